use std::collections::HashMap;

use super::{BufferKind, InstrKind, IrFunction};
use crate::error::{CompileError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Live,
    Released,
}

/// Checks buffer lifetimes and the memory plan of a lowered program.
///
/// Every activation operand must be allocated before it is touched and not
/// touched after its release, only output and profile weights may be written,
/// and activations that are live at the same time must not share bytes.
pub fn verify_ir(function: &IrFunction) -> Result<()> {
    let mut states = HashMap::new();
    for (pos, instr) in function.instructions().iter().enumerate() {
        let fail = |message: String| {
            CompileError::structural(&instr.node, format!("@{pos} {}: {message}", instr.name()))
        };
        match instr.kind {
            InstrKind::AllocActivation { dest } => {
                if !matches!(function.buffer(dest).kind, BufferKind::Activation) {
                    return Err(fail(format!("{dest} is not an activation")));
                }
                if states.insert(dest, State::Live).is_some() {
                    return Err(fail(format!("{dest} is allocated twice")));
                }
                continue;
            }
            InstrKind::DeallocActivation { src } => match states.get(&src) {
                Some(State::Live) => {
                    states.insert(src, State::Released);
                    continue;
                }
                _ => return Err(fail(format!("{src} is released while not live"))),
            },
            _ => {}
        }
        for (operand, role) in instr.operands() {
            let root = function.root(operand);
            match function.buffer(root).kind {
                BufferKind::Activation => match states.get(&root) {
                    Some(State::Live) => {}
                    Some(State::Released) => {
                        return Err(fail(format!("{operand} is used after release")))
                    }
                    None => return Err(fail(format!("{operand} is used before allocation"))),
                },
                BufferKind::Weight(index) => {
                    let weight = &function.weights()[index];
                    let aliases = matches!(instr.kind, InstrKind::TensorView { .. });
                    if role.writes() && !aliases && !weight.role.is_writable() {
                        return Err(fail(format!(
                            "writes {} weight `{}`",
                            weight.role.as_str(),
                            weight.name
                        )));
                    }
                }
                BufferKind::View { .. } => {
                    return Err(fail(format!("{operand} is a view of a view")));
                }
            }
        }
    }

    let plan = function.memory();
    let ranges: Vec<_> = plan.live_ranges.iter().collect();
    for (id, _) in &ranges {
        match plan.segments.get(*id) {
            Some(segment) if segment.end() <= plan.activation_bytes => {}
            Some(_) => {
                return Err(CompileError::structural(
                    &function.buffer(**id).name,
                    "segment exceeds the activation arena",
                ))
            }
            None => {
                return Err(CompileError::structural(
                    &function.buffer(**id).name,
                    "activation has no arena segment",
                ))
            }
        }
    }
    for (i, (a, range_a)) in ranges.iter().enumerate() {
        for (b, range_b) in &ranges[i + 1..] {
            if !range_a.overlaps(range_b) {
                continue;
            }
            if plan.segments[*a].overlaps(&plan.segments[*b]) {
                return Err(CompileError::structural(
                    &function.buffer(**a).name,
                    format!(
                        "shares arena bytes with `{}` while both are live",
                        function.buffer(**b).name
                    ),
                ));
            }
        }
    }
    Ok(())
}
