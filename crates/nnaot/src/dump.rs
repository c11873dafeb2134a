//! Read-only debug renderings of graphs and lowered programs.
//!
//! Text dumps are meant for diffing; DOT dumps for external viewers. Both
//! are deterministic for a given graph.

use std::fmt::Write as _;
use std::path::Path;

use crate::error::{CompileError, Result};
use crate::graph::{Function, NodeKind};
use crate::ir::{BufferId, BufferKind, InstrKind, IrFunction};

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

impl Function {
    /// One line per live node in topological order.
    pub fn dump(&self) -> Result<String> {
        let mut out = String::new();
        let _ = writeln!(out, "graph {} ({} nodes)", self.name(), self.len());
        for id in self.topological_order()? {
            let node = self.node(id)?;
            let operands = node
                .inputs()
                .iter()
                .map(|input| format!("{input}"))
                .collect::<Vec<_>>()
                .join(", ");
            let attrs = node.kind().attributes();
            let ty = node.ty().map(|t| format!(" : {t}")).unwrap_or_default();
            let _ = write!(out, "  {id} = {}({operands})", node.kind().name());
            if !attrs.is_empty() {
                let _ = write!(out, " [{attrs}]");
            }
            let _ = writeln!(out, "{ty}  ; {}", node.name());
        }
        Ok(out)
    }

    /// Node-and-edge rendering; edges run from operand to user.
    pub fn dump_dot(&self) -> Result<String> {
        let mut out = String::new();
        let _ = writeln!(out, "digraph \"{}\" {{", escape(self.name()));
        let _ = writeln!(out, "  node [fontname=\"monospace\"];");
        let order = self.topological_order()?;
        for &id in &order {
            let node = self.node(id)?;
            let shape = match node.kind() {
                NodeKind::Variable { .. } => "ellipse",
                NodeKind::Save | NodeKind::QuantizationProfile => "house",
                _ => "box",
            };
            let mut label = format!("{}\\n{}", escape(node.name()), node.kind().name());
            let attrs = node.kind().attributes();
            if !attrs.is_empty() {
                label.push_str(&format!("\\n{}", escape(&attrs)));
            }
            if let Some(ty) = node.ty() {
                label.push_str(&format!("\\n{}", escape(&ty.to_string())));
            }
            let _ = writeln!(out, "  n{} [shape={shape}, label=\"{label}\"];", id.0);
        }
        for &id in &order {
            for (slot, input) in self.node(id)?.inputs().iter().enumerate() {
                let _ = writeln!(out, "  n{} -> n{} [label=\"{slot}\"];", input.0, id.0);
            }
        }
        out.push_str("}\n");
        Ok(out)
    }
}

impl IrFunction {
    /// Buffers as nodes, instructions as boxes; edges follow data flow.
    /// Allocation bookkeeping is omitted.
    pub fn dump_dot(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph \"{}\" {{", escape(self.name()));
        let _ = writeln!(out, "  rankdir=TB;");
        for (index, buffer) in self.buffers().iter().enumerate() {
            let (fill, detail) = match buffer.kind {
                BufferKind::Weight(weight) => {
                    ("lightblue", self.weights()[weight].role.as_str().to_string())
                }
                BufferKind::Activation => match self.memory().segments.get(&BufferId(index as u32)) {
                    Some(segment) => ("white", format!("arena@{}", segment.offset)),
                    None => ("white", "arena".to_string()),
                },
                BufferKind::View { of } => ("white", format!("view of {of}")),
            };
            let _ = writeln!(
                out,
                "  b{index} [shape=ellipse, style=filled, fillcolor=\"{fill}\", label=\"{}\\n{}\\n{}\"];",
                escape(&buffer.name),
                escape(&buffer.ty.to_string()),
                escape(&detail)
            );
        }
        for (pos, instr) in self.instructions().iter().enumerate() {
            if matches!(
                instr.kind,
                InstrKind::AllocActivation { .. } | InstrKind::DeallocActivation { .. }
            ) {
                continue;
            }
            let _ = writeln!(
                out,
                "  i{pos} [shape=box, label=\"{pos}: {}\\n{}\"];",
                instr.name(),
                escape(&instr.node)
            );
            for (operand, role) in instr.operands() {
                if role.reads() {
                    let _ = writeln!(out, "  b{} -> i{pos};", operand.0);
                }
                if role.writes() {
                    let _ = writeln!(out, "  i{pos} -> b{};", operand.0);
                }
            }
        }
        out.push_str("}\n");
        out
    }
}

/// Writes a DOT rendering to `path`.
pub fn write_dot(path: &Path, dot: &str) -> Result<()> {
    std::fs::write(path, dot).map_err(|err| CompileError::io(path, err))?;
    log::info!("wrote graph description to {}", path.display());
    Ok(())
}
