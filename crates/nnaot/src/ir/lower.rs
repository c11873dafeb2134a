use std::collections::HashMap;

use super::{
    compute_live_ranges, plan_memory, verify_ir, BinaryOp, BufferId, BufferKind, InstrKind,
    Instruction, IrFunction, PoolKind, UnaryOp, WeightRole, WeightVar,
};
use crate::error::{CompileError, Result};
use crate::graph::{Function, NodeId, NodeKind, Visibility};

/// Role of a variable, decided by how the graph uses it.
fn weight_role(function: &Function, id: NodeId, visibility: Visibility) -> WeightRole {
    let mut role = match visibility {
        Visibility::Public => WeightRole::Input,
        Visibility::Private => WeightRole::Constant,
    };
    for user in function.users(id) {
        let Some(node) = function.try_node(*user) else {
            continue;
        };
        if node.input(1) != Some(id) {
            continue;
        }
        match node.kind() {
            NodeKind::Save => role = WeightRole::Output,
            NodeKind::QuantizationProfile => role = WeightRole::Profile,
            _ => {}
        }
    }
    role
}

struct Lowering<'a> {
    function: &'a Function,
    ir: IrFunction,
    values: HashMap<NodeId, BufferId>,
}

impl<'a> Lowering<'a> {
    fn value(&self, id: NodeId) -> Result<BufferId> {
        self.values.get(&id).copied().ok_or_else(|| {
            CompileError::structural(
                self.function.name_of(id),
                "value used before it was lowered",
            )
        })
    }

    fn operand(&self, node: NodeId, slot: usize) -> Result<BufferId> {
        let graph_node = self.function.node(node)?;
        let input = graph_node.input(slot).ok_or_else(|| {
            CompileError::structural(graph_node.name(), format!("missing operand #{slot}"))
        })?;
        self.value(input)
    }

    /// Allocates the activation holding `id`'s result.
    fn alloc(&mut self, id: NodeId) -> Result<BufferId> {
        let node = self.function.node(id)?;
        let ty = self.function.output_type(id)?.clone();
        let dest = self.ir.add_buffer(node.name(), ty, BufferKind::Activation);
        self.ir.push(Instruction::new(
            InstrKind::AllocActivation { dest },
            node.name(),
        ));
        self.values.insert(id, dest);
        Ok(dest)
    }

    fn lower_node(&mut self, id: NodeId) -> Result<()> {
        let function = self.function;
        let node = function.node(id)?;
        let name = node.name().to_string();
        let kind = node.kind().clone();

        let compute = match kind {
            NodeKind::Variable {
                visibility,
                payload,
            } => {
                let role = weight_role(function, id, visibility);
                let buffer = self.ir.add_weight(WeightVar {
                    name: name.clone(),
                    ty: payload.ty().clone(),
                    role,
                    payload: (role == WeightRole::Constant).then_some(payload),
                });
                self.values.insert(id, buffer);
                return Ok(());
            }
            NodeKind::Save => {
                let src = self.operand(id, 0)?;
                let dest = self.operand(id, 1)?;
                InstrKind::Copy { dest, src }
            }
            NodeKind::QuantizationProfile => {
                let src = self.operand(id, 0)?;
                let stats = self.operand(id, 1)?;
                InstrKind::QuantizationProfile { src, stats }
            }
            NodeKind::Reshape { .. } => {
                let src = self.operand(id, 0)?;
                let root = self.ir.root(src);
                let ty = function.output_type(id)?.clone();
                let dest = self.ir.add_buffer(&name, ty, BufferKind::View { of: root });
                self.values.insert(id, dest);
                InstrKind::TensorView { dest, src }
            }
            other => {
                let operands = (0..node.inputs().len())
                    .map(|slot| self.operand(id, slot))
                    .collect::<Result<Vec<_>>>()?;
                let dest = self.alloc(id)?;
                compute_kind(&name, other, dest, &operands)?
            }
        };
        self.ir.push(Instruction::new(compute, name));
        Ok(())
    }
}

fn compute_kind(
    name: &str,
    kind: NodeKind,
    dest: BufferId,
    ops: &[BufferId],
) -> Result<InstrKind> {
    let binary = |op| InstrKind::ElementBinary {
        op,
        dest,
        lhs: ops[0],
        rhs: ops[1],
    };
    let unary = |op| InstrKind::ElementUnary {
        op,
        dest,
        src: ops[0],
    };
    Ok(match kind {
        NodeKind::Add => binary(BinaryOp::Add),
        NodeKind::Sub => binary(BinaryOp::Sub),
        NodeKind::Mul => binary(BinaryOp::Mul),
        NodeKind::Div => binary(BinaryOp::Div),
        NodeKind::Max => binary(BinaryOp::Max),
        NodeKind::Min => binary(BinaryOp::Min),
        NodeKind::Relu => unary(UnaryOp::Relu),
        NodeKind::Sigmoid => unary(UnaryOp::Sigmoid),
        NodeKind::Tanh => unary(UnaryOp::Tanh),
        NodeKind::MatMul => InstrKind::MatMul {
            dest,
            lhs: ops[0],
            rhs: ops[1],
        },
        NodeKind::FullyConnected => InstrKind::FullyConnected {
            dest,
            src: ops[0],
            weights: ops[1],
            bias: ops[2],
        },
        NodeKind::Transpose { shuffle } => InstrKind::Transpose {
            dest,
            src: ops[0],
            shuffle,
        },
        NodeKind::Softmax => InstrKind::Softmax { dest, src: ops[0] },
        NodeKind::Splat { value } => InstrKind::Splat { dest, value },
        NodeKind::Convolution { window } => InstrKind::Convolution {
            dest,
            src: ops[0],
            filter: ops[1],
            bias: ops[2],
            window,
        },
        NodeKind::MaxPool { window } => InstrKind::Pool {
            kind: PoolKind::Max,
            dest,
            src: ops[0],
            window,
        },
        NodeKind::AvgPool { window } => InstrKind::Pool {
            kind: PoolKind::Avg,
            dest,
            src: ops[0],
            window,
        },
        NodeKind::Quantize => InstrKind::Quantize { dest, src: ops[0] },
        NodeKind::Dequantize => InstrKind::Dequantize { dest, src: ops[0] },
        NodeKind::RescaleQuantized => InstrKind::RescaleQuantized { dest, src: ops[0] },
        other => {
            return Err(CompileError::structural(
                name,
                format!("`{}` has no low-level counterpart", other.name()),
            ))
        }
    })
}

/// Inserts a dealloc right after the last use of every activation.
fn insert_deallocs(ir: &mut IrFunction) {
    let ranges = compute_live_ranges(ir);
    let mut releases: HashMap<usize, Vec<BufferId>> = HashMap::new();
    for (buffer, range) in &ranges {
        releases.entry(range.last_use).or_default().push(*buffer);
    }
    let mut code = Vec::with_capacity(ir.instructions().len() + ranges.len());
    for (pos, instr) in ir.instructions().iter().enumerate() {
        code.push(instr.clone());
        if let Some(buffers) = releases.get(&pos) {
            for &src in buffers {
                let node = ir.buffer(src).name.clone();
                code.push(Instruction::new(InstrKind::DeallocActivation { src }, node));
            }
        }
    }
    ir.set_instructions(code);
}

/// Lowers a verified graph into a low-level program with a memory plan.
///
/// Output is a pure function of the graph: nodes are visited in the graph's
/// deterministic topological order and arena offsets are assigned first-fit
/// in allocation order.
pub fn lower(function: &Function) -> Result<IrFunction> {
    function.verify()?;
    let mut lowering = Lowering {
        function,
        ir: IrFunction::new(function.name()),
        values: HashMap::new(),
    };
    for id in function.topological_order()? {
        lowering.lower_node(id)?;
    }
    let mut ir = lowering.ir;
    insert_deallocs(&mut ir);
    let live_ranges = compute_live_ranges(&ir);
    let memory = plan_memory(&ir, live_ranges);
    ir.set_memory(memory);
    verify_ir(&ir)?;
    log::debug!(
        target: "nnaot::ir",
        "lowered `{}`: {} instructions, {} weights, {} activation bytes",
        ir.name(),
        ir.instructions().len(),
        ir.weights().len(),
        ir.memory().activation_bytes
    );
    Ok(ir)
}
