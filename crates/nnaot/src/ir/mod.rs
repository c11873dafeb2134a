//! Low-level program: explicit buffers and a linear instruction list.
//!
//! Weights (variable-backed buffers) persist for the whole program, while
//! activations are allocated and released explicitly and share one arena
//! according to the [`MemoryPlan`].

mod allocator;
mod liveness;
mod lower;
mod verify;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};

use crate::graph::Window;
use crate::tensor::{Tensor, Type};

pub use allocator::{plan_memory, ARENA_ALIGNMENT};
pub use liveness::compute_live_ranges;
pub use lower::lower;
pub use verify::verify_ir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BufferId(pub u32);

impl BufferId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// How a weight is bound at execution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightRole {
    /// Baked into the compiled artifact.
    Constant,
    /// Bound by the caller before each run.
    Input,
    /// Written by the program, read back by the caller.
    Output,
    /// Quantization statistics updated in place by every run.
    Profile,
}

impl WeightRole {
    pub fn is_writable(self) -> bool {
        matches!(self, WeightRole::Output | WeightRole::Profile)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WeightRole::Constant => "constant",
            WeightRole::Input => "input",
            WeightRole::Output => "output",
            WeightRole::Profile => "profile",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightVar {
    pub name: String,
    pub ty: Type,
    pub role: WeightRole,
    /// Present for constants only.
    pub payload: Option<Tensor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Index into [`IrFunction::weights`].
    Weight(usize),
    Activation,
    /// Reinterprets the storage of another buffer, always a weight or activation.
    View { of: BufferId },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    pub name: String,
    pub ty: Type,
    pub kind: BufferKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandRole {
    In,
    Out,
    InOut,
}

impl OperandRole {
    pub fn reads(self) -> bool {
        matches!(self, OperandRole::In | OperandRole::InOut)
    }

    pub fn writes(self) -> bool {
        matches!(self, OperandRole::Out | OperandRole::InOut)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Max => "max",
            BinaryOp::Min => "min",
        }
    }

    pub fn apply(self, lhs: f32, rhs: f32) -> f32 {
        match self {
            BinaryOp::Add => lhs + rhs,
            BinaryOp::Sub => lhs - rhs,
            BinaryOp::Mul => lhs * rhs,
            BinaryOp::Div => lhs / rhs,
            BinaryOp::Max => {
                if lhs > rhs {
                    lhs
                } else {
                    rhs
                }
            }
            BinaryOp::Min => {
                if lhs < rhs {
                    lhs
                } else {
                    rhs
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Relu,
    Sigmoid,
    Tanh,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Relu => "relu",
            UnaryOp::Sigmoid => "sigmoid",
            UnaryOp::Tanh => "tanh",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Max,
    Avg,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstrKind {
    AllocActivation {
        dest: BufferId,
    },
    DeallocActivation {
        src: BufferId,
    },
    TensorView {
        dest: BufferId,
        src: BufferId,
    },
    Copy {
        dest: BufferId,
        src: BufferId,
    },
    ElementBinary {
        op: BinaryOp,
        dest: BufferId,
        lhs: BufferId,
        rhs: BufferId,
    },
    ElementUnary {
        op: UnaryOp,
        dest: BufferId,
        src: BufferId,
    },
    MatMul {
        dest: BufferId,
        lhs: BufferId,
        rhs: BufferId,
    },
    FullyConnected {
        dest: BufferId,
        src: BufferId,
        weights: BufferId,
        bias: BufferId,
    },
    Transpose {
        dest: BufferId,
        src: BufferId,
        shuffle: Vec<usize>,
    },
    Softmax {
        dest: BufferId,
        src: BufferId,
    },
    Splat {
        dest: BufferId,
        value: f32,
    },
    Convolution {
        dest: BufferId,
        src: BufferId,
        filter: BufferId,
        bias: BufferId,
        window: Window,
    },
    Pool {
        kind: PoolKind,
        dest: BufferId,
        src: BufferId,
        window: Window,
    },
    Quantize {
        dest: BufferId,
        src: BufferId,
    },
    Dequantize {
        dest: BufferId,
        src: BufferId,
    },
    RescaleQuantized {
        dest: BufferId,
        src: BufferId,
    },
    QuantizationProfile {
        src: BufferId,
        stats: BufferId,
    },
}

/// One step of the program, tagged with the graph node it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub kind: InstrKind,
    pub node: String,
}

impl Instruction {
    pub fn new(kind: InstrKind, node: impl Into<String>) -> Self {
        Self {
            kind,
            node: node.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match &self.kind {
            InstrKind::AllocActivation { .. } => "alloc",
            InstrKind::DeallocActivation { .. } => "dealloc",
            InstrKind::TensorView { .. } => "tensor_view",
            InstrKind::Copy { .. } => "copy",
            InstrKind::ElementBinary { op, .. } => match op {
                BinaryOp::Add => "element_add",
                BinaryOp::Sub => "element_sub",
                BinaryOp::Mul => "element_mul",
                BinaryOp::Div => "element_div",
                BinaryOp::Max => "element_max",
                BinaryOp::Min => "element_min",
            },
            InstrKind::ElementUnary { op, .. } => match op {
                UnaryOp::Relu => "relu",
                UnaryOp::Sigmoid => "sigmoid",
                UnaryOp::Tanh => "tanh",
            },
            InstrKind::MatMul { .. } => "matmul",
            InstrKind::FullyConnected { .. } => "fully_connected",
            InstrKind::Transpose { .. } => "transpose",
            InstrKind::Softmax { .. } => "softmax",
            InstrKind::Splat { .. } => "splat",
            InstrKind::Convolution { .. } => "convolution",
            InstrKind::Pool { kind, .. } => match kind {
                PoolKind::Max => "max_pool",
                PoolKind::Avg => "avg_pool",
            },
            InstrKind::Quantize { .. } => "quantize",
            InstrKind::Dequantize { .. } => "dequantize",
            InstrKind::RescaleQuantized { .. } => "rescale_quantized",
            InstrKind::QuantizationProfile { .. } => "quantization_profile",
        }
    }

    /// Buffers touched by the instruction, destination first.
    pub fn operands(&self) -> SmallVec<[(BufferId, OperandRole); 4]> {
        use OperandRole::{In, InOut, Out};
        match &self.kind {
            InstrKind::AllocActivation { dest } => smallvec![(*dest, Out)],
            InstrKind::DeallocActivation { src } => smallvec![(*src, In)],
            InstrKind::TensorView { dest, src } => smallvec![(*dest, Out), (*src, In)],
            InstrKind::Splat { dest, .. } => smallvec![(*dest, Out)],
            InstrKind::Copy { dest, src }
            | InstrKind::ElementUnary { dest, src, .. }
            | InstrKind::Transpose { dest, src, .. }
            | InstrKind::Softmax { dest, src }
            | InstrKind::Pool { dest, src, .. }
            | InstrKind::Quantize { dest, src }
            | InstrKind::Dequantize { dest, src }
            | InstrKind::RescaleQuantized { dest, src } => smallvec![(*dest, Out), (*src, In)],
            InstrKind::ElementBinary { dest, lhs, rhs, .. } | InstrKind::MatMul { dest, lhs, rhs } => {
                smallvec![(*dest, Out), (*lhs, In), (*rhs, In)]
            }
            InstrKind::FullyConnected {
                dest,
                src,
                weights,
                bias,
            } => smallvec![(*dest, Out), (*src, In), (*weights, In), (*bias, In)],
            InstrKind::Convolution {
                dest,
                src,
                filter,
                bias,
                ..
            } => smallvec![(*dest, Out), (*src, In), (*filter, In), (*bias, In)],
            InstrKind::QuantizationProfile { src, stats } => smallvec![(*stats, InOut), (*src, In)],
        }
    }

    /// True for instructions that manage storage rather than compute.
    pub fn is_memory_management(&self) -> bool {
        matches!(
            self.kind,
            InstrKind::AllocActivation { .. }
                | InstrKind::DeallocActivation { .. }
                | InstrKind::TensorView { .. }
        )
    }

    fn attributes(&self) -> String {
        match &self.kind {
            InstrKind::Transpose { shuffle, .. } => format!(" shuffle={shuffle:?}"),
            InstrKind::Splat { value, .. } => format!(" value={value:?}"),
            InstrKind::Convolution { window, .. } | InstrKind::Pool { window, .. } => format!(
                " kernel={} stride={} pad={}",
                window.kernel, window.stride, window.pad
            ),
            _ => String::new(),
        }
    }
}

/// `[first_def, last_use]` instruction positions of an activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveRange {
    pub first_def: usize,
    pub last_use: usize,
}

impl LiveRange {
    pub fn overlaps(&self, other: &LiveRange) -> bool {
        self.first_def <= other.last_use && other.first_def <= self.last_use
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub offset: usize,
    pub size: usize,
}

impl Segment {
    pub fn end(&self) -> usize {
        self.offset + self.size
    }

    pub fn overlaps(&self, other: &Segment) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryPlan {
    /// Size of the activation arena.
    pub activation_bytes: usize,
    pub segments: BTreeMap<BufferId, Segment>,
    pub live_ranges: BTreeMap<BufferId, LiveRange>,
}

/// Where the bytes of a buffer live at execution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Weight(usize),
    Activation { offset: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct IrFunction {
    name: String,
    buffers: Vec<Buffer>,
    weights: Vec<WeightVar>,
    instructions: Vec<Instruction>,
    memory: MemoryPlan,
}

impl IrFunction {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            buffers: Vec::new(),
            weights: Vec::new(),
            instructions: Vec::new(),
            memory: MemoryPlan::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    pub fn buffer(&self, id: BufferId) -> &Buffer {
        &self.buffers[id.index()]
    }

    pub fn weights(&self) -> &[WeightVar] {
        &self.weights
    }

    pub fn weight(&self, name: &str) -> Option<(usize, &WeightVar)> {
        self.weights.iter().enumerate().find(|(_, w)| w.name == name)
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn memory(&self) -> &MemoryPlan {
        &self.memory
    }

    /// The weight or activation a buffer ultimately aliases.
    pub fn root(&self, mut id: BufferId) -> BufferId {
        while let BufferKind::View { of } = self.buffer(id).kind {
            id = of;
        }
        id
    }

    /// Storage of `id`, following views. `None` for an activation without a
    /// segment, which only happens before memory planning.
    pub fn location(&self, id: BufferId) -> Option<Location> {
        let root = self.root(id);
        match self.buffer(root).kind {
            BufferKind::Weight(index) => Some(Location::Weight(index)),
            BufferKind::Activation => self
                .memory
                .segments
                .get(&root)
                .map(|segment| Location::Activation {
                    offset: segment.offset,
                }),
            BufferKind::View { .. } => None,
        }
    }

    pub fn activations(&self) -> impl Iterator<Item = BufferId> + '_ {
        self.buffers
            .iter()
            .enumerate()
            .filter(|(_, b)| matches!(b.kind, BufferKind::Activation))
            .map(|(i, _)| BufferId(i as u32))
    }

    pub(crate) fn add_buffer(&mut self, name: impl Into<String>, ty: Type, kind: BufferKind) -> BufferId {
        let id = BufferId(self.buffers.len() as u32);
        self.buffers.push(Buffer {
            name: name.into(),
            ty,
            kind,
        });
        id
    }

    pub(crate) fn add_weight(&mut self, weight: WeightVar) -> BufferId {
        let index = self.weights.len();
        let (name, ty) = (weight.name.clone(), weight.ty.clone());
        self.weights.push(weight);
        self.add_buffer(name, ty, BufferKind::Weight(index))
    }

    pub(crate) fn push(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    pub(crate) fn set_instructions(&mut self, instructions: Vec<Instruction>) {
        self.instructions = instructions;
    }

    pub(crate) fn set_memory(&mut self, memory: MemoryPlan) {
        self.memory = memory;
    }
}

impl fmt::Display for IrFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "function {}", self.name)?;
        writeln!(f, "weights:")?;
        for (index, weight) in self.weights.iter().enumerate() {
            writeln!(
                f,
                "  #{index} {} \"{}\" : {}",
                weight.role.as_str(),
                weight.name,
                weight.ty
            )?;
        }
        writeln!(f, "activations: {} bytes", self.memory.activation_bytes)?;
        for id in self.activations() {
            let buffer = self.buffer(id);
            match self.memory.segments.get(&id) {
                Some(segment) => writeln!(
                    f,
                    "  {id} \"{}\" : {} @ [{}, {})",
                    buffer.name,
                    buffer.ty,
                    segment.offset,
                    segment.end()
                )?,
                None => writeln!(f, "  {id} \"{}\" : {}", buffer.name, buffer.ty)?,
            }
        }
        writeln!(f, "code:")?;
        for (pos, instr) in self.instructions.iter().enumerate() {
            let operands = instr
                .operands()
                .iter()
                .map(|(id, role)| {
                    let mark = match role {
                        OperandRole::In => "",
                        OperandRole::Out => "out ",
                        OperandRole::InOut => "inout ",
                    };
                    format!("{mark}{id}")
                })
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(
                f,
                "  {pos:>4} {} {operands}{}  ; {}",
                instr.name(),
                instr.attributes(),
                instr.node
            )?;
        }
        Ok(())
    }
}
