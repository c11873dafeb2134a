use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::tensor::{Tensor, Type};

/// Stable handle of a node inside its owning [`crate::graph::Function`].
///
/// Handles are never reused after a node is erased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Bindable from outside the compiled program.
    Public,
    /// Internal constant.
    Private,
}

/// Window parameters shared by convolution and pooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    pub kernel: usize,
    pub stride: usize,
    pub pad: usize,
}

impl Window {
    pub fn new(kernel: usize, stride: usize, pad: usize) -> Self {
        Self {
            kernel,
            stride,
            pad,
        }
    }

    /// Output extent for an input extent, or `None` if the window does not fit.
    pub fn output_extent(&self, input: usize) -> Option<usize> {
        if self.kernel == 0 || self.stride == 0 {
            return None;
        }
        let padded = input + 2 * self.pad;
        if padded < self.kernel {
            return None;
        }
        Some((padded - self.kernel) / self.stride + 1)
    }
}

/// Operator kinds of the high-level graph together with their attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum NodeKind {
    /// Persistent tensor: a weight when private, a bindable input or output when public.
    Variable {
        visibility: Visibility,
        payload: Tensor,
    },
    /// Sink copying `inputs[0]` into the output variable `inputs[1]`.
    Save,
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    Relu,
    Sigmoid,
    Tanh,
    /// `[m, k] x [k, n] -> [m, n]`.
    MatMul,
    /// `inputs = [data, weights, bias]`; data is flattened to `[batch, k]`.
    FullyConnected,
    Transpose {
        shuffle: Vec<usize>,
    },
    Reshape {
        dims: Vec<usize>,
    },
    /// Row-wise softmax over the last dimension of a rank-2 input.
    Softmax,
    Splat {
        value: f32,
    },
    /// NCHW convolution, `inputs = [data, filter, bias]`.
    Convolution {
        window: Window,
    },
    MaxPool {
        window: Window,
    },
    AvgPool {
        window: Window,
    },
    Quantize,
    Dequantize,
    RescaleQuantized,
    /// Sink folding the observed range of `inputs[0]` into the statistics variable `inputs[1]`.
    QuantizationProfile,
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Variable { .. } => "variable",
            NodeKind::Save => "save",
            NodeKind::Add => "add",
            NodeKind::Sub => "sub",
            NodeKind::Mul => "mul",
            NodeKind::Div => "div",
            NodeKind::Max => "max",
            NodeKind::Min => "min",
            NodeKind::Relu => "relu",
            NodeKind::Sigmoid => "sigmoid",
            NodeKind::Tanh => "tanh",
            NodeKind::MatMul => "matmul",
            NodeKind::FullyConnected => "fully_connected",
            NodeKind::Transpose { .. } => "transpose",
            NodeKind::Reshape { .. } => "reshape",
            NodeKind::Softmax => "softmax",
            NodeKind::Splat { .. } => "splat",
            NodeKind::Convolution { .. } => "convolution",
            NodeKind::MaxPool { .. } => "max_pool",
            NodeKind::AvgPool { .. } => "avg_pool",
            NodeKind::Quantize => "quantize",
            NodeKind::Dequantize => "dequantize",
            NodeKind::RescaleQuantized => "rescale_quantized",
            NodeKind::QuantizationProfile => "quantization_profile",
        }
    }

    /// Sinks have no output value.
    pub fn is_sink(&self) -> bool {
        matches!(self, NodeKind::Save | NodeKind::QuantizationProfile)
    }

    pub fn is_variable(&self) -> bool {
        matches!(self, NodeKind::Variable { .. })
    }

    /// Pure operators may be merged or removed when unused.
    pub fn is_pure(&self) -> bool {
        !self.is_sink() && !self.is_variable()
    }

    pub fn is_elementwise_binary(&self) -> bool {
        matches!(
            self,
            NodeKind::Add
                | NodeKind::Sub
                | NodeKind::Mul
                | NodeKind::Div
                | NodeKind::Max
                | NodeKind::Min
        )
    }

    pub fn is_elementwise_unary(&self) -> bool {
        matches!(self, NodeKind::Relu | NodeKind::Sigmoid | NodeKind::Tanh)
    }

    /// Attributes rendered for dumps, without the payload of variables.
    pub fn attributes(&self) -> String {
        match self {
            NodeKind::Variable {
                visibility: Visibility::Public,
                ..
            } => "public".to_string(),
            NodeKind::Variable {
                visibility: Visibility::Private,
                ..
            } => "private".to_string(),
            NodeKind::Transpose { shuffle } => format!("shuffle={shuffle:?}"),
            NodeKind::Reshape { dims } => format!("dims={dims:?}"),
            NodeKind::Splat { value } => format!("value={value}"),
            NodeKind::Convolution { window }
            | NodeKind::MaxPool { window }
            | NodeKind::AvgPool { window } => format!(
                "kernel={} stride={} pad={}",
                window.kernel, window.stride, window.pad
            ),
            _ => String::new(),
        }
    }
}

/// A vertex of the operator graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    pub(crate) inputs: SmallVec<[NodeId; 3]>,
    pub(crate) ty: Option<Type>,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn input(&self, slot: usize) -> Option<NodeId> {
        self.inputs.get(slot).copied()
    }

    /// Output type; `None` for sinks.
    pub fn ty(&self) -> Option<&Type> {
        self.ty.as_ref()
    }

    pub fn is_public_variable(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::Variable {
                visibility: Visibility::Public,
                ..
            }
        )
    }

    pub fn is_private_variable(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::Variable {
                visibility: Visibility::Private,
                ..
            }
        )
    }

    /// Structural identity used for merging: same kind and attributes, same
    /// input handles, same output type.
    pub fn structural_key(&self) -> Option<Vec<u8>> {
        bincode::serialize(&(&self.kind, self.inputs.as_slice(), &self.ty)).ok()
    }
}
