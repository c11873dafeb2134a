//! Static kernel table keyed by instruction and element kind.

use nnaot::ir::InstrKind;
use nnaot::tensor::ElemKind;

use crate::kernels;
use crate::memory::Memory;
use crate::program::Step;

pub(crate) type Kernel = fn(&Step, &mut Memory) -> nnaot::backend::BackendResult<()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ElemClass {
    F32,
    I8,
    I32,
    I64,
    /// Kernel moves bytes and does not care about the element kind.
    Any,
}

impl ElemClass {
    pub fn of(elem: ElemKind) -> Self {
        match elem {
            ElemKind::F32 => ElemClass::F32,
            ElemKind::I8Q { .. } => ElemClass::I8,
            ElemKind::I32Q { .. } => ElemClass::I32,
            ElemKind::I64 => ElemClass::I64,
        }
    }
}

use ElemClass::{Any, F32, I32, I8};

static DISPATCH: &[(&str, ElemClass, Kernel)] = &[
    ("alloc", Any, kernels::alloc),
    ("dealloc", Any, kernels::dealloc),
    ("tensor_view", Any, kernels::tensor_view),
    ("copy", Any, kernels::copy),
    ("transpose", Any, kernels::transpose),
    ("element_add", F32, kernels::element_binary),
    ("element_sub", F32, kernels::element_binary),
    ("element_mul", F32, kernels::element_binary),
    ("element_div", F32, kernels::element_binary),
    ("element_max", F32, kernels::element_binary),
    ("element_min", F32, kernels::element_binary),
    ("element_add", I8, kernels::element_binary),
    ("element_sub", I8, kernels::element_binary),
    ("element_mul", I8, kernels::element_binary),
    ("element_max", I8, kernels::element_binary),
    ("element_min", I8, kernels::element_binary),
    ("relu", F32, kernels::element_unary),
    ("sigmoid", F32, kernels::element_unary),
    ("tanh", F32, kernels::element_unary),
    ("relu", I8, kernels::element_unary),
    ("matmul", F32, kernels::matmul_f32),
    ("matmul", I8, kernels::matmul_quantized),
    ("fully_connected", F32, kernels::fully_connected_f32),
    ("fully_connected", I8, kernels::fully_connected_quantized),
    ("convolution", F32, kernels::convolution_f32),
    ("convolution", I8, kernels::convolution_quantized),
    ("max_pool", F32, kernels::pool),
    ("max_pool", I8, kernels::pool),
    ("avg_pool", F32, kernels::pool),
    ("avg_pool", I8, kernels::pool),
    ("softmax", F32, kernels::softmax),
    ("splat", F32, kernels::splat),
    ("splat", I8, kernels::splat),
    ("splat", I32, kernels::splat),
    ("quantize", I8, kernels::quantize),
    ("quantize", I32, kernels::quantize),
    ("dequantize", I8, kernels::dequantize),
    ("dequantize", I32, kernels::dequantize),
    ("rescale_quantized", I8, kernels::rescale),
    ("rescale_quantized", I32, kernels::rescale),
    ("quantization_profile", F32, kernels::quantization_profile),
];

/// Index of the operand whose element kind selects the kernel.
///
/// Most instructions are keyed by their destination; dequantize and the
/// profiling collector are keyed by what they read.
pub(crate) fn key_operand(kind: &InstrKind) -> usize {
    match kind {
        InstrKind::Dequantize { .. } | InstrKind::QuantizationProfile { .. } => 1,
        _ => 0,
    }
}

pub(crate) fn lookup(instruction: &str, class: ElemClass) -> Option<Kernel> {
    DISPATCH
        .iter()
        .find(|(name, key, _)| *name == instruction && (*key == class || *key == Any))
        .map(|(_, _, kernel)| *kernel)
}
