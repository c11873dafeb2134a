//! Element kinds, types and host tensors.
//!
//! A [`Type`] is immutable once built and compares by element kind, shape and
//! layout. Fixed-point kinds carry their affine parameters inline so that two
//! tensors quantized differently never compare equal.

mod bytes;
mod host;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use bytes::AlignedBytes;
pub use host::{Tensor, TensorData, TensorSlice, TensorView};

/// Affine fixed-point parameters: `real = scale * (q - offset)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantParams {
    pub scale: f32,
    pub offset: i32,
}

impl QuantParams {
    pub fn new(scale: f32, offset: i32) -> Self {
        Self { scale, offset }
    }
}

/// Scalar element kinds understood by the compiler and every backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ElemKind {
    F32,
    /// 8-bit signed affine fixed point.
    I8Q { scale: f32, offset: i32 },
    /// 32-bit signed affine fixed point, used for accumulators and biases.
    I32Q { scale: f32, offset: i32 },
    /// 64-bit signed index.
    I64,
}

impl ElemKind {
    pub fn i8q(params: QuantParams) -> Self {
        ElemKind::I8Q {
            scale: params.scale,
            offset: params.offset,
        }
    }

    pub fn i32q(params: QuantParams) -> Self {
        ElemKind::I32Q {
            scale: params.scale,
            offset: params.offset,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ElemKind::F32)
    }

    pub fn is_quantized(self) -> bool {
        matches!(self, ElemKind::I8Q { .. } | ElemKind::I32Q { .. })
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            ElemKind::I8Q { .. } => 1,
            ElemKind::F32 | ElemKind::I32Q { .. } => 4,
            ElemKind::I64 => 8,
        }
    }

    /// Returns the affine parameters of a fixed-point kind.
    pub fn quant_params(self) -> Option<QuantParams> {
        match self {
            ElemKind::I8Q { scale, offset } | ElemKind::I32Q { scale, offset } => {
                Some(QuantParams { scale, offset })
            }
            _ => None,
        }
    }

    /// Short storage name, shared by dumps and generated code.
    pub fn storage_name(self) -> &'static str {
        match self {
            ElemKind::F32 => "f32",
            ElemKind::I8Q { .. } => "i8",
            ElemKind::I32Q { .. } => "i32",
            ElemKind::I64 => "i64",
        }
    }
}

impl fmt::Display for ElemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElemKind::F32 => write!(f, "f32"),
            ElemKind::I64 => write!(f, "i64"),
            ElemKind::I8Q { scale, offset } => write!(f, "i8q[s={scale},o={offset}]"),
            ElemKind::I32Q { scale, offset } => write!(f, "i32q[s={scale},o={offset}]"),
        }
    }
}

/// Canonical memory layout tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    #[default]
    Any,
    /// Batch, channel, height, width.
    Nchw,
    /// Batch, features.
    Nc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Type {
    elem: ElemKind,
    dims: Vec<usize>,
    #[serde(default)]
    layout: Layout,
}

impl Type {
    pub fn new(elem: ElemKind, dims: impl Into<Vec<usize>>) -> Self {
        Self {
            elem,
            dims: dims.into(),
            layout: Layout::Any,
        }
    }

    pub fn f32(dims: impl Into<Vec<usize>>) -> Self {
        Self::new(ElemKind::F32, dims)
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    /// Same dims and layout, different element kind.
    pub fn with_elem(&self, elem: ElemKind) -> Self {
        Self {
            elem,
            dims: self.dims.clone(),
            layout: self.layout,
        }
    }

    pub fn elem(&self) -> ElemKind {
        self.elem
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn byte_len(&self) -> usize {
        self.num_elements() * self.elem.size_in_bytes()
    }

    pub fn is_float(&self) -> bool {
        self.elem.is_float()
    }

    /// Element kind and dims agree; layout tags are ignored.
    ///
    /// This is the compatibility rule used when one node replaces another.
    pub fn same_storage_shape(&self, other: &Type) -> bool {
        self.elem == other.elem && self.dims == other.dims
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<", self.elem)?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                write!(f, " x ")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, ">")?;
        match self.layout {
            Layout::Any => Ok(()),
            Layout::Nchw => write!(f, "@nchw"),
            Layout::Nc => write!(f, "@nc"),
        }
    }
}

/// Row-major strides in elements.
pub fn contiguous_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; dims.len()];
    for axis in (0..dims.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * dims[axis + 1];
    }
    strides
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn types_compare_by_kind_shape_and_layout() {
        let a = Type::f32(vec![2, 3]);
        assert_eq!(a, Type::f32(vec![2, 3]));
        assert_ne!(a, Type::f32(vec![3, 2]));
        assert_ne!(a, a.clone().with_layout(Layout::Nc));
        assert!(a.same_storage_shape(&a.clone().with_layout(Layout::Nc)));
        let q = a.with_elem(ElemKind::I8Q {
            scale: 0.5,
            offset: 0,
        });
        assert_ne!(a, q);
        assert_eq!(q.byte_len(), 6);
    }

    #[test]
    fn strides_are_row_major() {
        assert_eq!(contiguous_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(contiguous_strides(&[]), Vec::<usize>::new());
    }

    #[test]
    fn display_is_compact() {
        let ty = Type::f32(vec![1, 3, 8, 8]).with_layout(Layout::Nchw);
        assert_eq!(ty.to_string(), "f32<1 x 3 x 8 x 8>@nchw");
    }
}
