use serde::{Deserialize, Serialize};

use super::{ElemKind, Type};
use crate::error::{CompileError, Result};

/// Owned element storage of a [`Tensor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "storage", content = "values", rename_all = "lowercase")]
pub enum TensorData {
    F32(Vec<f32>),
    I8(Vec<i8>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl TensorData {
    fn zeros(elem: ElemKind, len: usize) -> Self {
        match elem {
            ElemKind::F32 => TensorData::F32(vec![0.0; len]),
            ElemKind::I8Q { .. } => TensorData::I8(vec![0; len]),
            ElemKind::I32Q { .. } => TensorData::I32(vec![0; len]),
            ElemKind::I64 => TensorData::I64(vec![0; len]),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::I8(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn matches(&self, elem: ElemKind) -> bool {
        matches!(
            (self, elem),
            (TensorData::F32(_), ElemKind::F32)
                | (TensorData::I8(_), ElemKind::I8Q { .. })
                | (TensorData::I32(_), ElemKind::I32Q { .. })
                | (TensorData::I64(_), ElemKind::I64)
        )
    }
}

/// An owned, contiguous, row-major buffer of a fixed [`Type`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    ty: Type,
    data: TensorData,
}

impl Tensor {
    pub fn zeros(ty: Type) -> Self {
        let data = TensorData::zeros(ty.elem(), ty.num_elements());
        Self { ty, data }
    }

    pub fn new(ty: Type, data: TensorData) -> Result<Self> {
        if !data.matches(ty.elem()) {
            return Err(CompileError::type_mismatch(
                "<tensor>",
                format!("storage does not match element kind {}", ty.elem()),
            ));
        }
        if data.len() != ty.num_elements() {
            return Err(CompileError::type_mismatch(
                "<tensor>",
                format!(
                    "type {ty} needs {} elements, got {}",
                    ty.num_elements(),
                    data.len()
                ),
            ));
        }
        Ok(Self { ty, data })
    }

    pub fn from_f32(dims: impl Into<Vec<usize>>, values: Vec<f32>) -> Result<Self> {
        Self::new(Type::f32(dims), TensorData::F32(values))
    }

    pub fn splat_f32(ty: Type, value: f32) -> Result<Self> {
        let len = ty.num_elements();
        Self::new(ty, TensorData::F32(vec![value; len]))
    }

    pub fn ty(&self) -> &Type {
        &self.ty
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        match &mut self.data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i8(&self) -> Option<&[i8]> {
        match &self.data {
            TensorData::I8(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match &self.data {
            TensorData::I32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match &self.data {
            TensorData::I64(v) => Some(v),
            _ => None,
        }
    }

    /// Element at a multi-dimensional index, widened to `f32`.
    ///
    /// Fixed-point elements are dequantized.
    pub fn get_f32(&self, index: &[usize]) -> Option<f32> {
        let dims = self.ty.dims();
        if index.len() != dims.len() || index.iter().zip(dims).any(|(i, d)| i >= d) {
            return None;
        }
        let strides = super::contiguous_strides(dims);
        let flat: usize = index.iter().zip(&strides).map(|(i, s)| i * s).sum();
        self.flat_f32(flat)
    }

    fn flat_f32(&self, flat: usize) -> Option<f32> {
        let params = self.ty.elem().quant_params();
        match &self.data {
            TensorData::F32(v) => v.get(flat).copied(),
            TensorData::I8(v) => {
                let p = params?;
                v.get(flat).map(|q| p.scale * (*q as i32 - p.offset) as f32)
            }
            TensorData::I32(v) => {
                let p = params?;
                v.get(flat).map(|q| p.scale * (*q - p.offset) as f32)
            }
            TensorData::I64(v) => v.get(flat).map(|x| *x as f32),
        }
    }

    /// A float copy of this tensor; fixed-point values are dequantized.
    pub fn to_f32(&self) -> Tensor {
        let values = (0..self.len())
            .map(|idx| self.flat_f32(idx).unwrap_or(0.0))
            .collect();
        Tensor {
            ty: self.ty.with_elem(ElemKind::F32),
            data: TensorData::F32(values),
        }
    }

    /// Little-endian byte image, the layout every backend buffer uses.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.ty.byte_len());
        match &self.data {
            TensorData::F32(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            TensorData::I8(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            TensorData::I32(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            TensorData::I64(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
        }
        out
    }

    pub fn from_le_bytes(ty: Type, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != ty.byte_len() {
            return Err(CompileError::type_mismatch(
                "<tensor>",
                format!("type {ty} needs {} bytes, got {}", ty.byte_len(), bytes.len()),
            ));
        }
        let data = match ty.elem() {
            ElemKind::F32 => TensorData::F32(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            ElemKind::I8Q { .. } => TensorData::I8(bytes.iter().map(|b| *b as i8).collect()),
            ElemKind::I32Q { .. } => TensorData::I32(
                bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            ElemKind::I64 => TensorData::I64(
                bytes
                    .chunks_exact(8)
                    .map(|c| {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(c);
                        i64::from_le_bytes(raw)
                    })
                    .collect(),
            ),
        };
        Ok(Self { ty, data })
    }

    /// Compares types exactly and values element-wise within `tolerance`.
    pub fn is_equal(&self, other: &Tensor, tolerance: f32) -> bool {
        if self.ty != other.ty {
            return false;
        }
        match (&self.data, &other.data) {
            (TensorData::F32(a), TensorData::F32(b)) => a
                .iter()
                .zip(b)
                .all(|(x, y)| x == y || (x - y).abs() <= tolerance),
            _ => self.data == other.data,
        }
    }

    /// Indices of the smallest and the largest element.
    pub fn min_max_arg(&self) -> Option<(usize, usize)> {
        if self.is_empty() {
            return None;
        }
        let (mut min_idx, mut max_idx) = (0usize, 0usize);
        let (mut min, mut max) = (f32::INFINITY, f32::NEG_INFINITY);
        for idx in 0..self.len() {
            let value = self.flat_f32(idx)?;
            if value < min {
                min = value;
                min_idx = idx;
            }
            if value > max {
                max = value;
                max_idx = idx;
            }
        }
        Some((min_idx, max_idx))
    }

    /// Borrows the `index`-th slice along the outermost dimension.
    pub fn slice_outer(&self, index: usize) -> Result<TensorView<'_>> {
        let dims = self.ty.dims();
        let Some((&outer, inner)) = dims.split_first() else {
            return Err(CompileError::type_mismatch(
                "<tensor>",
                "cannot slice a scalar tensor",
            ));
        };
        if index >= outer {
            return Err(CompileError::type_mismatch(
                "<tensor>",
                format!("slice {index} out of bounds for outer dimension {outer}"),
            ));
        }
        let count: usize = inner.iter().product();
        let range = index * count..(index + 1) * count;
        let data = match &self.data {
            TensorData::F32(v) => TensorSlice::F32(&v[range]),
            TensorData::I8(v) => TensorSlice::I8(&v[range]),
            TensorData::I32(v) => TensorSlice::I32(&v[range]),
            TensorData::I64(v) => TensorSlice::I64(&v[range]),
        };
        Ok(TensorView {
            ty: Type::new(self.ty.elem(), inner.to_vec()),
            data,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TensorSlice<'a> {
    F32(&'a [f32]),
    I8(&'a [i8]),
    I32(&'a [i32]),
    I64(&'a [i64]),
}

/// A borrowed window into a [`Tensor`]; it cannot outlive its parent.
#[derive(Debug, Clone)]
pub struct TensorView<'a> {
    ty: Type,
    data: TensorSlice<'a>,
}

impl<'a> TensorView<'a> {
    pub fn ty(&self) -> &Type {
        &self.ty
    }

    pub fn data(&self) -> TensorSlice<'a> {
        self.data
    }

    pub fn as_f32(&self) -> Option<&'a [f32]> {
        match self.data {
            TensorSlice::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn to_tensor(&self) -> Tensor {
        let data = match self.data {
            TensorSlice::F32(v) => TensorData::F32(v.to_vec()),
            TensorSlice::I8(v) => TensorData::I8(v.to_vec()),
            TensorSlice::I32(v) => TensorData::I32(v.to_vec()),
            TensorSlice::I64(v) => TensorData::I64(v.to_vec()),
        };
        Tensor {
            ty: self.ty.clone(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_wrong_length_and_storage() {
        assert!(Tensor::from_f32(vec![2, 2], vec![1.0, 2.0, 3.0]).is_err());
        assert!(Tensor::new(Type::f32(vec![1]), TensorData::I8(vec![0])).is_err());
    }

    #[test]
    fn byte_image_round_trips() {
        let t = Tensor::from_f32(vec![3], vec![1.5, -2.0, 0.25]).unwrap();
        let back = Tensor::from_le_bytes(t.ty().clone(), &t.to_le_bytes()).unwrap();
        assert_eq!(t, back);
    }

    #[test]
    fn slices_and_multi_index_access() {
        let t = Tensor::from_f32(vec![2, 3], vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(t.get_f32(&[1, 2]), Some(5.0));
        assert_eq!(t.get_f32(&[2, 0]), None);
        let row = t.slice_outer(1).unwrap();
        assert_eq!(row.as_f32(), Some(&[3.0, 4.0, 5.0][..]));
        assert_eq!(row.to_tensor().min_max_arg(), Some((0, 2)));
        assert!(t.slice_outer(2).is_err());
    }

    #[test]
    fn fixed_point_values_dequantize() {
        let ty = Type::new(
            ElemKind::I8Q {
                scale: 0.5,
                offset: 2,
            },
            vec![2],
        );
        let t = Tensor::new(ty, TensorData::I8(vec![2, 6])).unwrap();
        assert_eq!(t.to_f32().as_f32(), Some(&[0.0, 2.0][..]));
    }
}
