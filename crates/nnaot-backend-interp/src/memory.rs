//! Weight storage and the activation arena of one compiled program.

use nnaot::backend::{BackendError, BackendResult};
use nnaot::ir::{IrFunction, WeightRole};
use nnaot::quantization::{dequantize, quantize_i32, quantize_i8, QuantParams};
use nnaot::tensor::{AlignedBytes, ElemKind, Type};

/// Byte written over released activations when poisoning is enabled.
pub(crate) const POISON: u8 = 0xA5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Place {
    Weight(usize),
    Arena { offset: usize },
}

/// A buffer operand resolved to concrete storage.
#[derive(Debug, Clone)]
pub(crate) struct Operand {
    pub name: String,
    pub ty: Type,
    pub place: Place,
}

impl Operand {
    pub fn elem(&self) -> ElemKind {
        self.ty.elem()
    }

    pub fn dims(&self) -> &[usize] {
        self.ty.dims()
    }

    pub fn len(&self) -> usize {
        self.ty.num_elements()
    }

    pub fn params(&self) -> BackendResult<QuantParams> {
        self.elem().quant_params().ok_or_else(|| {
            BackendError::execution(format!("`{}` is not fixed point: {}", self.name, self.ty))
        })
    }
}

pub(crate) struct Memory {
    weights: Vec<AlignedBytes>,
    arena: AlignedBytes,
    /// One flag per arena byte, set while the byte holds no live value.
    poisoned: Option<Vec<bool>>,
}

impl Memory {
    /// Materializes constants and zeroes every other weight.
    pub fn new(function: &IrFunction, poison: bool) -> BackendResult<Self> {
        let mut weights = Vec::with_capacity(function.weights().len());
        for weight in function.weights() {
            let storage = match (&weight.role, &weight.payload) {
                (WeightRole::Constant, Some(payload)) => {
                    AlignedBytes::from_slice(&payload.to_le_bytes())
                }
                (WeightRole::Constant, None) => {
                    return Err(BackendError::execution(format!(
                        "constant `{}` has no payload",
                        weight.name
                    )))
                }
                _ => AlignedBytes::zeroed(weight.ty.byte_len()),
            };
            weights.push(storage);
        }
        let activation_bytes = function.memory().activation_bytes;
        let mut memory = Self {
            weights,
            arena: AlignedBytes::zeroed(activation_bytes),
            poisoned: poison.then(|| vec![true; activation_bytes]),
        };
        memory.reset_arena();
        Ok(memory)
    }

    pub fn is_poisoning(&self) -> bool {
        self.poisoned.is_some()
    }

    /// Marks the whole arena as free before a run.
    pub fn reset_arena(&mut self) {
        if let Some(shadow) = self.poisoned.as_mut() {
            shadow.fill(true);
            self.arena.as_mut_slice().fill(POISON);
        }
    }

    pub fn weight_bytes(&self, index: usize) -> BackendResult<&[u8]> {
        self.weights
            .get(index)
            .map(AlignedBytes::as_slice)
            .ok_or_else(|| BackendError::execution(format!("weight #{index} out of range")))
    }

    pub fn weight_bytes_mut(&mut self, index: usize) -> BackendResult<&mut [u8]> {
        self.weights
            .get_mut(index)
            .map(AlignedBytes::as_mut_slice)
            .ok_or_else(|| BackendError::execution(format!("weight #{index} out of range")))
    }

    fn arena_range(&self, operand: &Operand, offset: usize) -> BackendResult<std::ops::Range<usize>> {
        let range = offset..offset + operand.ty.byte_len();
        if range.end > self.arena.len() {
            return Err(BackendError::execution(format!(
                "`{}` spans [{}, {}) past the {}-byte arena",
                operand.name,
                range.start,
                range.end,
                self.arena.len()
            )));
        }
        Ok(range)
    }

    pub fn bytes(&self, operand: &Operand) -> BackendResult<&[u8]> {
        match operand.place {
            Place::Weight(index) => {
                let bytes = self.weight_bytes(index)?;
                bytes.get(..operand.ty.byte_len()).ok_or_else(|| {
                    BackendError::execution(format!("`{}` is larger than its weight", operand.name))
                })
            }
            Place::Arena { offset } => {
                let range = self.arena_range(operand, offset)?;
                if let Some(shadow) = &self.poisoned {
                    if let Some(pos) = shadow[range.clone()].iter().position(|p| *p) {
                        return Err(BackendError::execution(format!(
                            "read of dead storage: `{}` byte {} (arena offset {})",
                            operand.name,
                            pos,
                            range.start + pos
                        )));
                    }
                }
                Ok(&self.arena.as_slice()[range])
            }
        }
    }

    /// Mutable storage of `operand`; the bytes count as live from here on.
    pub fn bytes_mut(&mut self, operand: &Operand) -> BackendResult<&mut [u8]> {
        match operand.place {
            Place::Weight(index) => {
                let len = operand.ty.byte_len();
                let name = &operand.name;
                let bytes = self
                    .weights
                    .get_mut(index)
                    .map(AlignedBytes::as_mut_slice)
                    .ok_or_else(|| BackendError::execution(format!("weight #{index} out of range")))?;
                bytes.get_mut(..len).ok_or_else(|| {
                    BackendError::execution(format!("`{name}` is larger than its weight"))
                })
            }
            Place::Arena { offset } => {
                let range = self.arena_range(operand, offset)?;
                if let Some(shadow) = self.poisoned.as_mut() {
                    shadow[range.clone()].fill(false);
                }
                Ok(&mut self.arena.as_mut_slice()[range])
            }
        }
    }

    /// Overwrites the storage of a released activation. No-op unless poisoning.
    pub fn poison(&mut self, operand: &Operand) -> BackendResult<()> {
        let Place::Arena { offset } = operand.place else {
            return Ok(());
        };
        let range = self.arena_range(operand, offset)?;
        if let Some(shadow) = self.poisoned.as_mut() {
            shadow[range.clone()].fill(true);
            self.arena.as_mut_slice()[range].fill(POISON);
        }
        Ok(())
    }

    pub fn load_f32(&self, operand: &Operand) -> BackendResult<Vec<f32>> {
        if !operand.elem().is_float() {
            return Err(BackendError::execution(format!(
                "`{}` is not f32: {}",
                operand.name, operand.ty
            )));
        }
        Ok(self
            .bytes(operand)?
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Raw fixed-point values, widened to i32, with their parameters.
    pub fn load_quantized(&self, operand: &Operand) -> BackendResult<(Vec<i32>, QuantParams)> {
        let params = operand.params()?;
        let bytes = self.bytes(operand)?;
        let values = match operand.elem() {
            ElemKind::I8Q { .. } => bytes.iter().map(|b| *b as i8 as i32).collect(),
            _ => bytes
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        };
        Ok((values, params))
    }

    /// Real values of a float or fixed-point operand.
    pub fn load_real(&self, operand: &Operand) -> BackendResult<Vec<f32>> {
        match operand.elem() {
            ElemKind::F32 => self.load_f32(operand),
            ElemKind::I8Q { .. } | ElemKind::I32Q { .. } => {
                let (values, params) = self.load_quantized(operand)?;
                Ok(values.into_iter().map(|q| dequantize(q, params)).collect())
            }
            ElemKind::I64 => Err(BackendError::execution(format!(
                "`{}` holds indices, not numbers",
                operand.name
            ))),
        }
    }

    pub fn store_f32(&mut self, operand: &Operand, values: &[f32]) -> BackendResult<()> {
        if !operand.elem().is_float() {
            return Err(BackendError::execution(format!(
                "`{}` is not f32: {}",
                operand.name, operand.ty
            )));
        }
        let bytes = self.bytes_mut(operand)?;
        check_len(&operand.name, bytes.len() / 4, values.len())?;
        for (chunk, value) in bytes.chunks_exact_mut(4).zip(values) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        Ok(())
    }

    /// Stores real values, quantizing them when the destination is fixed point.
    pub fn store_real(&mut self, operand: &Operand, values: &[f32]) -> BackendResult<()> {
        match operand.elem() {
            ElemKind::F32 => self.store_f32(operand, values),
            ElemKind::I8Q { scale, offset } => {
                let params = QuantParams::new(scale, offset);
                let bytes = self.bytes_mut(operand)?;
                check_len(&operand.name, bytes.len(), values.len())?;
                for (byte, value) in bytes.iter_mut().zip(values) {
                    *byte = quantize_i8(*value, params) as u8;
                }
                Ok(())
            }
            ElemKind::I32Q { scale, offset } => {
                let params = QuantParams::new(scale, offset);
                let bytes = self.bytes_mut(operand)?;
                check_len(&operand.name, bytes.len() / 4, values.len())?;
                for (chunk, value) in bytes.chunks_exact_mut(4).zip(values) {
                    chunk.copy_from_slice(&quantize_i32(*value, params).to_le_bytes());
                }
                Ok(())
            }
            ElemKind::I64 => Err(BackendError::execution(format!(
                "cannot store real values into index buffer `{}`",
                operand.name
            ))),
        }
    }
}

fn check_len(name: &str, expected: usize, actual: usize) -> BackendResult<()> {
    if expected != actual {
        return Err(BackendError::execution(format!(
            "`{name}` holds {expected} elements, kernel produced {actual}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(arena: usize, poison: bool) -> Memory {
        let mut memory = Memory {
            weights: Vec::new(),
            arena: AlignedBytes::zeroed(arena),
            poisoned: poison.then(|| vec![true; arena]),
        };
        memory.reset_arena();
        memory
    }

    fn activation(name: &str, offset: usize) -> Operand {
        Operand {
            name: name.to_string(),
            ty: Type::f32(vec![4]),
            place: Place::Arena { offset },
        }
    }

    #[test]
    fn released_storage_cannot_be_read() {
        let mut memory = memory(64, true);
        let a = activation("a", 0);
        memory.store_f32(&a, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(memory.load_f32(&a).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);

        memory.poison(&a).unwrap();
        let err = memory.load_f32(&a).unwrap_err();
        assert!(err.to_string().contains("dead storage"), "{err}");
        assert!(memory.arena.as_slice()[..16].iter().all(|b| *b == POISON));
    }

    #[test]
    fn unwritten_storage_cannot_be_read_when_poisoning() {
        let memory = memory(64, true);
        assert!(memory.load_f32(&activation("fresh", 16)).is_err());
    }

    #[test]
    fn without_poisoning_release_is_a_no_op() {
        let mut memory = memory(64, false);
        let a = activation("a", 0);
        memory.store_f32(&a, &[1.0; 4]).unwrap();
        memory.poison(&a).unwrap();
        assert_eq!(memory.load_f32(&a).unwrap(), vec![1.0; 4]);
        assert!(!memory.is_poisoning());
    }

    #[test]
    fn fixed_point_stores_quantize() {
        let mut memory = memory(64, false);
        let q = Operand {
            name: "q".to_string(),
            ty: Type::new(ElemKind::i8q(QuantParams::new(0.5, 1)), vec![3]),
            place: Place::Arena { offset: 0 },
        };
        memory.store_real(&q, &[0.0, 1.0, -1.0]).unwrap();
        let (raw, params) = memory.load_quantized(&q).unwrap();
        assert_eq!(raw, vec![1, 3, -1]);
        assert_eq!(params.offset, 1);
        assert_eq!(memory.load_real(&q).unwrap(), vec![0.0, 1.0, -1.0]);
    }

    #[test]
    fn out_of_arena_operands_are_rejected() {
        let memory = memory(16, false);
        assert!(memory.bytes(&activation("late", 8)).is_err());
    }
}
