use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::ir::{IrFunction, WeightRole};
use crate::tensor::ElemKind;

use super::{BackendError, BackendResult};

pub const BUNDLE_MANIFEST_VERSION: u32 = 1;

/// One external buffer the bundle entry point expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleBuffer {
    pub name: String,
    pub role: WeightRole,
    pub elem: ElemKind,
    pub dims: Vec<usize>,
    pub size: usize,
    /// Byte offset into the weights file, for constants only.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub weights_offset: Option<usize>,
}

/// Describes how to link and invoke a saved bundle without the compiler.
///
/// The entry point receives `weights[i]` for every entry of `buffers` (in
/// order) and one activation arena of `activation_bytes` bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub version: u32,
    pub name: String,
    pub entry: String,
    pub backend: String,
    pub mode: super::CompilationMode,
    pub activation_bytes: usize,
    pub alignment: usize,
    pub weights_file: String,
    pub weights_bytes: usize,
    pub buffers: Vec<BundleBuffer>,
    pub files: Vec<String>,
}

impl BundleManifest {
    /// Manifest skeleton for `function`, with buffer table and constant offsets
    /// filled in. Constants are packed in weight order with 64-byte alignment.
    pub fn describe(
        function: &IrFunction,
        backend: &str,
        entry: &str,
        mode: super::CompilationMode,
    ) -> Self {
        let mut cursor = 0usize;
        let buffers = function
            .weights()
            .iter()
            .map(|weight| {
                let size = weight.ty.byte_len();
                let weights_offset = (weight.role == WeightRole::Constant).then(|| {
                    let offset = cursor;
                    cursor = align_up(cursor + size, crate::ir::ARENA_ALIGNMENT);
                    offset
                });
                BundleBuffer {
                    name: weight.name.clone(),
                    role: weight.role,
                    elem: weight.ty.elem(),
                    dims: weight.ty.dims().to_vec(),
                    size,
                    weights_offset,
                }
            })
            .collect();
        BundleManifest {
            version: BUNDLE_MANIFEST_VERSION,
            name: function.name().to_string(),
            entry: entry.to_string(),
            backend: backend.to_string(),
            mode,
            activation_bytes: function.memory().activation_bytes,
            alignment: crate::ir::ARENA_ALIGNMENT,
            weights_file: format!("{}.weights.bin", function.name()),
            weights_bytes: cursor,
            buffers,
            files: Vec::new(),
        }
    }

    /// Concatenated constant payloads laid out at the manifest offsets.
    pub fn pack_weights(&self, function: &IrFunction) -> Vec<u8> {
        let mut blob = vec![0u8; self.weights_bytes];
        for (buffer, weight) in self.buffers.iter().zip(function.weights()) {
            let (Some(offset), Some(payload)) = (buffer.weights_offset, weight.payload.as_ref())
            else {
                continue;
            };
            let bytes = payload.to_le_bytes();
            blob[offset..offset + bytes.len()].copy_from_slice(&bytes);
        }
        blob
    }

    pub fn write(&self, path: &Path) -> BackendResult<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|err| BackendError::execution(format!("manifest serialization: {err}")))?;
        std::fs::write(path, text).map_err(|err| BackendError::io(path, err))
    }

    pub fn read(path: &Path) -> BackendResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| BackendError::io(path, err))?;
        serde_json::from_str(&text)
            .map_err(|err| BackendError::execution(format!("manifest {}: {err}", path.display())))
    }
}

fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}
