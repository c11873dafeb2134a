use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, Result};

/// Observed value range of one named tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeQuantizationInfo {
    pub name: String,
    pub min: f32,
    pub max: f32,
}

impl NodeQuantizationInfo {
    pub fn new(name: impl Into<String>, min: f32, max: f32) -> Self {
        Self {
            name: name.into(),
            min,
            max,
        }
    }
}

/// Version of the on-disk statistics format.
pub const PROFILE_FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct ProfileFile {
    version: u32,
    infos: Vec<NodeQuantizationInfo>,
}

fn validate(infos: &[NodeQuantizationInfo]) -> Result<()> {
    for info in infos {
        if !info.min.is_finite() || !info.max.is_finite() {
            return Err(CompileError::profile_mismatch(format!(
                "record `{}` has a non-finite range",
                info.name
            )));
        }
        if info.min > info.max {
            return Err(CompileError::profile_mismatch(format!(
                "record `{}` has min {} greater than max {}",
                info.name, info.min, info.max
            )));
        }
    }
    Ok(())
}

pub fn serialize_to_string(infos: &[NodeQuantizationInfo]) -> Result<String> {
    let file = ProfileFile {
        version: PROFILE_FORMAT_VERSION,
        infos: infos.to_vec(),
    };
    Ok(serde_json::to_string_pretty(&file)?)
}

pub fn deserialize_from_str(text: &str) -> Result<Vec<NodeQuantizationInfo>> {
    let file: ProfileFile = serde_json::from_str(text)?;
    if file.version != PROFILE_FORMAT_VERSION {
        return Err(CompileError::profile_mismatch(format!(
            "unsupported statistics format version {} (expected {PROFILE_FORMAT_VERSION})",
            file.version
        )));
    }
    validate(&file.infos)?;
    Ok(file.infos)
}

/// Writes the records, in order, as pretty-printed JSON.
pub fn serialize_to_file(path: &Path, infos: &[NodeQuantizationInfo]) -> Result<()> {
    let text = serialize_to_string(infos)?;
    fs::write(path, text).map_err(|err| CompileError::io(path, err))?;
    log::info!("wrote {} quantization records to {}", infos.len(), path.display());
    Ok(())
}

pub fn deserialize_from_file(path: &Path) -> Result<Vec<NodeQuantizationInfo>> {
    let text = fs::read_to_string(path).map_err(|err| CompileError::io(path, err))?;
    let infos = deserialize_from_str(&text)?;
    log::info!("read {} quantization records from {}", infos.len(), path.display());
    Ok(infos)
}
