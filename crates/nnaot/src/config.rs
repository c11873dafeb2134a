//! Explicit compiler configuration threaded into the execution engine.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backend::{BackendKind, CompilationMode};
use crate::env;
use crate::error::{CompileError, Result};
use crate::optimizer::OptimizerConfig;
use crate::quantization::QuantizationOptions;

/// Where to write debug renderings; `None` disables each dump.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DumpTargets {
    /// Print the optimized graph as text through the log.
    pub graph: bool,
    pub graph_dot: Option<PathBuf>,
    /// Print the lowered program as text through the log.
    pub ir: bool,
    pub ir_dot: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub backend: BackendKind,
    pub mode: CompilationMode,
    /// Instrument the graph and write collected statistics here after running.
    pub dump_profile: Option<PathBuf>,
    /// Quantize the graph with statistics read from here.
    pub load_profile: Option<PathBuf>,
    /// Save a bundle into this directory instead of running.
    pub emit_bundle: Option<PathBuf>,
    pub dumps: DumpTargets,
    pub optimizer: OptimizerConfig,
    pub quantization: QuantizationOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Interpreter,
            mode: CompilationMode::Infer,
            dump_profile: None,
            load_profile: None,
            emit_bundle: None,
            dumps: DumpTargets::default(),
            optimizer: OptimizerConfig::default(),
            quantization: QuantizationOptions::default(),
        }
    }
}

impl EngineConfig {
    pub fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            ..Self::default()
        }
    }

    /// Rejects contradictory settings before any compilation work starts.
    pub fn validate(&self) -> Result<()> {
        if self.dump_profile.is_some() && self.load_profile.is_some() {
            return Err(CompileError::Config(
                "dump-profile and load-profile are mutually exclusive".to_string(),
            ));
        }
        if self.optimizer.max_iters == 0 {
            return Err(CompileError::Config(
                "optimizer.max_iters must be at least 1".to_string(),
            ));
        }
        if self.emit_bundle.is_some() && self.dump_profile.is_some() {
            return Err(CompileError::Config(
                "a bundle cannot collect a quantization profile; drop dump-profile".to_string(),
            ));
        }
        Ok(())
    }

    /// Overrides fields from `NNAOT_BACKEND`, `NNAOT_OPT_MAX_ITERS` and
    /// `NNAOT_STRICT_PROFILE`. Unparsable values are reported, not ignored.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(value) = env::var("NNAOT_BACKEND") {
            self.backend = value.parse().map_err(CompileError::Config)?;
        }
        if let Some(value) = env::var("NNAOT_OPT_MAX_ITERS") {
            self.optimizer.max_iters = value.parse().map_err(|_| {
                CompileError::Config(format!("NNAOT_OPT_MAX_ITERS=`{value}` is not a count"))
            })?;
        }
        if let Some(value) = env::var("NNAOT_STRICT_PROFILE") {
            self.quantization.strict_coverage = env::parse_bool(&value).ok_or_else(|| {
                CompileError::Config(format!(
                    "NNAOT_STRICT_PROFILE=`{value}` is not one of 1/0, true/false, yes/no, on/off"
                ))
            })?;
        }
        Ok(())
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| CompileError::io(path, err))?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(r#"{"backend": "native"}"#).unwrap();
        assert_eq!(config.backend, BackendKind::Native);
        assert_eq!(config.optimizer.max_iters, 16);
        assert!(config.load_profile.is_none());
    }
}
