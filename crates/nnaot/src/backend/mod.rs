//! Backend capability interface.
//!
//! A backend turns an [`IrFunction`] into a [`CompiledFunction`] that can be
//! executed repeatedly, and may optionally serialize a standalone bundle.
//! Backends live in their own crates and reach the engine through the
//! [`registry`].

mod bundle;
pub mod registry;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ir::IrFunction;
use crate::tensor::Tensor;

pub use bundle::{BundleBuffer, BundleManifest, BUNDLE_MANIFEST_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Executes instructions through a dispatch table.
    Interpreter,
    /// Generates and links native code.
    Native,
    /// Generates device kernels.
    Gpu,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [BackendKind::Interpreter, BackendKind::Native, BackendKind::Gpu];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Interpreter => "interpreter",
            BackendKind::Native => "native",
            BackendKind::Gpu => "gpu",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interpreter" | "interp" => Ok(BackendKind::Interpreter),
            "native" | "cpu" | "c" => Ok(BackendKind::Native),
            "gpu" | "cuda" => Ok(BackendKind::Gpu),
            other => Err(format!(
                "unknown backend `{other}` (expected interpreter, native or gpu)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompilationMode {
    #[default]
    Infer,
    Train,
}

impl fmt::Display for CompilationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompilationMode::Infer => f.write_str("infer"),
            CompilationMode::Train => f.write_str("train"),
        }
    }
}

#[derive(Debug)]
pub enum BackendError {
    /// The backend cannot lower or generate code for an instruction.
    Unsupported {
        backend: String,
        instruction: String,
        node: String,
        reason: String,
    },
    /// Required toolchain, driver or device is missing.
    Unavailable { backend: String, reason: String },
    Execution { message: String },
    Io { path: PathBuf, source: std::io::Error },
}

impl BackendError {
    pub fn unsupported(
        backend: impl Into<String>,
        instruction: impl Into<String>,
        node: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        BackendError::Unsupported {
            backend: backend.into(),
            instruction: instruction.into(),
            node: node.into(),
            reason: reason.into(),
        }
    }

    pub fn unavailable(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        BackendError::Unavailable {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }

    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        BackendError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Unsupported {
                backend,
                instruction,
                node,
                reason,
            } => write!(
                f,
                "backend `{backend}` cannot compile `{instruction}` (node `{node}`): {reason}"
            ),
            BackendError::Unavailable { backend, reason } => {
                write!(f, "backend `{backend}` is unavailable: {reason}")
            }
            BackendError::Execution { message } => {
                write!(f, "backend execution failure: {message}")
            }
            BackendError::Io { path, source } => {
                write!(f, "i/o error on {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for BackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BackendError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// Host tensors exchanged with a compiled function, keyed by weight name.
///
/// Before execution it holds every `Input` and `Profile` weight; afterwards
/// `Output` and `Profile` entries carry the results.
#[derive(Debug, Clone, Default)]
pub struct IoBindings {
    tensors: BTreeMap<String, Tensor>,
}

impl IoBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.tensors.get_mut(name)
    }

    pub fn take(&mut self, name: &str) -> Option<Tensor> {
        self.tensors.remove(name)
    }

    /// Tensor bound to `name`, or an execution error naming the missing binding.
    pub fn require(&self, name: &str) -> BackendResult<&Tensor> {
        self.get(name)
            .ok_or_else(|| BackendError::execution(format!("no tensor bound to `{name}`")))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.tensors.iter()
    }
}

/// A target able to compile lowered programs.
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn name(&self) -> &str {
        self.kind().as_str()
    }

    fn compile(
        &self,
        function: &IrFunction,
        mode: CompilationMode,
    ) -> BackendResult<Box<dyn CompiledFunction>>;

    /// Writes a standalone bundle into `output_dir` instead of compiling for
    /// in-process execution.
    fn save(
        &self,
        function: &IrFunction,
        mode: CompilationMode,
        output_dir: &Path,
    ) -> BackendResult<BundleManifest> {
        let _ = (mode, output_dir);
        Err(BackendError::unsupported(
            self.name(),
            "bundle",
            function.name(),
            "bundle emission is not supported by this backend",
        ))
    }
}

/// Immutable, backend-specific artifact bound to one backend kind and mode.
pub trait CompiledFunction: Send {
    fn kind(&self) -> BackendKind;
    fn mode(&self) -> CompilationMode;
    fn execute(&mut self, io: &mut IoBindings) -> BackendResult<()>;
}
