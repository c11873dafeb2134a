use std::path::PathBuf;

use thiserror::Error;

use crate::backend::BackendError;

/// Errors that abort a compilation unit.
///
/// Every variant is fatal for the unit that raised it; nothing is retried.
/// Missing quantization statistics are deliberately absent from this list:
/// they are counted in [`crate::quantization::QuantizationReport`] instead.
#[derive(Debug, Error)]
pub enum CompileError {
    /// Malformed or cyclic graph, dangling reference, illegal mutation.
    #[error("structural error at node `{node}`: {message}")]
    Structural { node: String, message: String },
    /// Incompatible operand types or a bound tensor that disagrees with its declaration.
    #[error("type mismatch at `{node}`: {message}")]
    TypeMismatch { node: String, message: String },
    /// Statistics file and graph disagree on tensor names.
    #[error("quantization profile mismatch: {message}")]
    ProfileMismatch { message: String },
    /// The backend cannot lower or generate code for an instruction.
    #[error("backend `{backend}` cannot compile instruction `{instruction}` (node `{node}`): {reason}")]
    BackendCompilation {
        backend: String,
        instruction: String,
        node: String,
        reason: String,
    },
    #[error(transparent)]
    Backend(BackendError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("`{0}` not found")]
    NotFound(String),
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CompileError {
    pub fn structural(node: impl Into<String>, message: impl Into<String>) -> Self {
        CompileError::Structural {
            node: node.into(),
            message: message.into(),
        }
    }

    pub fn type_mismatch(node: impl Into<String>, message: impl Into<String>) -> Self {
        CompileError::TypeMismatch {
            node: node.into(),
            message: message.into(),
        }
    }

    pub fn profile_mismatch(message: impl Into<String>) -> Self {
        CompileError::ProfileMismatch {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CompileError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<BackendError> for CompileError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unsupported {
                backend,
                instruction,
                node,
                reason,
            } => CompileError::BackendCompilation {
                backend,
                instruction,
                node,
                reason,
            },
            other => CompileError::Backend(other),
        }
    }
}

pub type Result<T, E = CompileError> = std::result::Result<T, E>;
