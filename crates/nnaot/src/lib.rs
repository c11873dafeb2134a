pub mod backend;
pub mod config;
pub mod dump;
pub mod engine;
mod env;
pub mod error;
pub mod graph;
pub mod import;
pub mod ir;
pub mod optimizer;
pub mod quantization;
pub mod tensor;

pub use backend::{Backend, BackendKind, CompilationMode, CompiledFunction};
pub use config::EngineConfig;
pub use engine::ExecutionEngine;
pub use error::{CompileError, Result};
pub use graph::{Function, NodeId, NodeKind};
pub use ir::IrFunction;
pub use tensor::{ElemKind, Layout, Tensor, Type};
