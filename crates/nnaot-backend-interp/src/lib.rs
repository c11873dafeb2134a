//! Reference interpreter for lowered programs.
//!
//! Every instruction is bound to a kernel from a static dispatch table when
//! the program is compiled; pairs of instruction and element kind without a
//! kernel are rejected then, not at run time. Results define the reference
//! semantics the compiled backends are tested against.

mod dispatch;
mod kernels;
mod memory;
mod program;

use std::sync::Arc;

use nnaot::backend::registry::register_backend;
use nnaot::backend::{Backend, BackendKind, BackendResult, CompilationMode, CompiledFunction};
use nnaot::ir::IrFunction;

pub use program::InterpretedFunction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpreterOptions {
    /// Overwrite activations when they are released and fail on any read of
    /// released or never-written arena bytes. On by default in debug builds.
    pub poison_dead_buffers: bool,
}

impl Default for InterpreterOptions {
    fn default() -> Self {
        Self {
            poison_dead_buffers: cfg!(debug_assertions),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InterpreterBackend {
    options: InterpreterOptions,
}

impl InterpreterBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: InterpreterOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> InterpreterOptions {
        self.options
    }

    /// Like [`Backend::compile`], returning the concrete program.
    pub fn compile_program(
        &self,
        function: &IrFunction,
        mode: CompilationMode,
    ) -> BackendResult<InterpretedFunction> {
        program::compile(function, mode, self.options.poison_dead_buffers)
    }
}

impl Backend for InterpreterBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Interpreter
    }

    fn compile(
        &self,
        function: &IrFunction,
        mode: CompilationMode,
    ) -> BackendResult<Box<dyn CompiledFunction>> {
        Ok(Box::new(self.compile_program(function, mode)?))
    }
}

/// Registers the interpreter with the global backend registry.
pub fn register() {
    register_backend(BackendKind::Interpreter, || {
        Ok(Arc::new(InterpreterBackend::new()))
    });
}
