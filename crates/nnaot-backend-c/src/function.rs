use std::os::raw::c_int;
use std::sync::Arc;

use libloading::Library;
use nnaot::backend::{
    BackendError, BackendKind, BackendResult, CompilationMode, CompiledFunction, IoBindings,
};
use nnaot::ir::{IrFunction, WeightRole};
use nnaot::tensor::{AlignedBytes, Tensor, Type};

/// `int entry(uint8_t* const* weights, uint8_t* activations)`
pub(crate) type EntryFn = unsafe extern "C" fn(*const *mut u8, *mut u8) -> c_int;

pub(crate) struct CompiledModule {
    _lib: Library,
    entry: EntryFn,
}

impl CompiledModule {
    pub(crate) fn load(path: &std::path::Path, symbol: &str) -> BackendResult<Self> {
        // SAFETY: the library was produced by this crate's code generator and
        // runs no initialisers.
        let lib = unsafe { Library::new(path) }
            .map_err(|err| BackendError::execution(err.to_string()))?;
        // SAFETY: the generated entry point has exactly the `EntryFn` signature.
        let entry = unsafe { lib.get::<EntryFn>(symbol.as_bytes()).map(|symbol| *symbol) }
            .map_err(|err| BackendError::execution(err.to_string()))?;
        Ok(Self { _lib: lib, entry })
    }
}

struct Binding {
    index: usize,
    name: String,
    ty: Type,
    role: WeightRole,
}

/// A loaded native program with its own weights and activation arena.
pub struct NativeFunction {
    mode: CompilationMode,
    symbol: String,
    module: Arc<CompiledModule>,
    weights: Vec<AlignedBytes>,
    arena: AlignedBytes,
    bindings: Vec<Binding>,
}

impl NativeFunction {
    pub(crate) fn new(
        function: &IrFunction,
        mode: CompilationMode,
        symbol: String,
        module: Arc<CompiledModule>,
    ) -> BackendResult<Self> {
        let mut weights = Vec::with_capacity(function.weights().len());
        let mut bindings = Vec::new();
        for (index, weight) in function.weights().iter().enumerate() {
            if weight.role == WeightRole::Constant {
                let payload = weight.payload.as_ref().ok_or_else(|| {
                    BackendError::execution(format!("constant `{}` has no payload", weight.name))
                })?;
                weights.push(AlignedBytes::from_slice(&payload.to_le_bytes()));
            } else {
                weights.push(AlignedBytes::zeroed(weight.ty.byte_len()));
                bindings.push(Binding {
                    index,
                    name: weight.name.clone(),
                    ty: weight.ty.clone(),
                    role: weight.role,
                });
            }
        }
        Ok(Self {
            mode,
            symbol,
            module,
            weights,
            arena: AlignedBytes::zeroed(function.memory().activation_bytes),
            bindings,
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

impl CompiledFunction for NativeFunction {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn mode(&self) -> CompilationMode {
        self.mode
    }

    fn execute(&mut self, io: &mut IoBindings) -> BackendResult<()> {
        for binding in &self.bindings {
            if !matches!(binding.role, WeightRole::Input | WeightRole::Profile) {
                continue;
            }
            let tensor = io.require(&binding.name)?;
            if tensor.ty() != &binding.ty {
                return Err(BackendError::execution(format!(
                    "`{}` bound as {}, expected {}",
                    binding.name,
                    tensor.ty(),
                    binding.ty
                )));
            }
            self.weights[binding.index]
                .as_mut_slice()
                .copy_from_slice(&tensor.to_le_bytes());
        }

        let pointers: Vec<*mut u8> = self.weights.iter_mut().map(|w| w.as_mut_ptr()).collect();
        // SAFETY: every pointer addresses an aligned buffer sized from the same
        // program the entry point was generated for, and `self` is borrowed
        // mutably for the duration of the call.
        let status = unsafe { (self.module.entry)(pointers.as_ptr(), self.arena.as_mut_ptr()) };
        if status != 0 {
            return Err(BackendError::execution(format!(
                "`{}` returned status {status}",
                self.symbol
            )));
        }

        for binding in self.bindings.iter().filter(|b| b.role.is_writable()) {
            let tensor =
                Tensor::from_le_bytes(binding.ty.clone(), self.weights[binding.index].as_slice())
                    .map_err(|err| BackendError::execution(err.to_string()))?;
            io.insert(binding.name.clone(), tensor);
        }
        Ok(())
    }
}
