//! Native backend: lowered programs become one C translation unit, compiled
//! by the system C compiler and loaded in process with `libloading`.
//!
//! The scalar kernel emitter in [`kernels`] is shared with the GPU backend.

mod codegen;
mod function;
pub mod kernels;
mod toolchain;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use nnaot::backend::registry::register_backend;
use nnaot::backend::{
    Backend, BackendError, BackendKind, BackendResult, BundleManifest, CompilationMode,
    CompiledFunction,
};
use nnaot::ir::IrFunction;

pub use codegen::{collect_kernels, entry_symbol, generate, sanitize, CModule};
pub use function::NativeFunction;
pub use toolchain::compiler_available;

use function::CompiledModule;

#[derive(Default)]
pub struct NativeBackend {
    compiled: Mutex<HashMap<u64, Arc<CompiledModule>>>,
}

impl NativeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Like [`Backend::compile`], returning the concrete program.
    pub fn compile_native(
        &self,
        function: &IrFunction,
        mode: CompilationMode,
    ) -> BackendResult<NativeFunction> {
        let module = generate(function)?;
        let compiled = self.get_or_compile(&module)?;
        NativeFunction::new(function, mode, module.symbol, compiled)
    }

    fn get_or_compile(&self, module: &CModule) -> BackendResult<Arc<CompiledModule>> {
        let fingerprint = toolchain::source_fingerprint(&module.source);
        if let Some(found) = self.cache()?.get(&fingerprint).cloned() {
            return Ok(found);
        }

        let lib_path = toolchain::build_shared(&module.source, fingerprint)?;
        let loaded = Arc::new(CompiledModule::load(&lib_path, &module.symbol)?);
        Ok(self
            .cache()?
            .entry(fingerprint)
            .or_insert(loaded)
            .clone())
    }

    fn cache(&self) -> BackendResult<MutexGuard<'_, HashMap<u64, Arc<CompiledModule>>>> {
        self.compiled
            .lock()
            .map_err(|_| BackendError::execution("native module cache poisoned"))
    }
}

impl Backend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn compile(
        &self,
        function: &IrFunction,
        mode: CompilationMode,
    ) -> BackendResult<Box<dyn CompiledFunction>> {
        Ok(Box::new(self.compile_native(function, mode)?))
    }

    /// Writes `<name>.c`, `<name>.h`, `<name>.o`, the packed constants and,
    /// last, `<name>.manifest.json`.
    fn save(
        &self,
        function: &IrFunction,
        mode: CompilationMode,
        output_dir: &Path,
    ) -> BackendResult<BundleManifest> {
        std::fs::create_dir_all(output_dir).map_err(|err| BackendError::io(output_dir, err))?;
        let module = generate(function)?;
        let stem = function.name();
        let write = |file: &str, bytes: &[u8]| -> BackendResult<()> {
            let path = output_dir.join(file);
            std::fs::write(&path, bytes).map_err(|err| BackendError::io(&path, err))
        };

        let source = format!("{stem}.c");
        let header = format!("{stem}.h");
        let object = format!("{stem}.o");
        write(&source, module.source.as_bytes())?;
        write(&header, module.header.as_bytes())?;
        toolchain::compile_object(&output_dir.join(&source), &output_dir.join(&object))?;

        let mut manifest =
            BundleManifest::describe(function, BackendKind::Native.as_str(), &module.symbol, mode);
        write(&manifest.weights_file, &manifest.pack_weights(function))?;
        let manifest_file = format!("{stem}.manifest.json");
        manifest.files = vec![
            source,
            header,
            object,
            manifest.weights_file.clone(),
            manifest_file.clone(),
        ];
        manifest.write(&output_dir.join(manifest_file))?;
        Ok(manifest)
    }
}

/// Registers the native backend with the global backend registry.
pub fn register() {
    register_backend(BackendKind::Native, || Ok(Arc::new(NativeBackend::new())));
}
