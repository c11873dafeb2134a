//! GPU backend: one CUDA kernel per compute instruction, compiled to PTX with
//! NVRTC and launched through the driver API. Both libraries are loaded at
//! run time, so the crate builds and generates kernels without a CUDA
//! installation; compilation then fails with an unavailability error.

mod codegen;
pub mod device;
mod nvrtc;

use std::ffi::c_void;
use std::sync::Arc;

use nnaot::backend::registry::register_backend;
use nnaot::backend::{
    Backend, BackendError, BackendKind, BackendResult, CompilationMode, CompiledFunction,
    IoBindings,
};
use nnaot::ir::{IrFunction, Location, WeightRole};
use nnaot::tensor::{Tensor, Type};
use nnaot_backend_c::sanitize;

pub use codegen::{generate, CudaSource, KernelLaunch};

use device::{CudaDriver, CudaFunction, DeviceBuffer};

pub(crate) const BACKEND: &str = "gpu";

pub const THREADS_PER_BLOCK: u32 = 256;

#[derive(Debug, Clone, Default)]
pub struct CudaBackend;

impl CudaBackend {
    pub fn new() -> Self {
        Self
    }

    /// Like [`Backend::compile`], returning the concrete program.
    pub fn compile_program(
        &self,
        function: &IrFunction,
        mode: CompilationMode,
    ) -> BackendResult<CudaProgram> {
        let source = generate(function)?;
        let driver = device::driver()?;
        let unit = format!("{}.cu", sanitize(function.name()));
        let ptx = nvrtc::nvrtc()?.compile(&source.source, &unit)?;
        let module = driver.load_ptx_module(&ptx)?;

        let mut weights = Vec::with_capacity(function.weights().len());
        let mut bindings = Vec::new();
        for (index, weight) in function.weights().iter().enumerate() {
            if weight.role == WeightRole::Constant {
                let payload = weight.payload.as_ref().ok_or_else(|| {
                    BackendError::execution(format!("constant `{}` has no payload", weight.name))
                })?;
                weights.push(driver.alloc_and_upload(&payload.to_le_bytes())?);
            } else {
                weights.push(driver.alloc_zeroed(weight.ty.byte_len())?);
                bindings.push(Binding {
                    index,
                    name: weight.name.clone(),
                    ty: weight.ty.clone(),
                    role: weight.role,
                });
            }
        }
        let arena = driver.alloc_zeroed(function.memory().activation_bytes)?;

        let mut launches = Vec::with_capacity(source.launches.len());
        for launch in &source.launches {
            if launch.count == 0 {
                continue;
            }
            let args = launch
                .buffers
                .iter()
                .map(|id| match function.location(*id) {
                    Some(Location::Weight(index)) => Ok(weights[index].device_ptr()),
                    Some(Location::Activation { offset }) => Ok(arena.device_ptr() + offset as u64),
                    None => Err(BackendError::unsupported(
                        BACKEND,
                        launch.name.clone(),
                        launch.node.clone(),
                        format!("buffer {id} has no storage"),
                    )),
                })
                .collect::<BackendResult<Vec<u64>>>()?;
            let blocks = u32::try_from(launch.count.div_ceil(THREADS_PER_BLOCK as usize))
                .map_err(|_| {
                    BackendError::unsupported(
                        BACKEND,
                        launch.name.clone(),
                        launch.node.clone(),
                        format!("{} work items exceed one grid", launch.count),
                    )
                })?;
            launches.push(Launch {
                function: driver.get_function(&module, &launch.name)?,
                blocks,
                args,
            });
        }

        log::info!(
            target: "nnaot::gpu",
            "loaded `{}`: {} kernels, {} arena bytes on device",
            function.name(),
            launches.len(),
            arena.bytes()
        );
        Ok(CudaProgram {
            mode,
            driver,
            launches,
            weights,
            _arena: arena,
            bindings,
        })
    }
}

impl Backend for CudaBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Gpu
    }

    fn compile(
        &self,
        function: &IrFunction,
        mode: CompilationMode,
    ) -> BackendResult<Box<dyn CompiledFunction>> {
        Ok(Box::new(self.compile_program(function, mode)?))
    }
}

struct Launch {
    function: CudaFunction,
    blocks: u32,
    /// Device addresses passed by value, one per kernel parameter.
    args: Vec<u64>,
}

struct Binding {
    index: usize,
    name: String,
    ty: Type,
    role: WeightRole,
}

/// A program resident on the device with its weights and activation arena.
pub struct CudaProgram {
    mode: CompilationMode,
    driver: Arc<CudaDriver>,
    launches: Vec<Launch>,
    weights: Vec<DeviceBuffer>,
    // Addressed through the launch arguments only.
    _arena: DeviceBuffer,
    bindings: Vec<Binding>,
}

impl CompiledFunction for CudaProgram {
    fn kind(&self) -> BackendKind {
        BackendKind::Gpu
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
            self.weights[binding.index].upload(&tensor.to_le_bytes())?;
        }

        for launch in &self.launches {
            let mut args = launch.args.clone();
            let mut params: Vec<*mut c_void> = args
                .iter_mut()
                .map(|arg| arg as *mut u64 as *mut c_void)
                .collect();
            self.driver
                .launch(&launch.function, launch.blocks, THREADS_PER_BLOCK, &mut params)?;
        }
        self.driver.synchronize()?;

        for binding in self.bindings.iter().filter(|b| b.role.is_writable()) {
            let bytes = self.weights[binding.index].download()?;
            let tensor = Tensor::from_le_bytes(binding.ty.clone(), &bytes)
                .map_err(|err| BackendError::execution(err.to_string()))?;
            io.insert(binding.name.clone(), tensor);
        }
        Ok(())
    }
}

/// Registers the GPU backend with the global backend registry.
pub fn register() {
    register_backend(BackendKind::Gpu, || Ok(Arc::new(CudaBackend::new())));
}
