//! CUDA driver API, resolved at runtime from the installed driver library.

use std::ffi::{c_void, CString};
use std::fmt;
use std::os::raw::c_char;
use std::sync::{Arc, OnceLock};

use libloading::Library;
use nnaot::backend::{BackendError, BackendResult};

use crate::BACKEND;

type CUresult = i32;
type CUdevice = i32;
type CUcontext = *mut c_void;
type CUdeviceptr = u64;
type CUmodule = *mut c_void;
type CUfunction = *mut c_void;
type CUstream = *mut c_void;

const CUDA_SUCCESS: CUresult = 0;

type CuInitFn = unsafe extern "C" fn(flags: u32) -> CUresult;
type CuDeviceGetFn = unsafe extern "C" fn(device: *mut CUdevice, ordinal: i32) -> CUresult;
type CuCtxCreateFn =
    unsafe extern "C" fn(ctx: *mut CUcontext, flags: u32, dev: CUdevice) -> CUresult;
type CuCtxDestroyFn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuCtxSetCurrentFn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuCtxSynchronizeFn = unsafe extern "C" fn() -> CUresult;
type CuMemAllocFn = unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult;
type CuMemFreeFn = unsafe extern "C" fn(dptr: CUdeviceptr) -> CUresult;
type CuMemcpyHtoDFn = unsafe extern "C" fn(
    dst_device: CUdeviceptr,
    src_host: *const c_void,
    byte_count: usize,
) -> CUresult;
type CuMemcpyDtoHFn = unsafe extern "C" fn(
    dst_host: *mut c_void,
    src_device: CUdeviceptr,
    byte_count: usize,
) -> CUresult;
type CuMemsetD8Fn =
    unsafe extern "C" fn(dst_device: CUdeviceptr, value: u8, count: usize) -> CUresult;
type CuModuleLoadDataExFn = unsafe extern "C" fn(
    module: *mut CUmodule,
    image: *const c_void,
    num_options: u32,
    options: *mut u32,
    option_values: *mut *mut c_void,
) -> CUresult;
type CuModuleUnloadFn = unsafe extern "C" fn(module: CUmodule) -> CUresult;
type CuModuleGetFunctionFn =
    unsafe extern "C" fn(hfunc: *mut CUfunction, hmod: CUmodule, name: *const c_char) -> CUresult;
type CuLaunchKernelFn = unsafe extern "C" fn(
    f: CUfunction,
    grid_dim_x: u32,
    grid_dim_y: u32,
    grid_dim_z: u32,
    block_dim_x: u32,
    block_dim_y: u32,
    block_dim_z: u32,
    shared_mem_bytes: u32,
    h_stream: CUstream,
    kernel_params: *mut *mut c_void,
    extra: *mut *mut c_void,
) -> CUresult;

struct DriverFns {
    init: CuInitFn,
    device_get: CuDeviceGetFn,
    ctx_create: CuCtxCreateFn,
    ctx_destroy: CuCtxDestroyFn,
    ctx_set_current: CuCtxSetCurrentFn,
    ctx_synchronize: CuCtxSynchronizeFn,
    mem_alloc: CuMemAllocFn,
    mem_free: CuMemFreeFn,
    memcpy_htod: CuMemcpyHtoDFn,
    memcpy_dtoh: CuMemcpyDtoHFn,
    memset_d8: CuMemsetD8Fn,
    module_load_data_ex: CuModuleLoadDataExFn,
    module_unload: CuModuleUnloadFn,
    module_get_function: CuModuleGetFunctionFn,
    launch_kernel: CuLaunchKernelFn,
}

pub struct CudaDriver {
    _lib: Library,
    fns: DriverFns,
    // Kept as an integer so the driver is Send + Sync.
    ctx: usize,
}

impl Drop for CudaDriver {
    fn drop(&mut self) {
        if self.ctx != 0 {
            // SAFETY: the context is owned by this driver and destroyed once.
            let _ = unsafe { (self.fns.ctx_destroy)(self.ctx as CUcontext) };
            self.ctx = 0;
        }
    }
}

/// Device allocation released on drop.
pub struct DeviceBuffer {
    driver: Arc<CudaDriver>,
    ptr: CUdeviceptr,
    bytes: usize,
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &self.ptr)
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl DeviceBuffer {
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn device_ptr(&self) -> u64 {
        self.ptr
    }

    pub fn upload(&self, bytes: &[u8]) -> BackendResult<()> {
        if bytes.len() != self.bytes {
            return Err(BackendError::execution(format!(
                "upload of {} bytes into a {} byte device buffer",
                bytes.len(),
                self.bytes
            )));
        }
        self.driver.upload(self.ptr, bytes)
    }

    pub fn download(&self) -> BackendResult<Vec<u8>> {
        self.driver.download(self.ptr, self.bytes)
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if self.bytes != 0 {
            // SAFETY: the pointer was allocated by this driver and is freed once.
            let _ = unsafe { (self.driver.fns.mem_free)(self.ptr) };
        }
    }
}

pub struct CudaModule {
    driver: Arc<CudaDriver>,
    module: usize,
}

impl Drop for CudaModule {
    fn drop(&mut self) {
        if self.module != 0 {
            // SAFETY: the module belongs to this driver and is unloaded once.
            let _ = unsafe { (self.driver.fns.module_unload)(self.module as CUmodule) };
            self.module = 0;
        }
    }
}

#[derive(Clone)]
pub struct CudaFunction {
    // Keeps the module loaded while the function handle is in use.
    _module: Arc<CudaModule>,
    func: usize,
}

static CUDA_DRIVER: OnceLock<Result<Arc<CudaDriver>, String>> = OnceLock::new();

pub fn is_available() -> bool {
    driver().is_ok()
}

/// Process-wide driver with a context on device 0, created on first use.
pub fn driver() -> BackendResult<Arc<CudaDriver>> {
    let init = CUDA_DRIVER.get_or_init(|| match CudaDriver::new() {
        Ok(driver) => Ok(Arc::new(driver)),
        Err(err) => Err(reason(err)),
    });
    match init {
        Ok(driver) => Ok(Arc::clone(driver)),
        Err(msg) => Err(BackendError::unavailable(BACKEND, msg.clone())),
    }
}

impl CudaDriver {
    fn new() -> BackendResult<Self> {
        let lib = load_library(&["libcuda.so.1", "libcuda.so", "nvcuda.dll"], "CUDA driver")?;
        let fns = DriverFns {
            init: load_symbol(&lib, b"cuInit\0")?,
            device_get: load_symbol(&lib, b"cuDeviceGet\0")?,
            ctx_create: load_symbol(&lib, b"cuCtxCreate_v2\0")?,
            ctx_destroy: load_symbol(&lib, b"cuCtxDestroy_v2\0")?,
            ctx_set_current: load_symbol(&lib, b"cuCtxSetCurrent\0")?,
            ctx_synchronize: load_symbol(&lib, b"cuCtxSynchronize\0")?,
            mem_alloc: load_symbol(&lib, b"cuMemAlloc_v2\0")?,
            mem_free: load_symbol(&lib, b"cuMemFree_v2\0")?,
            memcpy_htod: load_symbol(&lib, b"cuMemcpyHtoD_v2\0")?,
            memcpy_dtoh: load_symbol(&lib, b"cuMemcpyDtoH_v2\0")?,
            memset_d8: load_symbol(&lib, b"cuMemsetD8_v2\0")?,
            module_load_data_ex: load_symbol(&lib, b"cuModuleLoadDataEx\0")?,
            module_unload: load_symbol(&lib, b"cuModuleUnload\0")?,
            module_get_function: load_symbol(&lib, b"cuModuleGetFunction\0")?,
            launch_kernel: load_symbol(&lib, b"cuLaunchKernel\0")?,
        };

        // A driver without a usable device is reported as unavailable.
        let no_device = |err: BackendError| BackendError::unavailable(BACKEND, reason(err));
        // SAFETY: every out pointer is valid for the duration of its call.
        unsafe {
            check_cuda((fns.init)(0), "cuInit").map_err(no_device)?;
            let mut dev: CUdevice = 0;
            check_cuda((fns.device_get)(&mut dev, 0), "cuDeviceGet").map_err(no_device)?;
            let mut ctx: CUcontext = std::ptr::null_mut();
            check_cuda((fns.ctx_create)(&mut ctx, 0, dev), "cuCtxCreate_v2").map_err(no_device)?;
            Ok(Self {
                _lib: lib,
                fns,
                ctx: ctx as usize,
            })
        }
    }

    pub fn alloc_zeroed(self: &Arc<Self>, bytes: usize) -> BackendResult<DeviceBuffer> {
        self.ensure_current()?;
        let mut ptr: CUdeviceptr = 0;
        if bytes != 0 {
            // SAFETY: `ptr` is a valid out pointer and the memset stays within
            // the fresh allocation.
            unsafe {
                check_cuda((self.fns.mem_alloc)(&mut ptr, bytes), "cuMemAlloc_v2")?;
                check_cuda((self.fns.memset_d8)(ptr, 0, bytes), "cuMemsetD8_v2")?;
            }
        }
        Ok(DeviceBuffer {
            driver: Arc::clone(self),
            ptr,
            bytes,
        })
    }

    pub fn alloc_and_upload(self: &Arc<Self>, bytes: &[u8]) -> BackendResult<DeviceBuffer> {
        let buffer = self.alloc_zeroed(bytes.len())?;
        buffer.upload(bytes)?;
        Ok(buffer)
    }

    fn upload(&self, ptr: CUdeviceptr, bytes: &[u8]) -> BackendResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.ensure_current()?;
        // SAFETY: the destination allocation holds `bytes.len()` bytes.
        unsafe {
            check_cuda(
                (self.fns.memcpy_htod)(ptr, bytes.as_ptr() as *const c_void, bytes.len()),
                "cuMemcpyHtoD_v2",
            )
        }
    }

    fn download(&self, ptr: CUdeviceptr, bytes: usize) -> BackendResult<Vec<u8>> {
        let mut out = vec![0u8; bytes];
        if bytes != 0 {
            self.ensure_current()?;
            // SAFETY: the source allocation holds `bytes` bytes and `out` is writable.
            unsafe {
                check_cuda(
                    (self.fns.memcpy_dtoh)(out.as_mut_ptr() as *mut c_void, ptr, bytes),
                    "cuMemcpyDtoH_v2",
                )?;
            }
        }
        Ok(out)
    }

    pub fn load_ptx_module(self: &Arc<Self>, ptx: &str) -> BackendResult<Arc<CudaModule>> {
        self.ensure_current()?;
        let c_ptx =
            CString::new(ptx).map_err(|_| BackendError::execution("ptx contains a NUL byte"))?;
        let mut module: CUmodule = std::ptr::null_mut();
        // SAFETY: the image is a NUL-terminated PTX string and no options are passed.
        unsafe {
            check_cuda(
                (self.fns.module_load_data_ex)(
                    &mut module,
                    c_ptx.as_ptr() as *const c_void,
                    0,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                ),
                "cuModuleLoadDataEx",
            )?;
        }
        Ok(Arc::new(CudaModule {
            driver: Arc::clone(self),
            module: module as usize,
        }))
    }

    pub fn get_function(
        &self,
        module: &Arc<CudaModule>,
        symbol: &str,
    ) -> BackendResult<CudaFunction> {
        self.ensure_current()?;
        let c_symbol = CString::new(symbol)
            .map_err(|_| BackendError::execution("kernel symbol contains a NUL byte"))?;
        let mut function: CUfunction = std::ptr::null_mut();
        // SAFETY: module handle and out pointer are valid.
        unsafe {
            check_cuda(
                (self.fns.module_get_function)(
                    &mut function,
                    module.module as CUmodule,
                    c_symbol.as_ptr(),
                ),
                "cuModuleGetFunction",
            )?;
        }
        Ok(CudaFunction {
            _module: Arc::clone(module),
            func: function as usize,
        })
    }

    /// Launches a 1-D grid on the default stream.
    pub fn launch(
        &self,
        function: &CudaFunction,
        blocks: u32,
        threads: u32,
        params: &mut [*mut c_void],
    ) -> BackendResult<()> {
        self.ensure_current()?;
        // SAFETY: `params` points at one live argument per kernel parameter.
        unsafe {
            check_cuda(
                (self.fns.launch_kernel)(
                    function.func as CUfunction,
                    blocks,
                    1,
                    1,
                    threads,
                    1,
                    1,
                    0,
                    std::ptr::null_mut(),
                    params.as_mut_ptr(),
                    std::ptr::null_mut(),
                ),
                "cuLaunchKernel",
            )
        }
    }

    pub fn synchronize(&self) -> BackendResult<()> {
        self.ensure_current()?;
        // SAFETY: a context is current on this thread.
        unsafe { check_cuda((self.fns.ctx_synchronize)(), "cuCtxSynchronize") }
    }

    fn ensure_current(&self) -> BackendResult<()> {
        // SAFETY: the context stays valid until the driver is dropped.
        unsafe {
            check_cuda(
                (self.fns.ctx_set_current)(self.ctx as CUcontext),
                "cuCtxSetCurrent",
            )
        }
    }
}

/// Opens the first loadable library among `candidates`.
pub(crate) fn load_library(candidates: &[&str], what: &str) -> BackendResult<Library> {
    for candidate in candidates {
        // SAFETY: probing only; no symbols are called here.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            return Ok(lib);
        }
    }
    Err(BackendError::unavailable(
        BACKEND,
        format!("cannot load the {what} library (tried {})", candidates.join(", ")),
    ))
}

pub(crate) fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> BackendResult<T> {
    // SAFETY: callers name the symbol together with its C signature.
    let symbol = unsafe { lib.get::<T>(name) }.map_err(|err| {
        BackendError::unavailable(
            BACKEND,
            format!(
                "missing symbol {}: {err}",
                String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name))
            ),
        )
    })?;
    Ok(*symbol)
}

/// Message of `err` without the generic error prefix.
pub(crate) fn reason(err: BackendError) -> String {
    match err {
        BackendError::Unavailable { reason, .. } => reason,
        BackendError::Execution { message } => message,
        other => other.to_string(),
    }
}

fn check_cuda(code: CUresult, op: &str) -> BackendResult<()> {
    if code == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(BackendError::execution(format!(
            "CUDA driver call {op} failed with code {code}"
        )))
    }
}
