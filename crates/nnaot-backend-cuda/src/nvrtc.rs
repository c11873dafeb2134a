//! Runtime compilation of CUDA C to PTX through NVRTC.

use std::ffi::{c_void, CString};
use std::os::raw::c_char;
use std::sync::{Arc, OnceLock};

use libloading::Library;
use nnaot::backend::{BackendError, BackendResult};

use crate::device::{load_library, load_symbol, reason};
use crate::BACKEND;

type NvrtcResult = i32;
type NvrtcProgram = *mut c_void;

const NVRTC_SUCCESS: NvrtcResult = 0;

type CreateProgramFn = unsafe extern "C" fn(
    prog: *mut NvrtcProgram,
    src: *const c_char,
    name: *const c_char,
    num_headers: i32,
    headers: *const *const c_char,
    include_names: *const *const c_char,
) -> NvrtcResult;
type CompileProgramFn = unsafe extern "C" fn(
    prog: NvrtcProgram,
    num_options: i32,
    options: *const *const c_char,
) -> NvrtcResult;
type DestroyProgramFn = unsafe extern "C" fn(prog: *mut NvrtcProgram) -> NvrtcResult;
type GetSizeFn = unsafe extern "C" fn(prog: NvrtcProgram, size: *mut usize) -> NvrtcResult;
type GetTextFn = unsafe extern "C" fn(prog: NvrtcProgram, out: *mut c_char) -> NvrtcResult;

/// Options matching the host backends' arithmetic: no fused multiply-add,
/// IEEE division and square root.
const OPTIONS: [&str; 4] = [
    "--fmad=false",
    "--prec-div=true",
    "--prec-sqrt=true",
    "--std=c++14",
];

pub struct Nvrtc {
    _lib: Library,
    create_program: CreateProgramFn,
    compile_program: CompileProgramFn,
    destroy_program: DestroyProgramFn,
    get_ptx_size: GetSizeFn,
    get_ptx: GetTextFn,
    get_log_size: GetSizeFn,
    get_log: GetTextFn,
}

static NVRTC: OnceLock<Result<Arc<Nvrtc>, String>> = OnceLock::new();

pub fn nvrtc() -> BackendResult<Arc<Nvrtc>> {
    let init = NVRTC.get_or_init(|| Nvrtc::load().map(Arc::new).map_err(reason));
    match init {
        Ok(nvrtc) => Ok(Arc::clone(nvrtc)),
        Err(msg) => Err(BackendError::unavailable(BACKEND, msg.clone())),
    }
}

/// Destroys the program handle however compilation ends.
struct ProgramGuard<'a> {
    nvrtc: &'a Nvrtc,
    prog: NvrtcProgram,
}

impl Drop for ProgramGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the handle was created by `nvrtcCreateProgram` and is destroyed once.
        let _ = unsafe { (self.nvrtc.destroy_program)(&mut self.prog) };
    }
}

impl Nvrtc {
    fn load() -> BackendResult<Self> {
        let lib = load_library(
            &[
                "libnvrtc.so",
                "libnvrtc.so.12",
                "libnvrtc.so.11.2",
                "nvrtc64_120_0.dll",
            ],
            "NVRTC",
        )?;
        Ok(Self {
            create_program: load_symbol(&lib, b"nvrtcCreateProgram\0")?,
            compile_program: load_symbol(&lib, b"nvrtcCompileProgram\0")?,
            destroy_program: load_symbol(&lib, b"nvrtcDestroyProgram\0")?,
            get_ptx_size: load_symbol(&lib, b"nvrtcGetPTXSize\0")?,
            get_ptx: load_symbol(&lib, b"nvrtcGetPTX\0")?,
            get_log_size: load_symbol(&lib, b"nvrtcGetProgramLogSize\0")?,
            get_log: load_symbol(&lib, b"nvrtcGetProgramLog\0")?,
            _lib: lib,
        })
    }

    /// Compiles `source` and returns the PTX text.
    pub fn compile(&self, source: &str, name: &str) -> BackendResult<String> {
        let c_source =
            CString::new(source).map_err(|_| BackendError::execution("source contains a NUL byte"))?;
        let c_name =
            CString::new(name).map_err(|_| BackendError::execution("name contains a NUL byte"))?;
        let options: Vec<CString> = OPTIONS
            .iter()
            .filter_map(|option| CString::new(*option).ok())
            .collect();
        let option_ptrs: Vec<*const c_char> = options.iter().map(|o| o.as_ptr()).collect();

        let mut prog: NvrtcProgram = std::ptr::null_mut();
        // SAFETY: source and name are NUL-terminated; no headers are passed.
        check(
            unsafe {
                (self.create_program)(
                    &mut prog,
                    c_source.as_ptr(),
                    c_name.as_ptr(),
                    0,
                    std::ptr::null(),
                    std::ptr::null(),
                )
            },
            "nvrtcCreateProgram",
        )?;
        let guard = ProgramGuard { nvrtc: self, prog };

        // SAFETY: `option_ptrs` holds `options.len()` live C strings.
        let status = unsafe {
            (self.compile_program)(guard.prog, option_ptrs.len() as i32, option_ptrs.as_ptr())
        };
        if status != NVRTC_SUCCESS {
            let log = Self::read_text(guard.prog, self.get_log_size, self.get_log)?;
            return Err(BackendError::execution(format!(
                "NVRTC failed with code {status}:\n{log}"
            )));
        }
        Self::read_text(guard.prog, self.get_ptx_size, self.get_ptx)
    }

    fn read_text(
        prog: NvrtcProgram,
        size: GetSizeFn,
        text: GetTextFn,
    ) -> BackendResult<String> {
        let mut len = 0usize;
        // SAFETY: `prog` is a live program and `len` a valid out pointer.
        check(unsafe { size(prog, &mut len) }, "nvrtc size query")?;
        let mut buffer = vec![0u8; len.max(1)];
        // SAFETY: `buffer` holds the `len` bytes NVRTC reported, NUL included.
        check(
            unsafe { text(prog, buffer.as_mut_ptr() as *mut c_char) },
            "nvrtc text query",
        )?;
        while buffer.last() == Some(&0) {
            buffer.pop();
        }
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

fn check(code: NvrtcResult, op: &str) -> BackendResult<()> {
    if code == NVRTC_SUCCESS {
        Ok(())
    } else {
        Err(BackendError::execution(format!("{op} failed with code {code}")))
    }
}
