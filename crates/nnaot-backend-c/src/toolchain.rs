//! System C compiler invocation and the on-disk cache of shared objects.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::process::Command;

use nnaot::backend::{BackendError, BackendResult};

const BACKEND: &str = "native";

/// Flags shared by every compilation. Contraction is disabled so fixed-point
/// requantization rounds exactly like the reference interpreter.
const COMMON_FLAGS: [&str; 3] = ["-fPIC", "-O2", "-ffp-contract=off"];

pub fn compiler() -> String {
    match std::env::var("CC") {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => "cc".to_string(),
    }
}

/// True when the configured C compiler can be started.
pub fn compiler_available() -> bool {
    Command::new(compiler())
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

pub(crate) fn cache_dir() -> PathBuf {
    std::env::temp_dir().join("nnaot_c_backend")
}

pub(crate) fn source_fingerprint(source: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    hasher.finish()
}

pub(crate) fn lib_ext() -> &'static str {
    if cfg!(target_os = "macos") {
        ".dylib"
    } else if cfg!(target_os = "windows") {
        ".dll"
    } else {
        ".so"
    }
}

/// Compiles `source` into a cached shared object and returns its path.
///
/// Existing objects for the same fingerprint are reused. New objects are
/// built under a process-unique name and renamed into place, so concurrent
/// builders never observe a partial file.
pub(crate) fn build_shared(source: &str, fingerprint: u64) -> BackendResult<PathBuf> {
    let dir = cache_dir();
    std::fs::create_dir_all(&dir).map_err(|err| BackendError::io(&dir, err))?;
    let lib_path = dir.join(format!("libnnaot_{fingerprint:016x}{}", lib_ext()));
    if lib_path.exists() {
        log::debug!(target: "nnaot::native", "reusing {}", lib_path.display());
        return Ok(lib_path);
    }

    let src_path = dir.join(format!("program_{fingerprint:016x}.c"));
    std::fs::write(&src_path, source).map_err(|err| BackendError::io(&src_path, err))?;
    let staging = dir.join(format!(
        "libnnaot_{fingerprint:016x}.{}.tmp{}",
        std::process::id(),
        lib_ext()
    ));
    compile_shared(&src_path, &staging)?;
    std::fs::rename(&staging, &lib_path).map_err(|err| BackendError::io(&lib_path, err))?;
    log::debug!(target: "nnaot::native", "built {}", lib_path.display());
    Ok(lib_path)
}

pub(crate) fn compile_shared(src: &Path, out: &Path) -> BackendResult<()> {
    let mut cmd = Command::new(compiler());
    if cfg!(target_os = "macos") {
        cmd.arg("-dynamiclib");
    } else {
        cmd.arg("-shared");
    }
    cmd.args(COMMON_FLAGS).arg("-o").arg(out).arg(src);
    if !cfg!(target_os = "windows") {
        cmd.arg("-lm");
    }
    run(cmd)
}

/// Compiles `src` into a relocatable object for bundles.
pub(crate) fn compile_object(src: &Path, out: &Path) -> BackendResult<()> {
    let mut cmd = Command::new(compiler());
    cmd.arg("-c").args(COMMON_FLAGS).arg("-o").arg(out).arg(src);
    run(cmd)
}

fn run(mut cmd: Command) -> BackendResult<()> {
    let output = cmd.output().map_err(|err| {
        BackendError::unavailable(
            BACKEND,
            format!("cannot start C compiler `{}`: {err}", compiler()),
        )
    })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BackendError::execution(format!(
            "C compiler failed: {stderr}"
        )));
    }
    Ok(())
}
