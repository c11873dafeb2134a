//! Runtime backend registry.
//!
//! Backend crates register a constructor per [`BackendKind`]; the engine
//! resolves the configured kind here and never names concrete backends.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use super::{Backend, BackendError, BackendKind, BackendResult};

/// Factory creating a backend instance.
pub type BackendConstructor = Box<dyn Fn() -> BackendResult<Arc<dyn Backend>> + Send + Sync>;

struct BackendRegistry {
    backends: RwLock<HashMap<BackendKind, BackendConstructor>>,
}

impl BackendRegistry {
    fn new() -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, kind: BackendKind, constructor: BackendConstructor) {
        match self.backends.write() {
            Ok(mut backends) => {
                backends.insert(kind, constructor);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(kind, constructor);
            }
        }
    }

    fn create(&self, kind: BackendKind) -> BackendResult<Arc<dyn Backend>> {
        let backends = self
            .backends
            .read()
            .map_err(|_| BackendError::execution("backend registry lock poisoned"))?;
        let constructor = backends.get(&kind).ok_or_else(|| {
            BackendError::unavailable(kind.as_str(), "no backend registered for this kind")
        })?;
        constructor()
    }

    fn list(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<BackendKind> = match self.backends.read() {
            Ok(backends) => backends.keys().copied().collect(),
            Err(poisoned) => poisoned.into_inner().keys().copied().collect(),
        };
        kinds.sort();
        kinds
    }
}

static GLOBAL_REGISTRY: OnceLock<BackendRegistry> = OnceLock::new();

fn global_registry() -> &'static BackendRegistry {
    GLOBAL_REGISTRY.get_or_init(BackendRegistry::new)
}

/// Registers (or replaces) the constructor for `kind`.
///
/// # Example
/// ```ignore
/// pub fn register() {
///     nnaot::backend::registry::register_backend(BackendKind::Interpreter, || {
///         Ok(Arc::new(InterpreterBackend::default()))
///     });
/// }
/// ```
pub fn register_backend<F>(kind: BackendKind, constructor: F)
where
    F: Fn() -> BackendResult<Arc<dyn Backend>> + Send + Sync + 'static,
{
    global_registry().register(kind, Box::new(constructor));
}

pub fn create_backend(kind: BackendKind) -> BackendResult<Arc<dyn Backend>> {
    global_registry().create(kind)
}

pub fn list_backends() -> Vec<BackendKind> {
    global_registry().list()
}

pub fn has_backend(kind: BackendKind) -> bool {
    list_backends().contains(&kind)
}
