//! Named task modules and the process-global registry.
//!
//! Workers resolve the module name carried by each request against this
//! registry, the analog of a module path resolvable by the worker. A pool's
//! default module (if configured) is resolved once during worker bootstrap;
//! per-task names are resolved at execution time.
//!
//! # Example
//!
//! ```
//! use lagoon::{module_registry, Payload};
//!
//! module_registry().register("sum", |ctx| {
//!     let (a, b) = ctx
//!         .payload
//!         .downcast::<(i64, i64)>()
//!         .map_err(|_| "expected a pair of integers".to_string())?;
//!     Ok(Payload::new(a + b))
//! });
//!
//! assert!(module_registry().contains("sum"));
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::buffer::Buffer;
use crate::task::Payload;

/// Opaque value shared with every worker, available to task modules.
pub type WorkerData = Arc<dyn Any + Send + Sync>;

/// Everything a task module receives for one invocation.
pub struct TaskContext {
    /// The submitted payload.
    pub payload: Payload,
    /// Buffers shipped through the transfer list, re-wrapped worker-side.
    pub transfers: Vec<Buffer>,
    /// The pool's `worker_data`, if configured.
    pub worker_data: Option<WorkerData>,
}

/// A task module: a named function executed on a worker thread.
///
/// Returning `Err` fails the submission with
/// [`PoolError::TaskFailed`](crate::PoolError::TaskFailed); panicking tears
/// the worker down.
pub type TaskFn = Arc<dyn Fn(TaskContext) -> Result<Payload, String> + Send + Sync>;

/// Process-global table mapping module names to task functions.
pub struct ModuleRegistry {
    modules: RwLock<HashMap<String, TaskFn>>,
}

impl ModuleRegistry {
    fn new() -> Self {
        Self {
            modules: RwLock::new(HashMap::new()),
        }
    }

    /// Register a task function under `name`.
    ///
    /// The last registration for a name wins.
    pub fn register<F>(&self, name: impl Into<String>, task: F)
    where
        F: Fn(TaskContext) -> Result<Payload, String> + Send + Sync + 'static,
    {
        self.modules.write().insert(name.into(), Arc::new(task));
    }

    /// Look up the task function registered under `name`.
    pub fn resolve(&self, name: &str) -> Option<TaskFn> {
        self.modules.read().get(name).cloned()
    }

    /// Whether a module is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.modules.read().contains_key(name)
    }

    /// Remove the module registered under `name`.
    pub fn unregister(&self, name: &str) -> bool {
        self.modules.write().remove(name).is_some()
    }
}

/// Global module registry instance.
static REGISTRY: OnceLock<ModuleRegistry> = OnceLock::new();

/// Access the process-global module registry.
pub fn module_registry() -> &'static ModuleRegistry {
    REGISTRY.get_or_init(ModuleRegistry::new)
}
