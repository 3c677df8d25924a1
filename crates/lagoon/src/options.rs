//! Pool configuration, defaults and validation.
//!
//! Options are validated and normalized once, at pool construction. The
//! autoscale band defaults to `[max(cpus/2, 1), cpus * 1.5]`; the queue is
//! unbounded unless configured otherwise.

use std::fmt;
use std::thread;
use std::time::Duration;

use crate::error::PoolError;
use crate::modules::WorkerData;

/// Bound on the task backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueLimit {
    /// No backlog bound.
    #[default]
    Unbounded,
    /// Resolve to `max_threads²` at construction.
    Auto,
    /// Fixed bound. `Bounded(0)` rejects rather than queues.
    Bounded(usize),
}

/// Resource limits applied to worker thread construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceLimits {
    /// Stack size for worker threads in bytes. `None` uses the platform default.
    pub stack_size: Option<usize>,
}

/// Configuration accepted by [`Pool::new`](crate::Pool::new).
///
/// Prefer [`Pool::builder`](crate::Pool::builder) for ergonomic setup.
#[derive(Clone)]
pub struct PoolOptions {
    /// Default module for submissions that omit one.
    pub module_name: Option<String>,
    /// Floor of the autoscale band. Defaults to `max(cpus / 2, 1)`.
    pub min_threads: Option<usize>,
    /// Ceiling of the autoscale band. Defaults to `cpus * 1.5`.
    pub max_threads: Option<usize>,
    /// How long a supernumerary worker may sit idle before retiring.
    /// `None` disables idle retirement.
    pub idle_timeout: Option<Duration>,
    /// Bound on the task backlog.
    pub max_queue: QueueLimit,
    /// How many tasks one worker may hold in flight. Must be at least 1.
    pub concurrent_tasks_per_worker: usize,
    /// Enables the shared-counter wake protocol and response fast path.
    pub use_atomics: bool,
    /// Limits applied to worker thread construction.
    pub resource_limits: ResourceLimits,
    /// Opaque value shared with every worker's task context.
    pub worker_data: Option<WorkerData>,
    /// Name prefix for worker threads.
    pub thread_name: String,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            module_name: None,
            min_threads: None,
            max_threads: None,
            idle_timeout: None,
            max_queue: QueueLimit::default(),
            concurrent_tasks_per_worker: 1,
            use_atomics: true,
            resource_limits: ResourceLimits::default(),
            worker_data: None,
            thread_name: "lagoon-worker".to_string(),
        }
    }
}

impl fmt::Debug for PoolOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolOptions")
            .field("module_name", &self.module_name)
            .field("min_threads", &self.min_threads)
            .field("max_threads", &self.max_threads)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_queue", &self.max_queue)
            .field(
                "concurrent_tasks_per_worker",
                &self.concurrent_tasks_per_worker,
            )
            .field("use_atomics", &self.use_atomics)
            .field("resource_limits", &self.resource_limits)
            .field("worker_data", &self.worker_data.as_ref().map(|_| "…"))
            .field("thread_name", &self.thread_name)
            .finish()
    }
}

impl PoolOptions {
    /// Validate and fill in defaults.
    pub(crate) fn resolve(self) -> Result<ResolvedOptions, PoolError> {
        let cpus = thread::available_parallelism().map_or(1, |n| n.get());
        let min_threads = self.min_threads.unwrap_or_else(|| (cpus / 2).max(1));
        let max_threads = self.max_threads.unwrap_or_else(|| (cpus + cpus / 2).max(1));

        if max_threads == 0 {
            return Err(PoolError::InvalidOptions(
                "max_threads must be at least 1".to_string(),
            ));
        }
        if min_threads > max_threads {
            return Err(PoolError::InvalidOptions(format!(
                "min_threads ({min_threads}) exceeds max_threads ({max_threads})"
            )));
        }
        if self.concurrent_tasks_per_worker == 0 {
            return Err(PoolError::InvalidOptions(
                "concurrent_tasks_per_worker must be at least 1".to_string(),
            ));
        }

        let max_queue = match self.max_queue {
            QueueLimit::Unbounded => usize::MAX,
            QueueLimit::Auto => max_threads.saturating_mul(max_threads),
            QueueLimit::Bounded(bound) => bound,
        };

        Ok(ResolvedOptions {
            module_name: self.module_name,
            min_threads,
            max_threads,
            idle_timeout: self.idle_timeout,
            max_queue,
            concurrent_tasks_per_worker: self.concurrent_tasks_per_worker,
            use_atomics: self.use_atomics,
            stack_size: self.resource_limits.stack_size,
            worker_data: self.worker_data,
            thread_name: self.thread_name,
        })
    }
}

/// Options after validation and defaulting.
#[derive(Clone)]
pub(crate) struct ResolvedOptions {
    pub module_name: Option<String>,
    pub min_threads: usize,
    pub max_threads: usize,
    pub idle_timeout: Option<Duration>,
    pub max_queue: usize,
    pub concurrent_tasks_per_worker: usize,
    pub use_atomics: bool,
    pub stack_size: Option<usize>,
    pub worker_data: Option<WorkerData>,
    pub thread_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_resolve() {
        let resolved = PoolOptions::default().resolve().unwrap();
        assert!(resolved.min_threads >= 1);
        assert!(resolved.max_threads >= resolved.min_threads);
        assert_eq!(resolved.max_queue, usize::MAX);
        assert_eq!(resolved.concurrent_tasks_per_worker, 1);
        assert!(resolved.use_atomics);
    }

    #[test]
    fn test_auto_queue_is_max_threads_squared() {
        let options = PoolOptions {
            min_threads: Some(1),
            max_threads: Some(4),
            max_queue: QueueLimit::Auto,
            ..Default::default()
        };
        let resolved = options.resolve().unwrap();
        assert_eq!(resolved.max_queue, 16);
    }

    #[test]
    fn test_zero_queue_is_kept() {
        let options = PoolOptions {
            max_queue: QueueLimit::Bounded(0),
            ..Default::default()
        };
        assert_eq!(options.resolve().unwrap().max_queue, 0);
    }

    #[test]
    fn test_min_above_max_is_rejected() {
        let options = PoolOptions {
            min_threads: Some(4),
            max_threads: Some(2),
            ..Default::default()
        };
        assert!(matches!(
            options.resolve(),
            Err(PoolError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_zero_max_threads_is_rejected() {
        let options = PoolOptions {
            min_threads: Some(0),
            max_threads: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            options.resolve(),
            Err(PoolError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let options = PoolOptions {
            concurrent_tasks_per_worker: 0,
            ..Default::default()
        };
        assert!(matches!(
            options.resolve(),
            Err(PoolError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_zero_min_threads_is_allowed() {
        let options = PoolOptions {
            min_threads: Some(0),
            max_threads: Some(2),
            ..Default::default()
        };
        assert_eq!(options.resolve().unwrap().min_threads, 0);
    }
}
