//! Autoscaling worker-thread pool running named task modules.
//!
//! Lagoon dispatches submitted payloads across a managed set of OS worker
//! threads. Each worker hosts an isolated execution context that resolves a
//! *module name* against the process-global [`module_registry`] and runs
//! the registered task function. Callers submit from any thread and receive
//! results asynchronously through a [`JobHandle`].
//!
//! - **Autoscaling**: the pool holds between `min_threads` and
//!   `max_threads` workers, growing under load and retiring idle workers
//!   after `idle_timeout`.
//! - **Backpressure**: overflow queues FIFO up to `max_queue`, with the
//!   effective bound widened by workers that are still warming up.
//! - **Cancellation**: a task carrying an [`AbortToken`] can be aborted;
//!   queued tasks cancel in place, in-flight tasks by tearing down and
//!   replacing their worker.
//! - **Zero-copy transfer**: a [`Buffer`] wrapped in [`Movable`] ships its
//!   backing bytes to the worker instead of sharing them.
//! - **Observability**: wait/run latency histograms, a `drain` signal when
//!   the queue empties and an `error` signal for stray worker failures.
//!
//! # Example
//!
//! ```
//! use lagoon::{Payload, Pool, module_registry};
//!
//! module_registry().register("double", |ctx| {
//!     let n = ctx
//!         .payload
//!         .downcast::<i64>()
//!         .map_err(|_| "expected an integer".to_string())?;
//!     Ok(Payload::new(n * 2))
//! });
//!
//! let pool = Pool::builder()
//!     .module_name("double")
//!     .min_threads(1)
//!     .max_threads(4)
//!     .build()?;
//!
//! let handle = pool.submit(Payload::new(2i64));
//! assert_eq!(handle.wait()?.downcast::<i64>().ok(), Some(4));
//! # Ok::<(), lagoon::PoolError>(())
//! ```
//!
//! # Cancellation Example
//!
//! ```
//! use std::time::Duration;
//! use lagoon::{AbortToken, Job, Payload, Pool, PoolError, module_registry};
//!
//! module_registry().register("nap", |ctx| {
//!     std::thread::sleep(Duration::from_millis(200));
//!     Ok(ctx.payload)
//! });
//!
//! let pool = Pool::builder()
//!     .module_name("nap")
//!     .min_threads(1)
//!     .max_threads(1)
//!     .build()?;
//!
//! let token = AbortToken::new();
//! let handle = pool.submit_job(Job::new(Payload::new(())).abortable(token.clone()));
//! token.abort();
//! assert_eq!(handle.wait().unwrap_err(), PoolError::Aborted);
//! # Ok::<(), lagoon::PoolError>(())
//! ```

#![warn(missing_docs)]

mod buffer;
mod error;
mod metrics;
pub mod modules;
mod options;
mod pool;
mod ready_set;
mod scheduler;
pub mod signal;
mod task;
mod timers;
mod wake;
mod worker;

pub use buffer::{Buffer, Movable};
pub use error::{PoolError, Result};
pub use metrics::{HistogramSummary, PoolMetrics};
pub use modules::{ModuleRegistry, TaskContext, TaskFn, WorkerData, module_registry};
pub use options::{PoolOptions, QueueLimit, ResourceLimits};
pub use pool::{Job, Pool, PoolBuilder};
pub use signal::{ConnectionId, Signal};
pub use task::{AbortToken, JobHandle, Payload, TaskId};
