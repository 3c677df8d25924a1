//! The public pool facade.
//!
//! A [`Pool`] owns a controller thread plus an autoscaled set of worker
//! threads. Submissions return a [`JobHandle`] immediately; admission,
//! dispatch and completion happen asynchronously on the controller.
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
//!     .max_threads(2)
//!     .build()?;
//!
//! let result = pool.submit(Payload::new(21i64)).wait()?;
//! assert_eq!(result.downcast::<i64>().ok(), Some(42));
//! # Ok::<(), lagoon::PoolError>(())
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Sender, bounded};
use parking_lot::Mutex;

use crate::buffer::{Buffer, Movable};
use crate::error::{PoolError, Result};
use crate::metrics::{HistogramSummary, PoolMetrics, PoolStats};
use crate::modules::WorkerData;
use crate::options::{PoolOptions, QueueLimit, ResolvedOptions, ResourceLimits};
use crate::scheduler::{ControlMessage, PoolEvents, spawn_controller};
use crate::signal::Signal;
use crate::task::{AbortToken, JobHandle, Payload, TaskDescriptor, TaskId};

/// A full-form submission: payload plus optional transfer list, module
/// override and abort token.
#[derive(Debug)]
pub struct Job {
    payload: Payload,
    transfer_list: Vec<Buffer>,
    module_name: Option<String>,
    abort: Option<AbortToken>,
}

impl Job {
    /// Start a job from a payload.
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            transfer_list: Vec::new(),
            module_name: None,
            abort: None,
        }
    }

    /// Add one buffer to the transfer list.
    pub fn transfer(mut self, buffer: Buffer) -> Self {
        self.transfer_list.push(buffer);
        self
    }

    /// Replace the transfer list.
    pub fn transfer_list(mut self, buffers: Vec<Buffer>) -> Self {
        self.transfer_list = buffers;
        self
    }

    /// Run under a specific module instead of the pool default.
    pub fn module(mut self, name: impl Into<String>) -> Self {
        self.module_name = Some(name.into());
        self
    }

    /// Attach an abort token. Abortable tasks get a worker to themselves.
    pub fn abortable(mut self, token: AbortToken) -> Self {
        self.abort = Some(token);
        self
    }
}

impl From<Payload> for Job {
    fn from(payload: Payload) -> Self {
        Self::new(payload)
    }
}

impl From<Movable> for Job {
    fn from(movable: Movable) -> Self {
        let (payload, buffer) = movable.into_parts();
        Self::new(payload).transfer(buffer)
    }
}

/// An autoscaling worker-thread pool running named task modules.
///
/// See the [crate documentation](crate) for the execution model.
pub struct Pool {
    control_tx: Sender<ControlMessage>,
    controller: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<PoolStats>,
    events: Arc<PoolEvents>,
    opts: ResolvedOptions,
    next_task_id: AtomicU64,
    destroyed: AtomicBool,
}

impl Pool {
    /// Create a pool from options.
    ///
    /// Validates the options, spawns the controller and fills the pool to
    /// `min_threads`.
    pub fn new(options: PoolOptions) -> Result<Self> {
        let opts = options.resolve()?;
        let stats = Arc::new(PoolStats::new());
        let events = Arc::new(PoolEvents::new());
        let (control_tx, controller) = spawn_controller(opts.clone(), stats.clone(), events.clone());
        Ok(Self {
            control_tx,
            controller: Mutex::new(Some(controller)),
            stats,
            events,
            opts,
            next_task_id: AtomicU64::new(1),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Start building a pool.
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Submit a payload to the pool's default module.
    pub fn submit(&self, payload: Payload) -> JobHandle {
        self.submit_job(Job::new(payload))
    }

    /// Submit a full-form job.
    ///
    /// The returned handle resolves with the module's result or the first
    /// applicable error; nothing here blocks.
    pub fn submit_job(&self, job: impl Into<Job>) -> JobHandle {
        let job = job.into();
        let task_id = TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed));

        if self.destroyed.load(Ordering::Acquire) {
            return JobHandle::completed_with(task_id, Err(PoolError::ThreadTermination));
        }
        let Some(module_name) = job.module_name.or_else(|| self.opts.module_name.clone()) else {
            return JobHandle::completed_with(task_id, Err(PoolError::ModuleNotProvided));
        };
        if job.abort.as_ref().is_some_and(AbortToken::is_aborted) {
            return JobHandle::completed_with(task_id, Err(PoolError::Aborted));
        }

        let abort = job.abort.clone();
        let (descriptor, handle) = TaskDescriptor::new(
            task_id,
            job.payload,
            job.transfer_list,
            module_name,
            job.abort,
        );
        if let Err(send_error) = self.control_tx.send(ControlMessage::Submit(descriptor)) {
            if let ControlMessage::Submit(mut descriptor) = send_error.into_inner() {
                descriptor.complete(Err(PoolError::ThreadTermination));
            }
            return handle;
        }
        // Installed after the submit is on the wire so the abort message
        // can never overtake it on the control channel.
        if let Some(token) = abort {
            let control_tx = self.control_tx.clone();
            token.on_abort(move || {
                let _ = control_tx.send(ControlMessage::Abort(task_id));
            });
        }
        handle
    }

    /// Tasks queued beyond what warming workers will absorb.
    pub fn queue_size(&self) -> usize {
        let pending_capacity = self
            .stats
            .pending_workers()
            .saturating_mul(self.opts.concurrent_tasks_per_worker);
        self.stats.queue_len().saturating_sub(pending_capacity)
    }

    /// Tasks completed since the pool started.
    pub fn completed(&self) -> u64 {
        self.stats.completed()
    }

    /// Time since the pool started.
    pub fn duration(&self) -> Duration {
        self.stats.duration()
    }

    /// Submission-to-dispatch latency summary, in microseconds.
    pub fn wait_time(&self) -> HistogramSummary {
        self.stats.wait_summary()
    }

    /// Dispatch-to-completion latency summary, in microseconds.
    pub fn run_time(&self) -> HistogramSummary {
        self.stats.run_summary()
    }

    /// Fraction of the pool's capacity spent running tasks.
    pub fn utilization(&self) -> f64 {
        self.stats.utilization(self.opts.max_threads)
    }

    /// Live worker threads, pending and ready.
    pub fn thread_count(&self) -> usize {
        self.stats.live_workers()
    }

    /// Floor of the autoscale band.
    pub fn min_threads(&self) -> usize {
        self.opts.min_threads
    }

    /// Ceiling of the autoscale band.
    pub fn max_threads(&self) -> usize {
        self.opts.max_threads
    }

    /// Point-in-time snapshot of every observable.
    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            queue_size: self.queue_size(),
            completed: self.completed(),
            duration: self.duration(),
            wait_time: self.wait_time(),
            run_time: self.run_time(),
            utilization: self.utilization(),
            threads: self.thread_count(),
        }
    }

    /// Fires whenever the task queue empties.
    pub fn on_drain(&self) -> &Signal<()> {
        &self.events.drain
    }

    /// Carries worker errors with no owning submission.
    pub fn on_error(&self) -> &Signal<PoolError> {
        &self.events.error
    }

    /// Shut the pool down.
    ///
    /// Queued tasks fail with [`PoolError::ThreadTermination`], workers are
    /// torn down, and the call blocks until the controller and its workers
    /// have exited. Subsequent submissions fail with the same error.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (done_tx, done_rx) = bounded(1);
        if self
            .control_tx
            .send(ControlMessage::Destroy { done: done_tx })
            .is_ok()
        {
            let _ = done_rx.recv();
        }
        if let Some(thread) = self.controller.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("threads", &self.thread_count())
            .field("queue_size", &self.queue_size())
            .field("completed", &self.completed())
            .finish()
    }
}

/// Builder for [`Pool`].
#[derive(Debug, Default)]
pub struct PoolBuilder {
    options: PoolOptions,
}

impl PoolBuilder {
    /// Create a builder with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Default module for submissions that omit one.
    pub fn module_name(mut self, name: impl Into<String>) -> Self {
        self.options.module_name = Some(name.into());
        self
    }

    /// Floor of the autoscale band.
    pub fn min_threads(mut self, count: usize) -> Self {
        self.options.min_threads = Some(count);
        self
    }

    /// Ceiling of the autoscale band.
    pub fn max_threads(mut self, count: usize) -> Self {
        self.options.max_threads = Some(count);
        self
    }

    /// Idle time before a supernumerary worker retires.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.options.idle_timeout = Some(timeout);
        self
    }

    /// Bound on the task backlog.
    pub fn max_queue(mut self, limit: QueueLimit) -> Self {
        self.options.max_queue = limit;
        self
    }

    /// How many tasks one worker may hold in flight.
    pub fn concurrent_tasks_per_worker(mut self, count: usize) -> Self {
        self.options.concurrent_tasks_per_worker = count;
        self
    }

    /// Toggle the shared-counter wake protocol and response fast path.
    pub fn use_atomics(mut self, enabled: bool) -> Self {
        self.options.use_atomics = enabled;
        self
    }

    /// Limits applied to worker thread construction.
    pub fn resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.options.resource_limits = limits;
        self
    }

    /// Opaque value shared with every worker's task context.
    pub fn worker_data(mut self, data: WorkerData) -> Self {
        self.options.worker_data = Some(data);
        self
    }

    /// Name prefix for worker threads.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.options.thread_name = name.into();
        self
    }

    /// Validate the options and start the pool.
    pub fn build(self) -> Result<Pool> {
        Pool::new(self.options)
    }
}
