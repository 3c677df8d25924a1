//! Task descriptors, completion handles and abort tokens.
//!
//! Every submission materializes as a [`TaskDescriptor`] on the controller
//! side and a [`JobHandle`] on the caller side. The descriptor carries the
//! payload, transfer list, target module and timestamps through the
//! scheduler; the handle lets the caller wait for the outcome.
//!
//! The completion contract is exactly-once: whatever path ends a task
//! (worker response, abort, worker teardown, send failure), the descriptor's
//! completer fires a single time.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::{Condvar, Mutex};

use crate::buffer::Buffer;
use crate::error::PoolError;
use crate::worker::WorkerId;

/// An opaque value handed to a task module.
///
/// Payloads are type-erased so that heterogeneous modules can share one
/// pool; use the downcast helpers to recover the concrete type.
pub struct Payload {
    value: Box<dyn Any + Send>,
}

impl Payload {
    /// Wrap a value.
    pub fn new<T: Any + Send>(value: T) -> Self {
        Self {
            value: Box::new(value),
        }
    }

    /// Recover the concrete value, returning the payload on type mismatch.
    pub fn downcast<T: Any>(self) -> Result<T, Payload> {
        match self.value.downcast::<T>() {
            Ok(boxed) => Ok(*boxed),
            Err(value) => Err(Payload { value }),
        }
    }

    /// Borrow the concrete value, if it has the expected type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Whether the payload holds a value of type `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload").finish_non_exhaustive()
    }
}

/// Identifies one submission; monotonically increasing per pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The outcome delivered through a [`JobHandle`].
pub(crate) type TaskResult = Result<Payload, PoolError>;

/// Wakeup primitive for threads blocked on a task's completion.
#[derive(Debug)]
struct Wakeup {
    ready: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl Wakeup {
    fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    fn wake(&self) {
        // Hold the lock while setting ready to avoid lost wakeup race condition
        let _guard = self.mutex.lock();
        self.ready.store(true, Ordering::Release);
        self.condvar.notify_all();
    }

    fn wait(&self) {
        let mut guard = self.mutex.lock();
        while !self.ready.load(Ordering::Acquire) {
            self.condvar.wait(&mut guard);
        }
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.mutex.lock();
        if self.ready.load(Ordering::Acquire) {
            return true;
        }
        let result = self.condvar.wait_for(&mut guard, timeout);
        self.ready.load(Ordering::Acquire) || !result.timed_out()
    }
}

/// Exactly-once completion endpoint owned by a descriptor.
struct Completer {
    tx: Sender<TaskResult>,
    wakeup: Arc<Wakeup>,
}

impl Completer {
    fn complete(self, result: TaskResult) {
        let _ = self.tx.send(result);
        self.wakeup.wake();
    }
}

/// Per-submission record owned by the scheduler or a worker handle.
pub(crate) struct TaskDescriptor {
    pub id: TaskId,
    pub payload: Option<Payload>,
    pub transfer_list: Vec<Buffer>,
    pub module_name: String,
    pub abort: Option<AbortToken>,
    pub created_at: Instant,
    pub started_at: Option<Instant>,
    pub owner: Option<WorkerId>,
    completer: Option<Completer>,
}

impl TaskDescriptor {
    /// Build a descriptor and its caller-side handle.
    pub fn new(
        id: TaskId,
        payload: Payload,
        transfer_list: Vec<Buffer>,
        module_name: String,
        abort: Option<AbortToken>,
    ) -> (Self, JobHandle) {
        let (tx, rx) = bounded(1);
        let wakeup = Arc::new(Wakeup::new());
        let descriptor = Self {
            id,
            payload: Some(payload),
            transfer_list,
            module_name,
            abort,
            created_at: Instant::now(),
            started_at: None,
            owner: None,
            completer: Some(Completer {
                tx,
                wakeup: wakeup.clone(),
            }),
        };
        let handle = JobHandle {
            id,
            receiver: rx,
            wakeup,
        };
        (descriptor, handle)
    }

    /// Whether the caller supplied an abort token.
    pub fn is_abortable(&self) -> bool {
        self.abort.is_some()
    }

    /// Deliver the outcome. Later calls are ignored.
    pub fn complete(&mut self, result: TaskResult) {
        if let Some(completer) = self.completer.take() {
            completer.complete(result);
        }
    }
}

impl fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("id", &self.id)
            .field("module_name", &self.module_name)
            .field("abortable", &self.is_abortable())
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

/// A handle to a submitted task.
///
/// The handle resolves exactly once, either with the module's result or
/// with the first applicable [`PoolError`].
#[derive(Debug)]
pub struct JobHandle {
    id: TaskId,
    receiver: Receiver<TaskResult>,
    wakeup: Arc<Wakeup>,
}

impl JobHandle {
    /// The submission's task id, usable as a correlation id.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Whether the task has completed.
    pub fn is_finished(&self) -> bool {
        !self.receiver.is_empty()
    }

    /// Take the outcome without blocking, if it is available.
    pub fn try_result(&self) -> Option<TaskResult> {
        self.receiver.try_recv().ok()
    }

    /// Block until the task completes and return its outcome.
    pub fn wait(self) -> TaskResult {
        self.wakeup.wait();
        self.receiver
            .recv()
            .unwrap_or(Err(PoolError::ThreadTermination))
    }

    /// Block up to `timeout` for the outcome.
    ///
    /// Returns `None` if the timeout elapsed first.
    pub fn wait_timeout(self, timeout: Duration) -> Option<TaskResult> {
        if self.wakeup.wait_timeout(timeout) {
            Some(
                self.receiver
                    .recv()
                    .unwrap_or(Err(PoolError::ThreadTermination)),
            )
        } else {
            None
        }
    }

    /// Build a handle that is already completed with the given outcome.
    pub(crate) fn completed_with(id: TaskId, result: TaskResult) -> Self {
        let (tx, rx) = bounded(1);
        let wakeup = Arc::new(Wakeup::new());
        let _ = tx.send(result);
        wakeup.wake();
        Self {
            id,
            receiver: rx,
            wakeup,
        }
    }
}

/// A cloneable, single-shot cancellation observable.
///
/// Aborting fires every registered listener once; listeners registered
/// after the fact fire immediately.
#[derive(Clone)]
pub struct AbortToken {
    inner: Arc<AbortState>,
}

struct AbortState {
    aborted: AtomicBool,
    listeners: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl AbortToken {
    /// Create a token in the non-aborted state.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AbortState {
                aborted: AtomicBool::new(false),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Whether abort has been signalled.
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }

    /// Signal abort. Only the first call fires the listeners.
    pub fn abort(&self) {
        let listeners = {
            let mut listeners = self.inner.listeners.lock();
            if self.inner.aborted.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *listeners)
        };
        for listener in listeners {
            listener();
        }
    }

    /// Register a listener; fires immediately if already aborted.
    pub(crate) fn on_abort(&self, listener: impl FnOnce() + Send + 'static) {
        {
            let mut listeners = self.inner.listeners.lock();
            if !self.inner.aborted.load(Ordering::Acquire) {
                listeners.push(Box::new(listener));
                return;
            }
        }
        listener();
    }
}

impl Default for AbortToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AbortToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortToken")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}
