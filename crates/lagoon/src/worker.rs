//! Worker handles and the worker-thread main loop.
//!
//! Each worker is coupled to the controller by a request port, a message
//! port, a shared doorbell and a [`WakeChannel`]. The controller-side
//! [`WorkerHandle`] owns the thread and the in-flight task map; the
//! worker-side loop bootstraps its module, reports ready, then alternates
//! between draining the request port and blocking on the wake gate.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use slotmap::new_key_type;

use crate::buffer::Buffer;
use crate::error::PoolError;
use crate::modules::{TaskContext, WorkerData, module_registry};
use crate::options::ResolvedOptions;
use crate::task::{Payload, TaskDescriptor, TaskId, TaskResult};
use crate::wake::{REQUEST_INDEX, RESPONSE_INDEX, WakeChannel};

new_key_type! {
    /// Identifies one worker within the pool.
    pub(crate) struct WorkerId;
}

/// One task, serialized for the request port.
pub(crate) struct RequestEnvelope {
    pub task_id: TaskId,
    pub payload: Payload,
    pub module_name: String,
    pub transfers: Vec<Vec<u8>>,
}

/// Messages a worker posts back to the controller.
pub(crate) enum WorkerMessage {
    /// Module bootstrap succeeded; the worker accepts tasks.
    Ready,
    /// One task finished, successfully or not.
    Response { task_id: TaskId, result: TaskResult },
    /// The worker thread is going down.
    Crashed { message: String },
}

/// Everything the worker thread needs, moved in at spawn.
struct WorkerStartup {
    id: WorkerId,
    startup_module: Option<String>,
    request_rx: Receiver<RequestEnvelope>,
    message_tx: Sender<WorkerMessage>,
    doorbell: Sender<WorkerId>,
    wake: Arc<WakeChannel>,
    use_atomics: bool,
    worker_data: Option<WorkerData>,
}

/// Controller-side record owning one worker thread.
pub(crate) struct WorkerHandle {
    pub id: WorkerId,
    thread: Option<JoinHandle<()>>,
    request_tx: Option<Sender<RequestEnvelope>>,
    message_rx: Receiver<WorkerMessage>,
    wake: Arc<WakeChannel>,
    /// In-flight descriptors, keyed by task id. The owning relation.
    pub task_map: HashMap<TaskId, TaskDescriptor>,
    /// Count of responses this handle has drained from its port.
    pub last_seen_responses: u32,
    /// Whether the ready sentinel has been observed (or assumed at fill).
    pub ready: bool,
    /// Token of the currently armed idle timer, if any.
    pub idle_token: Option<u64>,
}

impl WorkerHandle {
    /// Spawn the worker thread and build its handle.
    pub fn spawn(
        id: WorkerId,
        opts: &ResolvedOptions,
        doorbell: Sender<WorkerId>,
        index: u64,
    ) -> Self {
        let (request_tx, request_rx) = unbounded();
        let (message_tx, message_rx) = unbounded();
        let wake = Arc::new(WakeChannel::new());

        let startup = WorkerStartup {
            id,
            startup_module: opts.module_name.clone(),
            request_rx,
            message_tx,
            doorbell,
            wake: wake.clone(),
            use_atomics: opts.use_atomics,
            worker_data: opts.worker_data.clone(),
        };

        let mut builder = thread::Builder::new().name(format!("{}-{index}", opts.thread_name));
        if let Some(stack_size) = opts.stack_size {
            builder = builder.stack_size(stack_size);
        }
        let thread = builder
            .spawn(move || worker_main(startup))
            .expect("Failed to spawn worker thread");

        Self {
            id,
            thread: Some(thread),
            request_tx: Some(request_tx),
            message_rx,
            wake,
            task_map: HashMap::new(),
            last_seen_responses: 0,
            ready: false,
            idle_token: None,
        }
    }

    /// In-flight task count, treating a lone abortable task as exclusive.
    pub fn current_usage(&self) -> usize {
        if self.task_map.len() == 1
            && self
                .task_map
                .values()
                .next()
                .is_some_and(TaskDescriptor::is_abortable)
        {
            usize::MAX
        } else {
            self.task_map.len()
        }
    }

    /// Whether the worker can take one more task under `limit`.
    pub fn has_spare_capacity(&self, limit: usize) -> bool {
        self.current_usage() < limit
    }

    /// Ship a descriptor to the worker.
    ///
    /// On success the descriptor moves into the task map and the request
    /// counter is bumped. On failure the descriptor completes with the send
    /// error and `false` is returned.
    pub fn post(&mut self, mut descriptor: TaskDescriptor) -> bool {
        debug_assert!(!self.task_map.contains_key(&descriptor.id));

        let mut transfers = Vec::with_capacity(descriptor.transfer_list.len());
        let mut detach_failed = false;
        for buffer in &descriptor.transfer_list {
            match buffer.detach() {
                Some(bytes) => transfers.push(bytes),
                None => {
                    detach_failed = true;
                    break;
                }
            }
        }
        if detach_failed {
            descriptor.complete(Err(PoolError::InvalidTransfer(
                "buffer in transfer list is already detached".to_string(),
            )));
            return false;
        }

        let Some(payload) = descriptor.payload.take() else {
            descriptor.complete(Err(PoolError::ThreadTermination));
            return false;
        };
        let envelope = RequestEnvelope {
            task_id: descriptor.id,
            payload,
            module_name: descriptor.module_name.clone(),
            transfers,
        };

        let sent = self
            .request_tx
            .as_ref()
            .is_some_and(|tx| tx.send(envelope).is_ok());
        if !sent {
            descriptor.complete(Err(PoolError::ThreadTermination));
            return false;
        }

        descriptor.owner = Some(self.id);
        self.idle_token = None;
        self.task_map.insert(descriptor.id, descriptor);
        self.wake.increment_and_notify(REQUEST_INDEX);
        true
    }

    /// Whether the response lane has moved past what this handle drained.
    pub fn response_counter_moved(&self) -> bool {
        self.wake.counters().load(RESPONSE_INDEX) != self.last_seen_responses
    }

    /// Non-blocking receive from the worker's message port.
    pub fn try_recv_message(&mut self) -> Option<WorkerMessage> {
        self.message_rx.try_recv().ok()
    }

    /// Tear the worker down and return the descriptors it still owned.
    ///
    /// The thread is signalled, not joined: an idle worker exits promptly,
    /// a busy one at its next loop turn.
    pub fn destroy(&mut self) -> Vec<TaskDescriptor> {
        self.wake.terminate();
        self.request_tx = None;
        self.idle_token = None;
        self.task_map.drain().map(|(_, descriptor)| descriptor).collect()
    }

    /// Take the join handle for shutdown waits.
    pub fn take_thread(&mut self) -> Option<JoinHandle<()>> {
        self.thread.take()
    }
}

/// Worker-thread entry point.
fn worker_main(ctx: WorkerStartup) {
    tracing::trace!(target: "lagoon::worker", id = ?ctx.id, "worker thread started");

    if let Some(name) = &ctx.startup_module {
        if module_registry().resolve(name).is_none() {
            let _ = ctx.message_tx.send(WorkerMessage::Crashed {
                message: format!("no task module registered under {name:?}"),
            });
            let _ = ctx.doorbell.send(ctx.id);
            return;
        }
    }
    let _ = ctx.message_tx.send(WorkerMessage::Ready);
    let _ = ctx.doorbell.send(ctx.id);

    loop {
        // Observe the request lane before draining: anything posted after
        // this load either lands in the drain below or moves the lane past
        // `observed`, so the wait cannot sleep through a request.
        let observed = ctx.wake.counters().load(REQUEST_INDEX);
        loop {
            match ctx.request_rx.try_recv() {
                Ok(envelope) => {
                    if !run_task(&ctx, envelope) {
                        return;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }
        if ctx.wake.is_terminated() {
            return;
        }
        if ctx.use_atomics {
            ctx.wake.wait_for(REQUEST_INDEX, observed);
        } else {
            match ctx.request_rx.recv() {
                Ok(envelope) => {
                    if !run_task(&ctx, envelope) {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    }
}

/// Execute one envelope. Returns `false` when the worker must die.
fn run_task(ctx: &WorkerStartup, envelope: RequestEnvelope) -> bool {
    let RequestEnvelope {
        task_id,
        payload,
        module_name,
        transfers,
    } = envelope;

    let result = match module_registry().resolve(&module_name) {
        Some(task) => {
            let context = TaskContext {
                payload,
                transfers: transfers.into_iter().map(Buffer::from_vec).collect(),
                worker_data: ctx.worker_data.clone(),
            };
            match panic::catch_unwind(AssertUnwindSafe(|| task(context))) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(message)) => Err(PoolError::TaskFailed(message)),
                Err(panic_payload) => {
                    let message = panic_message(panic_payload);
                    tracing::error!(target: "lagoon::worker", id = ?ctx.id, %message, "task panicked");
                    let _ = ctx.message_tx.send(WorkerMessage::Crashed { message });
                    let _ = ctx.doorbell.send(ctx.id);
                    return false;
                }
            }
        }
        None => Err(PoolError::ModuleNotFound(module_name)),
    };

    // The counter must move before the port enqueue so the polling fast
    // path never observes a message without a counter change.
    ctx.wake.counters().increment(RESPONSE_INDEX);
    let _ = ctx.message_tx.send(WorkerMessage::Response { task_id, result });
    let _ = ctx.doorbell.send(ctx.id);
    true
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker task panicked".to_string()
    }
}
