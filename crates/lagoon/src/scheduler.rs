//! The controller thread: admission, dispatch, autoscale and teardown.
//!
//! All scheduler state lives on one dedicated thread and is touched only
//! there, so none of it is locked. Callers reach the controller through the
//! control channel; workers reach it through their message ports plus the
//! shared doorbell. Between events the controller sleeps until the next
//! idle-timer deadline.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, select, unbounded};
use slotmap::SlotMap;

use crate::error::PoolError;
use crate::metrics::PoolStats;
use crate::options::ResolvedOptions;
use crate::ready_set::WorkerSet;
use crate::signal::Signal;
use crate::task::{TaskDescriptor, TaskId, TaskResult};
use crate::timers::IdleTimerQueue;
use crate::worker::{WorkerHandle, WorkerId, WorkerMessage};

/// Sleep bound when no idle timer is armed.
const IDLE_SELECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Messages from the facade to the controller.
pub(crate) enum ControlMessage {
    Submit(TaskDescriptor),
    Abort(TaskId),
    Destroy { done: Sender<()> },
}

/// The pool's event surface.
pub(crate) struct PoolEvents {
    /// Fires when the task queue empties.
    pub drain: Signal<()>,
    /// Carries worker errors with no owning submission.
    pub error: Signal<PoolError>,
}

impl PoolEvents {
    pub fn new() -> Self {
        Self {
            drain: Signal::new(),
            error: Signal::new(),
        }
    }
}

/// Spawn the controller thread and hand back its control channel.
pub(crate) fn spawn_controller(
    opts: ResolvedOptions,
    stats: Arc<PoolStats>,
    events: Arc<PoolEvents>,
) -> (Sender<ControlMessage>, JoinHandle<()>) {
    let (control_tx, control_rx) = unbounded();
    let thread = std::thread::Builder::new()
        .name(format!("{}-controller", opts.thread_name))
        .spawn(move || {
            let mut scheduler = Scheduler::new(opts, control_rx, stats, events);
            scheduler.run();
        })
        .expect("Failed to spawn pool controller thread");
    (control_tx, thread)
}

struct Scheduler {
    opts: ResolvedOptions,
    workers: SlotMap<WorkerId, WorkerHandle>,
    set: WorkerSet,
    queue: VecDeque<TaskDescriptor>,
    /// Dispatched task → owning worker, for cancellation lookups.
    dispatched: HashMap<TaskId, WorkerId>,
    control_rx: Receiver<ControlMessage>,
    doorbell_tx: Sender<WorkerId>,
    doorbell_rx: Receiver<WorkerId>,
    idle_timers: IdleTimerQueue,
    stats: Arc<PoolStats>,
    events: Arc<PoolEvents>,
    in_process_pending_messages: bool,
    starting_up: bool,
    bootstrap_failed: bool,
    queue_was_nonempty: bool,
    spawn_counter: u64,
}

impl Scheduler {
    fn new(
        opts: ResolvedOptions,
        control_rx: Receiver<ControlMessage>,
        stats: Arc<PoolStats>,
        events: Arc<PoolEvents>,
    ) -> Self {
        let (doorbell_tx, doorbell_rx) = unbounded();
        let mut scheduler = Self {
            opts,
            workers: SlotMap::with_key(),
            set: WorkerSet::new(),
            queue: VecDeque::new(),
            dispatched: HashMap::new(),
            control_rx,
            doorbell_tx,
            doorbell_rx,
            idle_timers: IdleTimerQueue::new(),
            stats,
            events,
            in_process_pending_messages: false,
            starting_up: true,
            bootstrap_failed: false,
            queue_was_nonempty: false,
            spawn_counter: 0,
        };
        // Initial fill. There is no work yet, so the fresh handles are
        // marked ready without waiting for their sentinels.
        scheduler.ensure_minimum_workers();
        scheduler.starting_up = false;
        scheduler
    }

    fn run(&mut self) {
        let control_rx = self.control_rx.clone();
        let doorbell_rx = self.doorbell_rx.clone();
        loop {
            let timeout = self
                .idle_timers
                .time_until_next()
                .unwrap_or(IDLE_SELECT_TIMEOUT);
            select! {
                recv(control_rx) -> message => {
                    match message {
                        Ok(ControlMessage::Submit(descriptor)) => self.handle_submission(descriptor),
                        Ok(ControlMessage::Abort(task_id)) => self.handle_abort(task_id),
                        Ok(ControlMessage::Destroy { done }) => {
                            self.shutdown();
                            let _ = done.send(());
                            return;
                        }
                        Err(_) => {
                            self.shutdown();
                            return;
                        }
                    }
                },
                recv(doorbell_rx) -> message => {
                    if let Ok(worker_id) = message {
                        self.drain_worker_messages(worker_id);
                        self.process_pending_messages();
                    }
                },
                default(timeout) => {
                    self.fire_idle_timers();
                },
            }
        }
    }

    // ---- submission -----------------------------------------------------

    fn handle_submission(&mut self, mut descriptor: TaskDescriptor) {
        if !self.queue.is_empty() {
            if self.queue.len() >= self.effective_capacity() {
                let error = if self.opts.max_queue == 0 {
                    PoolError::NoQueueAvailable
                } else {
                    PoolError::QueueAtLimit
                };
                descriptor.complete(Err(error));
                return;
            }
            if self.workers.len() < self.opts.max_threads {
                self.spawn_worker();
            }
            self.enqueue(descriptor);
            return;
        }

        let mut selected = self.find_available();
        if let Some(worker_id) = selected {
            // Abortable tasks require an otherwise-idle worker.
            if descriptor.is_abortable() && self.workers[worker_id].current_usage() > 0 {
                selected = None;
            }
        }

        let wants_fresh_worker = match selected {
            None => true,
            Some(worker_id) => self.workers[worker_id].current_usage() > 0,
        };
        let mut spawned = false;
        if wants_fresh_worker && self.workers.len() < self.opts.max_threads {
            self.spawn_worker();
            spawned = true;
            tracing::trace!(target: "lagoon::scheduler", "waiting for new worker");
        }

        match selected {
            Some(worker_id) => self.dispatch(descriptor, worker_id),
            None => {
                if self.opts.max_queue == 0 && !spawned {
                    descriptor.complete(Err(PoolError::NoQueueAvailable));
                } else {
                    self.enqueue(descriptor);
                }
            }
        }
    }

    /// Queue capacity including what not-yet-ready workers will absorb.
    fn effective_capacity(&self) -> usize {
        self.opts.max_queue.saturating_add(
            self.set
                .pending_count()
                .saturating_mul(self.opts.concurrent_tasks_per_worker),
        )
    }

    /// Least-loaded ready worker with spare capacity, if any.
    fn find_available(&self) -> Option<WorkerId> {
        let limit = self.opts.concurrent_tasks_per_worker;
        let mut best: Option<(WorkerId, usize)> = None;
        for &worker_id in self.set.ready_ids() {
            let Some(handle) = self.workers.get(worker_id) else {
                continue;
            };
            let usage = handle.current_usage();
            if usage == 0 {
                return Some(worker_id);
            }
            if usage < limit && best.is_none_or(|(_, lowest)| usage < lowest) {
                best = Some((worker_id, usage));
            }
        }
        best.map(|(worker_id, _)| worker_id)
    }

    fn enqueue(&mut self, descriptor: TaskDescriptor) {
        self.queue.push_back(descriptor);
        self.queue_was_nonempty = true;
        self.stats.set_queue_len(self.queue.len());
    }

    fn dispatch(&mut self, mut descriptor: TaskDescriptor, worker_id: WorkerId) {
        let now = Instant::now();
        self.stats
            .record_wait(now.duration_since(descriptor.created_at));
        descriptor.started_at = Some(now);
        let task_id = descriptor.id;
        if self.workers[worker_id].post(descriptor) {
            self.dispatched.insert(task_id, worker_id);
            tracing::trace!(
                target: "lagoon::scheduler",
                task = %task_id,
                worker = ?worker_id,
                "task dispatched"
            );
        }
        self.maybe_drain();
    }

    fn maybe_drain(&mut self) {
        if self.queue.is_empty() && self.queue_was_nonempty {
            self.queue_was_nonempty = false;
            self.events.drain.emit(());
        }
    }

    // ---- worker lifecycle -----------------------------------------------

    fn spawn_worker(&mut self) -> WorkerId {
        self.spawn_counter += 1;
        let index = self.spawn_counter;
        let doorbell = self.doorbell_tx.clone();
        let opts = self.opts.clone();
        let worker_id = self
            .workers
            .insert_with_key(|id| WorkerHandle::spawn(id, &opts, doorbell, index));
        if self.starting_up {
            self.workers[worker_id].ready = true;
            self.set.insert_ready(worker_id);
        } else {
            self.set.insert_pending(worker_id);
        }
        self.update_worker_gauges();
        tracing::debug!(
            target: "lagoon::scheduler",
            worker = ?worker_id,
            pending = !self.starting_up,
            "worker spawned"
        );
        worker_id
    }

    fn ensure_minimum_workers(&mut self) {
        while self.workers.len() < self.opts.min_threads {
            self.spawn_worker();
        }
    }

    /// Remove a worker and reclaim whatever it still owned.
    ///
    /// `join` waits for the thread; teardown of a worker that may be stuck
    /// in a task passes `false` and lets the thread exit on its own.
    fn remove_worker(&mut self, worker_id: WorkerId, join: bool) -> Vec<TaskDescriptor> {
        self.set.remove(worker_id);
        let Some(mut handle) = self.workers.remove(worker_id) else {
            return Vec::new();
        };
        let orphans = handle.destroy();
        for descriptor in &orphans {
            self.dispatched.remove(&descriptor.id);
        }
        if join {
            if let Some(thread) = handle.take_thread() {
                let _ = thread.join();
            }
        }
        self.update_worker_gauges();
        orphans
    }

    fn update_worker_gauges(&self) {
        debug_assert_eq!(self.set.size(), self.workers.len());
        self.stats.set_live_workers(self.workers.len());
        self.stats.set_pending_workers(self.set.pending_count());
    }

    // ---- worker messages ------------------------------------------------

    fn drain_worker_messages(&mut self, worker_id: WorkerId) {
        loop {
            let Some(message) = self
                .workers
                .get_mut(worker_id)
                .and_then(WorkerHandle::try_recv_message)
            else {
                return;
            };
            match message {
                WorkerMessage::Ready => self.handle_worker_ready(worker_id),
                WorkerMessage::Response { task_id, result } => {
                    self.handle_response(worker_id, task_id, result);
                }
                WorkerMessage::Crashed { message } => {
                    self.handle_worker_crash(worker_id, message);
                    return;
                }
            }
        }
    }

    fn handle_worker_ready(&mut self, worker_id: WorkerId) {
        let Some(handle) = self.workers.get_mut(worker_id) else {
            return;
        };
        if handle.ready {
            return;
        }
        handle.ready = true;
        self.set.mark_ready(worker_id);
        self.update_worker_gauges();
        tracing::debug!(target: "lagoon::scheduler", worker = ?worker_id, "worker ready");
        self.on_worker_available(worker_id);
    }

    fn handle_response(&mut self, worker_id: WorkerId, task_id: TaskId, result: TaskResult) {
        let Some(handle) = self.workers.get_mut(worker_id) else {
            return;
        };
        handle.last_seen_responses = handle.last_seen_responses.wrapping_add(1);
        let Some(mut descriptor) = handle.task_map.remove(&task_id) else {
            return;
        };
        self.dispatched.remove(&task_id);
        if let Some(started_at) = descriptor.started_at {
            self.stats.record_run(started_at.elapsed());
        }
        self.stats.incr_completed();
        descriptor.complete(result);
        self.on_worker_available(worker_id);
        self.process_pending_messages();
    }

    /// Opportunistically drain every worker whose response counter moved.
    ///
    /// Collapses a burst of responses into one controller turn. The latch
    /// stops reentry from the completions this sweep itself triggers.
    fn process_pending_messages(&mut self) {
        if !self.opts.use_atomics || self.in_process_pending_messages {
            return;
        }
        self.in_process_pending_messages = true;
        let worker_ids: Vec<WorkerId> = self.workers.keys().collect();
        for worker_id in worker_ids {
            if self
                .workers
                .get(worker_id)
                .is_some_and(WorkerHandle::response_counter_moved)
            {
                self.drain_worker_messages(worker_id);
            }
        }
        self.in_process_pending_messages = false;
    }

    fn handle_worker_crash(&mut self, worker_id: WorkerId, message: String) {
        let Some(handle) = self.workers.get(worker_id) else {
            return;
        };
        let was_ready = handle.ready;
        tracing::error!(
            target: "lagoon::scheduler",
            worker = ?worker_id,
            %message,
            "worker crashed"
        );
        let orphans = self.remove_worker(worker_id, true);
        if !was_ready {
            // A worker that dies before its ready sentinel points at a
            // broken bootstrap; stop replacing workers or the pool flaps.
            self.bootstrap_failed = true;
        } else if !self.bootstrap_failed {
            self.ensure_minimum_workers();
        }

        let error = PoolError::TaskFailed(message);
        if orphans.is_empty() {
            self.events.error.emit(error);
        } else {
            for mut descriptor in orphans {
                descriptor.complete(Err(error.clone()));
            }
        }
    }

    // ---- availability and idle retirement -------------------------------

    fn on_worker_available(&mut self, worker_id: WorkerId) {
        let limit = self.opts.concurrent_tasks_per_worker;
        loop {
            let Some(handle) = self.workers.get(worker_id) else {
                return;
            };
            if !handle.ready || !handle.has_spare_capacity(limit) || self.queue.is_empty() {
                break;
            }
            // An abortable task at the head waits for an idle worker.
            if handle.current_usage() > 0
                && self.queue.front().is_some_and(TaskDescriptor::is_abortable)
            {
                break;
            }
            let Some(descriptor) = self.queue.pop_front() else {
                break;
            };
            self.stats.set_queue_len(self.queue.len());
            self.dispatch(descriptor, worker_id);
        }
        self.maybe_arm_idle_timer(worker_id);
    }

    fn maybe_arm_idle_timer(&mut self, worker_id: WorkerId) {
        let Some(timeout) = self.opts.idle_timeout else {
            return;
        };
        if self.workers.len() <= self.opts.min_threads {
            return;
        }
        let Some(handle) = self.workers.get_mut(worker_id) else {
            return;
        };
        if handle.current_usage() != 0 || handle.idle_token.is_some() {
            return;
        }
        let token = self.idle_timers.arm(worker_id, timeout);
        handle.idle_token = Some(token);
    }

    fn fire_idle_timers(&mut self) {
        for (worker_id, token) in self.idle_timers.pop_expired() {
            let still_armed = self
                .workers
                .get(worker_id)
                .is_some_and(|handle| handle.idle_token == Some(token));
            if !still_armed {
                continue;
            }
            if self.workers.len() <= self.opts.min_threads {
                if let Some(handle) = self.workers.get_mut(worker_id) {
                    handle.idle_token = None;
                }
                continue;
            }
            if self.workers[worker_id].current_usage() == 0 {
                tracing::debug!(
                    target: "lagoon::scheduler",
                    worker = ?worker_id,
                    "idle worker retired"
                );
                self.remove_worker(worker_id, true);
            }
        }
    }

    // ---- cancellation ---------------------------------------------------

    fn handle_abort(&mut self, task_id: TaskId) {
        // Queued: drop it in place, keeping the rest of the queue intact.
        if let Some(position) = self.queue.iter().position(|task| task.id == task_id) {
            if let Some(mut descriptor) = self.queue.remove(position) {
                self.stats.set_queue_len(self.queue.len());
                descriptor.complete(Err(PoolError::Aborted));
                self.maybe_drain();
            }
            return;
        }

        // Dispatched: the rejection must land before teardown side effects.
        let Some(worker_id) = self.dispatched.remove(&task_id) else {
            return;
        };
        if let Some(handle) = self.workers.get_mut(worker_id) {
            if let Some(mut descriptor) = handle.task_map.remove(&task_id) {
                debug_assert_eq!(descriptor.owner, Some(worker_id));
                descriptor.complete(Err(PoolError::Aborted));
            }
        }
        tracing::debug!(
            target: "lagoon::scheduler",
            task = %task_id,
            worker = ?worker_id,
            "in-flight task aborted; tearing down its worker"
        );
        let orphans = self.remove_worker(worker_id, false);
        for mut descriptor in orphans {
            descriptor.complete(Err(PoolError::ThreadTermination));
        }
        self.ensure_minimum_workers();
    }

    // ---- shutdown -------------------------------------------------------

    fn shutdown(&mut self) {
        tracing::debug!(target: "lagoon::scheduler", "pool shutting down");
        while let Some(mut descriptor) = self.queue.pop_front() {
            descriptor.complete(Err(PoolError::ThreadTermination));
        }
        self.stats.set_queue_len(0);

        let worker_ids: Vec<WorkerId> = self.workers.keys().collect();
        let mut threads = Vec::new();
        for worker_id in worker_ids {
            self.set.remove(worker_id);
            if let Some(mut handle) = self.workers.remove(worker_id) {
                for mut descriptor in handle.destroy() {
                    descriptor.complete(Err(PoolError::ThreadTermination));
                }
                if let Some(thread) = handle.take_thread() {
                    threads.push(thread);
                }
            }
        }
        self.dispatched.clear();
        self.update_worker_gauges();
        for thread in threads {
            let _ = thread.join();
        }
    }
}
