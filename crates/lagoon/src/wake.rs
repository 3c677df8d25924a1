//! Shared-counter wake channel between the controller and one worker.
//!
//! Each worker shares a block of two 32-bit atomic lanes with the
//! controller: lane 0 counts posted requests, lane 1 counts posted
//! responses. The controller bumps the request lane and notifies after each
//! post; the worker blocks on the gate between tasks and re-checks the lane
//! on wake. Only equality is ever compared, so wraparound at 2^32 is
//! harmless.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::{Condvar, Mutex};
use static_assertions::const_assert_eq;

/// Lane carrying the count of requests posted by the controller.
pub(crate) const REQUEST_INDEX: usize = 0;
/// Lane carrying the count of responses posted by the worker.
pub(crate) const RESPONSE_INDEX: usize = 1;

/// Two 32-bit counter lanes shared across the thread boundary.
#[repr(C)]
pub(crate) struct SharedCounters {
    lanes: [AtomicU32; 2],
}

const_assert_eq!(std::mem::size_of::<SharedCounters>(), 8);
const_assert_eq!(std::mem::align_of::<SharedCounters>(), 4);

impl SharedCounters {
    fn new() -> Self {
        Self {
            lanes: [AtomicU32::new(0), AtomicU32::new(0)],
        }
    }

    pub fn load(&self, index: usize) -> u32 {
        self.lanes[index].load(Ordering::Acquire)
    }

    /// Bump a lane; returns the new value.
    pub fn increment(&self, index: usize) -> u32 {
        self.lanes[index]
            .fetch_add(1, Ordering::Release)
            .wrapping_add(1)
    }
}

/// The wake half of a worker's channel: counters plus a condvar gate.
pub(crate) struct WakeChannel {
    counters: SharedCounters,
    terminated: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl WakeChannel {
    pub fn new() -> Self {
        Self {
            counters: SharedCounters::new(),
            terminated: AtomicBool::new(false),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    pub fn counters(&self) -> &SharedCounters {
        &self.counters
    }

    /// Wake any thread blocked in [`wait_for`](Self::wait_for).
    pub fn notify(&self) {
        // Notify under the lock so a concurrent waiter cannot miss it
        let _guard = self.mutex.lock();
        self.condvar.notify_all();
    }

    /// Bump a lane and wake the waiting side.
    pub fn increment_and_notify(&self, index: usize) {
        self.counters.increment(index);
        self.notify();
    }

    /// Mark the channel terminated and release any waiter.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
        self.notify();
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Block until the lane moves past `last_seen` or the channel terminates.
    pub fn wait_for(&self, index: usize, last_seen: u32) {
        let mut guard = self.mutex.lock();
        while self.counters.load(index) == last_seen && !self.is_terminated() {
            self.condvar.wait(&mut guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_counters_increment_monotonically() {
        let counters = SharedCounters::new();
        assert_eq!(counters.load(REQUEST_INDEX), 0);
        assert_eq!(counters.increment(REQUEST_INDEX), 1);
        assert_eq!(counters.increment(REQUEST_INDEX), 2);
        assert_eq!(counters.load(REQUEST_INDEX), 2);
        assert_eq!(counters.load(RESPONSE_INDEX), 0);
    }

    #[test]
    fn test_wait_returns_on_increment() {
        let channel = Arc::new(WakeChannel::new());
        let waiter = channel.clone();
        let handle = thread::spawn(move || {
            waiter.wait_for(REQUEST_INDEX, 0);
            waiter.counters().load(REQUEST_INDEX)
        });

        thread::sleep(Duration::from_millis(20));
        channel.increment_and_notify(REQUEST_INDEX);
        assert_eq!(handle.join().unwrap(), 1);
    }

    #[test]
    fn test_wait_returns_on_terminate() {
        let channel = Arc::new(WakeChannel::new());
        let waiter = channel.clone();
        let handle = thread::spawn(move || {
            waiter.wait_for(REQUEST_INDEX, 0);
        });

        thread::sleep(Duration::from_millis(20));
        channel.terminate();
        handle.join().unwrap();
        assert!(channel.is_terminated());
    }

    #[test]
    fn test_wait_with_stale_count_returns_immediately() {
        let channel = WakeChannel::new();
        channel.increment_and_notify(RESPONSE_INDEX);
        // Caller last saw 0, counter is already 1.
        channel.wait_for(RESPONSE_INDEX, 0);
    }
}
