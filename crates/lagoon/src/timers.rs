//! Idle-timer queue for retiring supernumerary workers.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use crate::worker::WorkerId;

/// An armed idle timer (min-heap by deadline).
#[derive(Debug, Clone, Copy)]
struct IdleEntry {
    deadline: Instant,
    worker: WorkerId,
    token: u64,
}

impl PartialEq for IdleEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for IdleEntry {}

impl PartialOrd for IdleEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IdleEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap (BinaryHeap is max-heap by default).
        other.deadline.cmp(&self.deadline)
    }
}

/// Deadline queue polled by the controller between channel events.
///
/// Entries are never removed eagerly; the scheduler validates the token
/// against the worker handle when an entry fires, so disarming is just
/// clearing the handle's token.
#[derive(Debug, Default)]
pub(crate) struct IdleTimerQueue {
    heap: BinaryHeap<IdleEntry>,
    next_token: u64,
}

impl IdleTimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer for `worker`; returns the token identifying this arming.
    pub fn arm(&mut self, worker: WorkerId, timeout: Duration) -> u64 {
        self.next_token += 1;
        let token = self.next_token;
        self.heap.push(IdleEntry {
            deadline: Instant::now() + timeout,
            worker,
            token,
        });
        token
    }

    /// Time until the earliest entry fires, if any are armed.
    pub fn time_until_next(&self) -> Option<Duration> {
        self.heap
            .peek()
            .map(|entry| entry.deadline.saturating_duration_since(Instant::now()))
    }

    /// Pop every entry whose deadline has passed.
    pub fn pop_expired(&mut self) -> Vec<(WorkerId, u64)> {
        let now = Instant::now();
        let mut fired = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = self.heap.pop().unwrap();
            fired.push((entry.worker, entry.token));
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn worker_ids(count: usize) -> Vec<WorkerId> {
        let mut map: SlotMap<WorkerId, ()> = SlotMap::with_key();
        (0..count).map(|_| map.insert(())).collect()
    }

    #[test]
    fn test_tokens_are_unique() {
        let ids = worker_ids(1);
        let mut timers = IdleTimerQueue::new();
        let a = timers.arm(ids[0], Duration::from_millis(1));
        let b = timers.arm(ids[0], Duration::from_millis(1));
        assert_ne!(a, b);
    }

    #[test]
    fn test_pop_expired_in_deadline_order() {
        let ids = worker_ids(2);
        let mut timers = IdleTimerQueue::new();
        let late = timers.arm(ids[1], Duration::from_millis(20));
        let early = timers.arm(ids[0], Duration::from_millis(1));

        std::thread::sleep(Duration::from_millis(30));
        let fired = timers.pop_expired();
        assert_eq!(fired, vec![(ids[0], early), (ids[1], late)]);
        assert!(timers.pop_expired().is_empty());
    }

    #[test]
    fn test_unexpired_entries_stay_queued() {
        let ids = worker_ids(1);
        let mut timers = IdleTimerQueue::new();
        timers.arm(ids[0], Duration::from_secs(60));

        assert!(timers.pop_expired().is_empty());
        let remaining = timers.time_until_next().unwrap();
        assert!(remaining > Duration::from_secs(50));
    }

    #[test]
    fn test_time_until_next_empty() {
        let timers = IdleTimerQueue::new();
        assert!(timers.time_until_next().is_none());
    }
}
