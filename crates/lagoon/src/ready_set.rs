//! Pending/ready bookkeeping for the worker pool.
//!
//! Workers live in exactly one of two disjoint sets: `pending` from spawn
//! until their ready sentinel arrives, `ready` thereafter. Only ready
//! workers participate in selection; pending workers still count toward the
//! pool size and toward the queue's effective capacity.

use crate::worker::WorkerId;

/// Two-set worker collection with insertion-order iteration.
#[derive(Debug, Default)]
pub(crate) struct WorkerSet {
    pending: Vec<WorkerId>,
    ready: Vec<WorkerId>,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a freshly spawned worker that has not reported ready yet.
    pub fn insert_pending(&mut self, id: WorkerId) {
        debug_assert!(!self.pending.contains(&id) && !self.ready.contains(&id));
        self.pending.push(id);
    }

    /// Add a worker directly to the ready set (initial pool fill).
    pub fn insert_ready(&mut self, id: WorkerId) {
        debug_assert!(!self.pending.contains(&id) && !self.ready.contains(&id));
        self.ready.push(id);
    }

    /// Move a worker from pending to ready.
    ///
    /// Returns `false` if the worker was not pending.
    pub fn mark_ready(&mut self, id: WorkerId) -> bool {
        let Some(position) = self.pending.iter().position(|&other| other == id) else {
            return false;
        };
        self.pending.remove(position);
        self.ready.push(id);
        true
    }

    /// Remove a worker from whichever set holds it.
    pub fn remove(&mut self, id: WorkerId) {
        self.pending.retain(|&other| other != id);
        self.ready.retain(|&other| other != id);
    }

    /// Ready workers, in the order they became ready.
    pub fn ready_ids(&self) -> &[WorkerId] {
        &self.ready
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Total workers tracked, pending and ready.
    pub fn size(&self) -> usize {
        self.pending.len() + self.ready.len()
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
    fn test_pending_to_ready_transition() {
        let ids = worker_ids(2);
        let mut set = WorkerSet::new();
        set.insert_pending(ids[0]);
        set.insert_pending(ids[1]);
        assert_eq!(set.pending_count(), 2);
        assert!(set.ready_ids().is_empty());
        assert_eq!(set.size(), 2);

        assert!(set.mark_ready(ids[1]));
        assert!(!set.mark_ready(ids[1]));
        assert_eq!(set.pending_count(), 1);
        assert_eq!(set.ready_ids(), &[ids[1]]);
        assert_eq!(set.size(), 2);
    }

    #[test]
    fn test_ready_order_is_arrival_order() {
        let ids = worker_ids(3);
        let mut set = WorkerSet::new();
        for &id in &ids {
            set.insert_pending(id);
        }
        set.mark_ready(ids[2]);
        set.mark_ready(ids[0]);
        set.mark_ready(ids[1]);

        assert_eq!(set.ready_ids(), &[ids[2], ids[0], ids[1]]);
    }

    #[test]
    fn test_remove_from_either_set() {
        let ids = worker_ids(2);
        let mut set = WorkerSet::new();
        set.insert_pending(ids[0]);
        set.insert_ready(ids[1]);

        set.remove(ids[0]);
        set.remove(ids[1]);
        assert_eq!(set.size(), 0);
    }
}
