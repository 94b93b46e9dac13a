// src/timer.rs
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

pub type ConnId = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerNode {
    expire: Instant,
    id: ConnId,
}

/// Idle-deadline tracker with lazy deletion.
///
/// Refreshing a deadline pushes a fresh heap entry instead of reordering
/// the old one, so the heap accumulates stale duplicates over time. The
/// map is the single source of truth: a popped heap entry counts as
/// expired only if the map still holds that exact (id, expire) pair;
/// anything else is a leftover from an earlier refresh or a removed id
/// and is dropped on the spot. Removal therefore only touches the map.
pub struct TimerManager {
    queue: BinaryHeap<Reverse<TimerNode>>,
    map: HashMap<ConnId, Instant>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            map: HashMap::new(),
        }
    }

    pub fn add_or_refresh(&mut self, id: ConnId, expire: Instant) {
        self.queue.push(Reverse(TimerNode { expire, id }));
        self.map.insert(id, expire);
    }

    pub fn remove(&mut self, id: ConnId) {
        self.map.remove(&id);
    }

    /// Pop every deadline at or before `now` and return the ids whose
    /// entries are still authoritative. Stale duplicates self-discard.
    pub fn sweep(&mut self, now: Instant) -> Vec<ConnId> {
        let mut expired = Vec::new();

        while let Some(Reverse(top)) = self.queue.peek().copied() {
            if top.expire > now {
                break;
            }
            self.queue.pop();

            match self.map.get(&top.id) {
                Some(&current) if current == top.expire => {
                    self.map.remove(&top.id);
                    expired.push(top.id);
                }
                _ => {} // stale duplicate or removed id
            }
        }

        expired
    }

    /// Number of live deadlines (not heap entries).
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn refresh_supersedes_earlier_deadline() {
        let now = Instant::now();
        let t1 = now + Duration::from_millis(100);
        let t2 = now + Duration::from_millis(300);

        let mut mgr = TimerManager::new();
        mgr.add_or_refresh(7, t1);
        mgr.add_or_refresh(7, t2);

        // at t1+eps the old entry is a stale duplicate
        let expired = mgr.sweep(t1 + Duration::from_millis(1));
        assert!(expired.is_empty());
        assert_eq!(mgr.len(), 1);

        // at t2+eps exactly one expiry fires
        let expired = mgr.sweep(t2 + Duration::from_millis(1));
        assert_eq!(expired, vec![7]);
        assert!(mgr.is_empty());

        // and it never fires twice
        assert!(mgr.sweep(t2 + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn removed_ids_never_expire() {
        let now = Instant::now();
        let mut mgr = TimerManager::new();
        mgr.add_or_refresh(1, now + Duration::from_millis(10));
        mgr.add_or_refresh(2, now + Duration::from_millis(10));
        mgr.remove(1);
        // removing an unknown id is a no-op
        mgr.remove(99);

        let expired = mgr.sweep(now + Duration::from_millis(20));
        assert_eq!(expired, vec![2]);
    }

    #[test]
    fn sweep_reports_in_deadline_order() {
        let now = Instant::now();
        let mut mgr = TimerManager::new();
        mgr.add_or_refresh(3, now + Duration::from_millis(30));
        mgr.add_or_refresh(1, now + Duration::from_millis(10));
        mgr.add_or_refresh(2, now + Duration::from_millis(20));

        let expired = mgr.sweep(now + Duration::from_millis(40));
        assert_eq!(expired, vec![1, 2, 3]);
    }

    #[test]
    fn future_deadlines_stop_the_sweep() {
        let now = Instant::now();
        let mut mgr = TimerManager::new();
        mgr.add_or_refresh(1, now + Duration::from_millis(10));
        mgr.add_or_refresh(2, now + Duration::from_secs(60));

        let expired = mgr.sweep(now + Duration::from_millis(20));
        assert_eq!(expired, vec![1]);
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn many_refreshes_leave_one_live_deadline() {
        let now = Instant::now();
        let mut mgr = TimerManager::new();
        for i in 0..100u64 {
            mgr.add_or_refresh(5, now + Duration::from_millis(i));
        }
        assert_eq!(mgr.len(), 1);

        let expired = mgr.sweep(now + Duration::from_secs(1));
        assert_eq!(expired, vec![5]);
    }
}
