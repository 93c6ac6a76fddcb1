//! Lead-time tracking: a priority queue over approaching timeslots.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use chrono::{DateTime, Utc};

use crate::domain::instance::InstanceId;

/// Priority queue keyed by `timeslot_start`, holding scheduled instances
/// that have not begun instantiating yet.
///
/// Entries are lazily validated on pop: an instance that moved on (or was
/// reset) since it was queued is simply skipped by the caller.
#[derive(Default)]
pub struct TimeslotQueue {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, InstanceId)>>,
    queued: HashSet<InstanceId>,
}

impl TimeslotQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an instance unless it is already queued.
    pub fn push(&mut self, start: DateTime<Utc>, id: InstanceId) {
        if self.queued.insert(id) {
            self.heap.push(Reverse((start, id)));
        }
    }

    /// Pop every instance whose timeslot start is at or before `cutoff`.
    pub fn pop_due(&mut self, cutoff: DateTime<Utc>) -> Vec<InstanceId> {
        let mut due = Vec::new();
        while let Some(Reverse((start, id))) = self.heap.peek().copied() {
            if start > cutoff {
                break;
            }
            self.heap.pop();
            self.queued.remove(&id);
            due.push(id);
        }
        due
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn pops_in_start_order_up_to_cutoff() {
        let mut queue = TimeslotQueue::new();
        let now = Utc::now();
        let soon = InstanceId::new();
        let later = InstanceId::new();
        let far = InstanceId::new();
        queue.push(now + Duration::minutes(10), later);
        queue.push(now + Duration::minutes(5), soon);
        queue.push(now + Duration::hours(2), far);

        let due = queue.pop_due(now + Duration::minutes(15));
        assert_eq!(due, vec![soon, later]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn duplicate_pushes_are_ignored() {
        let mut queue = TimeslotQueue::new();
        let now = Utc::now();
        let id = InstanceId::new();
        queue.push(now, id);
        queue.push(now + Duration::minutes(1), id);
        assert_eq!(queue.len(), 1);
    }
}
