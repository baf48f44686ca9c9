//! Priority queue feeding the workers.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::db::{CheckExecution, CheckerSchedule};

/// Lower values are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    OnDemand = 0,
    /// Missed more than one full interval.
    Overdue = 1,
    Scheduled = 2,
}

/// One pending run of a check.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub schedule: CheckerSchedule,
    pub execution: CheckExecution,
    pub priority: Priority,
    pub queued_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn new(schedule: CheckerSchedule, execution: CheckExecution, priority: Priority) -> Self {
        Self {
            schedule,
            execution,
            priority,
            queued_at: Utc::now(),
        }
    }
}

struct Entry {
    item: QueueItem,
    seq: u64,
}

impl Entry {
    fn key(&self) -> (Priority, DateTime<Utc>, u64) {
        (self.item.priority, self.item.queued_at, self.seq)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // BinaryHeap is a max-heap; reverse so the smallest key pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

/// Unbounded min-heap ordered by priority, then enqueue time.
#[derive(Default)]
pub struct PriorityQueue {
    inner: Mutex<Inner>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: QueueItem) {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Entry { item, seq });
    }

    pub fn pop(&self) -> Option<QueueItem> {
        self.inner.lock().heap.pop().map(|e| e.item)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CheckerOptions, ExecutionStatus, TargetType};
    use crate::ident::Identifier;
    use std::time::Duration;

    fn item(priority: Priority, tag: &str) -> QueueItem {
        let target_id = Identifier::generate();
        let schedule = CheckerSchedule {
            id: Identifier::generate(),
            checker_name: tag.to_string(),
            owner_id: Identifier::generate(),
            target_type: TargetType::Domain,
            target_id,
            interval: Duration::from_secs(3600),
            enabled: true,
            next_run: Utc::now(),
            last_run: None,
            options: CheckerOptions::new(),
        };
        let execution = CheckExecution {
            id: Identifier::generate(),
            schedule_id: Some(schedule.id),
            checker_name: tag.to_string(),
            owner_id: schedule.owner_id,
            target_type: TargetType::Domain,
            target_id,
            options: CheckerOptions::new(),
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            result_id: None,
        };
        QueueItem::new(schedule, execution, priority)
    }

    #[test]
    fn test_empty_pop() {
        let queue = PriorityQueue::new();
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_priority_then_fifo() {
        let queue = PriorityQueue::new();
        queue.push(item(Priority::Scheduled, "s1"));
        queue.push(item(Priority::Overdue, "o1"));
        queue.push(item(Priority::Scheduled, "s2"));
        queue.push(item(Priority::OnDemand, "d1"));
        queue.push(item(Priority::Overdue, "o2"));
        assert_eq!(queue.len(), 5);

        let order: Vec<String> = std::iter::from_fn(|| queue.pop())
            .map(|i| i.schedule.checker_name)
            .collect();
        assert_eq!(order, vec!["d1", "o1", "o2", "s1", "s2"]);
    }

    #[test]
    fn test_same_timestamp_keeps_insertion_order() {
        let queue = PriorityQueue::new();
        let at = Utc::now();
        for i in 0..20 {
            let mut it = item(Priority::Scheduled, &i.to_string());
            it.queued_at = at;
            queue.push(it);
        }
        for i in 0..20 {
            assert_eq!(queue.pop().unwrap().schedule.checker_name, i.to_string());
        }
    }

    #[test]
    fn test_drain_is_non_decreasing() {
        let queue = PriorityQueue::new();
        let priorities = [Priority::Scheduled, Priority::OnDemand, Priority::Overdue];
        for i in 0..30 {
            queue.push(item(priorities[i % 3], "x"));
        }
        let drained: Vec<_> = std::iter::from_fn(|| queue.pop())
            .map(|i| (i.priority, i.queued_at))
            .collect();
        assert_eq!(drained.len(), 30);
        assert!(drained.windows(2).all(|w| w[0] <= w[1]));
    }
}
