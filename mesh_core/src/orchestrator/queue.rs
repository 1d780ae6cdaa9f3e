//! Priority queue of pending jobs.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::job::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueueEntry {
    pub priority: i32,
    pub sequence: u64,
    pub job_id: JobId,
}

impl Ord for QueueEntry {
    /// Higher priority first, then earlier submission.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
            .then_with(|| self.job_id.cmp(&other.job_id))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Max-heap ordered by `(priority desc, sequence asc)`.
///
/// Entries may outlive their job's Pending state; the dispatcher checks the
/// job record before acting on a popped entry.
#[derive(Debug, Default)]
pub(crate) struct JobQueue {
    heap: BinaryHeap<QueueEntry>,
}

impl JobQueue {
    pub fn push(&mut self, entry: QueueEntry) {
        self.heap.push(entry);
    }

    pub fn pop(&mut self) -> Option<QueueEntry> {
        self.heap.pop()
    }

    pub fn remove(&mut self, job_id: JobId) -> bool {
        let before = self.heap.len();
        self.heap.retain(|entry| entry.job_id != job_id);
        self.heap.len() != before
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

    fn entry(priority: i32, sequence: u64) -> QueueEntry {
        QueueEntry {
            priority,
            sequence,
            job_id: JobId::new(),
        }
    }

    #[test]
    fn test_priority_then_fifo() {
        let mut queue = JobQueue::default();
        let low = entry(1, 0);
        let high_late = entry(9, 2);
        let high_early = entry(9, 1);
        queue.push(low);
        queue.push(high_late);
        queue.push(high_early);

        assert_eq!(queue.pop(), Some(high_early));
        assert_eq!(queue.pop(), Some(high_late));
        assert_eq!(queue.pop(), Some(low));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remove() {
        let mut queue = JobQueue::default();
        let a = entry(1, 0);
        queue.push(a);
        queue.push(entry(2, 1));
        assert!(queue.remove(a.job_id));
        assert!(!queue.remove(a.job_id));
        assert_eq!(queue.len(), 1);
    }
}
