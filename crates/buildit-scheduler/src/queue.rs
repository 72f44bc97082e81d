//! In-memory job queue.
//!
//! Ordered by priority (highest first), then arrival time, then admission
//! order, so requests in the same priority band are served FIFO.

use buildit_core::{BuildId, BuildRequest};
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::AdmissionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<i32>,
    received_at: DateTime<Utc>,
    seq: u64,
}

/// Bounded priority queue of admitted, not yet placed build requests.
#[derive(Debug)]
pub struct JobQueue {
    entries: BTreeMap<QueueKey, Arc<BuildRequest>>,
    index: HashMap<BuildId, QueueKey>,
    next_seq: u64,
    max_depth: usize,
}

impl JobQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            index: HashMap::new(),
            next_seq: 0,
            max_depth,
        }
    }

    /// Admit a new request. Fails with backpressure at the depth limit.
    pub fn enqueue(&mut self, request: Arc<BuildRequest>) -> Result<(), AdmissionError> {
        if self.index.contains_key(&request.id) {
            return Err(AdmissionError::Duplicate(request.id));
        }
        if self.entries.len() >= self.max_depth {
            return Err(AdmissionError::Backpressure {
                depth: self.entries.len(),
                max_depth: self.max_depth,
            });
        }
        self.insert(request);
        Ok(())
    }

    /// Put a retried request back. Ignores the depth limit: a build that was
    /// already admitted is never dropped.
    pub fn requeue(&mut self, request: Arc<BuildRequest>) {
        if !self.index.contains_key(&request.id) {
            self.insert(request);
        }
    }

    fn insert(&mut self, request: Arc<BuildRequest>) {
        let key = QueueKey {
            priority: Reverse(request.priority),
            received_at: request.received_at,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.index.insert(request.id, key);
        self.entries.insert(key, request);
    }

    /// The request that would be dequeued next.
    pub fn peek(&self) -> Option<&Arc<BuildRequest>> {
        self.entries.values().next()
    }

    pub fn dequeue(&mut self) -> Option<Arc<BuildRequest>> {
        let (_, request) = self.entries.pop_first()?;
        self.index.remove(&request.id);
        Some(request)
    }

    /// Remove a queued request. Returns false if it is not queued (already
    /// scheduled or never admitted).
    pub fn cancel(&mut self, id: &BuildId) -> bool {
        match self.index.remove(id) {
            Some(key) => self.entries.remove(&key).is_some(),
            None => false,
        }
    }

    pub fn contains(&self, id: &BuildId) -> bool {
        self.index.contains_key(id)
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// How long the longest-waiting request has been queued.
    pub fn oldest_age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.entries
            .values()
            .map(|r| r.received_at)
            .min()
            .map(|oldest| now - oldest)
    }

    /// Requests in scheduling order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<BuildRequest>> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn request(priority: i32, at_secs: i64) -> Arc<BuildRequest> {
        let at = Utc.timestamp_opt(1_700_000_000 + at_secs, 0).unwrap();
        Arc::new(BuildRequest::new("acme/app", "abc", priority, "test").received_at(at))
    }

    #[test]
    fn test_higher_priority_first() {
        let mut queue = JobQueue::new(10);
        let a = request(5, 0);
        let b = request(10, 1);
        queue.enqueue(a.clone()).unwrap();
        queue.enqueue(b.clone()).unwrap();

        assert_eq!(queue.dequeue().unwrap().id, b.id);
        assert_eq!(queue.dequeue().unwrap().id, a.id);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_fifo_within_priority() {
        let mut queue = JobQueue::new(10);
        let a = request(1, 0);
        let b = request(1, 1);
        let c = request(1, 2);
        queue.enqueue(c.clone()).unwrap();
        queue.enqueue(a.clone()).unwrap();
        queue.enqueue(b.clone()).unwrap();

        let order: Vec<_> = queue.iter().map(|r| r.id).collect();
        assert_eq!(order, vec![a.id, b.id, c.id]);
    }

    #[test]
    fn test_same_timestamp_keeps_admission_order() {
        let mut queue = JobQueue::new(10);
        let first = request(0, 0);
        let second = request(0, 0);
        queue.enqueue(first.clone()).unwrap();
        queue.enqueue(second.clone()).unwrap();
        assert_eq!(queue.peek().unwrap().id, first.id);
    }

    #[test]
    fn test_backpressure_at_max_depth() {
        let mut queue = JobQueue::new(2);
        queue.enqueue(request(0, 0)).unwrap();
        queue.enqueue(request(0, 1)).unwrap();

        let err = queue.enqueue(request(0, 2)).unwrap_err();
        assert_eq!(
            err,
            AdmissionError::Backpressure {
                depth: 2,
                max_depth: 2
            }
        );
        assert_eq!(queue.size(), 2);
    }

    #[test]
    fn test_requeue_bypasses_depth_limit() {
        let mut queue = JobQueue::new(1);
        queue.enqueue(request(0, 0)).unwrap();
        let retried = request(0, 1);
        queue.requeue(retried.clone());
        assert_eq!(queue.size(), 2);
        assert!(queue.contains(&retried.id));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut queue = JobQueue::new(10);
        let a = request(0, 0);
        queue.enqueue(a.clone()).unwrap();
        assert_eq!(
            queue.enqueue(a.clone()).unwrap_err(),
            AdmissionError::Duplicate(a.id)
        );
    }

    #[test]
    fn test_cancel_only_while_queued() {
        let mut queue = JobQueue::new(10);
        let a = request(0, 0);
        let b = request(0, 1);
        queue.enqueue(a.clone()).unwrap();
        queue.enqueue(b.clone()).unwrap();

        assert!(queue.cancel(&b.id));
        assert!(!queue.cancel(&b.id));

        let scheduled = queue.dequeue().unwrap();
        assert_eq!(scheduled.id, a.id);
        assert!(!queue.cancel(&a.id));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_oldest_age() {
        let mut queue = JobQueue::new(10);
        assert!(queue.oldest_age(Utc::now()).is_none());

        // A high priority latecomer does not hide the oldest waiter
        queue.enqueue(request(0, 0)).unwrap();
        queue.enqueue(request(9, 30)).unwrap();
        let now = Utc.timestamp_opt(1_700_000_060, 0).unwrap();
        assert_eq!(queue.oldest_age(now), Some(chrono::Duration::seconds(60)));
    }
}
