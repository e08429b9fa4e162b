use std::collections::VecDeque;
use std::time::Instant;

use crate::api::{DequeueResult, QueueStateEntry, QueuedRequest, RequestHandle, RequestRecord};
use crate::config::PriorityConfig;
use crate::priority::compute_priority;
use crate::tracker::KeyFrequencyTracker;

/// Insertion-ordered queue whose serving order is recomputed on every read.
///
/// Priorities are never cached: an entry's priority depends on the share its
/// keys hold in the whole queue, and that changes whenever any entry is added
/// or removed. Selection is a linear scan, which is fine at admission-queue
/// sizes (low hundreds).
///
/// Not synchronized; [`crate::PriorityBucketQueue`] wraps it in a single lock.
#[derive(Debug)]
pub struct BucketedQueueStore<T> {
    config: PriorityConfig,
    // Sorted by sequence, since sequences are assigned in push order.
    entries: VecDeque<QueuedRequest<T>>,
    ip_counts: KeyFrequencyTracker,
    anonymous_agents: KeyFrequencyTracker,
    next_sequence: u64,
}

impl<T> BucketedQueueStore<T> {
    pub fn new(config: PriorityConfig) -> Self {
        Self {
            config,
            entries: VecDeque::new(),
            ip_counts: KeyFrequencyTracker::new(),
            anonymous_agents: KeyFrequencyTracker::new(),
            next_sequence: 0,
        }
    }

    pub fn config(&self) -> &PriorityConfig {
        &self.config
    }

    pub fn enqueue(&mut self, record: RequestRecord, payload: T) -> RequestHandle {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        self.ip_counts.increment(&record.ip);
        if record.is_anonymous() {
            self.anonymous_agents.increment(&record.user_agent);
        }

        self.entries.push_back(QueuedRequest {
            record,
            payload,
            enqueue_ts: Instant::now(),
            sequence,
        });
        RequestHandle::new(sequence)
    }

    /// The entry `dequeue` would return next and its current priority.
    pub fn peek(&self) -> Option<(&QueuedRequest<T>, u32)> {
        let (idx, priority) = self.select()?;
        Some((&self.entries[idx], priority))
    }

    pub fn dequeue(&mut self) -> DequeueResult<T> {
        let Some((idx, pre_op_priority)) = self.select() else {
            return DequeueResult::Empty;
        };
        match self.remove_at(idx) {
            Some(request) => DequeueResult::Request {
                request,
                pre_op_priority,
            },
            None => DequeueResult::Empty,
        }
    }

    /// Removes the entry behind `handle`, if it is still queued.
    pub fn remove(&mut self, handle: RequestHandle) -> Option<QueuedRequest<T>> {
        let idx = self
            .entries
            .binary_search_by_key(&handle.sequence(), |entry| entry.sequence)
            .ok()?;
        self.remove_at(idx)
    }

    /// Removes every entry, oldest first.
    pub fn drain(&mut self) -> Vec<QueuedRequest<T>> {
        self.ip_counts = KeyFrequencyTracker::new();
        self.anonymous_agents = KeyFrequencyTracker::new();
        self.entries.drain(..).collect()
    }

    pub fn size(&self) -> usize {
        debug_assert_eq!(self.entries.len(), self.ip_counts.total());
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn priority_of(&self, entry: &QueuedRequest<T>) -> u32 {
        compute_priority(
            &entry.record,
            &self.ip_counts,
            &self.anonymous_agents,
            self.entries.len(),
            &self.config,
        )
    }

    /// Every queued entry with its current priority, oldest first.
    pub fn snapshot(&self, now: Instant) -> Vec<QueueStateEntry> {
        self.entries
            .iter()
            .map(|entry| QueueStateEntry {
                record: entry.record.clone(),
                sequence: entry.sequence,
                priority: self.priority_of(entry),
                waited_ns: now
                    .saturating_duration_since(entry.enqueue_ts)
                    .as_nanos()
                    .min(u128::from(u64::MAX)) as u64,
            })
            .collect()
    }

    pub fn ip_counts(&self) -> &KeyFrequencyTracker {
        &self.ip_counts
    }

    pub fn anonymous_agents(&self) -> &KeyFrequencyTracker {
        &self.anonymous_agents
    }

    /// Lowest priority wins; ties go to the lowest sequence.
    fn select(&self) -> Option<(usize, u32)> {
        let mut best: Option<(usize, u32, u64)> = None;
        for (idx, entry) in self.entries.iter().enumerate() {
            let priority = self.priority_of(entry);
            let better = match best {
                None => true,
                Some((_, best_priority, best_sequence)) => {
                    (priority, entry.sequence) < (best_priority, best_sequence)
                }
            };
            if better {
                best = Some((idx, priority, entry.sequence));
            }
        }
        best.map(|(idx, priority, _)| (idx, priority))
    }

    fn remove_at(&mut self, idx: usize) -> Option<QueuedRequest<T>> {
        let entry = self.entries.remove(idx)?;
        self.ip_counts.decrement(&entry.record.ip);
        if entry.record.is_anonymous() {
            self.anonymous_agents.decrement(&entry.record.user_agent);
        }
        Some(entry)
    }
}

impl<T> Default for BucketedQueueStore<T> {
    fn default() -> Self {
        Self::new(PriorityConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anon(ip: &str, ua: &str) -> RequestRecord {
        RequestRecord::anonymous(ip, ua)
    }

    #[test]
    fn empty_store_returns_nothing() {
        let mut store = BucketedQueueStore::<()>::default();
        assert!(store.peek().is_none());
        assert!(store.dequeue().is_empty());
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn peek_does_not_mutate() {
        let mut store = BucketedQueueStore::default();
        store.enqueue(anon("1.1.1.1", "a"), 1);
        store.enqueue(anon("2.2.2.2", "b"), 2);

        let first = store.peek().map(|(entry, p)| (entry.payload, p));
        let second = store.peek().map(|(entry, p)| (entry.payload, p));
        assert_eq!(first, Some((1, 1)));
        assert_eq!(first, second);
        assert_eq!(store.size(), 2);
        assert_eq!(store.ip_counts().total(), 2);
    }

    #[test]
    fn trackers_follow_entries() {
        let mut store = BucketedQueueStore::default();
        store.enqueue(anon("1.1.1.1", "a"), ());
        store.enqueue(RequestRecord::authenticated("1.1.1.1", "a", "u"), ());
        assert_eq!(store.ip_counts().count("1.1.1.1"), 2);
        assert_eq!(store.anonymous_agents().count("a"), 1);

        let _ = store.dequeue();
        let _ = store.dequeue();
        assert_eq!(store.ip_counts().total(), 0);
        assert_eq!(store.anonymous_agents().total(), 0);
    }

    #[test]
    fn remove_by_handle_updates_trackers() {
        let mut store = BucketedQueueStore::default();
        let first = store.enqueue(anon("1.1.1.1", "a"), 1);
        let second = store.enqueue(anon("2.2.2.2", "b"), 2);

        let removed = store.remove(second).expect("queued");
        assert_eq!(removed.payload, 2);
        assert!(store.remove(second).is_none());
        assert_eq!(store.anonymous_agents().count("b"), 0);
        assert_eq!(store.size(), 1);
        assert_eq!(store.peek().map(|(entry, _)| entry.handle()), Some(first));
    }

    #[test]
    fn drain_empties_entries_and_trackers() {
        let mut store = BucketedQueueStore::default();
        store.enqueue(anon("1.1.1.1", "a"), 1);
        store.enqueue(RequestRecord::authenticated("2.2.2.2", "b", "u"), 2);

        let drained: Vec<_> = store.drain().into_iter().map(|e| e.payload).collect();
        assert_eq!(drained, vec![1, 2]);
        assert!(store.is_empty());
        assert_eq!(store.ip_counts().total(), 0);
        assert_eq!(store.anonymous_agents().distinct_keys(), 0);

        let handle = store.enqueue(anon("1.1.1.1", "a"), 3);
        assert!(handle.sequence() >= 2);
    }

    #[test]
    fn sequences_are_never_reused() {
        let mut store = BucketedQueueStore::default();
        let a = store.enqueue(anon("1.1.1.1", "a"), ());
        let _ = store.dequeue();
        let b = store.enqueue(anon("1.1.1.1", "a"), ());
        assert!(b.sequence() > a.sequence());
    }
}
