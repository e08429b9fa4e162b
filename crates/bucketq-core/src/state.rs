use std::sync::atomic::{AtomicU64, Ordering};

/// Upper bounds (ns) of the queue-time histogram buckets.
pub(crate) const QUEUE_TIME_BUCKETS_NS: [u64; 10] = [
    1_000_000,
    5_000_000,
    10_000_000,
    50_000_000,
    100_000_000,
    500_000_000,
    1_000_000_000,
    5_000_000_000,
    30_000_000_000,
    u64::MAX,
];

/// Highest priority the calculator can produce: base + two tiers on each of
/// the two dimensions. Larger values share the last slot.
pub(crate) const MAX_TRACKED_PRIORITY: usize = 5;

#[derive(Debug)]
pub(crate) struct StatsCounters {
    pub(crate) enqueued: AtomicU64,
    pub(crate) dequeued: AtomicU64,
    pub(crate) cancelled: AtomicU64,
    pub(crate) expired: AtomicU64,
    pub(crate) queue_time_sum_ns: AtomicU64,
    pub(crate) queue_time_samples: AtomicU64,
    pub(crate) queue_time_buckets: [AtomicU64; QUEUE_TIME_BUCKETS_NS.len()],
    pub(crate) served_by_priority: [AtomicU64; MAX_TRACKED_PRIORITY],
}

impl StatsCounters {
    pub(crate) fn new() -> Self {
        Self {
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            queue_time_sum_ns: AtomicU64::new(0),
            queue_time_samples: AtomicU64::new(0),
            queue_time_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            served_by_priority: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub(crate) fn saturating_add(counter: &AtomicU64, delta: u64) {
        if delta == 0 {
            return;
        }
        let mut current = counter.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(delta);
            match counter.compare_exchange(current, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn record_queue_time(&self, queue_time_ns: u64) {
        Self::saturating_add(&self.queue_time_sum_ns, queue_time_ns);
        Self::saturating_add(&self.queue_time_samples, 1);
        for (idx, bound) in QUEUE_TIME_BUCKETS_NS.iter().enumerate() {
            if queue_time_ns <= *bound {
                Self::saturating_add(&self.queue_time_buckets[idx], 1);
                break;
            }
        }
    }

    pub(crate) fn record_served_priority(&self, priority: u32) {
        let slot = (priority.max(1) as usize).min(MAX_TRACKED_PRIORITY) - 1;
        Self::saturating_add(&self.served_by_priority[slot], 1);
    }

    pub(crate) fn load(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
