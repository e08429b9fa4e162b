use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::api::{
    CancelResult, DequeueResult, PeekedRequest, PriorityCount, QueueStateEntry, QueueStats,
    QueueTimeBucket, QueuedRequest, RequestHandle, RequestRecord,
};
use crate::config::{ConfigError, PriorityConfig};
use crate::state::{QUEUE_TIME_BUCKETS_NS, StatsCounters};
use crate::store::BucketedQueueStore;

/// Thread-safe priority bucket queue.
///
/// Every operation runs inside one critical section covering the entries and
/// both trackers, because computing any entry's priority reads the whole
/// queue. Nothing blocks beyond that lock and nothing is ever rejected.
pub struct PriorityBucketQueue<T> {
    store: Mutex<BucketedQueueStore<T>>,
    stats: StatsCounters,
}

impl<T> PriorityBucketQueue<T> {
    /// Builds a queue without rejecting the configuration. An invalid one is
    /// logged and used as given; see [`PriorityBucketQueue::try_new`].
    pub fn new(config: PriorityConfig) -> Self {
        if let Err(err) = config.validate() {
            warn!(error = %err, "priority bucket queue built with an invalid config");
        }
        Self {
            store: Mutex::new(BucketedQueueStore::new(config)),
            stats: StatsCounters::new(),
        }
    }

    pub fn try_new(config: PriorityConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(config))
    }

    pub fn with_defaults() -> Self {
        Self::new(PriorityConfig::default())
    }

    pub fn config(&self) -> PriorityConfig {
        self.store.lock().config().clone()
    }

    pub fn enqueue(&self, record: RequestRecord, payload: T) -> RequestHandle {
        let mut store = self.store.lock();
        let handle = store.enqueue(record, payload);
        let queue_len = store.size();
        drop(store);

        StatsCounters::saturating_add(&self.stats.enqueued, 1);
        debug!(sequence = handle.sequence(), queue_len, "request enqueued");
        handle
    }

    /// The request `dequeue` would return right now, without removing it.
    pub fn peek(&self) -> Option<PeekedRequest> {
        let store = self.store.lock();
        store.peek().map(|(entry, priority)| PeekedRequest {
            record: entry.record.clone(),
            handle: entry.handle(),
            pre_op_priority: priority,
        })
    }

    pub fn dequeue(&self) -> DequeueResult<T> {
        let mut store = self.store.lock();
        let result = store.dequeue();
        let queue_len = store.size();
        drop(store);

        if let DequeueResult::Request {
            request,
            pre_op_priority,
        } = &result
        {
            let queue_time_ns = Instant::now()
                .saturating_duration_since(request.enqueue_ts)
                .as_nanos()
                .min(u128::from(u64::MAX)) as u64;
            StatsCounters::saturating_add(&self.stats.dequeued, 1);
            self.stats.record_queue_time(queue_time_ns);
            self.stats.record_served_priority(*pre_op_priority);
            debug!(
                sequence = request.sequence,
                ip = %request.record.ip,
                priority = *pre_op_priority,
                queue_len,
                "request dequeued"
            );
        }
        result
    }

    /// Removes a still-queued request, e.g. when its client went away.
    pub fn cancel(&self, handle: RequestHandle) -> CancelResult {
        let removed = self.store.lock().remove(handle);
        match removed {
            Some(_) => {
                StatsCounters::saturating_add(&self.stats.cancelled, 1);
                debug!(sequence = handle.sequence(), "request cancelled");
                CancelResult::Cancelled
            }
            None => CancelResult::NotFound,
        }
    }

    /// Empties the queue, e.g. on shutdown. Drained requests count as
    /// cancelled.
    pub fn drain(&self) -> Vec<QueuedRequest<T>> {
        let drained = self.store.lock().drain();
        if !drained.is_empty() {
            StatsCounters::saturating_add(&self.stats.cancelled, drained.len() as u64);
            debug!(count = drained.len(), "queue drained");
        }
        drained
    }

    pub fn size(&self) -> usize {
        self.store.lock().size()
    }

    pub fn is_empty(&self) -> bool {
        self.store.lock().is_empty()
    }

    /// Every queued request with its current priority, oldest first.
    pub fn snapshot(&self) -> Vec<QueueStateEntry> {
        self.store.lock().snapshot(Instant::now())
    }

    /// Accounts for requests the drainage side discarded after dequeue
    /// because they waited too long.
    pub fn record_expired(&self, count: u64) {
        StatsCounters::saturating_add(&self.stats.expired, count);
    }

    pub fn stats(&self) -> QueueStats {
        let queue_time_histogram = QUEUE_TIME_BUCKETS_NS
            .iter()
            .enumerate()
            .map(|(idx, bound)| QueueTimeBucket {
                le_ns: *bound,
                count: StatsCounters::load(&self.stats.queue_time_buckets[idx]),
            })
            .collect::<Vec<_>>();

        let total_samples: u64 = queue_time_histogram.iter().map(|b| b.count).sum();
        let percentile = |pct: f64| -> u64 {
            if total_samples == 0 {
                return 0;
            }
            let target = (total_samples as f64 * pct).ceil() as u64;
            let mut cumulative = 0u64;
            for bucket in &queue_time_histogram {
                cumulative = cumulative.saturating_add(bucket.count);
                if cumulative >= target {
                    return bucket.le_ns;
                }
            }
            queue_time_histogram
                .last()
                .map(|bucket| bucket.le_ns)
                .unwrap_or(0)
        };

        let served_by_priority = self
            .stats
            .served_by_priority
            .iter()
            .enumerate()
            .map(|(idx, counter)| PriorityCount {
                priority: idx as u32 + 1,
                count: StatsCounters::load(counter),
            })
            .filter(|entry| entry.count > 0)
            .collect();

        QueueStats {
            enqueued: StatsCounters::load(&self.stats.enqueued),
            dequeued: StatsCounters::load(&self.stats.dequeued),
            cancelled: StatsCounters::load(&self.stats.cancelled),
            expired: StatsCounters::load(&self.stats.expired),
            queue_len: self.size() as u64,
            queue_time_sum_ns: StatsCounters::load(&self.stats.queue_time_sum_ns),
            queue_time_samples: StatsCounters::load(&self.stats.queue_time_samples),
            queue_time_p95_ns: percentile(0.95),
            queue_time_p99_ns: percentile(0.99),
            queue_time_histogram,
            served_by_priority,
        }
    }
}

impl<T> Default for PriorityBucketQueue<T> {
    fn default() -> Self {
        Self::with_defaults()
    }
}
