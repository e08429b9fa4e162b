//! In-process admission queue that decides which pending request is served
//! next when a shared resource (a pool of render workers, say) is saturated.
//!
//! Requests are never rejected. Instead each queued request gets a priority
//! recomputed from the whole queue on every read:
//! - below `size_threshold` queued requests, every priority is 1 (plain FIFO);
//! - an IP holding more than 60% / 90% of the queue adds +1 / +2;
//! - an anonymous client signature (user agent) crowding the anonymous
//!   requests adds a further penalty; authenticated requests are exempt.
//!
//! Lower priority is served first, ties by enqueue order.
//!
//! Async and tower adapters live in `bucketq-async` and `bucketq-tower`.

mod api;
mod config;
mod priority;
pub mod prometheus;
mod queue;
mod state;
mod store;
mod tracker;

pub use api::{
    BASE_PRIORITY, CancelResult, DequeueResult, MISSING_USER_AGENT, PeekedRequest, PriorityCount,
    QueueStateEntry, QueueStats, QueueTimeBucket, QueuedRequest, RequestHandle, RequestRecord,
    UNKNOWN_IP,
};
pub use config::{ConfigError, MAX_TIERS, PriorityConfig};
pub use priority::compute_priority;
pub use queue::PriorityBucketQueue;
pub use store::BucketedQueueStore;
pub use tracker::KeyFrequencyTracker;

#[cfg(test)]
mod tests;
