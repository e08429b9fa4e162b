use std::time::Instant;

use serde::{Deserialize, Serialize};

/// IP recorded when the host cannot determine the client address.
pub const UNKNOWN_IP: &str = "unknown";

/// User agent recorded when the request carries none.
pub const MISSING_USER_AGENT: &str = "missing-user-agent";

/// Priority every request starts from. Lower values are served first.
pub const BASE_PRIORITY: u32 = 1;

/// The three attributes the queue orders requests by.
///
/// Immutable once enqueued. `user_id == None` marks the request as anonymous.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestRecord {
    pub ip: String,
    pub user_agent: String,
    pub user_id: Option<String>,
}

impl RequestRecord {
    pub fn anonymous(ip: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            user_agent: user_agent.into(),
            user_id: None,
        }
    }

    pub fn authenticated(
        ip: impl Into<String>,
        user_agent: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            ip: ip.into(),
            user_agent: user_agent.into(),
            user_id: Some(user_id.into()),
        }
    }

    /// Builds a record from whatever the host could extract, substituting
    /// [`UNKNOWN_IP`] and [`MISSING_USER_AGENT`] for absent values.
    pub fn from_parts(ip: Option<&str>, user_agent: Option<&str>, user_id: Option<&str>) -> Self {
        Self {
            ip: ip.unwrap_or(UNKNOWN_IP).to_string(),
            user_agent: user_agent.unwrap_or(MISSING_USER_AGENT).to_string(),
            user_id: user_id.map(str::to_string),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_id.is_none()
    }
}

/// Identifies one enqueued request. Backed by its sequence number, so a
/// handle is never reused within a queue.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestHandle(u64);

impl RequestHandle {
    pub(crate) fn new(sequence: u64) -> Self {
        Self(sequence)
    }

    pub fn sequence(&self) -> u64 {
        self.0
    }
}

/// A request waiting in the queue.
///
/// - `payload` is opaque to the queue (a callback, a permit channel, ...).
/// - `enqueue_ts` feeds queue-time metrics and stale-request expiry; it never
///   affects priority.
/// - `sequence` is the FIFO tie-break.
#[derive(Clone, Debug)]
pub struct QueuedRequest<T> {
    pub record: RequestRecord,
    pub payload: T,
    pub enqueue_ts: Instant,
    pub sequence: u64,
}

impl<T> QueuedRequest<T> {
    pub fn handle(&self) -> RequestHandle {
        RequestHandle::new(self.sequence)
    }
}

#[derive(Clone, Debug)]
pub enum DequeueResult<T> {
    /// The selected request, with the priority it was chosen at (computed
    /// before it was removed).
    Request {
        request: QueuedRequest<T>,
        pre_op_priority: u32,
    },
    /// Nothing is queued.
    Empty,
}

impl<T> DequeueResult<T> {
    pub fn is_empty(&self) -> bool {
        matches!(self, DequeueResult::Empty)
    }

    pub fn into_request(self) -> Option<(QueuedRequest<T>, u32)> {
        match self {
            DequeueResult::Request {
                request,
                pre_op_priority,
            } => Some((request, pre_op_priority)),
            DequeueResult::Empty => None,
        }
    }
}

/// Result of [`crate::PriorityBucketQueue::peek`]: the request that would be
/// dequeued next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeekedRequest {
    pub record: RequestRecord,
    pub handle: RequestHandle,
    pub pre_op_priority: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancelResult {
    /// The request was still queued and has been removed.
    Cancelled,
    /// The request was already dequeued or cancelled.
    NotFound,
}

/// One row of [`crate::PriorityBucketQueue::snapshot`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueueStateEntry {
    pub record: RequestRecord,
    pub sequence: u64,
    pub priority: u32,
    pub waited_ns: u64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct QueueStats {
    /// Requests accepted into the queue.
    pub enqueued: u64,
    /// Requests handed to the drainage side.
    pub dequeued: u64,
    /// Requests removed through [`crate::PriorityBucketQueue::cancel`] or
    /// [`crate::PriorityBucketQueue::drain`].
    pub cancelled: u64,
    /// Requests the drainage side discarded as stale after dequeue.
    pub expired: u64,
    /// Requests currently queued.
    pub queue_len: u64,
    /// Sum of queue time (ns) of dequeued requests.
    pub queue_time_sum_ns: u64,
    pub queue_time_samples: u64,
    pub queue_time_p95_ns: u64,
    pub queue_time_p99_ns: u64,
    pub queue_time_histogram: Vec<QueueTimeBucket>,
    /// How many requests were served at each pre-op priority.
    pub served_by_priority: Vec<PriorityCount>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct QueueTimeBucket {
    pub le_ns: u64,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PriorityCount {
    pub priority: u32,
    pub count: u64,
}
