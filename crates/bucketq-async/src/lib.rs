//! Tokio adapter for `bucketq-core`.
//!
//! This crate provides:
//! - `AsyncBucketQueue`, a shareable queue handle that can wait for work
//! - `AsyncReceiver` and `AsyncStream` helpers
//! - `Dispatcher`, a drainage loop with bounded in-flight execution and
//!   optional expiry of requests that waited too long

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

pub use bucketq_core::{
    self, BASE_PRIORITY, CancelResult, ConfigError, DequeueResult, MISSING_USER_AGENT,
    PeekedRequest, PriorityBucketQueue, PriorityConfig, PriorityCount, QueueStateEntry,
    QueueStats, QueueTimeBucket, QueuedRequest, RequestHandle, RequestRecord, UNKNOWN_IP,
};
use futures_core::Stream;
use tokio::sync::{Notify, Semaphore};
use tracing::{info, warn};

#[derive(Debug)]
struct WorkSignal {
    notify: Notify,
    closed: AtomicBool,
}

/// Async wrapper around [`PriorityBucketQueue`].
///
/// Enqueueing wakes one waiting consumer. Closing wakes all of them; after
/// that, waiting dequeues return `None` while non-waiting operations keep
/// working on whatever is left.
pub struct AsyncBucketQueue<T> {
    inner: Arc<PriorityBucketQueue<T>>,
    signal: Arc<WorkSignal>,
}

impl<T> Clone for AsyncBucketQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            signal: Arc::clone(&self.signal),
        }
    }
}

impl<T> AsyncBucketQueue<T> {
    /// Creates a new async wrapper over a shared core queue.
    pub fn new(inner: Arc<PriorityBucketQueue<T>>) -> Self {
        Self {
            inner,
            signal: Arc::new(WorkSignal {
                notify: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn with_config(config: PriorityConfig) -> Self {
        Self::new(Arc::new(PriorityBucketQueue::new(config)))
    }

    /// Returns the shared core queue.
    pub fn inner(&self) -> &Arc<PriorityBucketQueue<T>> {
        &self.inner
    }

    /// Enqueues a request and wakes a waiting consumer.
    pub fn enqueue(&self, record: RequestRecord, payload: T) -> RequestHandle {
        let handle = self.inner.enqueue(record, payload);
        self.signal.notify.notify_one();
        handle
    }

    /// Non-waiting dequeue attempt.
    pub fn try_dequeue(&self) -> DequeueResult<T> {
        self.inner.dequeue()
    }

    pub fn peek(&self) -> Option<PeekedRequest> {
        self.inner.peek()
    }

    /// Removes a request that is still waiting for its turn.
    pub fn cancel(&self, handle: RequestHandle) -> CancelResult {
        self.inner.cancel(handle)
    }

    pub fn size(&self) -> usize {
        self.inner.size()
    }

    pub fn snapshot(&self) -> Vec<QueueStateEntry> {
        self.inner.snapshot()
    }

    /// Returns queue metric snapshot.
    pub fn stats(&self) -> QueueStats {
        self.inner.stats()
    }

    /// Stops waiting consumers. Idempotent.
    pub fn close(&self) {
        if !self.signal.closed.swap(true, Ordering::AcqRel) {
            info!(queued = self.inner.size(), "bucket queue closed");
            self.signal.notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.signal.closed.load(Ordering::Acquire)
    }

    /// Waits until a request can be dequeued, returning `None` once the
    /// queue is closed.
    pub async fn dequeue_async(&self) -> Option<DequeueItem<T>> {
        loop {
            let notified = self.signal.notify.notified();
            if self.is_closed() {
                return None;
            }
            if let DequeueResult::Request {
                request,
                pre_op_priority,
            } = self.inner.dequeue()
            {
                return Some(DequeueItem {
                    request,
                    pre_op_priority,
                });
            }
            notified.await;
        }
    }

    /// Returns a receiver-style async dequeue helper.
    pub fn receiver(&self) -> AsyncReceiver<T> {
        AsyncReceiver::new(self.clone())
    }
}

impl<T: Send + 'static> AsyncBucketQueue<T> {
    /// Returns a `Stream` wrapper for dequeue operations.
    pub fn stream(&self) -> AsyncStream<T> {
        AsyncStream::new(self.clone())
    }
}

impl<T> Default for AsyncBucketQueue<T> {
    fn default() -> Self {
        Self::new(Arc::new(PriorityBucketQueue::with_defaults()))
    }
}

/// A dequeued request and the priority it was selected at.
#[derive(Debug)]
pub struct DequeueItem<T> {
    pub request: QueuedRequest<T>,
    pub pre_op_priority: u32,
}

impl<T> DequeueItem<T> {
    /// How long the request waited in the queue.
    pub fn waited(&self) -> Duration {
        self.request.enqueue_ts.elapsed()
    }
}

/// Receiver-style async facade over queue dequeue.
#[derive(Clone)]
pub struct AsyncReceiver<T> {
    queue: AsyncBucketQueue<T>,
}

impl<T> AsyncReceiver<T> {
    /// Creates a new receiver facade.
    pub fn new(queue: AsyncBucketQueue<T>) -> Self {
        Self { queue }
    }

    /// Waits for the next request, returning `None` once the queue closes.
    pub async fn recv(&self) -> Option<DequeueItem<T>> {
        self.queue.dequeue_async().await
    }
}

type PendingDequeue<T> = Pin<Box<dyn Future<Output = Option<DequeueItem<T>>> + Send>>;

/// `Stream` adapter for dequeue operations.
pub struct AsyncStream<T> {
    queue: AsyncBucketQueue<T>,
    pending: Option<PendingDequeue<T>>,
}

impl<T> AsyncStream<T> {
    /// Creates a new stream adapter.
    pub fn new(queue: AsyncBucketQueue<T>) -> Self {
        Self {
            queue,
            pending: None,
        }
    }
}

impl<T: Send + 'static> Stream for AsyncStream<T> {
    type Item = DequeueItem<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let pending = this.pending.get_or_insert_with(|| {
            let queue = this.queue.clone();
            Box::pin(async move { queue.dequeue_async().await })
        });

        match pending.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(item) => {
                this.pending = None;
                Poll::Ready(item)
            }
        }
    }
}

/// Drainage settings.
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Requests processed concurrently.
    pub max_in_flight: usize,
    /// Requests that waited longer than this are not processed.
    pub queue_timeout: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 3,
            queue_timeout: None,
        }
    }
}

/// Drains a queue into an async handler.
///
/// A request is dequeued only once an in-flight slot is free, so it is
/// selected against the queue as it stands at that moment.
pub struct Dispatcher<T> {
    queue: AsyncBucketQueue<T>,
    semaphore: Arc<Semaphore>,
    config: DispatcherConfig,
}

impl<T> Dispatcher<T> {
    /// Creates a dispatcher with bounded in-flight handler executions.
    pub fn new(queue: AsyncBucketQueue<T>, mut config: DispatcherConfig) -> Self {
        config.max_in_flight = config.max_in_flight.max(1);
        Self {
            queue,
            semaphore: Arc::new(Semaphore::new(config.max_in_flight)),
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Handler executions currently running.
    pub fn in_flight(&self) -> usize {
        self.config
            .max_in_flight
            .saturating_sub(self.semaphore.available_permits())
    }

    fn is_stale(&self, item: &DequeueItem<T>) -> bool {
        match self.config.queue_timeout {
            Some(timeout) => item.waited() > timeout,
            None => false,
        }
    }
}

impl<T: Send + 'static> Dispatcher<T> {
    /// Runs the drainage loop until the queue closes. Stale requests are
    /// dropped.
    pub async fn run<F, Fut>(&self, handler: F)
    where
        F: Fn(DequeueItem<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.run_with_expiry(handler, |_item| {}).await;
    }

    /// Runs the drainage loop until the queue closes, passing stale requests
    /// to `on_expired` instead of `handler`.
    pub async fn run_with_expiry<F, Fut, E>(&self, handler: F, on_expired: E)
    where
        F: Fn(DequeueItem<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        E: Fn(DequeueItem<T>),
    {
        let handler = Arc::new(handler);
        loop {
            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let Some(item) = self.queue.dequeue_async().await else {
                break;
            };

            if self.is_stale(&item) {
                warn!(
                    sequence = item.request.sequence,
                    ip = %item.request.record.ip,
                    waited_ms = item.waited().as_millis() as u64,
                    "queued request expired before its turn"
                );
                self.queue.inner().record_expired(1);
                on_expired(item);
                continue;
            }

            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                handler(item).await;
                drop(permit);
            });
        }

        let _ = self
            .semaphore
            .acquire_many(self.config.max_in_flight as u32)
            .await;
    }
}
