//! Tower integration for bucketq admission ordering.
//!
//! `bucketq-tower` exposes a configurable layer that:
//! - extracts a [`RequestRecord`] (IP, user agent, user id) from requests
//! - queues every request through a priority bucket queue
//! - lets at most `max_in_flight` requests reach the inner service, picking
//!   the next one by crowding priority
//! - answers requests that waited longer than the queue timeout with a 429
//! - cancels queued requests whose caller gave up before their turn
//!
//! # Example
//!
//! ```rust,no_run
//! use bucketq_tower::{BucketQueueBuilder, RequestRecord};
//! use std::convert::Infallible;
//! use std::future::Ready;
//! use std::task::{Context, Poll};
//! use tower::{Service, ServiceBuilder};
//!
//! #[derive(Clone)]
//! struct Request {
//!     peer_ip: String,
//!     user_agent: Option<String>,
//!     body: String,
//! }
//!
//! #[derive(Clone)]
//! struct EchoService;
//!
//! impl Service<Request> for EchoService {
//!     type Response = String;
//!     type Error = Infallible;
//!     type Future = Ready<Result<Self::Response, Self::Error>>;
//!     fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
//!         Poll::Ready(Ok(()))
//!     }
//!     fn call(&mut self, req: Request) -> Self::Future {
//!         std::future::ready(Ok(req.body))
//!     }
//! }
//!
//! let layer = BucketQueueBuilder::new()
//!     .with_max_in_flight(4)
//!     .build(|req: &Request| {
//!         RequestRecord::from_parts(Some(&req.peer_ip), req.user_agent.as_deref(), None)
//!     });
//! let _svc = ServiceBuilder::new().layer(layer).service(EchoService);
//! ```

mod builder;
mod extract;

pub use builder::BucketQueueBuilder;
pub use bucketq_async::{
    self, AsyncBucketQueue, CancelResult, ConfigError, PriorityBucketQueue, PriorityConfig,
    QueueStateEntry, QueueStats, RequestHandle, RequestRecord,
};
pub use extract::HeaderRecordExtractor;

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tower_service::Service;
use tracing::{debug, warn};

/// Why a queued request was not let through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// The request waited longer than the configured queue timeout.
    QueueTimeout,
}

/// Function used to map queue rejections into HTTP-facing errors.
pub type RejectionMapper = Arc<dyn Fn(RejectReason) -> BucketHttpRejection + Send + Sync>;

/// Structured HTTP rejection payload produced by the layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BucketHttpRejection {
    /// HTTP status code.
    pub status: u16,
    /// Stable machine-readable error code.
    pub code: &'static str,
    /// Human-readable error message.
    pub message: &'static str,
    pub reason: RejectReason,
}

/// Default mapping from rejection reasons to HTTP responses.
pub fn default_rejection_mapper(reason: RejectReason) -> BucketHttpRejection {
    match reason {
        RejectReason::QueueTimeout => BucketHttpRejection {
            status: 429,
            code: "queue_timeout",
            message: "request waited too long for a free worker",
            reason,
        },
    }
}

type SlotResult = Result<OwnedSemaphorePermit, RejectReason>;

/// Queue payload for one pending request: the channel its permit (or
/// rejection) is delivered on.
pub struct BucketSlot {
    tx: oneshot::Sender<SlotResult>,
}

/// Layer/service error type.
#[derive(Debug, thiserror::Error)]
pub enum BucketError<E> {
    /// Error returned by the wrapped inner service.
    #[error("service error: {0}")]
    Service(#[source] E),
    /// Request rejected while queued.
    #[error("request rejected: status={} code={}", .0.status, .0.code)]
    Rejected(BucketHttpRejection),
    /// The queue has been shut down.
    #[error("admission queue closed")]
    Closed,
    /// The drainage worker went away before granting a permit.
    #[error("permit dropped before the request's turn")]
    PermitDropped,
}

pub trait RecordExtractor<Request>: Clone {
    /// Extracts the queue attributes from an incoming request.
    fn extract(&self, req: &Request) -> RequestRecord;
}

impl<F, Request> RecordExtractor<Request> for F
where
    F: Fn(&Request) -> RequestRecord + Clone,
{
    fn extract(&self, req: &Request) -> RequestRecord {
        (self)(req)
    }
}

/// Tower `Layer` ordering requests through a priority bucket queue.
pub struct BucketLayer<Request, K> {
    queue: AsyncBucketQueue<BucketSlot>,
    extractor: K,
    in_flight: Arc<Semaphore>,
    max_in_flight: usize,
    worker: Arc<BackgroundWorker>,
    rejection_mapper: RejectionMapper,
    _marker: PhantomData<fn(Request)>,
}

impl<Request, K: Clone> Clone for BucketLayer<Request, K> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            extractor: self.extractor.clone(),
            in_flight: Arc::clone(&self.in_flight),
            max_in_flight: self.max_in_flight,
            worker: Arc::clone(&self.worker),
            rejection_mapper: Arc::clone(&self.rejection_mapper),
            _marker: PhantomData,
        }
    }
}

impl<Request, K> BucketLayer<Request, K> {
    /// Creates a layer and starts its drainage worker thread.
    pub fn new(
        queue: AsyncBucketQueue<BucketSlot>,
        extractor: K,
        max_in_flight: usize,
        queue_timeout: Option<Duration>,
        rejection_mapper: RejectionMapper,
    ) -> Self {
        let max_in_flight = max_in_flight.max(1);
        let in_flight = Arc::new(Semaphore::new(max_in_flight));
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = spawn_drain_worker(
            queue.clone(),
            Arc::clone(&in_flight),
            Arc::clone(&shutdown),
            queue_timeout,
        );

        let worker = Arc::new(BackgroundWorker::new(
            queue.clone(),
            Arc::clone(&in_flight),
            shutdown,
            handle,
        ));

        Self {
            queue,
            extractor,
            in_flight,
            max_in_flight,
            worker,
            rejection_mapper,
            _marker: PhantomData,
        }
    }

    pub fn queue(&self) -> &AsyncBucketQueue<BucketSlot> {
        &self.queue
    }

    /// Returns configured in-flight execution limit.
    pub fn in_flight_limit(&self) -> usize {
        self.max_in_flight
    }

    /// Returns currently active in-flight executions.
    pub fn in_flight_active(&self) -> usize {
        self.max_in_flight
            .saturating_sub(self.in_flight.available_permits())
    }
}

impl<Request> BucketLayer<Request, ()> {
    /// Returns the layer builder.
    pub fn builder() -> BucketQueueBuilder {
        BucketQueueBuilder::new()
    }
}

/// Hands out in-flight permits in queue order. Runs on its own thread with a
/// current-thread runtime so the layer can be built outside of tokio.
fn spawn_drain_worker(
    queue: AsyncBucketQueue<BucketSlot>,
    in_flight: Arc<Semaphore>,
    shutdown: Arc<AtomicBool>,
    queue_timeout: Option<Duration>,
) -> Option<std::thread::JoinHandle<()>> {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            warn!(error = %err, "failed to build drain worker runtime");
            queue.close();
            return None;
        }
    };

    let worker_queue = queue.clone();
    let spawned = std::thread::Builder::new()
        .name("bucketq-drain".to_string())
        .spawn(move || {
            let queue = worker_queue;
            runtime.block_on(async move {
                while !shutdown.load(Ordering::Acquire) {
                    let permit = match Arc::clone(&in_flight).acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let Some(item) = queue.dequeue_async().await else {
                        break;
                    };

                    let waited = item.waited();
                    if queue_timeout.is_some_and(|timeout| waited > timeout) {
                        warn!(
                            sequence = item.request.sequence,
                            ip = %item.request.record.ip,
                            waited_ms = waited.as_millis() as u64,
                            "queued request expired before its turn"
                        );
                        queue.inner().record_expired(1);
                        let _ = item.request.payload.tx.send(Err(RejectReason::QueueTimeout));
                        continue;
                    }

                    debug!(
                        sequence = item.request.sequence,
                        priority = item.pre_op_priority,
                        "granting in-flight permit"
                    );
                    // A closed receiver hands the permit straight back.
                    let _ = item.request.payload.tx.send(Ok(permit));
                }

                // Dropping the leftover slots wakes their callers with `Closed`.
                queue.close();
                let abandoned = queue.inner().drain();
                if !abandoned.is_empty() {
                    debug!(count = abandoned.len(), "released requests queued at shutdown");
                }
            });
        });

    match spawned {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!(error = %err, "failed to spawn drain worker");
            queue.close();
            None
        }
    }
}

impl<S, Request, K> tower::Layer<S> for BucketLayer<Request, K>
where
    K: RecordExtractor<Request> + Clone,
{
    type Service = BucketService<S, K, Request>;

    fn layer(&self, inner: S) -> Self::Service {
        BucketService {
            inner,
            queue: self.queue.clone(),
            extractor: self.extractor.clone(),
            worker: Arc::clone(&self.worker),
            rejection_mapper: Arc::clone(&self.rejection_mapper),
            _marker: PhantomData,
        }
    }
}

/// Tower `Service` produced by [`BucketLayer`].
pub struct BucketService<S, K, Request> {
    inner: S,
    queue: AsyncBucketQueue<BucketSlot>,
    extractor: K,
    worker: Arc<BackgroundWorker>,
    rejection_mapper: RejectionMapper,
    _marker: PhantomData<fn(Request)>,
}

impl<S, K, Request> Clone for BucketService<S, K, Request>
where
    S: Clone,
    K: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            queue: self.queue.clone(),
            extractor: self.extractor.clone(),
            worker: Arc::clone(&self.worker),
            rejection_mapper: Arc::clone(&self.rejection_mapper),
            _marker: PhantomData,
        }
    }
}

impl<S, K, Request> Service<Request> for BucketService<S, K, Request>
where
    S: Service<Request> + Clone + Send + 'static,
    S::Future: Send + 'static,
    K: RecordExtractor<Request> + Send + 'static,
    Request: Send + 'static,
{
    type Response = S::Response;
    type Error = BucketError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(BucketError::Service)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        if self.queue.is_closed() {
            return Box::pin(async { Err(BucketError::Closed) });
        }

        let record = self.extractor.extract(&req);
        let (tx, rx) = oneshot::channel();
        let handle = self.queue.enqueue(record, BucketSlot { tx });

        // The worker was closed between the check above and the enqueue.
        if self.queue.is_closed() {
            let _ = self.queue.cancel(handle);
            return Box::pin(async { Err(BucketError::Closed) });
        }

        // Owned by the future so dropping it unpolled still cancels.
        let mut guard = PendingCancelGuard::new(self.queue.clone(), handle);
        let queue = self.queue.clone();
        // Keeps the drain worker alive until this request has its answer.
        let worker = Arc::clone(&self.worker);
        let mapper = Arc::clone(&self.rejection_mapper);
        // Take the service that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let granted = rx.await.map_err(|_| {
                if queue.is_closed() {
                    BucketError::Closed
                } else {
                    BucketError::PermitDropped
                }
            })?;
            guard.disarm();
            drop(worker);

            let permit = granted.map_err(|reason| BucketError::Rejected(mapper(reason)))?;
            let response = inner.call(req).await.map_err(BucketError::Service)?;
            drop(permit);
            Ok(response)
        })
    }
}

/// Removes the queued entry if the caller drops the future before its turn.
struct PendingCancelGuard {
    queue: AsyncBucketQueue<BucketSlot>,
    handle: Option<RequestHandle>,
}

impl PendingCancelGuard {
    fn new(queue: AsyncBucketQueue<BucketSlot>, handle: RequestHandle) -> Self {
        Self {
            queue,
            handle: Some(handle),
        }
    }

    fn disarm(&mut self) {
        self.handle = None;
    }
}

impl Drop for PendingCancelGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.queue.cancel(handle);
        }
    }
}

struct BackgroundWorker {
    queue: AsyncBucketQueue<BucketSlot>,
    in_flight: Arc<Semaphore>,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl BackgroundWorker {
    fn new(
        queue: AsyncBucketQueue<BucketSlot>,
        in_flight: Arc<Semaphore>,
        shutdown: Arc<AtomicBool>,
        handle: Option<std::thread::JoinHandle<()>>,
    ) -> Self {
        Self {
            queue,
            in_flight,
            shutdown,
            handle: Mutex::new(handle),
        }
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.in_flight.close();
        self.queue.close();
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        // Joining would block a runtime worker thread; the drain thread
        // exits on its own once it sees the closed queue.
        if tokio::runtime::Handle::try_current().is_ok() {
            return;
        }
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}
