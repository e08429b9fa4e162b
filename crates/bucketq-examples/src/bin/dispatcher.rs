// Drains a bucketq queue with the tokio dispatcher while one IP floods it.
//
// Run: RUST_LOG=info cargo run --bin dispatcher

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bucketq_async::{AsyncBucketQueue, DequeueItem, Dispatcher, DispatcherConfig, RequestRecord};
use tracing::info;
use tracing_subscriber::EnvFilter;

const HOT_IP: &str = "198.51.100.1";

#[derive(Debug)]
struct Job {
    label: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let queue = AsyncBucketQueue::<Job>::default();
    let dispatcher = Dispatcher::new(
        queue.clone(),
        DispatcherConfig {
            max_in_flight: 3,
            queue_timeout: Some(Duration::from_millis(500)),
        },
    );

    let hot_served = Arc::new(AtomicU64::new(0));
    let cold_served = Arc::new(AtomicU64::new(0));
    let expired = Arc::new(AtomicU64::new(0));

    let hot_producer = {
        let queue = queue.clone();
        tokio::spawn(async move {
            for i in 0..120u32 {
                queue.enqueue(
                    RequestRecord::anonymous(HOT_IP, format!("crawler/{}", i % 8)),
                    Job {
                        label: format!("hot-{i}"),
                    },
                );
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    };

    let cold_producer = {
        let queue = queue.clone();
        tokio::spawn(async move {
            for i in 0..30u32 {
                let ip = format!("203.0.113.{}", i + 1);
                let record = if i % 3 == 0 {
                    RequestRecord::authenticated(ip, "Mozilla/5.0", format!("user-{i}"))
                } else {
                    RequestRecord::anonymous(ip, "Mozilla/5.0")
                };
                queue.enqueue(
                    record,
                    Job {
                        label: format!("cold-{i}"),
                    },
                );
                tokio::time::sleep(Duration::from_millis(8)).await;
            }
        })
    };

    let closer = {
        let queue = queue.clone();
        tokio::spawn(async move {
            let _ = hot_producer.await;
            let _ = cold_producer.await;
            while queue.size() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            queue.close();
        })
    };

    let handler = {
        let hot_served = Arc::clone(&hot_served);
        let cold_served = Arc::clone(&cold_served);
        move |item: DequeueItem<Job>| {
            let counter = if item.request.record.ip == HOT_IP {
                Arc::clone(&hot_served)
            } else {
                Arc::clone(&cold_served)
            };
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                counter.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    job = %item.request.payload.label,
                    priority = item.pre_op_priority,
                    "served"
                );
            }
        }
    };
    let on_expired = {
        let expired = Arc::clone(&expired);
        move |_item: DequeueItem<Job>| {
            expired.fetch_add(1, Ordering::Relaxed);
        }
    };

    dispatcher.run_with_expiry(handler, on_expired).await;
    let _ = closer.await;

    let stats = queue.stats();
    info!(
        hot_served = hot_served.load(Ordering::Relaxed),
        cold_served = cold_served.load(Ordering::Relaxed),
        expired = expired.load(Ordering::Relaxed),
        p95_ms = stats.queue_time_p95_ns / 1_000_000,
        "drained"
    );
    for entry in &stats.served_by_priority {
        info!(priority = entry.priority, count = entry.count, "served by priority");
    }
}
