use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::thread;
use std::time::{Duration, Instant};

use bucketq_core::{DequeueResult, PriorityBucketQueue, PriorityConfig, RequestRecord};
use tracing_subscriber::EnvFilter;

const HOT_IP: &str = "198.51.100.1";

#[derive(Default)]
struct ClassStats {
    served: AtomicU64,
    queue_time_ns: AtomicU64,
}

impl ClassStats {
    fn record(&self, waited: Duration) {
        self.served.fetch_add(1, Ordering::Relaxed);
        self.queue_time_ns
            .fetch_add(waited.as_nanos() as u64, Ordering::Relaxed);
    }

    fn avg_ms(&self) -> f64 {
        let served = self.served.load(Ordering::Relaxed);
        if served == 0 {
            return 0.0;
        }
        self.queue_time_ns.load(Ordering::Relaxed) as f64 / served as f64 / 1_000_000.0
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let run_seconds = 5u64;
    let worker_count = 4usize;
    let work_time = Duration::from_millis(2);
    let cold_clients = 40u64;

    let queue = Arc::new(PriorityBucketQueue::new(PriorityConfig::default()));
    let running = Arc::new(AtomicBool::new(true));
    let hot = Arc::new(ClassStats::default());
    let cold = Arc::new(ClassStats::default());

    let mut handles = Vec::new();

    // One IP rotating user agents, as a scraper dodging signature checks would.
    handles.push(spawn_producer(
        Arc::clone(&queue),
        Arc::clone(&running),
        |seq| RequestRecord::anonymous(HOT_IP, format!("scraper-{}", seq % 16)),
        1,
    ));

    for client in 0..cold_clients {
        handles.push(spawn_producer(
            Arc::clone(&queue),
            Arc::clone(&running),
            move |_| {
                RequestRecord::anonymous(
                    format!("203.0.113.{}", client + 2),
                    "Mozilla/5.0 (X11; Linux x86_64)",
                )
            },
            40,
        ));
    }

    for _ in 0..worker_count {
        handles.push(spawn_worker(
            Arc::clone(&queue),
            Arc::clone(&running),
            Arc::clone(&hot),
            Arc::clone(&cold),
            work_time,
        ));
    }

    println!(
        "bench: hot ip vs {} clients ({} workers, {:?} per request, {}s)",
        cold_clients, worker_count, work_time, run_seconds
    );
    let start = Instant::now();
    thread::sleep(Duration::from_secs(run_seconds));
    let elapsed = start.elapsed().as_secs_f64();

    running.store(false, Ordering::Relaxed);
    for handle in handles {
        let _ = handle.join();
    }

    let stats = queue.stats();
    let throughput = if elapsed > 0.0 {
        stats.dequeued as f64 / elapsed
    } else {
        0.0
    };

    println!(
        "stats: enq={} deq={} qlen={} p95_ms={:.3} p99_ms={:.3}",
        stats.enqueued,
        stats.dequeued,
        stats.queue_len,
        stats.queue_time_p95_ns as f64 / 1_000_000.0,
        stats.queue_time_p99_ns as f64 / 1_000_000.0
    );
    println!(
        "hot: served={} avg_queue_time_ms={:.3}",
        hot.served.load(Ordering::Relaxed),
        hot.avg_ms()
    );
    println!(
        "cold: served={} avg_queue_time_ms={:.3}",
        cold.served.load(Ordering::Relaxed),
        cold.avg_ms()
    );
    for entry in &stats.served_by_priority {
        println!("priority {}: {}", entry.priority, entry.count);
    }
    println!("derived: throughput={:.1} req/s", throughput);
}

fn spawn_producer<F>(
    queue: Arc<PriorityBucketQueue<u64>>,
    running: Arc<AtomicBool>,
    make_record: F,
    interval_ms: u64,
) -> thread::JoinHandle<()>
where
    F: Fn(u64) -> RequestRecord + Send + 'static,
{
    thread::spawn(move || {
        let mut seq = 0u64;
        while running.load(Ordering::Relaxed) {
            seq += 1;
            queue.enqueue(make_record(seq), seq);
            if interval_ms > 0 {
                thread::sleep(Duration::from_millis(interval_ms));
            }
        }
    })
}

fn spawn_worker(
    queue: Arc<PriorityBucketQueue<u64>>,
    running: Arc<AtomicBool>,
    hot: Arc<ClassStats>,
    cold: Arc<ClassStats>,
    work_time: Duration,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while running.load(Ordering::Relaxed) {
            match queue.dequeue() {
                DequeueResult::Request { request, .. } => {
                    let waited = request.enqueue_ts.elapsed();
                    if request.record.ip == HOT_IP {
                        hot.record(waited);
                    } else {
                        cold.record(waited);
                    }
                    thread::sleep(work_time);
                }
                DequeueResult::Empty => thread::sleep(Duration::from_micros(200)),
            }
        }
    })
}
