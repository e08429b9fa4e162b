use crate::api::QueueStats;

/// Renders a stats snapshot in the Prometheus text exposition format.
pub fn render_stats(stats: &QueueStats, namespace: &str) -> String {
    let ns = if namespace.is_empty() {
        "bucketq"
    } else {
        namespace
    };

    let mut out = String::new();
    out.push_str(&format!(
        "# HELP {ns}_enqueued_total Total requests enqueued\n# TYPE {ns}_enqueued_total counter\n{ns}_enqueued_total {}\n",
        stats.enqueued
    ));
    out.push_str(&format!(
        "# HELP {ns}_dequeued_total Total requests dequeued\n# TYPE {ns}_dequeued_total counter\n{ns}_dequeued_total {}\n",
        stats.dequeued
    ));
    out.push_str(&format!(
        "# HELP {ns}_cancelled_total Total requests cancelled while queued\n# TYPE {ns}_cancelled_total counter\n{ns}_cancelled_total {}\n",
        stats.cancelled
    ));
    out.push_str(&format!(
        "# HELP {ns}_expired_total Total requests discarded as stale after dequeue\n# TYPE {ns}_expired_total counter\n{ns}_expired_total {}\n",
        stats.expired
    ));
    out.push_str(&format!(
        "# HELP {ns}_queue_len Requests currently queued\n# TYPE {ns}_queue_len gauge\n{ns}_queue_len {}\n",
        stats.queue_len
    ));
    out.push_str(&format!(
        "# HELP {ns}_queue_time_sum_ns Sum of queue time in ns\n# TYPE {ns}_queue_time_sum_ns counter\n{ns}_queue_time_sum_ns {}\n",
        stats.queue_time_sum_ns
    ));
    out.push_str(&format!(
        "# HELP {ns}_queue_time_samples Total queue time samples\n# TYPE {ns}_queue_time_samples counter\n{ns}_queue_time_samples {}\n",
        stats.queue_time_samples
    ));
    out.push_str(&format!(
        "# HELP {ns}_queue_time_p95_ns Approx p95 queue time in ns\n# TYPE {ns}_queue_time_p95_ns gauge\n{ns}_queue_time_p95_ns {}\n",
        stats.queue_time_p95_ns
    ));
    out.push_str(&format!(
        "# HELP {ns}_queue_time_p99_ns Approx p99 queue time in ns\n# TYPE {ns}_queue_time_p99_ns gauge\n{ns}_queue_time_p99_ns {}\n",
        stats.queue_time_p99_ns
    ));

    if !stats.queue_time_histogram.is_empty() {
        out.push_str(&format!(
            "# HELP {ns}_queue_time_ns Queue time histogram\n# TYPE {ns}_queue_time_ns histogram\n"
        ));
        let mut cumulative = 0u64;
        for bucket in &stats.queue_time_histogram {
            cumulative = cumulative.saturating_add(bucket.count);
            let le = if bucket.le_ns == u64::MAX {
                "+Inf".to_string()
            } else {
                bucket.le_ns.to_string()
            };
            out.push_str(&format!(
                "{ns}_queue_time_ns_bucket{{le=\"{le}\"}} {cumulative}\n"
            ));
        }
        out.push_str(&format!(
            "{ns}_queue_time_ns_count {}\n{ns}_queue_time_ns_sum {}\n",
            stats.queue_time_samples, stats.queue_time_sum_ns
        ));
    }

    if !stats.served_by_priority.is_empty() {
        out.push_str(&format!(
            "# HELP {ns}_served_total Requests served, by priority at selection time\n# TYPE {ns}_served_total counter\n"
        ));
        for entry in &stats.served_by_priority {
            out.push_str(&format!(
                "{ns}_served_total{{priority=\"{}\"}} {}\n",
                entry.priority, entry.count
            ));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PriorityBucketQueue, RequestRecord};

    #[test]
    fn renders_counters_and_priority_breakdown() {
        let queue = PriorityBucketQueue::with_defaults();
        queue.enqueue(RequestRecord::anonymous("1.1.1.1", "a"), ());
        queue.enqueue(RequestRecord::anonymous("2.2.2.2", "b"), ());
        let _ = queue.dequeue();

        let text = render_stats(&queue.stats(), "");
        assert!(text.contains("bucketq_enqueued_total 2\n"));
        assert!(text.contains("bucketq_dequeued_total 1\n"));
        assert!(text.contains("bucketq_queue_len 1\n"));
        assert!(text.contains("bucketq_served_total{priority=\"1\"} 1\n"));
        assert!(text.contains("bucketq_queue_time_ns_bucket{le=\"+Inf\"} 1\n"));
    }

    #[test]
    fn exposes_queue_time_sum_and_samples() {
        let stats = QueueStats {
            queue_time_sum_ns: 3_000,
            queue_time_samples: 2,
            ..QueueStats::default()
        };
        let text = render_stats(&stats, "bucketq");
        assert!(text.contains("# TYPE bucketq_queue_time_sum_ns counter\n"));
        assert!(text.contains("bucketq_queue_time_sum_ns 3000\n"));
        assert!(text.contains("bucketq_queue_time_samples 2\n"));
    }

    #[test]
    fn honours_namespace() {
        let queue = PriorityBucketQueue::<()>::with_defaults();
        let text = render_stats(&queue.stats(), "ssr_queue");
        assert!(text.contains("ssr_queue_enqueued_total 0\n"));
        assert!(!text.contains("ssr_queue_served_total"));
    }
}
