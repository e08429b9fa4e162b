use proptest::prelude::*;

use crate::{
    CancelResult, DequeueResult, PriorityBucketQueue, PriorityConfig, RequestRecord,
};

fn anon(ip: &str, ua: &str) -> RequestRecord {
    RequestRecord::anonymous(ip, ua)
}

fn drain<T>(queue: &PriorityBucketQueue<T>) -> Vec<(T, u32)> {
    let mut served = Vec::new();
    while let DequeueResult::Request {
        request,
        pre_op_priority,
    } = queue.dequeue()
    {
        served.push((request.payload, pre_op_priority));
    }
    served
}

fn priorities<T>(queue: &PriorityBucketQueue<T>) -> Vec<u32> {
    queue.snapshot().iter().map(|entry| entry.priority).collect()
}

#[test]
fn fresh_queue_dequeues_nothing() {
    let queue = PriorityBucketQueue::<()>::with_defaults();
    assert!(matches!(queue.dequeue(), DequeueResult::Empty));
    assert!(queue.peek().is_none());
    assert_eq!(queue.size(), 0);
}

#[test]
fn small_queue_is_fifo() {
    let queue = PriorityBucketQueue::with_defaults();
    for i in 0..3 {
        queue.enqueue(anon("10.0.0.1", "same-agent"), i);
    }
    assert_eq!(drain(&queue), vec![(0, 1), (1, 1), (2, 1)]);
}

#[test]
fn dominant_ip_yields_to_other_ip() {
    let queue = PriorityBucketQueue::with_defaults();
    for i in 0..4 {
        queue.enqueue(anon("10.0.0.1", &format!("agent-{i}")), i);
    }
    let peeked = queue.peek().expect("queued");
    assert_eq!(peeked.handle.sequence(), 0);
    assert_eq!(peeked.pre_op_priority, 3);

    queue.enqueue(anon("10.0.0.2", "agent-x"), 4);
    assert_eq!(
        drain(&queue),
        vec![(4, 1), (0, 3), (1, 1), (2, 1), (3, 1)]
    );
}

#[test]
fn crowded_user_agent_waits_once_over_first_tier() {
    let queue = PriorityBucketQueue::with_defaults();
    queue.enqueue(anon("10.0.0.1", "agent-1"), 0);
    queue.enqueue(anon("10.0.0.2", "agent-2"), 1);
    queue.enqueue(anon("10.0.0.3", "agent-1"), 2);
    queue.enqueue(anon("10.0.0.4", "agent-2"), 3);
    assert_eq!(priorities(&queue), vec![1, 1, 1, 1]);

    // 3 of 5 is exactly the first tier, not over it.
    queue.enqueue(anon("10.0.0.5", "agent-1"), 4);
    assert_eq!(priorities(&queue), vec![1; 5]);

    queue.enqueue(anon("10.0.0.6", "agent-1"), 5);
    assert_eq!(priorities(&queue), vec![2, 1, 2, 1, 2, 2]);
    assert_eq!(
        drain(&queue),
        vec![(1, 1), (3, 1), (0, 2), (2, 1), (4, 1), (5, 1)]
    );
}

#[test]
fn logged_in_user_skips_signature_penalty() {
    let queue = PriorityBucketQueue::with_defaults();
    for i in 0..3 {
        queue.enqueue(anon("10.0.0.1", "agent-x"), i);
    }
    queue.enqueue(
        RequestRecord::authenticated("10.0.0.1", "agent-y", "user-1"),
        3,
    );
    queue.enqueue(anon("10.0.0.2", "agent-x"), 4);

    assert_eq!(
        drain(&queue),
        vec![(3, 2), (4, 2), (0, 1), (1, 1), (2, 1)]
    );
}

#[test]
fn penalties_are_additive_and_revert_below_threshold() {
    let queue = PriorityBucketQueue::with_defaults();
    for i in 0..4 {
        queue.enqueue(anon("10.0.0.1", "agent-x"), i);
    }
    queue.enqueue(anon("10.0.0.2", "agent-y"), 4);
    assert_eq!(priorities(&queue), vec![3, 3, 3, 3, 1]);

    assert_eq!(
        drain(&queue),
        vec![(4, 1), (0, 4), (1, 1), (2, 1), (3, 1)]
    );
}

#[test]
fn symmetric_config_gives_signature_full_weight() {
    let queue = PriorityBucketQueue::new(PriorityConfig::symmetric());
    for i in 0..4 {
        queue.enqueue(anon("10.0.0.1", "agent-x"), i);
    }
    assert_eq!(priorities(&queue), vec![5, 5, 5, 5]);

    let other = PriorityBucketQueue::new(PriorityConfig::symmetric());
    for i in 0..4 {
        other.enqueue(anon(&format!("10.0.1.{i}"), "agent-x"), i);
    }
    // A dominant signature weighs exactly like a dominant IP.
    assert_eq!(priorities(&other), vec![3, 3, 3, 3]);
}

#[test]
fn authenticated_requests_never_pay_for_shared_agent() {
    let queue = PriorityBucketQueue::new(PriorityConfig::symmetric());
    for i in 0..6 {
        queue.enqueue(
            RequestRecord::authenticated(format!("10.0.0.{i}"), "agent-x", format!("user-{i}")),
            i,
        );
    }
    assert_eq!(priorities(&queue), vec![1; 6]);
}

#[test]
fn removal_changes_remaining_priorities_immediately() {
    let queue = PriorityBucketQueue::with_defaults();
    let handles: Vec<_> = (0..4)
        .map(|i| queue.enqueue(anon("10.0.0.1", &format!("agent-{i}")), i))
        .collect();
    assert_eq!(queue.peek().map(|p| p.pre_op_priority), Some(3));

    assert_eq!(queue.cancel(handles[3]), CancelResult::Cancelled);
    assert_eq!(queue.cancel(handles[3]), CancelResult::NotFound);
    assert_eq!(queue.peek().map(|p| p.pre_op_priority), Some(1));
    assert_eq!(queue.size(), 3);
    assert_eq!(queue.stats().cancelled, 1);
}

#[test]
fn stats_track_served_priorities() {
    let queue = PriorityBucketQueue::with_defaults();
    for i in 0..4 {
        queue.enqueue(anon("10.0.0.1", &format!("agent-{i}")), i);
    }
    let _ = drain(&queue);
    queue.record_expired(2);

    let stats = queue.stats();
    assert_eq!(stats.enqueued, 4);
    assert_eq!(stats.dequeued, 4);
    assert_eq!(stats.expired, 2);
    assert_eq!(stats.queue_len, 0);
    assert_eq!(stats.queue_time_samples, 4);
    let served: Vec<_> = stats
        .served_by_priority
        .iter()
        .map(|entry| (entry.priority, entry.count))
        .collect();
    assert_eq!(served, vec![(1, 3), (3, 1)]);
}

#[test]
fn concurrent_producers_and_consumers_keep_counts_consistent() {
    use std::sync::Arc;
    use std::thread;

    let queue = Arc::new(PriorityBucketQueue::with_defaults());
    let producers: Vec<_> = (0..4)
        .map(|p| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..250 {
                    queue.enqueue(anon(&format!("10.0.0.{p}"), &format!("agent-{}", i % 3)), i);
                }
            })
        })
        .collect();
    for handle in producers {
        handle.join().expect("producer");
    }

    let consumers: Vec<_> = (0..4)
        .map(|_| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut served = 0u64;
                while !queue.dequeue().is_empty() {
                    served += 1;
                }
                served
            })
        })
        .collect();
    let served: u64 = consumers
        .into_iter()
        .map(|handle| handle.join().expect("consumer"))
        .sum();

    assert_eq!(served, 1_000);
    assert_eq!(queue.size(), 0);
}

#[derive(Clone, Debug)]
enum Op {
    Enqueue { ip: u8, agent: u8, user: Option<u8> },
    Dequeue,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u8..3, 0u8..3, proptest::option::of(0u8..2))
            .prop_map(|(ip, agent, user)| Op::Enqueue { ip, agent, user }),
        2 => Just(Op::Dequeue),
    ]
}

/// Recomputes every share by scanning the whole model queue.
fn model_priority(model: &[(RequestRecord, usize)], idx: usize, config: &PriorityConfig) -> u32 {
    if model.len() < config.size_threshold {
        return 1;
    }
    let record = &model[idx].0;
    let tiers = config.tiers();
    let penalty = |share: f64, limit: usize| {
        tiers[..limit].iter().filter(|&&tier| share > tier).count() as u32
    };

    let same_ip = model.iter().filter(|(r, _)| r.ip == record.ip).count();
    let mut priority = 1 + penalty(same_ip as f64 / model.len() as f64, 2);

    if record.is_anonymous() {
        let anonymous = model.iter().filter(|(r, _)| r.is_anonymous()).count();
        let same_agent = model
            .iter()
            .filter(|(r, _)| r.is_anonymous() && r.user_agent == record.user_agent)
            .count();
        priority += penalty(same_agent as f64 / anonymous as f64, config.identity_tiers);
    }
    priority
}

proptest! {
    #[test]
    fn matches_full_scan_model(ops in proptest::collection::vec(op_strategy(), 0..80), symmetric in any::<bool>()) {
        let config = if symmetric { PriorityConfig::symmetric() } else { PriorityConfig::default() };
        let queue = PriorityBucketQueue::new(config.clone());
        let mut model: Vec<(RequestRecord, usize)> = Vec::new();
        let mut enqueued = 0usize;
        let mut dequeued = 0usize;

        for (step, op) in ops.into_iter().enumerate() {
            match op {
                Op::Enqueue { ip, agent, user } => {
                    let record = RequestRecord {
                        ip: format!("10.0.0.{ip}"),
                        user_agent: format!("agent-{agent}"),
                        user_id: user.map(|u| format!("user-{u}")),
                    };
                    queue.enqueue(record.clone(), step);
                    model.push((record, step));
                    enqueued += 1;
                }
                Op::Dequeue => {
                    let expected = (0..model.len())
                        .map(|idx| (model_priority(&model, idx, &config), idx))
                        .min();
                    match (queue.dequeue(), expected) {
                        (DequeueResult::Empty, None) => {}
                        (DequeueResult::Request { request, pre_op_priority }, Some((priority, idx))) => {
                            prop_assert_eq!(request.payload, model[idx].1);
                            prop_assert_eq!(pre_op_priority, priority);
                            if model.len() < config.size_threshold {
                                prop_assert_eq!(pre_op_priority, 1);
                                prop_assert_eq!(idx, 0);
                            }
                            model.remove(idx);
                            dequeued += 1;
                        }
                        (actual, expected) => {
                            prop_assert!(false, "queue returned {:?}, model expected {:?}", actual.is_empty(), expected);
                        }
                    }
                }
            }
            prop_assert_eq!(queue.size(), enqueued - dequeued);

            for entry in queue.snapshot() {
                if entry.record.user_id.is_some() {
                    // Only the IP dimension can penalize authenticated requests.
                    prop_assert!(entry.priority <= 3);
                }
            }
        }
    }
}

#[test]
fn drain_releases_everything_as_cancelled() {
    let queue = PriorityBucketQueue::with_defaults();
    for i in 0..5u32 {
        queue.enqueue(anon("1.1.1.1", "bot"), i);
    }

    let drained: Vec<_> = queue.drain().into_iter().map(|r| r.payload).collect();
    assert_eq!(drained, vec![0, 1, 2, 3, 4]);
    assert!(queue.is_empty());
    assert!(queue.dequeue().is_empty());

    let stats = queue.stats();
    assert_eq!(stats.cancelled, 5);
    assert_eq!(stats.dequeued, 0);
    assert_eq!(stats.queue_len, 0);
}

#[test]
fn stats_and_snapshot_serialize_to_json() {
    let queue = PriorityBucketQueue::with_defaults();
    queue.enqueue(RequestRecord::authenticated("1.1.1.1", "a", "u-1"), ());
    queue.enqueue(anon("2.2.2.2", "b"), ());
    let _ = queue.dequeue();

    let stats = serde_json::to_value(queue.stats()).expect("stats json");
    assert_eq!(stats["enqueued"], 2);
    assert_eq!(stats["served_by_priority"][0]["priority"], 1);

    let snapshot = serde_json::to_value(queue.snapshot()).expect("snapshot json");
    assert_eq!(snapshot[0]["record"]["ip"], "2.2.2.2");
    assert_eq!(snapshot[0]["record"]["user_id"], serde_json::Value::Null);
}
