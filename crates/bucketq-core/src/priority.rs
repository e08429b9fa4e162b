use crate::api::{BASE_PRIORITY, RequestRecord};
use crate::config::{MAX_TIERS, PriorityConfig};
use crate::tracker::KeyFrequencyTracker;

/// Priority of `record` given the current composition of the queue.
///
/// `ip_counts` tracks every queued request by IP; `anonymous_agents` tracks
/// only anonymous requests by user agent. Below `config.size_threshold` the
/// result is always [`BASE_PRIORITY`]. Above it, the IP penalty and (for
/// anonymous requests only) the user-agent penalty are added on top.
pub fn compute_priority(
    record: &RequestRecord,
    ip_counts: &KeyFrequencyTracker,
    anonymous_agents: &KeyFrequencyTracker,
    queue_size: usize,
    config: &PriorityConfig,
) -> u32 {
    let mut priority = BASE_PRIORITY;
    if queue_size < config.size_threshold {
        return priority;
    }

    priority += crowding_penalty(ip_counts.fraction_of(&record.ip), config, MAX_TIERS);

    // Authenticated requests are exempt from signature crowding.
    if record.is_anonymous() {
        priority += crowding_penalty(
            anonymous_agents.fraction_of(&record.user_agent),
            config,
            config.identity_tiers,
        );
    }

    priority
}

/// One point for every tier (among the first `tiers`) that `fraction`
/// strictly exceeds.
fn crowding_penalty(fraction: f64, config: &PriorityConfig, tiers: usize) -> u32 {
    config
        .tiers()
        .iter()
        .take(tiers)
        .filter(|&&tier| fraction > tier)
        .count() as u32
}
