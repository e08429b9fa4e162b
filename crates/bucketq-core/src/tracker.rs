use std::collections::HashMap;

/// Per-key occurrence counts over the requests currently queued.
///
/// `total` always equals the sum of all counts, which in turn equals the
/// number of entries registered with this tracker. Both are maintained
/// incrementally on every enqueue/dequeue so [`fraction_of`] is O(1).
///
/// [`fraction_of`]: KeyFrequencyTracker::fraction_of
#[derive(Debug, Default, Clone)]
pub struct KeyFrequencyTracker {
    counts: HashMap<String, usize>,
    total: usize,
}

impl KeyFrequencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, key: &str) {
        match self.counts.get_mut(key) {
            Some(count) => *count += 1,
            None => {
                self.counts.insert(key.to_string(), 1);
            }
        }
        self.total += 1;
    }

    /// Decrements `key`, pruning it once its count reaches zero. Unknown keys
    /// leave the tracker untouched.
    pub fn decrement(&mut self, key: &str) {
        let Some(count) = self.counts.get_mut(key) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.counts.remove(key);
        }
        self.total = self.total.saturating_sub(1);
    }

    /// Share of tracked entries carrying `key`, in `[0, 1]`.
    pub fn fraction_of(&self, key: &str) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.count(key) as f64 / self.total as f64
    }

    pub fn count(&self, key: &str) -> usize {
        self.counts.get(key).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn distinct_keys(&self) -> usize {
        self.counts.len()
    }
}
