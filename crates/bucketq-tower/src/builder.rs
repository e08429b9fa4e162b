use crate::{
    BucketLayer, RecordExtractor, RejectReason, RejectionMapper, default_rejection_mapper,
};
use bucketq_async::{AsyncBucketQueue, ConfigError, PriorityConfig};
use std::sync::Arc;
use std::time::Duration;

/// Main builder for wiring a priority bucket queue in front of a service.
pub struct BucketQueueBuilder {
    config: PriorityConfig,
    max_in_flight: usize,
    queue_timeout: Option<Duration>,
    rejection_mapper: RejectionMapper,
}

impl Default for BucketQueueBuilder {
    fn default() -> Self {
        Self {
            config: PriorityConfig::default(),
            max_in_flight: 3,
            queue_timeout: None,
            rejection_mapper: Arc::new(default_rejection_mapper),
        }
    }
}

impl BucketQueueBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole priority configuration.
    pub fn with_config(mut self, config: PriorityConfig) -> Self {
        self.config = config;
        self
    }

    /// Queue size at which crowding penalties start to apply.
    pub fn with_size_threshold(mut self, size_threshold: usize) -> Self {
        self.config.size_threshold = size_threshold;
        self
    }

    pub fn with_tier_fractions(mut self, tier1: f64, tier2: f64) -> Self {
        self.config.tier1_fraction = tier1;
        self.config.tier2_fraction = tier2;
        self
    }

    /// How many fraction tiers apply to the user-agent dimension.
    pub fn with_identity_tiers(mut self, tiers: usize) -> Self {
        self.config.identity_tiers = tiers;
        self
    }

    /// Requests allowed to run in the inner service at once.
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    /// Requests that waited longer than `timeout` are rejected instead of
    /// processed.
    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = Some(timeout);
        self
    }

    pub fn with_rejection_mapper<F>(mut self, mapper: F) -> Self
    where
        F: Fn(RejectReason) -> crate::BucketHttpRejection + Send + Sync + 'static,
    {
        self.rejection_mapper = Arc::new(mapper);
        self
    }

    /// Like [`BucketQueueBuilder::build`], but rejects an invalid priority
    /// configuration instead of logging it.
    pub fn try_build<Request, K>(
        self,
        extractor: K,
    ) -> Result<BucketLayer<Request, K>, ConfigError>
    where
        K: RecordExtractor<Request> + Clone,
    {
        self.config.validate()?;
        Ok(self.build(extractor))
    }

    /// Builds the layer. `extractor` maps `&Request` to a `RequestRecord`;
    /// the `Request` type is inferred from it. An invalid configuration is
    /// logged and used as given.
    pub fn build<Request, K>(self, extractor: K) -> BucketLayer<Request, K>
    where
        K: RecordExtractor<Request> + Clone,
    {
        let queue = AsyncBucketQueue::with_config(self.config);
        BucketLayer::new(
            queue,
            extractor,
            self.max_in_flight,
            self.queue_timeout,
            self.rejection_mapper,
        )
    }
}
