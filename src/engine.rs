//! Quota engine: ties the cache, bucket construction, and strategy dispatch
//! together behind one entry point.

use std::sync::Arc;

use chrono::TimeZone;
use tracing::debug;

use crate::bucket::{BucketConfig, BucketType, QuotaBucket};
use crate::cache::BucketCache;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::counter::{CounterStore, HttpCounterStore};
use crate::error::QuotaError;
use crate::period::{QuotaType, TimeUnit};
use crate::reconciler;
use crate::request::{QuotaRequest, QuotaResult};
use crate::strategy::strategy_for;

/// The quota engine. Cheap to share behind an `Arc`; all interior state is
/// already synchronized.
#[derive(Debug)]
pub struct QuotaEngine {
    config: EngineConfig,
    store: Arc<dyn CounterStore>,
    cache: BucketCache,
    clock: Arc<dyn Clock>,
}

impl QuotaEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        let cache = BucketCache::new(config.cache_ttl, clock.clone());
        Self { config, store, cache, clock }
    }

    /// Engine wired to the real counting service over HTTP.
    pub fn with_http_store(config: EngineConfig) -> Result<Self, QuotaError> {
        let store = HttpCounterStore::new(
            config.counter_service_url.clone(),
            config.auth_token.clone(),
            config.request_timeout,
            config.connect_timeout,
        )?;
        Ok(Self::new(config, Arc::new(store), Arc::new(SystemClock)))
    }

    /// Charge the request's weight against its bucket and report whether the
    /// quota is exceeded and how much remains.
    pub async fn check(&self, request: &QuotaRequest) -> Result<QuotaResult, QuotaError> {
        let bucket = self.bucket_for(request).await?;
        let strategy = strategy_for(bucket.config().bucket_type);
        strategy.increment(&bucket, self.store.as_ref()).await
    }

    /// Force the local counter for the request's bucket back to zero for the
    /// active window.
    pub async fn reset(&self, request: &QuotaRequest) -> Result<QuotaResult, QuotaError> {
        let bucket = self.bucket_for(request).await?;
        let strategy = strategy_for(bucket.config().bucket_type);
        strategy.reset(&bucket, self.store.as_ref()).await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &BucketCache {
        &self.cache
    }

    /// Cache lookup, or construct-validate-insert on a miss, done atomically
    /// under the cache lock so concurrent first requests share one bucket.
    /// A hit refreshes the bucket's weight from this request.
    async fn bucket_for(&self, request: &QuotaRequest) -> Result<Arc<QuotaBucket>, QuotaError> {
        // Semantic validation happens before the cache is consulted, so a
        // malformed request never resolves to a previously valid bucket.
        let bucket_type = request.bucket_type()?;
        let time_unit: TimeUnit = request.time_unit.parse()?;
        let quota_type: QuotaType = request.quota_type.parse()?;

        let now = self.clock.now();
        let start_time = match request.start_timestamp {
            Some(secs) => chrono::Utc
                .timestamp_opt(secs, 0)
                .single()
                .ok_or(QuotaError::InvalidStartTime(secs))?,
            None => now,
        };

        let key = request.cache_key();
        let (bucket, inserted) = self.cache.get_or_try_insert(&key, || {
            let config = BucketConfig {
                edge_org_id: request.edge_org_id.clone(),
                id: request.id.clone(),
                interval: request.interval,
                time_unit,
                quota_type,
                bucket_type,
                precise_at_seconds_level: request.precise_at_seconds_level,
                start_time,
                max_count: request.max_count,
                sync_time_in_sec: request.sync_time_in_sec,
                sync_message_count: request.sync_message_count,
            };
            QuotaBucket::new(
                config,
                request.weight,
                self.config.default_sync_interval,
                self.clock.clone(),
            )
        })?;

        if inserted {
            if bucket_type == BucketType::Asynchronous {
                reconciler::spawn(
                    bucket.clone(),
                    self.store.clone(),
                    self.cache.clone(),
                    self.config.idle_ticks_before_evict,
                );
            }
            debug!(key = %key, bucket_type = %bucket_type, "new quota bucket cached");
        } else {
            bucket.set_weight(request.weight).await;
        }
        Ok(bucket)
    }
}
