//! Counting strategies.
//!
//! One strategy per bucket type, dispatched purely on
//! [`BucketType`]: non-distributed counting stays in the bucket,
//! synchronous counting round-trips to the counting service on every call,
//! asynchronous counting answers from a local estimate and buffers weight
//! for the reconciler.
//!
//! The exceed boundary everywhere is: an increment succeeds iff it would
//! not push the count strictly above `max_count`.

use async_trait::async_trait;
use tracing::warn;

use crate::bucket::{BucketType, FlushTrigger, QuotaBucket};
use crate::counter::{get_count, CounterStore};
use crate::error::QuotaError;
use crate::period::Period;
use crate::reconciler;
use crate::request::QuotaResult;

/// Increment-and-report interface shared by the three bucket types.
#[async_trait]
pub trait CountingStrategy: Send + Sync {
    /// Charge the bucket's weight against the current period and report
    /// whether the quota is exceeded and how much remains.
    async fn increment(
        &self,
        bucket: &QuotaBucket,
        store: &dyn CounterStore,
    ) -> Result<QuotaResult, QuotaError>;

    /// Zero the local view of the active window.
    async fn reset(
        &self,
        bucket: &QuotaBucket,
        store: &dyn CounterStore,
    ) -> Result<QuotaResult, QuotaError>;
}

/// Select the strategy for a bucket type.
pub fn strategy_for(bucket_type: BucketType) -> &'static dyn CountingStrategy {
    match bucket_type {
        BucketType::Synchronous => &Synchronous,
        BucketType::Asynchronous => &Asynchronous,
        BucketType::NonDistributed => &NonDistributed,
    }
}

fn result_for(bucket: &QuotaBucket, period: Period, exceeded: bool, remaining: i64) -> QuotaResult {
    let config = bucket.config();
    QuotaResult {
        edge_org_id: config.edge_org_id.clone(),
        id: config.id.clone(),
        max_count: config.max_count,
        exceeded,
        remaining_count: remaining.max(0),
        start_timestamp: period.start_timestamp(),
        expires_timestamp: period.expires_timestamp(),
    }
}

/// Counts held only in the bucket instance itself.
pub struct NonDistributed;

#[async_trait]
impl CountingStrategy for NonDistributed {
    async fn increment(
        &self,
        bucket: &QuotaBucket,
        _store: &dyn CounterStore,
    ) -> Result<QuotaResult, QuotaError> {
        let now = bucket.clock_now();
        let mut state = bucket.lock_state().await;
        let period = bucket.refresh_period(&mut state, now);
        let config = bucket.config();
        let max_count = config.max_count;
        let weight = state.weight;

        let mut exceeded = false;
        let mut remaining = 0;
        if period.is_current(config.quota_type, now) {
            if state.local_count + weight <= max_count {
                state.local_count += weight;
            } else if weight != 0 {
                exceeded = true;
            }
            remaining = max_count - state.local_count;
        }

        Ok(result_for(bucket, period, exceeded, remaining))
    }

    async fn reset(
        &self,
        bucket: &QuotaBucket,
        _store: &dyn CounterStore,
    ) -> Result<QuotaResult, QuotaError> {
        let now = bucket.clock_now();
        let mut state = bucket.lock_state().await;
        let period = bucket.refresh_period(&mut state, now);
        state.local_count = 0;
        Ok(result_for(bucket, period, false, bucket.config().max_count))
    }
}

/// Every increment is a blocking round-trip to the counting service.
pub struct Synchronous;

#[async_trait]
impl CountingStrategy for Synchronous {
    async fn increment(
        &self,
        bucket: &QuotaBucket,
        store: &dyn CounterStore,
    ) -> Result<QuotaResult, QuotaError> {
        let now = bucket.clock_now();
        let mut state = bucket.lock_state().await;
        let period = bucket.refresh_period(&mut state, now);
        let config = bucket.config();
        let max_count = config.max_count;
        let weight = state.weight;
        let (start_ms, end_ms) = window_millis(period);

        let mut exceeded = false;
        let mut remaining = 0;
        if period.is_current(config.quota_type, now) {
            let mut current =
                get_count(store, &config.edge_org_id, &config.id, start_ms, end_ms).await?;
            if current < max_count {
                let allowed = max_count - current;
                if allowed >= weight {
                    // Only charge the service when the increment fits.
                    if weight != 0 {
                        current = store
                            .increment_and_count(
                                &config.edge_org_id,
                                &config.id,
                                weight,
                                start_ms,
                                end_ms,
                            )
                            .await?;
                    }
                } else if weight != 0 {
                    exceeded = true;
                }
                remaining = max_count - current;
            } else {
                exceeded = true;
                remaining = max_count - current;
            }
        }

        Ok(result_for(bucket, period, exceeded, remaining))
    }

    async fn reset(
        &self,
        bucket: &QuotaBucket,
        _store: &dyn CounterStore,
    ) -> Result<QuotaResult, QuotaError> {
        // The service counter is keyed by window; a fresh window is already
        // zero remotely and there is no local state to clear.
        let now = bucket.clock_now();
        let mut state = bucket.lock_state().await;
        let period = bucket.refresh_period(&mut state, now);
        Ok(result_for(bucket, period, false, bucket.config().max_count))
    }
}

/// Increments served from `global_count + buffered_total`; no network on the
/// hot path apart from the one-time seed read and the message-count flush.
pub struct Asynchronous;

#[async_trait]
impl CountingStrategy for Asynchronous {
    async fn increment(
        &self,
        bucket: &QuotaBucket,
        store: &dyn CounterStore,
    ) -> Result<QuotaResult, QuotaError> {
        let now = bucket.clock_now();
        let mut state = bucket.lock_state().await;
        let period = bucket.refresh_period(&mut state, now);
        let config = bucket.config();
        let max_count = config.max_count;
        let weight = state.weight;
        let (start_ms, end_ms) = window_millis(period);
        let async_state = state.async_state.as_mut().ok_or(QuotaError::MissingAsyncState)?;

        let mut exceeded = false;
        let mut remaining = 0;
        if period.is_current(config.quota_type, now) {
            if !async_state.initialized {
                match get_count(store, &config.edge_org_id, &config.id, start_ms, end_ms).await {
                    Ok(count) => {
                        async_state.global_count = count;
                        async_state.initialized = true;
                    }
                    // The caller is answered from the local estimate either
                    // way; the next call retries the seed.
                    Err(err) => warn!(
                        org = %config.edge_org_id,
                        id = %config.id,
                        error = %err,
                        "seeding global count failed; continuing from local estimate"
                    ),
                }
            }

            let estimate = async_state.estimate();
            if estimate < max_count {
                if estimate + weight <= max_count {
                    async_state.buffer.push(weight);
                    async_state.buffered_total += weight;
                    remaining = max_count - (estimate + weight);

                    if let FlushTrigger::MessageCount(threshold) = async_state.trigger {
                        if async_state.buffered_total >= threshold {
                            if let Err(err) =
                                reconciler::reconcile_window(config, store, async_state, period)
                                    .await
                            {
                                warn!(
                                    org = %config.edge_org_id,
                                    id = %config.id,
                                    error = %err,
                                    "message-count flush failed; weight stays buffered"
                                );
                            }
                        }
                    }
                } else {
                    exceeded = true;
                    remaining = max_count - estimate;
                }
            } else {
                exceeded = true;
                remaining = max_count - estimate;
            }
        }

        Ok(result_for(bucket, period, exceeded, remaining))
    }

    async fn reset(
        &self,
        bucket: &QuotaBucket,
        _store: &dyn CounterStore,
    ) -> Result<QuotaResult, QuotaError> {
        let now = bucket.clock_now();
        let mut state = bucket.lock_state().await;
        let period = bucket.refresh_period(&mut state, now);
        let async_state = state.async_state.as_mut().ok_or(QuotaError::MissingAsyncState)?;
        async_state.clear_window();
        Ok(result_for(bucket, period, false, bucket.config().max_count))
    }
}

pub(crate) fn window_millis(period: Period) -> (i64, i64) {
    (period.start_timestamp() * 1000, period.expires_timestamp() * 1000)
}
