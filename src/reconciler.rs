//! Background reconciliation for asynchronous buckets.
//!
//! One task per asynchronous bucket, started when the bucket enters the
//! cache. Each tick drains the locally buffered weight into a single
//! increment against the counting service and refreshes the cached global
//! count. A bucket whose buffer stays empty past the idle threshold is
//! evicted from the cache and its task stops, bounding live tasks to the
//! set of active tenant/resources.

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::bucket::{AsyncState, BucketConfig, QuotaBucket};
use crate::cache::BucketCache;
use crate::counter::CounterStore;
use crate::error::RemoteError;
use crate::period::Period;
use crate::strategy::window_millis;

/// One reconciliation step: flush the buffered weight for `period` and
/// refresh the global count.
///
/// The caller holds the bucket's state mutex, so the buffer cannot change
/// underneath the remote call; on failure it is left untouched and nothing
/// is lost.
pub(crate) async fn reconcile_window(
    config: &BucketConfig,
    store: &dyn CounterStore,
    async_state: &mut AsyncState,
    period: Period,
) -> Result<i64, RemoteError> {
    let weight: i64 = async_state.buffer.iter().sum();
    let (start_ms, end_ms) = window_millis(period);
    let count = store
        .increment_and_count(&config.edge_org_id, &config.id, weight, start_ms, end_ms)
        .await?;
    async_state.buffer.clear();
    async_state.buffered_total -= weight;
    async_state.global_count = count;
    async_state.initialized = true;
    Ok(count)
}

/// Start the periodic reconciliation task for an asynchronous bucket.
/// No-op for other bucket types.
pub(crate) fn spawn(
    bucket: Arc<QuotaBucket>,
    store: Arc<dyn CounterStore>,
    cache: BucketCache,
    idle_ticks_before_evict: u32,
) {
    let Some(tick) = bucket.tick_interval() else { return };
    let Some(mut stop) = bucket.subscribe_stop() else { return };

    tokio::spawn(async move {
        let key = bucket.cache_key();
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately.
        interval.tick().await;
        let mut idle_ticks = 0u32;

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = interval.tick() => {
                    let now = bucket.clock_now();
                    let mut state = bucket.lock_state().await;
                    let period = bucket.refresh_period(&mut state, now);
                    let config = bucket.config();
                    let Some(async_state) = state.async_state.as_mut() else {
                        // Unreachable for buckets built through QuotaBucket::new.
                        warn!(key = %key, "async bucket lost its counting state; stopping reconciler");
                        break;
                    };

                    if async_state.buffer.is_empty() {
                        idle_ticks += 1;
                    } else {
                        idle_ticks = 0;
                    }

                    match reconcile_window(config, store.as_ref(), async_state, period).await {
                        Ok(count) => {
                            debug!(key = %key, global_count = count, "reconciled with counter service");
                        }
                        Err(err) => {
                            warn!(key = %key, error = %err, "reconciliation failed; retrying next tick");
                        }
                    }
                    drop(state);

                    if idle_ticks > idle_ticks_before_evict {
                        debug!(key = %key, idle_ticks, "bucket idle; evicting and stopping reconciler");
                        cache.evict(&key);
                        break;
                    }
                }
            }
        }
        debug!(key = %key, "reconciler stopped");
    });
}
