//! The quota bucket entity: static configuration, the resolved period, and
//! the mutable counting state shared by the increment path and the
//! reconciler.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex, MutexGuard};

use crate::clock::Clock;
use crate::error::QuotaError;
use crate::period::{self, Period, QuotaType, TimeUnit};

/// Counting strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketType {
    /// Every increment round-trips to the counting service.
    Synchronous,
    /// Increments served from a local estimate, reconciled in the background.
    Asynchronous,
    /// Counts held only in this process.
    NonDistributed,
}

impl BucketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synchronous => "synchronous",
            Self::Asynchronous => "asynchronous",
            Self::NonDistributed => "nondistributed",
        }
    }
}

impl fmt::Display for BucketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BucketType {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "synchronous" => Ok(Self::Synchronous),
            "asynchronous" => Ok(Self::Asynchronous),
            "nondistributed" => Ok(Self::NonDistributed),
            other => Err(QuotaError::InvalidBucketType(format!("unrecognized '{other}'"))),
        }
    }
}

/// What pushes buffered async weight to the counting service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// Flush on a fixed wall-clock cadence.
    Interval(Duration),
    /// Flush once the buffered total reaches this count.
    MessageCount(i64),
}

/// Local counting state of an asynchronous bucket.
///
/// Written by the increment path and the reconciler tick; both go through
/// the bucket's state mutex.
#[derive(Debug)]
pub struct AsyncState {
    /// Last count fetched from the counting service.
    pub global_count: i64,
    /// Pending weights not yet flushed, in arrival order.
    pub buffer: Vec<i64>,
    /// Running sum of `buffer`.
    pub buffered_total: i64,
    /// Whether `global_count` has been seeded from the service.
    pub initialized: bool,
    pub trigger: FlushTrigger,
}

impl AsyncState {
    fn new(trigger: FlushTrigger) -> Self {
        Self { global_count: 0, buffer: Vec::new(), buffered_total: 0, initialized: false, trigger }
    }

    /// Forget everything tied to the previous window.
    pub fn clear_window(&mut self) {
        self.buffer.clear();
        self.buffered_total = 0;
        self.global_count = 0;
        self.initialized = false;
    }

    /// Local estimate of the current count.
    pub fn estimate(&self) -> i64 {
        self.global_count + self.buffered_total
    }
}

/// Static bucket configuration, immutable after construction.
#[derive(Debug, Clone)]
pub struct BucketConfig {
    pub edge_org_id: String,
    pub id: String,
    pub interval: u32,
    pub time_unit: TimeUnit,
    pub quota_type: QuotaType,
    pub bucket_type: BucketType,
    /// Informational; carried through for the API layer.
    pub precise_at_seconds_level: bool,
    /// Tenant-supplied reference instant.
    pub start_time: DateTime<Utc>,
    pub max_count: i64,
    pub sync_time_in_sec: Option<u64>,
    pub sync_message_count: Option<i64>,
}

/// Mutable per-bucket state, guarded by one mutex.
#[derive(Debug)]
pub struct BucketState {
    pub period: Period,
    /// Cost of one increment; refreshed from each request.
    pub weight: i64,
    /// Counter for non-distributed buckets.
    pub local_count: i64,
    pub async_state: Option<AsyncState>,
}

/// One tenant+resource quota bucket.
#[derive(Debug)]
pub struct QuotaBucket {
    config: BucketConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<BucketState>,
    /// Reconciler cadence; `None` for non-async buckets.
    tick_interval: Option<Duration>,
    /// Stop signal for the reconciler; `None` for non-async buckets.
    stop: Option<watch::Sender<bool>>,
}

impl QuotaBucket {
    /// Build a bucket: derive the async flush trigger, resolve the initial
    /// period, and validate it.
    ///
    /// For asynchronous buckets exactly one of `sync_time_in_sec` /
    /// `sync_message_count` may be set; neither falls back to
    /// `default_sync_interval`. The reconciler itself is spawned by the
    /// engine once the bucket is in the cache.
    pub fn new(
        config: BucketConfig,
        initial_weight: i64,
        default_sync_interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, QuotaError> {
        let (async_state, tick_interval, stop) = match config.bucket_type {
            BucketType::Asynchronous => {
                let sync_time = config.sync_time_in_sec.filter(|t| *t > 0);
                let message_count = config.sync_message_count.filter(|n| *n > 0);
                if sync_time.is_some() && message_count.is_some() {
                    return Err(QuotaError::AmbiguousSyncTrigger);
                }
                let trigger = match (sync_time, message_count) {
                    (Some(secs), None) => FlushTrigger::Interval(Duration::from_secs(secs)),
                    (None, Some(n)) => FlushTrigger::MessageCount(n),
                    _ => FlushTrigger::Interval(default_sync_interval),
                };
                // Message-count buckets still get a periodic safety-net flush.
                let tick = match trigger {
                    FlushTrigger::Interval(d) => d,
                    FlushTrigger::MessageCount(_) => default_sync_interval,
                };
                let (tx, _rx) = watch::channel(false);
                (Some(AsyncState::new(trigger)), Some(tick), Some(tx))
            }
            _ => (None, None, None),
        };

        let now = clock.now();
        let period = period::resolve(
            config.quota_type,
            config.time_unit,
            config.interval,
            config.start_time,
            now,
        );
        period.validate()?;

        Ok(Arc::new(Self {
            config,
            clock,
            state: Mutex::new(BucketState {
                period,
                weight: initial_weight,
                local_count: 0,
                async_state,
            }),
            tick_interval,
            stop,
        }))
    }

    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    pub fn cache_key(&self) -> String {
        format!(
            "{}{}{}",
            self.config.edge_org_id,
            crate::cache::CACHE_KEY_DELIMITER,
            self.config.id
        )
    }

    pub(crate) fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) async fn lock_state(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().await
    }

    /// Replace the per-increment weight (each request carries its own).
    pub async fn set_weight(&self, weight: i64) {
        self.state.lock().await.weight = weight;
    }

    /// Re-resolve the period when stale, per the re-resolution rule:
    /// rolling windows always, calendar windows only once expired. Rolling a
    /// calendar window over resets the local view of the old window — the
    /// remote counter is keyed by window, so carrying local state across
    /// windows would double-count.
    pub(crate) fn refresh_period(&self, state: &mut BucketState, now: DateTime<Utc>) -> Period {
        match self.config.quota_type {
            QuotaType::RollingWindow => {
                state.period = period::resolve(
                    QuotaType::RollingWindow,
                    self.config.time_unit,
                    self.config.interval,
                    self.config.start_time,
                    now,
                );
            }
            QuotaType::Calendar => {
                if state.period.is_expired(now) {
                    state.period = period::resolve(
                        QuotaType::Calendar,
                        self.config.time_unit,
                        self.config.interval,
                        self.config.start_time,
                        now,
                    );
                    state.local_count = 0;
                    if let Some(async_state) = state.async_state.as_mut() {
                        async_state.clear_window();
                    }
                }
            }
        }
        state.period
    }

    /// Reconciler cadence for asynchronous buckets.
    pub(crate) fn tick_interval(&self) -> Option<Duration> {
        self.tick_interval
    }

    /// Subscribe to the stop signal; `None` for non-async buckets.
    pub(crate) fn subscribe_stop(&self) -> Option<watch::Receiver<bool>> {
        self.stop.as_ref().map(watch::Sender::subscribe)
    }

    /// Signal the reconciler to stop. Idempotent; an in-flight tick is
    /// allowed to finish before the task observes the signal.
    pub fn stop_reconciler(&self) {
        if let Some(stop) = &self.stop {
            let _ = stop.send(true);
        }
    }

    /// Semantic validation of the bucket's current state.
    pub async fn validate(&self) -> Result<(), QuotaError> {
        self.state.lock().await.period.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    const DEFAULT_SYNC: Duration = Duration::from_secs(300);

    fn config(bucket_type: BucketType) -> BucketConfig {
        BucketConfig {
            edge_org_id: "org1".into(),
            id: "res1".into(),
            interval: 1,
            time_unit: TimeUnit::Hour,
            quota_type: QuotaType::Calendar,
            bucket_type,
            precise_at_seconds_level: false,
            // Well before the fixed test clock.
            start_time: Utc.timestamp_opt(1_600_000_000, 0).single().unwrap(),
            max_count: 10,
            sync_time_in_sec: None,
            sync_message_count: None,
        }
    }

    fn clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::at_unix(1_700_000_000))
    }

    #[tokio::test]
    async fn constructor_resolves_and_validates_period() {
        let bucket =
            QuotaBucket::new(config(BucketType::NonDistributed), 1, DEFAULT_SYNC, clock())
                .unwrap();
        bucket.validate().await.unwrap();
        let state = bucket.lock_state().await;
        assert!(state.period.start < state.period.end);
        assert!(state.async_state.is_none());
        assert_eq!(state.weight, 1);
    }

    #[tokio::test]
    async fn async_bucket_rejects_both_triggers() {
        let mut cfg = config(BucketType::Asynchronous);
        cfg.sync_time_in_sec = Some(30);
        cfg.sync_message_count = Some(5);
        let err = QuotaBucket::new(cfg, 1, DEFAULT_SYNC, clock()).unwrap_err();
        assert!(matches!(err, QuotaError::AmbiguousSyncTrigger));
    }

    #[tokio::test]
    async fn async_bucket_defaults_flush_interval() {
        let bucket =
            QuotaBucket::new(config(BucketType::Asynchronous), 1, DEFAULT_SYNC, clock()).unwrap();
        assert_eq!(bucket.tick_interval(), Some(DEFAULT_SYNC));
        let state = bucket.lock_state().await;
        let async_state = state.async_state.as_ref().unwrap();
        assert_eq!(async_state.trigger, FlushTrigger::Interval(DEFAULT_SYNC));
        assert!(!async_state.initialized);
    }

    #[tokio::test]
    async fn message_count_bucket_keeps_default_tick() {
        let mut cfg = config(BucketType::Asynchronous);
        cfg.sync_message_count = Some(3);
        let bucket = QuotaBucket::new(cfg, 1, DEFAULT_SYNC, clock()).unwrap();
        assert_eq!(bucket.tick_interval(), Some(DEFAULT_SYNC));
        let state = bucket.lock_state().await;
        assert_eq!(state.async_state.as_ref().unwrap().trigger, FlushTrigger::MessageCount(3));
    }

    #[tokio::test]
    async fn interval_trigger_sets_tick() {
        let mut cfg = config(BucketType::Asynchronous);
        cfg.sync_time_in_sec = Some(30);
        let bucket = QuotaBucket::new(cfg, 1, DEFAULT_SYNC, clock()).unwrap();
        assert_eq!(bucket.tick_interval(), Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn calendar_rollover_resets_local_state() {
        let clock = clock();
        let bucket = QuotaBucket::new(
            config(BucketType::NonDistributed),
            1,
            DEFAULT_SYNC,
            clock.clone(),
        )
        .unwrap();
        {
            let mut state = bucket.lock_state().await;
            state.local_count = 7;
        }
        clock.advance(ChronoDuration::hours(2));
        let now = clock.now();
        let mut state = bucket.lock_state().await;
        let old_period = state.period;
        let period = bucket.refresh_period(&mut state, now);
        assert_ne!(period, old_period);
        assert!(period.start <= now && now < period.end);
        assert_eq!(state.local_count, 0);
    }

    #[tokio::test]
    async fn calendar_period_is_stable_within_window() {
        let clock = clock();
        let bucket = QuotaBucket::new(
            config(BucketType::NonDistributed),
            1,
            DEFAULT_SYNC,
            clock.clone(),
        )
        .unwrap();
        {
            let mut state = bucket.lock_state().await;
            state.local_count = 7;
        }
        clock.advance(ChronoDuration::seconds(10));
        let now = clock.now();
        let mut state = bucket.lock_state().await;
        let old_period = state.period;
        assert_eq!(bucket.refresh_period(&mut state, now), old_period);
        assert_eq!(state.local_count, 7);
    }

    #[tokio::test]
    async fn rolling_period_always_moves() {
        let clock = clock();
        let mut cfg = config(BucketType::NonDistributed);
        cfg.quota_type = QuotaType::RollingWindow;
        let bucket = QuotaBucket::new(cfg, 1, DEFAULT_SYNC, clock.clone()).unwrap();
        {
            let mut state = bucket.lock_state().await;
            state.local_count = 4;
        }
        clock.advance(ChronoDuration::seconds(1));
        let now = clock.now();
        let mut state = bucket.lock_state().await;
        let period = bucket.refresh_period(&mut state, now);
        assert_eq!(period.end, now);
        // Rolling windows never reset the counters.
        assert_eq!(state.local_count, 4);
    }

    #[test]
    fn bucket_type_parsing() {
        assert_eq!("Synchronous".parse::<BucketType>().unwrap(), BucketType::Synchronous);
        assert_eq!(" nonDistributed ".parse::<BucketType>().unwrap(), BucketType::NonDistributed);
        assert!(matches!(
            "sharded".parse::<BucketType>(),
            Err(QuotaError::InvalidBucketType(_))
        ));
    }

    #[test]
    fn async_state_estimate_and_clear() {
        let mut state = AsyncState::new(FlushTrigger::MessageCount(3));
        state.global_count = 5;
        state.buffer.push(2);
        state.buffered_total = 2;
        state.initialized = true;
        assert_eq!(state.estimate(), 7);
        state.clear_window();
        assert_eq!(state.estimate(), 0);
        assert!(state.buffer.is_empty());
        assert!(!state.initialized);
    }
}
