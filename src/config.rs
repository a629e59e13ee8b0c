//! Engine configuration.

use std::time::Duration;

/// Everything the engine needs injected at construction; there are no
/// process-wide globals.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL of the remote counting service. May stay empty when the
    /// engine is built with a non-HTTP [`crate::counter::CounterStore`].
    pub counter_service_url: String,
    /// Bearer token for the counting service, when it requires one.
    pub auth_token: Option<String>,
    /// Uniform TTL for bucket cache entries.
    pub cache_ttl: Duration,
    /// Reconciler tick interval when a bucket configures neither
    /// `syncTimeInSec` nor `syncMessageCount`, and the safety-net cadence
    /// for message-count buckets.
    pub default_sync_interval: Duration,
    /// Consecutive empty-buffer ticks before the reconciler evicts its
    /// bucket and stops.
    pub idle_ticks_before_evict: u32,
    /// Per-call timeout for counting service requests.
    pub request_timeout: Duration,
    /// Connect timeout for the counting service client.
    pub connect_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            counter_service_url: String::new(),
            auth_token: None,
            cache_ttl: Duration::from_secs(60),
            default_sync_interval: Duration::from_secs(300),
            idle_ticks_before_evict: 3,
            request_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    pub fn with_counter_service(url: impl Into<String>, token: Option<String>) -> Self {
        Self { counter_service_url: url.into(), auth_token: token, ..Self::default() }
    }
}
