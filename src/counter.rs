//! Remote counting service client.
//!
//! The counting service is the authoritative counter keyed by
//! (tenant, resource, window). [`CounterStore`] abstracts it so the engine
//! can run against the real HTTP service ([`HttpCounterStore`]) or an
//! in-process counter ([`InMemoryCounterStore`]) in tests and local setups.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::RemoteError;

/// Client-side contract of the remote counting service.
#[async_trait]
pub trait CounterStore: Send + Sync + std::fmt::Debug {
    /// Add `delta` to the counter for `(org_id, key)` within the
    /// `[start_ms, end_ms)` window and return the post-increment count.
    ///
    /// `delta = 0` reads the current count without mutating it.
    async fn increment_and_count(
        &self,
        org_id: &str,
        key: &str,
        delta: i64,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<i64, RemoteError>;
}

/// Convenience wrapper for the read-only case.
pub async fn get_count(
    store: &dyn CounterStore,
    org_id: &str,
    key: &str,
    start_ms: i64,
    end_ms: i64,
) -> Result<i64, RemoteError> {
    store.increment_and_count(org_id, key, 0, start_ms, end_ms).await
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct CounterRequest<'a> {
    org_id: &'a str,
    key: &'a str,
    delta: i64,
    start_time: i64,
    end_time: i64,
}

#[derive(serde::Deserialize)]
struct CounterResponse {
    count: i64,
}

/// HTTP client for the counting service.
///
/// POSTs `{orgId, key, delta, startTime, endTime}` (times in epoch
/// milliseconds) to the configured base URL with an optional bearer token;
/// expects `{"count": n}` on 200, and treats every other status as a hard
/// failure for that call.
#[derive(Debug, Clone)]
pub struct HttpCounterStore {
    http: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpCounterStore {
    pub fn new(
        base_url: impl Into<String>,
        bearer_token: Option<String>,
        request_timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let base_url = base_url.into();
        if base_url.is_empty() {
            return Err(RemoteError::BaseUrlMissing);
        }
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        Ok(Self { http, base_url, bearer_token })
    }
}

#[async_trait]
impl CounterStore for HttpCounterStore {
    async fn increment_and_count(
        &self,
        org_id: &str,
        key: &str,
        delta: i64,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<i64, RemoteError> {
        let body = CounterRequest { org_id, key, delta, start_time: start_ms, end_time: end_ms };

        let mut request = self
            .http
            .post(&self.base_url)
            .header("Accept", "application/json")
            .json(&body);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| RemoteError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let text =
            response.text().await.map_err(|e| RemoteError::Transport(e.to_string()))?;
        if status != 200 {
            return Err(RemoteError::Status { status, body: text });
        }

        parse_count(&text)
    }
}

/// Pure response parsing, split out so it is testable without a server.
fn parse_count(body: &str) -> Result<i64, RemoteError> {
    let parsed: CounterResponse =
        serde_json::from_str(body).map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;
    Ok(parsed.count)
}

type WindowKey = (String, String, i64, i64);

/// In-process counter with the same window-keyed semantics as the service.
///
/// Records every delta it receives and can be switched into a failing mode,
/// which is what the strategy and reconciler tests drive against.
#[derive(Debug, Default, Clone)]
pub struct InMemoryCounterStore {
    counts: Arc<Mutex<HashMap<WindowKey, i64>>>,
    deltas: Arc<Mutex<Vec<i64>>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`RemoteError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// All deltas received so far, in call order (including zero reads).
    pub fn recorded_deltas(&self) -> Vec<i64> {
        self.deltas.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    /// Number of calls that reached the store.
    pub fn call_count(&self) -> usize {
        self.deltas.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    /// Current count for a window, 0 when untouched.
    pub fn count_for(&self, org_id: &str, key: &str, start_ms: i64, end_ms: i64) -> i64 {
        let counts = self.counts.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        counts
            .get(&(org_id.to_string(), key.to_string(), start_ms, end_ms))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment_and_count(
        &self,
        org_id: &str,
        key: &str,
        delta: i64,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<i64, RemoteError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable);
        }
        self.deltas.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(delta);
        let mut counts = self.counts.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = counts
            .entry((org_id.to_string(), key.to_string(), start_ms, end_ms))
            .or_insert(0);
        *entry += delta;
        Ok(*entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_count_accepts_service_shape() {
        assert_eq!(parse_count(r#"{"count": 42}"#).unwrap(), 42);
        assert_eq!(parse_count(r#"{"count": 0, "extra": true}"#).unwrap(), 0);
    }

    #[test]
    fn parse_count_rejects_missing_field() {
        assert!(matches!(
            parse_count(r#"{"total": 42}"#),
            Err(RemoteError::InvalidResponse(_))
        ));
        assert!(parse_count("not json").is_err());
    }

    #[test]
    fn http_store_requires_base_url() {
        let err = HttpCounterStore::new(
            "",
            None,
            Duration::from_secs(60),
            Duration::from_secs(10),
        )
        .unwrap_err();
        assert!(matches!(err, RemoteError::BaseUrlMissing));
    }

    #[tokio::test]
    async fn in_memory_store_is_window_keyed() {
        let store = InMemoryCounterStore::new();
        assert_eq!(store.increment_and_count("org", "res", 3, 0, 1000).await.unwrap(), 3);
        assert_eq!(store.increment_and_count("org", "res", 2, 0, 1000).await.unwrap(), 5);
        // Different window counts from zero.
        assert_eq!(store.increment_and_count("org", "res", 1, 1000, 2000).await.unwrap(), 1);
        // delta 0 reads without mutating.
        assert_eq!(store.increment_and_count("org", "res", 0, 0, 1000).await.unwrap(), 5);
        assert_eq!(store.recorded_deltas(), vec![3, 2, 1, 0]);
    }

    #[tokio::test]
    async fn get_count_reads_without_charging() {
        let store = InMemoryCounterStore::new();
        store.increment_and_count("org", "res", 4, 0, 1000).await.unwrap();
        assert_eq!(get_count(&store, "org", "res", 0, 1000).await.unwrap(), 4);
        assert_eq!(store.count_for("org", "res", 0, 1000), 4);
    }

    #[tokio::test]
    async fn in_memory_store_failure_toggle() {
        let store = InMemoryCounterStore::new();
        store.set_failing(true);
        assert!(matches!(
            store.increment_and_count("org", "res", 1, 0, 1000).await,
            Err(RemoteError::Unavailable)
        ));
        assert_eq!(store.call_count(), 0);
        store.set_failing(false);
        assert_eq!(store.increment_and_count("org", "res", 1, 0, 1000).await.unwrap(), 1);
    }
}
