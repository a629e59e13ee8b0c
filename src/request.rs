//! Typed request/response shapes exchanged with the API layer.
//!
//! The hosting API layer owns presence and primitive-type validation; by the
//! time a [`QuotaRequest`] exists, every field is well-typed. The engine only
//! checks semantic validity (enum membership, trigger exclusivity, period
//! ordering). Field spellings mirror the wire format.

use serde::{Deserialize, Serialize};

use crate::bucket::BucketType;
use crate::error::QuotaError;

/// One quota check: identifies the bucket and carries this call's weight.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaRequest {
    /// Tenant identifier.
    #[serde(rename = "edgeOrgID")]
    pub edge_org_id: String,
    /// Resource identifier, unique within the tenant.
    pub id: String,
    pub interval: u32,
    pub time_unit: String,
    #[serde(rename = "type", alias = "quotaType")]
    pub quota_type: String,
    #[serde(default)]
    pub precise_at_seconds_level: bool,
    /// UNIX seconds; defaults to request-receipt time when absent.
    #[serde(default, alias = "startTime")]
    pub start_timestamp: Option<i64>,
    pub max_count: i64,
    pub weight: i64,
    pub distributed: bool,
    #[serde(default)]
    pub synchronous: bool,
    #[serde(default)]
    pub sync_time_in_sec: Option<u64>,
    #[serde(default)]
    pub sync_message_count: Option<i64>,
}

impl QuotaRequest {
    /// Cache key for this request's bucket.
    pub fn cache_key(&self) -> String {
        format!("{}{}{}", self.edge_org_id, crate::cache::CACHE_KEY_DELIMITER, self.id)
    }

    /// Derive the bucket type from the `distributed`/`synchronous` flags.
    ///
    /// Non-distributed + synchronous is contradictory and rejected.
    pub fn bucket_type(&self) -> Result<BucketType, QuotaError> {
        match (self.distributed, self.synchronous) {
            (false, true) => Err(QuotaError::InvalidBucketType(
                "bucket cannot be both non-distributed and synchronous".into(),
            )),
            (false, false) => Ok(BucketType::NonDistributed),
            (true, true) => Ok(BucketType::Synchronous),
            (true, false) => Ok(BucketType::Asynchronous),
        }
    }
}

/// Outcome of one increment, serialized back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaResult {
    #[serde(rename = "edgeOrgID")]
    pub edge_org_id: String,
    pub id: String,
    pub max_count: i64,
    pub exceeded: bool,
    pub remaining_count: i64,
    /// Period start, epoch seconds.
    pub start_timestamp: i64,
    /// Period end, epoch seconds.
    pub expires_timestamp: i64,
}
