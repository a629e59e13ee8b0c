//! Error types for the quota engine

/// Unified error type for quota operations.
#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    /// The requested time unit is not one of the accepted set.
    #[error("invalid quota time unit '{0}' (expected second, minute, hour, day, week, or month)")]
    InvalidTimeUnit(String),
    /// The requested quota type is not one of the accepted set.
    #[error("invalid quota type '{0}' (expected calendar or rollingwindow)")]
    InvalidQuotaType(String),
    /// The requested bucket type (or flag combination) is not valid.
    #[error("invalid quota bucket type: {0}")]
    InvalidBucketType(String),
    /// A resolved or supplied period had `start >= end`.
    #[error("invalid quota period: start ({start}) must be before end ({end})")]
    InvalidPeriod { start: i64, end: i64 },
    /// The supplied start timestamp cannot be represented as a UTC instant.
    #[error("start timestamp {0} is outside the representable time range")]
    InvalidStartTime(i64),
    /// Both `syncTimeInSec` and `syncMessageCount` were configured.
    #[error("both syncTimeInSec and syncMessageCount are set; exactly one flush trigger is allowed")]
    AmbiguousSyncTrigger,
    /// An asynchronous operation found a bucket without async counting state.
    ///
    /// This is an internal invariant violation: buckets constructed through
    /// [`crate::bucket::QuotaBucket::new`] always carry async state when their
    /// bucket type is asynchronous.
    #[error("asynchronous bucket has no async counting state")]
    MissingAsyncState,
    /// The remote counting service call failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl QuotaError {
    /// True for configuration/validation errors that should be surfaced to the
    /// caller as a rejected request and never retried.
    pub fn is_invalid_config(&self) -> bool {
        matches!(
            self,
            Self::InvalidTimeUnit(_)
                | Self::InvalidQuotaType(_)
                | Self::InvalidBucketType(_)
                | Self::InvalidPeriod { .. }
                | Self::InvalidStartTime(_)
                | Self::AmbiguousSyncTrigger
        )
    }

    /// True when the error came from the remote counting service.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}

/// Failure talking to the remote counting service.
///
/// Any of these is a hard failure for the call that produced it; whether it
/// fails the caller's request depends on the counting strategy (synchronous
/// buckets abort, the async reconciler logs and retries).
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// No counter-service base URL was configured.
    #[error("counter service base URL is not configured")]
    BaseUrlMissing,
    /// Connection, TLS, or timeout failure before a response arrived.
    #[error("counter service request failed: {0}")]
    Transport(String),
    /// The service answered with a non-200 status.
    #[error("counter service returned status {status}: {body}")]
    Status { status: u16, body: String },
    /// The response body was not the expected `{"count": n}` shape.
    #[error("unparseable counter service response: {0}")]
    InvalidResponse(String),
    /// Failure injected by a test double.
    #[error("counter service unavailable")]
    Unavailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_time_unit_display_names_the_unit() {
        let err = QuotaError::InvalidTimeUnit("fortnight".into());
        let msg = err.to_string();
        assert!(msg.contains("fortnight"));
        assert!(err.is_invalid_config());
        assert!(!err.is_remote());
    }

    #[test]
    fn invalid_period_display_carries_bounds() {
        let err = QuotaError::InvalidPeriod { start: 200, end: 100 };
        let msg = err.to_string();
        assert!(msg.contains("200"));
        assert!(msg.contains("100"));
    }

    #[test]
    fn remote_errors_are_transparent() {
        let err = QuotaError::from(RemoteError::Status { status: 503, body: "oops".into() });
        assert!(err.is_remote());
        assert!(!err.is_invalid_config());
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn ambiguous_trigger_is_config_error() {
        assert!(QuotaError::AmbiguousSyncTrigger.is_invalid_config());
    }

    #[test]
    fn invalid_start_time_is_config_error() {
        let err = QuotaError::InvalidStartTime(i64::MAX);
        assert!(err.is_invalid_config());
        assert!(err.to_string().contains(&i64::MAX.to_string()));
    }
}
