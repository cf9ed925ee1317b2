use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Error type for token bucket operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    /// The bucket could not be constructed from the given configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A token count of zero was passed to `drip` or `take`.
    #[error("'count' must be a number greater than zero (received {count})")]
    InvalidCount {
        /// The rejected count.
        count: usize,
    },
    /// The bucket does not hold enough tokens to satisfy a `take`.
    #[error(transparent)]
    OutOfTokens(#[from] OutOfTokensError),
    /// The bucket that issued a ticket no longer exists.
    #[error("ticket '{key}' is orphaned and cannot be cloned")]
    Orphaned {
        /// Key of the orphaned ticket.
        key: String,
    },
    /// The bucket has been disposed.
    #[error("{} has been disposed", BucketLabel(.name.as_deref()))]
    Disposed {
        /// Name of the disposed bucket, if it has one.
        name: Option<String>,
    },
}

/// Invalid or missing construction parameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// No capacity was configured.
    #[error("token bucket configuration is missing 'capacity'")]
    MissingCapacity,
    /// Refunding was enabled without a ticket expiry.
    #[error("refunding is enabled but 'refund_ticket_expiry' is missing")]
    MissingRefundExpiry,
    /// The refund ticket expiry must be non-zero.
    #[error("'refund_ticket_expiry' must be greater than zero")]
    ZeroRefundExpiry,
    /// The sweep floor must be non-zero.
    #[error("'sweep_floor' must be greater than zero")]
    ZeroSweepFloor,
    /// Automatic drip was enabled without an interval.
    #[error("automatic drip is enabled but 'interval' is missing or zero")]
    ZeroDripInterval,
    /// Automatic drip was enabled without an amount.
    #[error("automatic drip is enabled but 'amount' is missing or zero")]
    ZeroDripAmount,
    /// The orphan check interval must be non-zero.
    #[error("'orphan_check_interval' must be greater than zero")]
    ZeroOrphanCheckInterval,
    /// A duration is too long to schedule against the clock.
    #[error("'{field}' is too long, at most {max:?} is supported")]
    DurationTooLong {
        /// Name of the offending setting.
        field: &'static str,
        /// Longest supported duration.
        max: Duration,
    },
    /// Background tasks were requested outside of a Tokio runtime.
    #[error("automatic drip and refunding require a Tokio runtime")]
    NoRuntime,
}

/// Raised when a `take` asks for more tokens than the bucket holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutOfTokensError {
    available: usize,
    requested: usize,
    bucket_name: Option<String>,
}

impl OutOfTokensError {
    pub(crate) fn new(available: usize, requested: usize, bucket_name: Option<String>) -> Self {
        Self {
            available,
            requested,
            bucket_name,
        }
    }

    /// Tokens the bucket held when the request was rejected.
    pub fn available(&self) -> usize {
        self.available
    }

    /// Tokens that were requested.
    pub fn requested(&self) -> usize {
        self.requested
    }

    /// Name of the bucket that rejected the request.
    pub fn bucket_name(&self) -> Option<&str> {
        self.bucket_name.as_deref()
    }
}

impl fmt::Display for OutOfTokensError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} does not have enough tokens to fulfil the request. Available: {}, requested: {}",
            BucketLabel(self.bucket_name.as_deref()),
            self.available,
            self.requested
        )
    }
}

impl std::error::Error for OutOfTokensError {}

struct BucketLabel<'a>(Option<&'a str>);

impl fmt::Display for BucketLabel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(name) => write!(f, "Token Bucket '{}'", name),
            None => write!(f, "The given token bucket"),
        }
    }
}
