//! Bucket configuration.
//!
//! A [`BucketConfig`] is plain data and can be filled in directly (or
//! deserialized with the `serde` feature). [`Builder`] is the fluent way of
//! producing one and constructing the bucket in one go.

use std::time::Duration;

use tokio::runtime::Handle;

use crate::bucket::TokenBucket;
use crate::error::{ConfigError, Error};
use crate::observers::Dispatch;
use crate::registry::{StoreRegistry, DEFAULT_ORPHAN_CHECK_INTERVAL};
use crate::store::DEFAULT_SWEEP_FLOOR;

/// Longest duration accepted for any interval or expiry.
pub(crate) const MAX_DURATION: Duration = Duration::from_secs(86400 * 365 * 30);

fn check_duration(field: &'static str, duration: Duration) -> Result<Duration, ConfigError> {
    if duration > MAX_DURATION {
        return Err(ConfigError::DurationTooLong {
            field,
            max: MAX_DURATION,
        });
    }

    Ok(duration)
}

/// Configuration for a [`TokenBucket`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BucketConfig {
    /// Display name, used in diagnostics and error messages.
    pub bucket_name: Option<String>,
    /// Maximum number of tokens the bucket can hold. Required.
    pub capacity: Option<usize>,
    /// Start with zero tokens instead of a full bucket.
    pub start_empty: bool,
    /// Periodic replenishment.
    pub automatic_drip: Option<AutoDripConfig>,
    /// Refund behavior.
    pub behavior: Option<BehaviorConfig>,
    /// How notification observers are invoked.
    pub dispatch: Dispatch,
    /// How often a refund-enabled bucket checks whether it has been orphaned.
    /// Defaults to two minutes.
    pub orphan_check_interval: Option<Duration>,
}

/// Automatic drip configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct AutoDripConfig {
    /// Whether tokens are dripped automatically.
    pub enabled: bool,
    /// Interval between drips.
    pub interval: Duration,
    /// Tokens added per drip.
    pub amount: usize,
}

/// Behavioral configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BehaviorConfig {
    /// Refund behavior.
    pub refund: Option<RefundConfig>,
}

/// Refund configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RefundConfig {
    /// Whether tickets can be refunded. If disabled, taken tokens are never
    /// returned by any means.
    pub enabled: bool,
    /// How long a ticket can be refunded for. Required when enabled.
    pub refund_ticket_expiry: Option<Duration>,
    /// Automatic refunding of expired tickets.
    pub auto_refund: Option<AutoRefundConfig>,
    /// Lower bound for the period at which expired tickets are swept.
    /// Defaults to one second.
    pub sweep_floor: Option<Duration>,
}

/// Automatic refund configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct AutoRefundConfig {
    /// Whether expired tickets are refunded automatically.
    pub enabled: bool,
}

/// Validated refund settings.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RefundSettings {
    pub(crate) expiry: Duration,
    pub(crate) auto_refund: bool,
    pub(crate) sweep_floor: Duration,
}

/// Validated bucket settings.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) name: Option<String>,
    pub(crate) capacity: usize,
    pub(crate) start_empty: bool,
    pub(crate) auto_drip: Option<(Duration, usize)>,
    pub(crate) refund: Option<RefundSettings>,
    pub(crate) dispatch: Dispatch,
    pub(crate) orphan_check_interval: Duration,
}

impl Settings {
    /// Test if the bucket needs to run background tasks.
    pub(crate) fn needs_runtime(&self) -> bool {
        self.auto_drip.is_some() || self.refund.is_some()
    }
}

impl BucketConfig {
    /// Validate the configuration.
    pub(crate) fn validate(&self) -> Result<Settings, ConfigError> {
        let capacity = self.capacity.ok_or(ConfigError::MissingCapacity)?;

        let auto_drip = match &self.automatic_drip {
            Some(drip) if drip.enabled => {
                if drip.interval.is_zero() {
                    return Err(ConfigError::ZeroDripInterval);
                }

                if drip.amount == 0 {
                    return Err(ConfigError::ZeroDripAmount);
                }

                Some((check_duration("interval", drip.interval)?, drip.amount))
            }
            _ => None,
        };

        let refund = match self.behavior.as_ref().and_then(|b| b.refund.as_ref()) {
            Some(refund) if refund.enabled => {
                let expiry = refund
                    .refund_ticket_expiry
                    .ok_or(ConfigError::MissingRefundExpiry)?;

                if expiry.is_zero() {
                    return Err(ConfigError::ZeroRefundExpiry);
                }

                let expiry = check_duration("refund_ticket_expiry", expiry)?;

                let sweep_floor = refund.sweep_floor.unwrap_or(DEFAULT_SWEEP_FLOOR);

                if sweep_floor.is_zero() {
                    return Err(ConfigError::ZeroSweepFloor);
                }

                let sweep_floor = check_duration("sweep_floor", sweep_floor)?;

                Some(RefundSettings {
                    expiry,
                    auto_refund: refund.auto_refund.as_ref().map_or(false, |a| a.enabled),
                    sweep_floor,
                })
            }
            _ => None,
        };

        let orphan_check_interval = self
            .orphan_check_interval
            .unwrap_or(DEFAULT_ORPHAN_CHECK_INTERVAL);

        if orphan_check_interval.is_zero() {
            return Err(ConfigError::ZeroOrphanCheckInterval);
        }

        let orphan_check_interval =
            check_duration("orphan_check_interval", orphan_check_interval)?;

        Ok(Settings {
            name: self.bucket_name.clone(),
            capacity,
            start_empty: self.start_empty,
            auto_drip,
            refund,
            dispatch: self.dispatch,
            orphan_check_interval,
        })
    }

    fn refund_mut(&mut self) -> &mut RefundConfig {
        self.behavior
            .get_or_insert_with(BehaviorConfig::default)
            .refund
            .get_or_insert_with(RefundConfig::default)
    }
}

/// Builder for a [`TokenBucket`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use ticket_bucket::TokenBucket;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), ticket_bucket::Error> {
/// let bucket = TokenBucket::builder()
///     .name("uploads")
///     .capacity(10)
///     .refund(Duration::from_secs(30))
///     .auto_refund(true)
///     .build()?;
///
/// let ticket = bucket.take(4)?;
/// assert_eq!(bucket.tokens(), 6);
/// assert_eq!(bucket.refund(&ticket), 4);
/// assert_eq!(bucket.tokens(), 10);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct Builder {
    config: BucketConfig,
    registry: Option<StoreRegistry>,
    runtime: Option<Handle>,
}

impl Builder {
    /// Start from an existing configuration.
    pub fn from_config(config: BucketConfig) -> Self {
        Self {
            config,
            registry: None,
            runtime: None,
        }
    }

    /// Set the display name of the bucket.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.bucket_name = Some(name.into());
        self
    }

    /// Set the capacity of the bucket.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = Some(capacity);
        self
    }

    /// Start with zero tokens instead of a full bucket.
    pub fn start_empty(mut self, start_empty: bool) -> Self {
        self.config.start_empty = start_empty;
        self
    }

    /// Drip `amount` tokens into the bucket every `interval`.
    pub fn auto_drip(mut self, interval: Duration, amount: usize) -> Self {
        self.config.automatic_drip = Some(AutoDripConfig {
            enabled: true,
            interval,
            amount,
        });
        self
    }

    /// Allow tickets to be refunded for `expiry` after they were issued.
    ///
    /// Refunding sweeps expired tickets in the background, so the bucket
    /// must be built inside a Tokio runtime or be given one through
    /// [`Builder::runtime`]. This holds even without [`auto_refund`].
    ///
    /// [`auto_refund`]: Builder::auto_refund
    pub fn refund(mut self, expiry: Duration) -> Self {
        let refund = self.config.refund_mut();
        refund.enabled = true;
        refund.refund_ticket_expiry = Some(expiry);
        self
    }

    /// Refund expired tickets automatically.
    ///
    /// Has no effect unless refunding is enabled.
    pub fn auto_refund(mut self, enabled: bool) -> Self {
        self.config.refund_mut().auto_refund = Some(AutoRefundConfig { enabled });
        self
    }

    /// Lower bound for the period at which expired tickets are swept.
    pub fn sweep_floor(mut self, floor: Duration) -> Self {
        self.config.refund_mut().sweep_floor = Some(floor);
        self
    }

    /// How notification observers are invoked.
    pub fn dispatch(mut self, dispatch: Dispatch) -> Self {
        self.config.dispatch = dispatch;
        self
    }

    /// How often the bucket checks whether it has been orphaned.
    pub fn orphan_check_interval(mut self, interval: Duration) -> Self {
        self.config.orphan_check_interval = Some(interval);
        self
    }

    /// Register the bucket's ticket store with a shared registry.
    ///
    /// Without one, the bucket uses a registry of its own.
    pub fn registry(mut self, registry: StoreRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Run background tasks on the given runtime instead of the current one.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Construct the bucket.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Config`] if the configuration is incomplete or
    /// invalid, or if background tasks are needed and no Tokio runtime is
    /// available.
    pub fn build(self) -> Result<TokenBucket, Error> {
        let settings = self.config.validate()?;

        let runtime = match self.runtime {
            Some(runtime) => Some(runtime),
            None => Handle::try_current().ok(),
        };

        if settings.needs_runtime() && runtime.is_none() {
            return Err(ConfigError::NoRuntime.into());
        }

        Ok(TokenBucket::from_settings(
            settings,
            self.registry.unwrap_or_default(),
            runtime,
        ))
    }
}
