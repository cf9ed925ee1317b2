#![deny(missing_docs)]
//! A token bucket which issues refundable tickets against its capacity.
//!
//! Taking tokens from a [`TokenBucket`] hands out a [`Ticket`] describing the
//! claim. If the bucket is configured to allow refunds, the ticket can be
//! handed back within its expiry to return its tokens. Tickets that expire
//! without being refunded are either lost or, with auto-refund enabled,
//! returned to the bucket by a periodic sweep.
//!
//! Buckets can also be replenished periodically through auto-drip.
//!
//! ## Usage
//!
//! Add the following to your `Cargo.toml`:
//!
//! ```toml
//! ticket-bucket = "0.1.0"
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use ticket_bucket::TokenBucket;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ticket_bucket::Error> {
//!     let bucket = TokenBucket::builder()
//!         .name("outbound")
//!         .capacity(100)
//!         .auto_drip(Duration::from_secs(1), 10)
//!         .refund(Duration::from_secs(30))
//!         .auto_refund(true)
//!         .build()?;
//!
//!     let ticket = bucket.take(25)?;
//!     println!("{} tokens left", bucket.tokens());
//!
//!     // The work failed, give the tokens back.
//!     bucket.refund(&ticket);
//!     Ok(())
//! }
//! ```
//!
//! ## Background tasks
//!
//! Auto-drip and the expiry sweep run as Tokio tasks, so buckets using either
//! must be built inside a runtime or be given one through
//! [`Builder::runtime`]. A plain bucket with neither works anywhere.
//!
//! Background tasks only hold weak references to the bucket. Dropping or
//! [disposing] the bucket stops them. As an additional safety net, the
//! ticket stores of refund-enabled buckets are tracked by a
//! [`StoreRegistry`] which reclaims stores left behind by buckets that are no
//! longer alive.
//!
//! ## Features
//!
//! * `tracing` (default) - emit diagnostics through [tracing].
//! * `serde` - (de)serialize [`BucketConfig`] and friends.
//!
//! [disposing]: TokenBucket::dispose
//! [tracing]: https://docs.rs/tracing

#[cfg(feature = "tracing")]
macro_rules! trace {
    ($($arg:tt)*) => {
        tracing::trace!($($arg)*)
    };
}

#[cfg(feature = "tracing")]
macro_rules! debug {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

#[cfg(feature = "tracing")]
macro_rules! warn {
    ($($arg:tt)*) => {
        tracing::warn!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
macro_rules! warn {
    ($($arg:tt)*) => {};
}

mod bucket;
mod config;
mod error;
mod observers;
mod registry;
mod scheduled;
mod store;
mod ticket;

pub use self::bucket::TokenBucket;
pub use self::config::{
    AutoDripConfig, AutoRefundConfig, BehaviorConfig, BucketConfig, Builder, RefundConfig,
};
pub use self::error::{ConfigError, Error, OutOfTokensError};
pub use self::observers::{Dispatch, ObserverId, Observers};
pub use self::registry::StoreRegistry;
pub use self::scheduled::ScheduledTask;
pub use self::ticket::Ticket;
