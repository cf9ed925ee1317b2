use std::fmt;
use std::sync::Weak;

use rand::Rng as _;
use tokio::time::Instant;

use crate::bucket::Shared;
use crate::error::Error;

/// Number of random bytes in a ticket key.
const KEY_BYTES: usize = 8;

/// A claim against a [`TokenBucket`]'s capacity.
///
/// A ticket records how many tokens were taken, when, and until when they
/// can be refunded. It refers back to the bucket that issued it without
/// keeping that bucket alive: once the bucket is disposed or dropped the
/// ticket is [orphaned] and refunding it does nothing.
///
/// [`TokenBucket`]: crate::TokenBucket
/// [orphaned]: Ticket::is_orphaned
pub struct Ticket {
    key: String,
    count: usize,
    source_bucket_name: Option<String>,
    issue_time: Instant,
    expiry_time: Option<Instant>,
    refunded: bool,
    source: Weak<Shared>,
}

impl Ticket {
    pub(crate) fn issue(
        source: Weak<Shared>,
        source_bucket_name: Option<String>,
        count: usize,
        issue_time: Instant,
        expiry_time: Option<Instant>,
    ) -> Self {
        Self {
            key: new_key(),
            count,
            source_bucket_name,
            issue_time,
            expiry_time,
            refunded: false,
            source,
        }
    }

    /// Copy of this ticket with its own `refunded` flag.
    pub(crate) fn duplicate(&self) -> Self {
        Self {
            key: self.key.clone(),
            count: self.count,
            source_bucket_name: self.source_bucket_name.clone(),
            issue_time: self.issue_time,
            expiry_time: self.expiry_time,
            refunded: false,
            source: self.source.clone(),
        }
    }

    /// The unique key identifying this ticket.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The number of tokens this ticket represents.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Name of the bucket that issued this ticket.
    pub fn source_bucket_name(&self) -> Option<&str> {
        self.source_bucket_name.as_deref()
    }

    /// When the ticket was issued.
    pub fn issue_time(&self) -> Instant {
        self.issue_time
    }

    /// When the ticket expires.
    ///
    /// `None` if the issuing bucket does not allow refunds, in which case the
    /// ticket never expires but can never be refunded either.
    pub fn expiry_time(&self) -> Option<Instant> {
        self.expiry_time
    }

    /// Test if the ticket has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub(crate) fn is_expired_at(&self, now: Instant) -> bool {
        self.expiry_time.map_or(false, |expiry| expiry <= now)
    }

    /// Test if [`refund`] has been called on this ticket.
    ///
    /// This only reflects that a refund was attempted, not that the bucket
    /// honored it.
    ///
    /// [`refund`]: Ticket::refund
    pub fn was_refunded(&self) -> bool {
        self.refunded
    }

    /// Test if the issuing bucket has been disposed or dropped.
    pub fn is_orphaned(&self) -> bool {
        self.source
            .upgrade()
            .map_or(true, |source| source.is_disposed())
    }

    /// Return this ticket's tokens to the issuing bucket.
    ///
    /// Returns the number of tokens the bucket took back. Only the first call
    /// on a given ticket reaches the bucket; later calls return `0`.
    pub fn refund(&mut self) -> usize {
        if self.refunded {
            return 0;
        }

        let refunded = match self.source.upgrade() {
            Some(source) => source.refund(self),
            None => 0,
        };

        self.refunded = true;
        refunded
    }

    /// Construct a copy of this ticket with a fresh `refunded` flag.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Orphaned`] if the issuing bucket has been disposed
    /// or dropped.
    pub fn try_clone(&self) -> Result<Ticket, Error> {
        if self.is_orphaned() {
            return Err(Error::Orphaned {
                key: self.key.clone(),
            });
        }

        Ok(self.duplicate())
    }
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket")
            .field("key", &self.key)
            .field("count", &self.count)
            .field("source_bucket_name", &self.source_bucket_name)
            .field("issue_time", &self.issue_time)
            .field("expiry_time", &self.expiry_time)
            .field("refunded", &self.refunded)
            .finish()
    }
}

fn new_key() -> String {
    let mut bytes = [0u8; KEY_BYTES];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}
