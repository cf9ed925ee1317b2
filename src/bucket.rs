use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::Instant;

use crate::config::{Builder, BucketConfig, RefundSettings, Settings};
use crate::error::{Error, OutOfTokensError};
use crate::observers::Observers;
use crate::registry::StoreRegistry;
use crate::scheduled::ScheduledTask;
use crate::store::{self, Taken, TicketStore};
use crate::ticket::Ticket;

/// A token bucket which issues [`Ticket`]s for the tokens taken from it.
///
/// Tokens are taken with [`take`] and returned either by [`drip`], by
/// refunding a ticket, or automatically by the configured auto-drip and
/// auto-refund behavior. The number of tokens never exceeds the capacity.
///
/// All operations are synchronous and may be called from any number of
/// threads. Background work (auto-drip and the expiry sweep) runs on Tokio.
///
/// Dropping the bucket disposes it.
///
/// [`take`]: TokenBucket::take
/// [`drip`]: TokenBucket::drip
pub struct TokenBucket {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    name: Option<String>,
    capacity: usize,
    refund: Option<RefundSettings>,
    state: Mutex<State>,
    tasks: Mutex<Tasks>,
    registry: StoreRegistry,
    dripped: Observers<usize>,
    tokens_taken: Observers<usize>,
    tokens_refunded: Observers<usize>,
}

/// Everything guarded by the bucket's lock.
struct State {
    tokens: usize,
    store: Option<Arc<TicketStore>>,
    disposed: bool,
}

#[derive(Default)]
struct Tasks {
    auto_drip: Option<ScheduledTask<Shared>>,
    orphan_watcher: Option<ScheduledTask<Shared>>,
}

impl TokenBucket {
    /// Construct a bucket through a builder.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Construct a bucket from a configuration.
    ///
    /// Background tasks run on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Config`] if the configuration is incomplete or
    /// invalid.
    pub fn new(config: BucketConfig) -> Result<Self, Error> {
        Builder::from_config(config).build()
    }

    pub(crate) fn from_settings(
        settings: Settings,
        registry: StoreRegistry,
        runtime: Option<Handle>,
    ) -> Self {
        let tokens = if settings.start_empty {
            0
        } else {
            settings.capacity
        };

        let shared = Arc::new(Shared {
            name: settings.name,
            capacity: settings.capacity,
            refund: settings.refund,
            state: Mutex::new(State {
                tokens,
                store: None,
                disposed: false,
            }),
            tasks: Mutex::new(Tasks::default()),
            registry,
            dripped: Observers::new("dripped", settings.dispatch, runtime.clone()),
            tokens_taken: Observers::new("tokens_taken", settings.dispatch, runtime.clone()),
            tokens_refunded: Observers::new("tokens_refunded", settings.dispatch, runtime.clone()),
        });

        // Validation guarantees a runtime whenever a task is needed.
        if let Some(runtime) = runtime {
            if let Some(refund) = settings.refund {
                shared.start_refunds(refund, settings.orphan_check_interval, &runtime);
            }

            if let Some((interval, amount)) = settings.auto_drip {
                shared.start_auto_drip(interval, amount, runtime);
            }
        }

        debug!(
            name = ?shared.name,
            capacity = shared.capacity,
            tokens,
            refund = shared.refund.is_some(),
            "token bucket constructed"
        );

        Self { shared }
    }

    /// The display name of the bucket.
    pub fn name(&self) -> Option<&str> {
        self.shared.name.as_deref()
    }

    /// The maximum number of tokens the bucket can hold.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// The number of tokens currently available.
    ///
    /// # Examples
    ///
    /// ```
    /// use ticket_bucket::TokenBucket;
    ///
    /// let bucket = TokenBucket::builder().capacity(10).build()?;
    /// assert_eq!(bucket.tokens(), 10);
    ///
    /// bucket.take(4)?;
    /// assert_eq!(bucket.tokens(), 6);
    /// # Ok::<_, ticket_bucket::Error>(())
    /// ```
    pub fn tokens(&self) -> usize {
        self.shared.state.lock().tokens
    }

    /// Test if tickets issued by this bucket can be refunded.
    ///
    /// If not, tokens taken from the bucket are never returned by any means.
    pub fn is_refund_enabled(&self) -> bool {
        self.shared.refund.is_some()
    }

    /// Test if expired tickets are refunded automatically.
    pub fn is_auto_refund_enabled(&self) -> bool {
        self.shared.is_auto_refund_enabled()
    }

    /// How long issued tickets can be refunded for.
    pub fn refund_ticket_expiry(&self) -> Option<Duration> {
        self.shared.refund.map(|refund| refund.expiry)
    }

    /// Test if the bucket has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// Number of issued tickets that can still be refunded.
    pub fn outstanding_tickets(&self) -> usize {
        self.shared
            .state
            .lock()
            .store
            .as_ref()
            .map_or(0, |store| store.len())
    }

    /// The registry the bucket's ticket store is registered with.
    pub fn registry(&self) -> &StoreRegistry {
        &self.shared.registry
    }

    /// Add `count` tokens to the bucket, saturating at the capacity.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidCount`] if `count` is zero and with
    /// [`Error::Disposed`] if the bucket has been disposed.
    pub fn drip(&self, count: usize) -> Result<(), Error> {
        self.shared.drip(count)
    }

    /// Take `count` tokens from the bucket.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidCount`] if `count` is zero, with
    /// [`Error::OutOfTokens`] if fewer than `count` tokens are available and
    /// with [`Error::Disposed`] if the bucket has been disposed. The bucket is
    /// left untouched on failure.
    ///
    /// # Examples
    ///
    /// ```
    /// use ticket_bucket::{Error, TokenBucket};
    ///
    /// let bucket = TokenBucket::builder().name("db").capacity(3).build()?;
    ///
    /// match bucket.take(4) {
    ///     Err(Error::OutOfTokens(e)) => {
    ///         assert_eq!(e.available(), 3);
    ///         assert_eq!(e.requested(), 4);
    ///         assert_eq!(e.bucket_name(), Some("db"));
    ///     }
    ///     other => panic!("unexpected: {:?}", other),
    /// }
    /// # Ok::<_, Error>(())
    /// ```
    pub fn take(&self, count: usize) -> Result<Ticket, Error> {
        self.shared.take(count)
    }

    /// Return the tokens of `ticket` to the bucket.
    ///
    /// This never fails. Returns the number of tokens returned, which is `0`
    /// if refunding is disabled, the ticket was not issued by this bucket, was
    /// already refunded, has expired, or the bucket has been disposed.
    pub fn refund(&self, ticket: &Ticket) -> usize {
        self.shared.refund(ticket)
    }

    /// Stop all background work and release the ticket store.
    ///
    /// Calling this more than once has no effect. After disposal `drip` and
    /// `take` fail with [`Error::Disposed`] and `refund` returns `0`.
    pub fn dispose(&self) {
        self.shared.dispose();
    }

    /// Notification raised after tokens are dripped into the bucket, manually
    /// or automatically.
    pub fn dripped(&self) -> &Observers<usize> {
        &self.shared.dripped
    }

    /// Notification raised after tokens are taken from the bucket.
    pub fn tokens_taken(&self) -> &Observers<usize> {
        &self.shared.tokens_taken
    }

    /// Notification raised after tokens are refunded, manually or
    /// automatically.
    pub fn tokens_refunded(&self) -> &Observers<usize> {
        &self.shared.tokens_refunded
    }
}

impl Drop for TokenBucket {
    fn drop(&mut self) {
        self.shared.dispose();
    }
}

impl fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();

        f.debug_struct("TokenBucket")
            .field("name", &self.shared.name)
            .field("tokens", &state.tokens)
            .field("capacity", &self.shared.capacity)
            .field("refund_enabled", &self.shared.refund.is_some())
            .field("disposed", &state.disposed)
            .finish()
    }
}

impl Shared {
    fn start_refunds(
        self: &Arc<Self>,
        refund: RefundSettings,
        orphan_check: Duration,
        runtime: &Handle,
    ) {
        let store = TicketStore::new();
        let period = store::sweep_period(refund.expiry, refund.sweep_floor);
        let bucket = Arc::downgrade(self);

        store.start_sweep(period, runtime.clone(), move |store: &TicketStore| {
            match bucket.upgrade() {
                Some(bucket) => bucket.sweep(store),
                // Nothing left to credit.
                None => drop(store.evict_expired(Instant::now())),
            }
        });

        self.registry.register(Arc::downgrade(self), store.clone());
        let watcher = self
            .registry
            .watch(Arc::downgrade(self), orphan_check, runtime.clone());

        self.state.lock().store = Some(store);
        self.tasks.lock().orphan_watcher = Some(watcher);

        trace!(?period, "ticket store sweeping");
    }

    fn start_auto_drip(self: &Arc<Self>, interval: Duration, amount: usize, runtime: Handle) {
        let task = ScheduledTask::new(
            Arc::downgrade(self),
            interval,
            true,
            runtime,
            move |bucket: &Shared| {
                if let Err(error) = bucket.drip(amount) {
                    debug!(%error, "automatic drip skipped");
                }
            },
        );

        self.tasks.lock().auto_drip = Some(task);
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    fn is_auto_refund_enabled(&self) -> bool {
        self.refund.map_or(false, |refund| refund.auto_refund)
    }

    fn disposed_error(&self) -> Error {
        Error::Disposed {
            name: self.name.clone(),
        }
    }

    fn credit(&self, state: &mut State, count: usize) {
        state.tokens = state.tokens.saturating_add(count).min(self.capacity);
    }

    fn drip(&self, count: usize) -> Result<(), Error> {
        if count == 0 {
            return Err(Error::InvalidCount { count });
        }

        {
            let mut state = self.state.lock();

            if state.disposed {
                return Err(self.disposed_error());
            }

            self.credit(&mut state, count);
            trace!(count, tokens = state.tokens, "dripped");
        }

        self.dripped.emit(count);
        Ok(())
    }

    fn take(self: &Arc<Self>, count: usize) -> Result<Ticket, Error> {
        if count == 0 {
            return Err(Error::InvalidCount { count });
        }

        let ticket = {
            let mut state = self.state.lock();

            if state.disposed {
                return Err(self.disposed_error());
            }

            if state.tokens < count {
                return Err(
                    OutOfTokensError::new(state.tokens, count, self.name.clone()).into(),
                );
            }

            let now = Instant::now();
            let expiry = self
                .refund
                .and_then(|refund| now.checked_add(refund.expiry));

            let ticket = Ticket::issue(
                Arc::downgrade(self),
                self.name.clone(),
                count,
                now,
                expiry,
            );

            if let Some(store) = &state.store {
                if !store.put(ticket.duplicate()) {
                    warn!(name = ?self.name, "ticket store closed, refusing to take tokens");
                    return Err(self.disposed_error());
                }
            }

            state.tokens = state.tokens.saturating_sub(count);
            trace!(count, tokens = state.tokens, key = ticket.key(), "tokens taken");
            ticket
        };

        self.tokens_taken.emit(count);
        Ok(ticket)
    }

    pub(crate) fn refund(&self, ticket: &Ticket) -> usize {
        let (refunded, auto_refunded) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            if state.disposed {
                return 0;
            }

            let taken = match &state.store {
                Some(store) => store.take(ticket.key(), Instant::now()),
                None => None,
            };

            match taken {
                Some(Taken::Live(ticket)) => {
                    self.credit(state, ticket.count());
                    (ticket.count(), 0)
                }
                // Found before the sweep got to it, settle it the same way.
                Some(Taken::Expired(ticket)) if self.is_auto_refund_enabled() => {
                    self.credit(state, ticket.count());
                    (0, ticket.count())
                }
                Some(Taken::Expired(..)) | None => return 0,
            }
        };

        trace!(
            refunded,
            auto_refunded,
            key = ticket.key(),
            "ticket refunded"
        );

        if auto_refunded > 0 {
            self.tokens_refunded.emit(auto_refunded);
        }

        if refunded > 0 {
            self.tokens_refunded.emit(refunded);
        }

        refunded
    }

    /// Evict expired tickets, crediting them back if auto-refund is enabled.
    fn sweep(&self, store: &TicketStore) {
        let credited = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            if state.disposed {
                return;
            }

            let expired = store.evict_expired(Instant::now());

            if expired.is_empty() {
                return;
            }

            if !self.is_auto_refund_enabled() {
                trace!(discarded = expired.len(), "expired tickets discarded");
                return;
            }

            let counts = expired.iter().map(Ticket::count).collect::<Vec<_>>();

            for &count in &counts {
                self.credit(state, count);
            }

            trace!(refunded = counts.len(), tokens = state.tokens, "expired tickets refunded");
            counts
        };

        for count in credited {
            self.tokens_refunded.emit(count);
        }
    }

    fn dispose(&self) {
        let store = {
            let mut state = self.state.lock();

            if state.disposed {
                return;
            }

            state.disposed = true;
            state.store.take()
        };

        let tasks = std::mem::take(&mut *self.tasks.lock());

        if let Some(task) = tasks.auto_drip {
            task.stop();
        }

        if let Some(store) = store {
            store.close();
            self.registry.deregister(&store);
        }

        if let Some(watcher) = tasks.orphan_watcher {
            watcher.stop();
        }

        debug!(name = ?self.name, "token bucket disposed");
    }
}
