//! Storage for outstanding tickets of a refund-enabled bucket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::Instant;

use crate::scheduled::ScheduledTask;
use crate::ticket::Ticket;

/// Default lower bound for the sweep period.
pub(crate) const DEFAULT_SWEEP_FLOOR: Duration = Duration::from_secs(1);

/// Period at which expired tickets are swept for the given expiry.
///
/// Sweeping is linear in the number of outstanding tickets, so it never runs
/// more often than `floor`.
pub(crate) fn sweep_period(expiry: Duration, floor: Duration) -> Duration {
    (expiry / 4).max(floor)
}

/// Result of removing a ticket from the store.
#[derive(Debug)]
pub(crate) enum Taken {
    /// The ticket was present and had not yet expired.
    Live(Ticket),
    /// The ticket was present but had expired before a sweep got to it.
    Expired(Ticket),
}

/// Outstanding tickets keyed by ticket key.
pub(crate) struct TicketStore {
    entries: Mutex<HashMap<String, Ticket>>,
    closed: AtomicBool,
    sweeper: Mutex<Option<ScheduledTask<TicketStore>>>,
}

impl TicketStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        })
    }

    /// Start running `sweep` every `period`.
    ///
    /// The sweep task only holds a weak reference to the store and winds down
    /// by itself once the store is dropped.
    pub(crate) fn start_sweep<F>(self: &Arc<Self>, period: Duration, runtime: Handle, sweep: F)
    where
        F: Fn(&TicketStore) + Send + Sync + 'static,
    {
        let task = ScheduledTask::new(Arc::downgrade(self), period, true, runtime, sweep);
        *self.sweeper.lock() = Some(task);
    }

    /// Insert a ticket. Returns `false` if the store has been closed.
    pub(crate) fn put(&self, ticket: Ticket) -> bool {
        let mut entries = self.entries.lock();

        if self.is_closed() {
            return false;
        }

        entries.insert(ticket.key().to_owned(), ticket);
        true
    }

    /// Atomically look up and remove the ticket with the given key.
    pub(crate) fn take(&self, key: &str, now: Instant) -> Option<Taken> {
        let ticket = self.entries.lock().remove(key)?;

        if ticket.is_expired_at(now) {
            Some(Taken::Expired(ticket))
        } else {
            Some(Taken::Live(ticket))
        }
    }

    /// Remove and return every ticket which has expired as of `now`.
    pub(crate) fn evict_expired(&self, now: Instant) -> Vec<Ticket> {
        let mut entries = self.entries.lock();

        let expired = entries
            .iter()
            .filter(|(_, ticket)| ticket.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();

        expired
            .into_iter()
            .filter_map(|key| entries.remove(&key))
            .collect()
    }

    /// Number of tickets currently held.
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Stop sweeping and drop all tickets. Idempotent.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }

        let dropped = {
            let mut entries = self.entries.lock();
            let dropped = entries.len();
            entries.clear();
            dropped
        };

        trace!(dropped, "ticket store closed");
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .map_or(false, |sweeper| sweeper.is_running())
    }
}

#[cfg(test)]
mod tests {
    use super::{sweep_period, Taken, TicketStore};
    use crate::ticket::Ticket;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Weak};
    use tokio::runtime::Handle;
    use tokio::time::{self, Duration, Instant};

    fn ticket(count: usize, expiry: Duration) -> Ticket {
        let now = Instant::now();
        Ticket::issue(Weak::new(), None, count, now, Some(now + expiry))
    }

    #[test]
    fn test_sweep_period() {
        let floor = Duration::from_secs(1);
        assert_eq!(sweep_period(Duration::from_millis(1), floor), floor);
        assert_eq!(sweep_period(Duration::from_secs(4), floor), floor);
        assert_eq!(
            sweep_period(Duration::from_secs(60), floor),
            Duration::from_secs(15)
        );
        assert_eq!(
            sweep_period(Duration::from_millis(8), Duration::from_millis(1)),
            Duration::from_millis(2)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_is_exactly_once() {
        let store = TicketStore::new();
        let ticket = ticket(4, Duration::from_secs(10));
        let key = ticket.key().to_owned();

        assert!(store.put(ticket));
        assert_eq!(store.len(), 1);

        match store.take(&key, Instant::now()) {
            Some(Taken::Live(ticket)) => assert_eq!(ticket.count(), 4),
            other => panic!("expected live ticket, got {:?}", other),
        }

        assert!(store.take(&key, Instant::now()).is_none());
        assert!(store.take("unknown", Instant::now()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_rechecks_expiry() {
        let store = TicketStore::new();
        let ticket = ticket(2, Duration::from_millis(5));
        let key = ticket.key().to_owned();
        store.put(ticket);

        time::advance(Duration::from_millis(5)).await;

        assert!(matches!(
            store.take(&key, Instant::now()),
            Some(Taken::Expired(..))
        ));
        assert_eq!(store.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired() {
        let store = TicketStore::new();
        store.put(ticket(1, Duration::from_millis(5)));
        store.put(ticket(2, Duration::from_millis(5)));
        store.put(ticket(3, Duration::from_secs(60)));

        assert!(store.evict_expired(Instant::now()).is_empty());

        time::advance(Duration::from_millis(10)).await;

        let mut evicted = store
            .evict_expired(Instant::now())
            .iter()
            .map(Ticket::count)
            .collect::<Vec<_>>();
        evicted.sort();

        assert_eq!(evicted, vec![1, 2]);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_and_close() {
        let store = TicketStore::new();
        let swept = Arc::new(AtomicUsize::new(0));

        store.start_sweep(Duration::from_millis(10), Handle::current(), {
            let swept = swept.clone();
            move |store: &TicketStore| {
                let evicted = store.evict_expired(Instant::now());
                swept.fetch_add(evicted.len(), Ordering::SeqCst);
            }
        });

        assert!(store.is_sweeping());
        store.put(ticket(1, Duration::from_millis(1)));

        time::sleep(Duration::from_millis(15)).await;
        assert_eq!(swept.load(Ordering::SeqCst), 1);

        store.put(ticket(1, Duration::from_secs(60)));
        store.close();
        store.close();

        assert!(store.is_closed());
        assert!(!store.is_sweeping());
        assert_eq!(store.len(), 0);
        assert!(!store.put(ticket(1, Duration::from_secs(60))));
    }
}
