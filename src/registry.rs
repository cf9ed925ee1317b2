//! Safety net for ticket stores whose bucket went away without being disposed.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::scheduled::ScheduledTask;
use crate::store::TicketStore;

/// Default period at which buckets check whether they have been orphaned.
pub(crate) const DEFAULT_ORPHAN_CHECK_INTERVAL: Duration = Duration::from_secs(120);

struct Entry {
    owner: Weak<dyn Any + Send + Sync>,
    store: Arc<TicketStore>,
}

/// Tracks the ticket stores of refund-enabled buckets.
///
/// Each store is registered together with a weak reference to the bucket
/// owning it. If a bucket disappears without closing its store, the store is
/// closed here the next time an orphaned owner is detected.
///
/// This is a secondary safety net. Dropping a [`TokenBucket`] disposes it,
/// which closes and deregisters its store while the bucket is still alive,
/// so the registry only reclaims stores whose owner went away without
/// passing through that path.
///
/// A registry is cheap to clone and clones share their entries. Buckets
/// constructed with the same registry watch over each other.
///
/// [`TokenBucket`]: crate::TokenBucket
#[derive(Clone, Default)]
pub struct StoreRegistry {
    entries: Arc<Mutex<Vec<Entry>>>,
}

impl StoreRegistry {
    /// Construct an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register<O>(&self, owner: Weak<O>, store: Arc<TicketStore>)
    where
        O: Send + Sync + 'static,
    {
        let owner: Weak<dyn Any + Send + Sync> = owner;
        self.entries.lock().push(Entry { owner, store });
    }

    /// Remove `store` without closing it. Returns `false` if it was not
    /// registered.
    pub(crate) fn deregister(&self, store: &Arc<TicketStore>) -> bool {
        let mut entries = self.entries.lock();

        match entries
            .iter()
            .position(|entry| Arc::ptr_eq(&entry.store, store))
        {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Close and remove the first store whose owner is gone.
    ///
    /// Returns `true` if a store was reclaimed.
    pub fn reap_orphan(&self) -> bool {
        let entry = {
            let mut entries = self.entries.lock();

            match entries
                .iter()
                .position(|entry| entry.owner.strong_count() == 0)
            {
                Some(index) => entries.remove(index),
                None => return false,
            }
        };

        entry.store.close();
        debug!("closed orphaned ticket store");
        true
    }

    /// Close and remove every store whose owner is gone.
    ///
    /// Returns the number of stores reclaimed.
    pub fn reap_orphaned(&self) -> usize {
        let mut reaped = 0;

        while self.reap_orphan() {
            reaped += 1;
        }

        reaped
    }

    /// Number of registered stores.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Test if no stores are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Forget every registered store without closing any of them.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Start a task which reclaims an orphaned store once `owner` is gone.
    pub(crate) fn watch<O>(
        &self,
        owner: Weak<O>,
        period: Duration,
        runtime: Handle,
    ) -> ScheduledTask<O>
    where
        O: Send + Sync + 'static,
    {
        let watcher = ScheduledTask::new(owner, period, true, runtime, |_: &O| {});
        let registry = self.clone();

        watcher.orphaned().subscribe(move |()| {
            registry.reap_orphan();
        });

        watcher
    }
}

impl fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::StoreRegistry;
    use crate::store::TicketStore;
    use std::sync::Arc;
    use tokio::runtime::Handle;
    use tokio::time::{self, Duration};

    struct Owner;

    #[test]
    fn test_register_and_deregister() {
        let registry = StoreRegistry::new();
        let owner = Arc::new(Owner);
        let store = TicketStore::new();

        registry.register(Arc::downgrade(&owner), store.clone());
        assert_eq!(registry.len(), 1);

        // Owner is alive so nothing is reclaimed.
        assert!(!registry.reap_orphan());

        assert!(registry.deregister(&store));
        assert!(!registry.deregister(&store));
        assert!(registry.is_empty());
        assert!(!store.is_closed());
    }

    #[test]
    fn test_reap_orphaned() {
        let registry = StoreRegistry::new();
        let alive = Arc::new(Owner);
        let stores = (0..3).map(|_| TicketStore::new()).collect::<Vec<_>>();

        let dead = (0..2).map(|_| Arc::new(Owner)).collect::<Vec<_>>();
        registry.register(Arc::downgrade(&dead[0]), stores[0].clone());
        registry.register(Arc::downgrade(&alive), stores[1].clone());
        registry.register(Arc::downgrade(&dead[1]), stores[2].clone());
        drop(dead);

        assert_eq!(registry.reap_orphaned(), 2);
        assert_eq!(registry.len(), 1);
        assert!(stores[0].is_closed());
        assert!(!stores[1].is_closed());
        assert!(stores[2].is_closed());
    }

    #[test]
    fn test_clear_does_not_close() {
        let registry = StoreRegistry::new();
        let owner = Arc::new(Owner);
        let store = TicketStore::new();

        registry.register(Arc::downgrade(&owner), store.clone());
        registry.clone().clear();

        assert!(registry.is_empty());
        assert!(!store.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_reclaims_store() {
        let registry = StoreRegistry::new();
        let owner = Arc::new(Owner);
        let store = TicketStore::new();

        store.start_sweep(Duration::from_millis(5), Handle::current(), |_| {});
        registry.register(Arc::downgrade(&owner), store.clone());

        let watcher = registry.watch(
            Arc::downgrade(&owner),
            Duration::from_millis(10),
            Handle::current(),
        );

        time::sleep(Duration::from_millis(25)).await;
        assert!(store.is_sweeping());
        assert_eq!(registry.len(), 1);

        drop(owner);
        time::sleep(Duration::from_millis(15)).await;

        assert!(watcher.is_orphaned());
        assert!(store.is_closed());
        assert!(!store.is_sweeping());
        assert!(registry.is_empty());
    }
}
