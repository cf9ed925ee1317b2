//! Observer lists used for bucket and task notifications.
//!
//! Every observer is invoked independently. A panicking observer is caught
//! and logged; it never reaches the operation that raised the notification
//! and never prevents the remaining observers from running.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;

type Callback<A> = Arc<dyn Fn(A) + Send + Sync + 'static>;

/// How observers are invoked when a notification is emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Dispatch {
    /// Observers are called one after another on the emitting thread, after
    /// the bucket's lock has been released.
    #[default]
    Sequential,
    /// Each observer is called on its own Tokio task. Falls back to
    /// [`Dispatch::Sequential`] when no runtime is available.
    Concurrent,
}

/// Identifies a subscription so that it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct Subscriptions<A> {
    next_id: u64,
    entries: Vec<(ObserverId, Callback<A>)>,
}

/// A list of observers for notifications carrying an `A`.
pub struct Observers<A> {
    name: &'static str,
    dispatch: Dispatch,
    runtime: Option<Handle>,
    subscriptions: Mutex<Subscriptions<A>>,
}

impl<A> Observers<A>
where
    A: Clone + Send + 'static,
{
    /// Construct an empty observer list. `name` is only used in diagnostics.
    pub(crate) fn new(name: &'static str, dispatch: Dispatch, runtime: Option<Handle>) -> Self {
        Self {
            name,
            dispatch,
            runtime,
            subscriptions: Mutex::new(Subscriptions {
                next_id: 0,
                entries: Vec::new(),
            }),
        }
    }

    /// Subscribe an observer.
    pub fn subscribe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        let mut subscriptions = self.subscriptions.lock();
        let id = ObserverId(subscriptions.next_id);
        subscriptions.next_id += 1;
        subscriptions.entries.push((id, Arc::new(observer)));
        id
    }

    /// Remove a previously subscribed observer.
    ///
    /// Returns `false` if no observer with the given id is subscribed.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        let before = subscriptions.entries.len();
        subscriptions.entries.retain(|(existing, _)| *existing != id);
        subscriptions.entries.len() != before
    }

    /// Number of subscribed observers.
    pub fn len(&self) -> usize {
        self.subscriptions.lock().entries.len()
    }

    /// Test if there are no subscribed observers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The dispatch mode of this list.
    pub fn dispatch(&self) -> Dispatch {
        self.dispatch
    }

    /// Notify all observers.
    ///
    /// Must not be called while holding a lock an observer might need.
    pub(crate) fn emit(&self, value: A) {
        // Snapshot so observers may subscribe or unsubscribe while running.
        let observers = self
            .subscriptions
            .lock()
            .entries
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect::<Vec<_>>();

        if observers.is_empty() {
            return;
        }

        match (self.dispatch, &self.runtime) {
            (Dispatch::Concurrent, Some(runtime)) => {
                for observer in observers {
                    let value = value.clone();
                    let name = self.name;
                    runtime.spawn(async move { invoke(name, &observer, value) });
                }
            }
            _ => {
                for observer in &observers {
                    invoke(self.name, observer, value.clone());
                }
            }
        }
    }
}

fn invoke<A>(name: &'static str, observer: &Callback<A>, value: A) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| observer(value))) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| String::from("<non-string panic>"));
        warn!(notification = name, panic = %message, "observer panicked");
    }
}

impl<A> fmt::Debug for Observers<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("name", &self.name)
            .field("dispatch", &self.dispatch)
            .field("len", &self.subscriptions.lock().entries.len())
            .finish()
    }
}
