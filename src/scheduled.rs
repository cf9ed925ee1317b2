//! A periodic callback bound to the liveness of an owner.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::observers::{Dispatch, Observers};

type TaskCallback<O> = Box<dyn Fn(&O) + Send + Sync + 'static>;

/// A cancellable periodic callback that holds its owner through a [`Weak`].
///
/// On every tick the owner is upgraded and handed to the callback. Once the
/// owner can no longer be upgraded the task stops itself, is marked as
/// orphaned and emits [`orphaned`] instead of running the callback.
///
/// Dropping a `ScheduledTask` does not stop it. The timer keeps running until
/// [`stop`] is called or the owner goes away.
///
/// [`orphaned`]: ScheduledTask::orphaned
/// [`stop`]: ScheduledTask::stop
pub struct ScheduledTask<O> {
    inner: Arc<Inner<O>>,
}

struct Inner<O> {
    owner: Weak<O>,
    callback: TaskCallback<O>,
    period: Duration,
    runtime: Handle,
    timer: Mutex<Option<JoinHandle<()>>>,
    is_orphaned: AtomicBool,
    started: Observers<()>,
    stopped: Observers<()>,
    orphaned: Observers<()>,
}

impl<O> ScheduledTask<O>
where
    O: Send + Sync + 'static,
{
    /// Construct a new task which calls `callback` every `period`.
    ///
    /// The first tick happens one `period` after the task is started.
    ///
    /// # Panics
    ///
    /// Panics if `period` is zero or too long to be added to the current
    /// time.
    pub fn new<F>(
        owner: Weak<O>,
        period: Duration,
        start_immediately: bool,
        runtime: Handle,
        callback: F,
    ) -> Self
    where
        F: Fn(&O) + Send + Sync + 'static,
    {
        assert!(period > Duration::ZERO, "period must be greater than zero");
        assert!(
            Instant::now().checked_add(period).is_some(),
            "period is too long to schedule"
        );

        let task = Self {
            inner: Arc::new(Inner {
                owner,
                callback: Box::new(callback),
                period,
                runtime,
                timer: Mutex::new(None),
                is_orphaned: AtomicBool::new(false),
                started: Observers::new("started", Dispatch::Sequential, None),
                stopped: Observers::new("stopped", Dispatch::Sequential, None),
                orphaned: Observers::new("orphaned", Dispatch::Sequential, None),
            }),
        };

        if start_immediately {
            task.start();
        }

        task
    }

    /// Start the timer. Does nothing if it is already running.
    pub fn start(&self) {
        {
            let mut timer = self.inner.timer.lock();

            if timer.as_ref().map_or(false, |handle| !handle.is_finished()) {
                return;
            }

            let inner = self.inner.clone();
            *timer = Some(self.inner.runtime.spawn(inner.run()));
        }

        trace!(period = ?self.inner.period, "scheduled task started");
        self.inner.started.emit(());
    }

    /// Stop the timer. Does nothing if it is not running.
    pub fn stop(&self) {
        let handle = match self.inner.timer.lock().take() {
            Some(handle) => handle,
            None => return,
        };

        let was_running = !handle.is_finished();
        handle.abort();

        if was_running {
            trace!(period = ?self.inner.period, "scheduled task stopped");
            self.inner.stopped.emit(());
        }
    }

    /// Test if the timer is currently running.
    pub fn is_running(&self) -> bool {
        self.inner
            .timer
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Test if the task has observed that its owner is gone.
    pub fn is_orphaned(&self) -> bool {
        self.inner.is_orphaned.load(Ordering::Acquire)
    }

    /// The period between ticks.
    pub fn period(&self) -> Duration {
        self.inner.period
    }

    /// Notification raised when the timer transitions to running.
    pub fn started(&self) -> &Observers<()> {
        &self.inner.started
    }

    /// Notification raised when the timer transitions to stopped.
    pub fn stopped(&self) -> &Observers<()> {
        &self.inner.stopped
    }

    /// Notification raised when the task discovers that its owner is gone.
    pub fn orphaned(&self) -> &Observers<()> {
        &self.inner.orphaned
    }
}

impl<O> Inner<O>
where
    O: Send + Sync + 'static,
{
    async fn run(self: Arc<Self>) {
        let first = match Instant::now().checked_add(self.period) {
            Some(first) => first,
            None => {
                warn!(period = ?self.period, "scheduled task period overflows the clock");
                return;
            }
        };

        let mut interval = time::interval_at(first, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let owner = match self.owner.upgrade() {
                Some(owner) => owner,
                None => break,
            };

            if panic::catch_unwind(AssertUnwindSafe(|| (self.callback)(&owner))).is_err() {
                warn!(period = ?self.period, "scheduled task callback panicked");
            }
        }

        self.is_orphaned.store(true, Ordering::Release);
        // Detach rather than abort, this is the task being torn down.
        drop(self.timer.lock().take());
        debug!(period = ?self.period, "scheduled task orphaned");
        self.orphaned.emit(());
    }
}

impl<O> fmt::Debug for ScheduledTask<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("period", &self.inner.period)
            .field("is_orphaned", &self.inner.is_orphaned.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::ScheduledTask;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::runtime::Handle;
    use tokio::time::{self, Duration};

    struct Owner {
        ticks: AtomicUsize,
    }

    fn owner() -> Arc<Owner> {
        Arc::new(Owner {
            ticks: AtomicUsize::new(0),
        })
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(()) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let observer = {
            let count = count.clone();
            move |()| {
                count.fetch_add(1, Ordering::SeqCst);
            }
        };
        (count, observer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_tick() {
        let owner = owner();
        let task = ScheduledTask::new(
            Arc::downgrade(&owner),
            Duration::from_millis(10),
            false,
            Handle::current(),
            |owner: &Owner| {
                owner.ticks.fetch_add(1, Ordering::SeqCst);
            },
        );

        let (started, observer) = counter();
        task.started().subscribe(observer);

        assert!(!task.is_running());
        assert!(!task.is_orphaned());

        task.start();
        assert!(task.is_running());
        assert_eq!(started.load(Ordering::SeqCst), 1);

        time::sleep(Duration::from_millis(11)).await;
        assert_eq!(owner.ticks.load(Ordering::SeqCst), 1);

        time::sleep(Duration::from_millis(20)).await;
        assert_eq!(owner.ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop() {
        let owner = owner();
        let task = ScheduledTask::new(
            Arc::downgrade(&owner),
            Duration::from_millis(10),
            true,
            Handle::current(),
            |owner: &Owner| {
                owner.ticks.fetch_add(1, Ordering::SeqCst);
            },
        );

        time::sleep(Duration::from_millis(11)).await;
        assert_eq!(owner.ticks.load(Ordering::SeqCst), 1);

        let (stopped, observer) = counter();
        task.stopped().subscribe(observer);

        task.stop();
        assert!(!task.is_running());
        assert_eq!(stopped.load(Ordering::SeqCst), 1);

        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(owner.ticks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redundant_transitions_are_silent() {
        let owner = owner();
        let task = ScheduledTask::new(
            Arc::downgrade(&owner),
            Duration::from_millis(5),
            true,
            Handle::current(),
            |_: &Owner| {},
        );

        let (started, observer) = counter();
        task.started().subscribe(observer);
        let (stopped, observer) = counter();
        task.stopped().subscribe(observer);

        task.start();
        assert_eq!(started.load(Ordering::SeqCst), 0);
        assert!(task.is_running());

        task.stop();
        task.stop();
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert!(!task.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_orphaned_when_owner_dropped() {
        let owner = owner();
        let ticks = Arc::new(AtomicUsize::new(0));

        let task = ScheduledTask::new(
            Arc::downgrade(&owner),
            Duration::from_millis(1),
            true,
            Handle::current(),
            {
                let ticks = ticks.clone();
                move |_: &Owner| {
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        let (orphaned, observer) = counter();
        task.orphaned().subscribe(observer);

        time::sleep(Duration::from_millis(2)).await;
        let before = ticks.load(Ordering::SeqCst);
        assert!(before > 0);

        drop(owner);
        time::sleep(Duration::from_millis(10)).await;

        assert!(task.is_orphaned());
        assert!(!task.is_running());
        assert_eq!(orphaned.load(Ordering::SeqCst), 1);
        assert_eq!(ticks.load(Ordering::SeqCst), before);
    }

    #[tokio::test(start_paused = true)]
    #[should_panic = "period is too long to schedule"]
    async fn test_unschedulable_period() {
        let owner = owner();
        let _task = ScheduledTask::new(
            Arc::downgrade(&owner),
            Duration::MAX,
            true,
            Handle::current(),
            |_: &Owner| {},
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_period_does_not_tick() {
        let owner = owner();
        let task = ScheduledTask::new(
            Arc::downgrade(&owner),
            Duration::from_secs(86400 * 365 * 30),
            true,
            Handle::current(),
            |owner: &Owner| {
                owner.ticks.fetch_add(1, Ordering::SeqCst);
            },
        );

        time::sleep(Duration::from_secs(3600)).await;
        assert!(task.is_running());
        assert_eq!(owner.ticks.load(Ordering::SeqCst), 0);
        task.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_callback_keeps_ticking() {
        let owner = owner();
        let task = ScheduledTask::new(
            Arc::downgrade(&owner),
            Duration::from_millis(10),
            true,
            Handle::current(),
            |owner: &Owner| {
                owner.ticks.fetch_add(1, Ordering::SeqCst);
                panic!("tick failure");
            },
        );

        time::sleep(Duration::from_millis(35)).await;
        assert_eq!(owner.ticks.load(Ordering::SeqCst), 3);
        assert!(task.is_running());
        task.stop();
    }
}
