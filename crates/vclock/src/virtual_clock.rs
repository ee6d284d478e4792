// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;

use crate::alarm::{AlarmCallback, AlarmKey, Alarms, FireOutcome, VirtualAlarm};
use crate::context::{CancelFn, Context, DeadlineContext};
use crate::Clock;

pub(crate) static OUTSIDE_RANGE_MESSAGE: &str = "moving the clock outside of the supported time range is not possible";

static CURRENT_LOCK_MESSAGE: &str = "clock instant lock poisoned";
static REGISTRY_LOCK_MESSAGE: &str = "alarm registry lock poisoned";

/// Default number of delivery attempts before a fire is dropped.
///
/// Each failed attempt yields to other tasks, so on a cooperative scheduler
/// the budget translates into that many chances for a consumer to drain the
/// alarm's channel slot.
const DEFAULT_DELIVERY_RETRIES: usize = 64;

/// Simulates the passage of time under full control of the caller.
///
/// A `VirtualClock` owns a simulated "now" and a registry of pending alarms.
/// Time only moves when [`advance`][Self::advance] or [`set`][Self::set] is
/// called; the clock then walks every alarm due at or before the target, in
/// ascending schedule order, delivering each fire before the next is
/// considered. This reproduces, deterministically, the concurrency behavior a
/// real clock provides implicitly: multiple alarms firing in order, tickers
/// rescheduling without drift, and safe stop/reset while a fire is in flight.
///
/// Code under test receives a [`Clock`] created via
/// [`to_clock`][Self::to_clock] and cannot tell it apart from the system
/// clock; the test driver keeps the `VirtualClock` half and moves time.
/// Exactly one task is expected to drive `advance`/`set`; concurrent
/// advancement from several tasks leaves the firing order undefined.
///
/// Cloning is inexpensive (an `Arc` clone) and every clone shares the same
/// simulated time and alarm registry.
///
/// # Examples
///
/// ```
/// use std::time::{Duration, SystemTime};
///
/// use vclock::VirtualClock;
///
/// # async fn example() {
/// let clock = VirtualClock::new();
/// let handle = clock.to_clock();
///
/// let mut firings = handle.after(Duration::from_secs(60));
///
/// // Jump one hour ahead; the timer fires on the way.
/// clock.advance(Duration::from_secs(3600), true).await;
///
/// assert_eq!(
///     firings.try_recv(),
///     Some(SystemTime::UNIX_EPOCH + Duration::from_secs(60))
/// );
/// assert_eq!(handle.now(), SystemTime::UNIX_EPOCH + Duration::from_secs(3600));
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct VirtualClock {
    core: Arc<ClockCore>,
}

impl VirtualClock {
    /// Creates a virtual clock whose simulated time starts at the UNIX epoch.
    #[must_use]
    pub fn new() -> Self {
        Self::new_at(SystemTime::UNIX_EPOCH)
    }

    /// Creates a virtual clock whose simulated time starts at `start`.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::{Duration, SystemTime};
    ///
    /// use vclock::VirtualClock;
    ///
    /// let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_500_000_000);
    /// let clock = VirtualClock::new_at(start);
    ///
    /// assert_eq!(clock.now(), start);
    /// ```
    #[must_use]
    pub fn new_at(start: impl Into<SystemTime>) -> Self {
        Self {
            core: Arc::new(ClockCore {
                current: Mutex::new(start.into()),
                alarms: Mutex::new(Alarms::default()),
                next_seq: AtomicU64::new(0),
                delivery_retries: AtomicUsize::new(DEFAULT_DELIVERY_RETRIES),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Sets the retry budget for best-effort fire delivery.
    ///
    /// When an alarm fires and its channel slot is occupied, the advancement
    /// loop yields to other tasks and retries, up to this many attempts,
    /// before dropping the fire. Lowering the budget makes drop behavior
    /// deterministic in tests; it never blocks advancement indefinitely.
    #[must_use]
    pub fn delivery_retries(self, retries: usize) -> Self {
        self.core.delivery_retries.store(retries, Ordering::Relaxed);
        self
    }

    /// Returns the current simulated instant.
    #[must_use]
    pub fn now(&self) -> SystemTime {
        self.core.now()
    }

    /// Converts the control handle into a [`Clock`] for code under test.
    #[must_use]
    pub fn to_clock(&self) -> Clock {
        Clock::from_virtual(self.clone())
    }

    /// Advances simulated time by `duration`.
    ///
    /// Sugar for [`set`][Self::set] at `now() + duration`.
    ///
    /// # Panics
    ///
    /// Panics if the target instant falls outside the supported time range.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use vclock::VirtualClock;
    ///
    /// # async fn example() {
    /// let clock = VirtualClock::new();
    /// let before = clock.now();
    ///
    /// clock.advance(Duration::from_secs(10), true).await;
    ///
    /// assert_eq!(clock.now(), before + Duration::from_secs(10));
    /// # }
    /// ```
    pub async fn advance(&self, duration: Duration, process_alarms: bool) {
        let target = self.now().checked_add(duration).expect(OUTSIDE_RANGE_MESSAGE);
        self.set(target, process_alarms).await;
    }

    /// Moves simulated time to `target`, firing due alarms along the way.
    ///
    /// Every alarm scheduled at or before `target` fires in ascending
    /// schedule order (ties broken by registration order), each delivered
    /// before the next is considered; a callback observing `now()` during
    /// its own fire sees the instant of that fire, not the final target.
    /// Oneshot alarms retire; tickers reschedule anchored to the previous
    /// fire instant.
    ///
    /// Moving time backward, or forward with no alarms registered, is a pure
    /// clock write: nothing fires. When `process_alarms` is false, due
    /// schedules still retire or reschedule, but nothing is delivered and no
    /// callbacks run.
    ///
    /// Delivery is best-effort: a fire whose channel slot stays occupied for
    /// the whole retry budget is dropped rather than blocking advancement.
    #[cfg_attr(test, mutants::skip)] // mutations of the loop condition never terminate
    pub async fn set(&self, target: SystemTime, process_alarms: bool) {
        self.core.advance_to(target, process_alarms).await;
    }

    /// Stops and evicts every alarm owned by this clock.
    ///
    /// Afterwards no alarm can fire and registrations are inert; the clock
    /// remains usable for [`now`][Self::now]. Closing twice is a no-op.
    pub fn close(&self) {
        self.core.close();
    }

    /// Derives a cancellation context resolved at `deadline` in virtual time,
    /// composed with `parent`.
    ///
    /// Returns the context together with a cancel procedure. The context
    /// resolves to whichever of {parent resolution, deadline crossing,
    /// explicit cancel} happens first; the first cause wins and later causes
    /// are no-ops. See [`DeadlineContext`].
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime: parent resolution is observed
    /// by a background watcher task.
    #[must_use = "dropping the context renders the deadline meaningless"]
    pub fn with_deadline(&self, parent: Arc<dyn Context>, deadline: SystemTime) -> (DeadlineContext, CancelFn) {
        DeadlineContext::new(self, parent, deadline)
    }

    /// Derives a cancellation context resolved `timeout` from now in virtual
    /// time, composed with `parent`.
    ///
    /// Sugar for [`with_deadline`][Self::with_deadline] at `now() + timeout`.
    ///
    /// # Panics
    ///
    /// Panics if the deadline falls outside the supported time range. Must be
    /// called within a Tokio runtime.
    #[must_use = "dropping the context renders the timeout meaningless"]
    pub fn with_timeout(&self, parent: Arc<dyn Context>, timeout: Duration) -> (DeadlineContext, CancelFn) {
        let deadline = self.now().checked_add(timeout).expect(OUTSIDE_RANGE_MESSAGE);
        self.with_deadline(parent, deadline)
    }

    pub(crate) fn core(&self) -> &Arc<ClockCore> {
        &self.core
    }

    #[cfg(test)]
    pub(crate) fn alarms_len(&self) -> usize {
        self.core.alarms.lock().expect(REGISTRY_LOCK_MESSAGE).len()
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl From<VirtualClock> for Clock {
    fn from(clock: VirtualClock) -> Self {
        clock.to_clock()
    }
}

impl From<&VirtualClock> for Clock {
    fn from(clock: &VirtualClock) -> Self {
        clock.to_clock()
    }
}

/// Shared state behind a virtual clock and all of its clones.
///
/// The simulated instant and the alarm registry are guarded by separate
/// locks, and each alarm guards its own schedule, so independent alarms can
/// be stopped or reset concurrently without contending on a single lock.
/// Whenever an alarm lock and the registry lock are held together, the alarm
/// lock is acquired first.
#[derive(Debug)]
pub(crate) struct ClockCore {
    current: Mutex<SystemTime>,
    alarms: Mutex<Alarms>,
    next_seq: AtomicU64,
    delivery_retries: AtomicUsize,
    closed: AtomicBool,
}

impl ClockCore {
    pub(crate) fn now(&self) -> SystemTime {
        *self.current.lock().expect(CURRENT_LOCK_MESSAGE)
    }

    /// Registers a new alarm due `duration` from now.
    ///
    /// On a closed clock the alarm is created already closed and never enters
    /// the registry, so it can never fire.
    pub(crate) fn register(
        self: &Arc<Self>,
        duration: Duration,
        oneshot: bool,
        callback: Option<AlarmCallback>,
    ) -> (Arc<VirtualAlarm>, mpsc::Receiver<SystemTime>) {
        // A zero-period ticker would never let the advancement loop pass its
        // schedule; round it up to the smallest representable period.
        let period = if !oneshot && duration.is_zero() {
            Duration::from_nanos(1)
        } else {
            duration
        };

        let next = self.now().checked_add(period).expect(OUTSIDE_RANGE_MESSAGE);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        let (alarm, rx) = VirtualAlarm::new(Arc::downgrade(self), seq, next, period, oneshot, callback);

        // The closed flag is read under the registry lock; close sets the
        // flag before draining, so an alarm never slips in behind a close.
        let closed = {
            let mut alarms = self.alarms.lock().expect(REGISTRY_LOCK_MESSAGE);
            let closed = self.closed.load(Ordering::SeqCst);
            if !closed {
                alarms.insert(AlarmKey::new(next, seq), Arc::clone(&alarm));
            }
            closed
        };
        if closed {
            alarm.mark_closed();
        }

        (alarm, rx)
    }

    /// Removes an alarm from the registry. Called by `VirtualAlarm::stop`
    /// with the alarm's own lock held.
    pub(crate) fn evict(&self, key: AlarmKey) {
        self.alarms.lock().expect(REGISTRY_LOCK_MESSAGE).remove(key);
    }

    /// Replaces an alarm's registry entry after a reset. Called with the
    /// alarm's own lock held.
    pub(crate) fn rekey(&self, old: AlarmKey, new: AlarmKey, alarm: &Arc<VirtualAlarm>) {
        let mut alarms = self.alarms.lock().expect(REGISTRY_LOCK_MESSAGE);
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        alarms.rekey(old, new, alarm);
    }

    /// Reinserts a rescheduled ticker. Called with the alarm's own lock held.
    pub(crate) fn reregister(&self, key: AlarmKey, alarm: &Arc<VirtualAlarm>) {
        let mut alarms = self.alarms.lock().expect(REGISTRY_LOCK_MESSAGE);
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        alarms.insert(key, Arc::clone(alarm));
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        // The flag goes first so registrations racing with close stay inert.
        self.closed.store(true, Ordering::SeqCst);

        let drained = self.alarms.lock().expect(REGISTRY_LOCK_MESSAGE).drain();
        for alarm in &drained {
            alarm.mark_closed();
        }

        if !drained.is_empty() {
            tracing::trace!(alarms = drained.len(), "virtual clock closed, alarms evicted");
        }
    }

    /// The deterministic time-advancement algorithm.
    #[cfg_attr(test, mutants::skip)] // mutations of the loop condition never terminate
    async fn advance_to(&self, target: SystemTime, process_alarms: bool) {
        // Moving backward, or forward with nothing registered, is a pure
        // clock-setting operation.
        {
            let no_alarms = self.alarms.lock().expect(REGISTRY_LOCK_MESSAGE).is_empty();
            let mut current = self.current.lock().expect(CURRENT_LOCK_MESSAGE);
            if target < *current || no_alarms {
                *current = target;
                return;
            }
        }

        loop {
            let due = self.alarms.lock().expect(REGISTRY_LOCK_MESSAGE).pop_due(target);

            let Some((key, alarm)) = due else {
                *self.current.lock().expect(CURRENT_LOCK_MESSAGE) = target;
                return;
            };

            // The fire observes its own instant, not the final target.
            *self.current.lock().expect(CURRENT_LOCK_MESSAGE) = key.due();

            match alarm.begin_fire(key) {
                // Stopped or rescheduled between the pop and the lock.
                FireOutcome::Skip => {}
                FireOutcome::Fire { mut callback, repeat } => {
                    if process_alarms {
                        self.deliver(&alarm, key.due()).await;

                        // No clock or alarm locks are held here, so the
                        // callback may call back into the clock.
                        if let Some(f) = callback.as_mut() {
                            f();
                        }
                    }

                    // Hand the callback back so a rearmed oneshot reruns it.
                    if let Some(f) = callback {
                        alarm.restore_callback(f);
                    }

                    if repeat {
                        alarm.reinsert();
                    }
                }
            }
        }
    }

    /// Best-effort single delivery with a bounded retry budget.
    ///
    /// A failed attempt yields to other pending tasks so a consumer gets a
    /// chance to drain the channel slot; once the budget is exhausted the
    /// fire is dropped rather than blocking the advancement loop forever.
    async fn deliver(&self, alarm: &Arc<VirtualAlarm>, fired_at: SystemTime) {
        let budget = self.delivery_retries.load(Ordering::Relaxed).max(1);

        for _ in 0..budget {
            match alarm.sender().try_send(fired_at) {
                Ok(()) => {
                    tracing::trace!(?fired_at, "alarm fired");
                    return;
                }
                Err(mpsc::error::TrySendError::Full(_)) => tokio::task::yield_now().await,
                // The reader was dropped; nobody will ever listen.
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }

        tracing::debug!(?fired_at, "alarm fire dropped, no receiver within the retry budget");
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn epoch_plus(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(VirtualClock: Send, Sync, Clone);
    }

    #[test]
    fn new_starts_at_epoch() {
        let clock = VirtualClock::new();
        assert_eq!(clock.now(), SystemTime::UNIX_EPOCH);
    }

    #[test]
    fn new_at_starts_at_given_instant() {
        let start = epoch_plus(1_500_000_000);
        let clock = VirtualClock::new_at(start);
        assert_eq!(clock.now(), start);
    }

    #[tokio::test]
    async fn set_moves_now_exactly() {
        let clock = VirtualClock::new();
        let target = epoch_plus(42);

        clock.set(target, true).await;

        assert_eq!(clock.now(), target);
    }

    #[tokio::test]
    async fn set_backward_is_a_pure_clock_write() {
        let clock = VirtualClock::new_at(epoch_plus(100));
        let handle = clock.to_clock();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = Arc::clone(&fired);
        let _timer = handle.after_func(Duration::from_secs(10), move || {
            let _ = fired_in_cb.fetch_add(1, Ordering::SeqCst);
        });

        // Backward past the alarm's schedule: nothing fires.
        clock.set(epoch_plus(50), true).await;
        assert_eq!(clock.now(), epoch_plus(50));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // The alarm is still scheduled at its original instant.
        clock.set(epoch_plus(110), true).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn advance_is_sugar_for_set() {
        let clock = VirtualClock::new();

        clock.advance(Duration::from_secs(5), true).await;
        clock.advance(Duration::from_secs(5), true).await;

        assert_eq!(clock.now(), epoch_plus(10));
    }

    #[tokio::test]
    async fn callback_observes_its_own_fire_instant() {
        let clock = VirtualClock::new();
        let handle = clock.to_clock();

        let observed = Arc::new(Mutex::new(None));
        let observed_in_cb = Arc::clone(&observed);
        let probe = clock.clone();
        let _timer = handle.after_func(Duration::from_secs(3), move || {
            *observed_in_cb.lock().expect("lock") = Some(probe.now());
        });

        clock.advance(Duration::from_secs(10), true).await;

        assert_eq!(*observed.lock().expect("lock"), Some(epoch_plus(3)));
        assert_eq!(clock.now(), epoch_plus(10));
    }

    #[tokio::test]
    async fn simultaneous_alarms_fire_in_registration_order() {
        let clock = VirtualClock::new();
        let handle = clock.to_clock();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut timers = Vec::new();
        for id in 0..3 {
            let order = Arc::clone(&order);
            timers.push(handle.after_func(Duration::from_secs(1), move || {
                order.lock().expect("lock").push(id);
            }));
        }

        clock.advance(Duration::from_secs(1), true).await;

        assert_eq!(*order.lock().expect("lock"), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn unprocessed_advance_retires_without_delivering() {
        let clock = VirtualClock::new();
        let handle = clock.to_clock();

        let mut chan = handle.after(Duration::from_secs(1));

        clock.advance(Duration::from_secs(5), false).await;

        assert_eq!(chan.try_recv(), None);
        assert_eq!(clock.alarms_len(), 0);
    }

    #[tokio::test]
    async fn exhausted_retry_budget_drops_the_fire() {
        let clock = VirtualClock::new().delivery_retries(1);
        let handle = clock.to_clock();

        // Nobody drains the slot, so only the first fire lands.
        let mut chan = handle.tick(Duration::from_secs(1));
        clock.advance(Duration::from_secs(3), true).await;

        assert_eq!(chan.try_recv(), Some(epoch_plus(1)));
        assert_eq!(chan.try_recv(), None);
    }

    #[tokio::test]
    async fn close_evicts_every_alarm() {
        let clock = VirtualClock::new();
        let handle = clock.to_clock();

        let timer = handle.new_timer(Duration::from_secs(1));
        let ticker = handle.new_ticker(Duration::from_secs(1));
        assert_eq!(clock.alarms_len(), 2);

        clock.close();
        assert_eq!(clock.alarms_len(), 0);

        // Stop after close reports no effect.
        assert!(!timer.stop());
        assert!(!ticker.stop());

        // The clock is still usable for now(), and close is idempotent.
        clock.advance(Duration::from_secs(5), true).await;
        assert_eq!(clock.now(), epoch_plus(5));
        clock.close();
    }

    #[tokio::test]
    async fn registration_after_close_is_inert() {
        let clock = VirtualClock::new();
        let handle = clock.to_clock();
        clock.close();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = Arc::clone(&fired);
        let timer = handle.after_func(Duration::from_secs(1), move || {
            let _ = fired_in_cb.fetch_add(1, Ordering::SeqCst);
        });

        clock.advance(Duration::from_secs(10), true).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!timer.stop());
    }

    #[tokio::test]
    async fn callback_may_call_back_into_the_clock() {
        let clock = VirtualClock::new();
        let handle = clock.to_clock();

        // The callback registers another alarm due within the same advance.
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_inner = Arc::clone(&fired);
        let inner_handle = handle.clone();
        let _timer = handle.after_func(Duration::from_secs(1), move || {
            let fired_inner = Arc::clone(&fired_inner);
            // Keep the nested timer alive via the clock's registry.
            let _ = inner_handle.after_func(Duration::from_secs(1), move || {
                let _ = fired_inner.fetch_add(1, Ordering::SeqCst);
            });
        });

        clock.advance(Duration::from_secs(5), true).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
