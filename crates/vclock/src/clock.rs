// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::alarm::{AlarmCallback, VirtualAlarm};
use crate::system::SystemClock;
use crate::timer::{AlarmHandle, Ticker, TimeChan, Timer};
use crate::virtual_clock::{ClockCore, VirtualClock};

/// A source of wall-clock time, timers, and tickers.
///
/// Production code asks for a `Clock` and never learns whether it is backed
/// by the operating system ([`Clock::system`]) or by a
/// [`VirtualClock`] a test controls. Clones are cheap and share the
/// underlying time source.
///
/// # Examples
///
/// Code written against `Clock` runs unchanged under both backends:
///
/// ```
/// use std::time::Duration;
///
/// use vclock::Clock;
///
/// async fn poll_with_backoff(clock: &Clock, attempts: u32) {
///     for _ in 0..attempts {
///         clock.sleep(Duration::from_secs(1)).await;
///         // ... check for the condition ...
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Clock(ClockRepr);

#[derive(Debug, Clone)]
enum ClockRepr {
    System(SystemClock),
    Virtual(VirtualClock),
}

impl Clock {
    /// Returns a clock backed by the operating system.
    ///
    /// Timers and tickers created from it are serviced by background tasks,
    /// so they require a running Tokio runtime.
    #[must_use]
    pub fn system() -> Self {
        Self(ClockRepr::System(SystemClock::new()))
    }

    pub(crate) fn from_virtual(clock: VirtualClock) -> Self {
        Self(ClockRepr::Virtual(clock))
    }

    /// Returns the current instant: wall-clock time for the system backend,
    /// simulated time for a virtual one.
    #[must_use]
    pub fn now(&self) -> SystemTime {
        match &self.0 {
            ClockRepr::System(_) => SystemTime::now(),
            ClockRepr::Virtual(clock) => clock.now(),
        }
    }

    /// Returns the time elapsed since `earlier`, or zero if `earlier` is in
    /// the future.
    #[must_use]
    pub fn since(&self, earlier: SystemTime) -> Duration {
        self.now().duration_since(earlier).unwrap_or(Duration::ZERO)
    }

    /// Creates a one-shot [`Timer`] that fires `duration` from now.
    #[must_use]
    pub fn new_timer(&self, duration: Duration) -> Timer {
        let (handle, chan) = self.register(duration, true, None);
        Timer::new(handle, chan)
    }

    /// Creates a [`Ticker`] that fires every `duration`.
    #[must_use]
    pub fn new_ticker(&self, duration: Duration) -> Ticker {
        let (handle, chan) = self.register(duration, false, None);
        Ticker::new(handle, chan)
    }

    /// Creates a timer that invokes `f` when it fires, in addition to
    /// announcing the fire on its channel.
    ///
    /// Under a virtual clock the callback runs synchronously inside the
    /// advancement that fires it; under the system clock it runs on the
    /// timer's driver task. Either way it may use the clock, but it must not
    /// block.
    #[must_use = "dropping the timer does not cancel it, but stopping it requires the handle"]
    pub fn after_func(&self, duration: Duration, f: impl FnMut() + Send + 'static) -> Timer {
        let (handle, chan) = self.register(duration, true, Some(Box::new(f)));
        Timer::new(handle, chan)
    }

    /// Creates a one-shot timer and returns only its channel.
    ///
    /// The timer cannot be stopped or reset; it fires `duration` from now
    /// and the fire instant appears on the returned channel.
    #[must_use]
    pub fn after(&self, duration: Duration) -> TimeChan {
        self.new_timer(duration).into_chan()
    }

    /// Creates a ticker and returns only its channel.
    ///
    /// The ticker cannot be stopped; it runs until the clock is closed.
    #[must_use]
    pub fn tick(&self, duration: Duration) -> TimeChan {
        self.new_ticker(duration).into_chan()
    }

    /// Waits until `duration` has elapsed on this clock.
    ///
    /// Under a virtual clock the wait completes when simulated time passes
    /// the wake instant; sleeping does not advance the clock. Returns
    /// immediately for a zero duration or a closed clock.
    pub async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }

        match &self.0 {
            ClockRepr::System(_) => tokio::time::sleep(duration).await,
            ClockRepr::Virtual(clock) => {
                if clock.core().is_closed() {
                    return;
                }
                let _ = self.after(duration).recv().await;
            }
        }
    }

    /// Stops every timer and ticker created from this clock.
    ///
    /// Afterwards nothing fires and new registrations are inert. The clock
    /// itself keeps reporting time.
    pub fn close(&self) {
        match &self.0 {
            ClockRepr::System(clock) => clock.close(),
            ClockRepr::Virtual(clock) => clock.close(),
        }
    }

    fn register(&self, duration: Duration, oneshot: bool, callback: Option<AlarmCallback>) -> (AlarmHandle, TimeChan) {
        match &self.0 {
            ClockRepr::System(clock) => {
                let (handle, chan) = clock.register(duration, oneshot, callback);
                (AlarmHandle::System(handle), chan)
            }
            ClockRepr::Virtual(clock) => {
                let (alarm, chan) = register_virtual(clock.core(), duration, oneshot, callback);
                (AlarmHandle::Virtual(alarm), chan)
            }
        }
    }
}

impl AsRef<Self> for Clock {
    fn as_ref(&self) -> &Self {
        self
    }
}

fn register_virtual(
    core: &Arc<ClockCore>,
    duration: Duration,
    oneshot: bool,
    callback: Option<AlarmCallback>,
) -> (Arc<VirtualAlarm>, TimeChan) {
    let (alarm, rx) = core.register(duration, oneshot, callback);
    let chan = TimeChan::new(rx, alarm.sender().clone());
    (alarm, chan)
}
