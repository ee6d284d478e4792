// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;

use crate::alarm::VirtualAlarm;
use crate::system::SystemHandle;

/// Receiving side of a timer or ticker.
///
/// Each fire delivers the instant at which it occurred. The channel holds at
/// most one undelivered fire; a ticker whose consumer falls behind loses
/// fires rather than queueing them.
///
/// Stopping the owning timer does not close the channel: a reader blocked in
/// [`recv`][Self::recv] stays parked instead of waking with a phantom fire.
#[derive(Debug)]
pub struct TimeChan {
    rx: mpsc::Receiver<SystemTime>,
    // Keeps the channel open after the producer is stopped or evicted.
    _tx: mpsc::Sender<SystemTime>,
}

impl TimeChan {
    pub(crate) fn new(rx: mpsc::Receiver<SystemTime>, tx: mpsc::Sender<SystemTime>) -> Self {
        Self { rx, _tx: tx }
    }

    /// Waits for the next fire and returns the instant it occurred.
    pub async fn recv(&mut self) -> Option<SystemTime> {
        self.rx.recv().await
    }

    /// Returns the next fire if one is already pending, without waiting.
    pub fn try_recv(&mut self) -> Option<SystemTime> {
        self.rx.try_recv().ok()
    }
}

/// Backend-specific alarm plumbing behind a [`Timer`] or [`Ticker`].
#[derive(Debug)]
pub(crate) enum AlarmHandle {
    Virtual(Arc<VirtualAlarm>),
    System(SystemHandle),
}

impl AlarmHandle {
    fn reset(&self, period: Duration) -> bool {
        match self {
            Self::Virtual(alarm) => alarm.reset(period),
            Self::System(handle) => handle.reset(period),
        }
    }

    fn stop(&self) -> bool {
        match self {
            Self::Virtual(alarm) => alarm.stop(),
            Self::System(handle) => handle.stop(),
        }
    }
}

/// A one-shot alarm that fires once at its scheduled instant.
///
/// Created by [`Clock::new_timer`][crate::Clock::new_timer] or
/// [`Clock::after_func`][crate::Clock::after_func]. The fire is announced on
/// [`chan`][Self::chan] (and, for `after_func`, by invoking the callback).
///
/// Dropping a `Timer` does not stop it; the alarm stays scheduled until it
/// fires or the owning clock closes. Call [`stop`][Self::stop] to retire it
/// early.
#[derive(Debug)]
pub struct Timer {
    handle: AlarmHandle,
    chan: TimeChan,
}

impl Timer {
    pub(crate) fn new(handle: AlarmHandle, chan: TimeChan) -> Self {
        Self { handle, chan }
    }

    /// Reschedules the timer to fire `duration` from now.
    ///
    /// Works on both pending and already-fired timers. Returns `false` if
    /// the timer was already stopped or its clock closed, in which case
    /// nothing is scheduled.
    pub fn reset(&self, duration: Duration) -> bool {
        self.handle.reset(duration)
    }

    /// Retires the timer so it never fires.
    ///
    /// Returns `false` if it had already fired or been stopped. A fire
    /// already delivered to [`chan`][Self::chan] stays readable; stopping
    /// never produces a phantom fire.
    pub fn stop(&self) -> bool {
        self.handle.stop()
    }

    /// The channel on which fires are announced.
    pub fn chan(&mut self) -> &mut TimeChan {
        &mut self.chan
    }

    /// Consumes the timer, keeping only the receiving channel.
    ///
    /// The alarm stays scheduled; this merely gives up the ability to stop
    /// or reset it.
    #[must_use]
    pub fn into_chan(self) -> TimeChan {
        self.chan
    }
}

/// A repeating alarm that fires at a fixed period.
///
/// Created by [`Clock::new_ticker`][crate::Clock::new_ticker]. Each fire is
/// scheduled one period after the previous fire's scheduled instant, so a
/// ticker does not drift even when consumed late.
///
/// Unlike [`Timer`], a ticker cannot be rescheduled; stop it and create a
/// new one instead.
#[derive(Debug)]
pub struct Ticker {
    handle: AlarmHandle,
    chan: TimeChan,
}

impl Ticker {
    pub(crate) fn new(handle: AlarmHandle, chan: TimeChan) -> Self {
        Self { handle, chan }
    }

    /// Retires the ticker so it never fires again.
    ///
    /// Returns `false` if it was already stopped or its clock closed.
    pub fn stop(&self) -> bool {
        self.handle.stop()
    }

    /// The channel on which fires are announced.
    pub fn chan(&mut self) -> &mut TimeChan {
        &mut self.chan
    }

    /// Consumes the ticker, keeping only the receiving channel.
    #[must_use]
    pub fn into_chan(self) -> TimeChan {
        self.chan
    }
}
