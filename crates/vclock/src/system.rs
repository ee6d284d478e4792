// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::alarm::AlarmCallback;
use crate::timer::TimeChan;

/// Shortest period a system ticker will run at.
///
/// Tokio's timer wheel has roughly millisecond granularity; a shorter period
/// would make the driver spin without firing any more often.
const MIN_SYSTEM_PERIOD: Duration = Duration::from_millis(1);

static DRIVERS_LOCK_MESSAGE: &str = "system driver list lock poisoned";

/// Commands a [`SystemHandle`] sends to its driver task.
#[derive(Debug)]
enum Cmd {
    Reset(Duration),
    Stop,
}

/// Real-time clock backend.
///
/// Each timer or ticker is serviced by a dedicated driver task sleeping on
/// the Tokio timer wheel and forwarding fires into the handle's channel.
/// Creating alarms therefore requires a running Tokio runtime.
#[derive(Debug, Clone, Default)]
pub(crate) struct SystemClock {
    drivers: Arc<Mutex<Vec<DriverLink>>>,
    clock_closed: Arc<AtomicBool>,
}

/// The clock's grip on one driver task, kept so `close` can stop it.
#[derive(Debug)]
struct DriverLink {
    cmd: mpsc::UnboundedSender<Cmd>,
    closed: Arc<AtomicBool>,
}

impl SystemClock {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Spawns a driver task for a new alarm due `duration` from now.
    pub(crate) fn register(
        &self,
        duration: Duration,
        oneshot: bool,
        callback: Option<AlarmCallback>,
    ) -> (SystemHandle, TimeChan) {
        let period = if oneshot { None } else { Some(duration.max(MIN_SYSTEM_PERIOD)) };
        let (tx, rx) = mpsc::channel(1);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let chan = TimeChan::new(rx, tx.clone());
        let closed = Arc::new(AtomicBool::new(false));
        let spent = Arc::new(AtomicBool::new(false));

        {
            let mut drivers = self.drivers.lock().expect(DRIVERS_LOCK_MESSAGE);
            if self.clock_closed.load(Ordering::SeqCst) {
                // The clock is closed; hand back an inert alarm.
                closed.store(true, Ordering::SeqCst);
                return (SystemHandle { cmd: cmd_tx, closed, spent }, chan);
            }

            drivers.push(DriverLink {
                cmd: cmd_tx.clone(),
                closed: Arc::clone(&closed),
            });
        }

        drop(tokio::spawn(drive(
            Instant::now() + duration,
            period,
            tx,
            callback,
            cmd_rx,
            Arc::clone(&spent),
        )));

        (SystemHandle { cmd: cmd_tx, closed, spent }, chan)
    }

    /// Stops every driver task spawned by this clock.
    pub(crate) fn close(&self) {
        let mut drivers = self.drivers.lock().expect(DRIVERS_LOCK_MESSAGE);
        // The flag goes first so registrations racing with close stay inert.
        self.clock_closed.store(true, Ordering::SeqCst);
        let stopped = drivers.len();
        for link in drivers.drain(..) {
            link.closed.store(true, Ordering::SeqCst);
            let _ = link.cmd.send(Cmd::Stop);
        }

        if stopped > 0 {
            tracing::trace!(alarms = stopped, "system clock closed, drivers stopped");
        }
    }
}

/// Control side of a system-backed timer or ticker.
#[derive(Debug)]
pub(crate) struct SystemHandle {
    cmd: mpsc::UnboundedSender<Cmd>,
    closed: Arc<AtomicBool>,
    spent: Arc<AtomicBool>,
}

impl SystemHandle {
    pub(crate) fn reset(&self, duration: Duration) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.spent.store(false, Ordering::SeqCst);
        self.cmd.send(Cmd::Reset(duration)).is_ok()
    }

    pub(crate) fn stop(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let was_pending = !self.spent.load(Ordering::SeqCst);
        let _ = self.cmd.send(Cmd::Stop);
        was_pending
    }
}

/// Driver loop for one system alarm.
///
/// Sleeps until the deadline, forwards the fire, then either reschedules
/// (ticker) or parks awaiting a reset (fired oneshot). Exits on stop or when
/// every control handle is gone.
#[cfg_attr(test, mutants::skip)] // mutations of the select arms hang the driver
async fn drive(
    mut deadline: Instant,
    period: Option<Duration>,
    tx: mpsc::Sender<SystemTime>,
    mut callback: Option<AlarmCallback>,
    mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    spent: Arc<AtomicBool>,
) {
    let mut armed = true;

    loop {
        tokio::select! {
            () = tokio::time::sleep_until(deadline), if armed => {
                // Best effort: an unconsumed previous fire wins the slot.
                let _ = tx.try_send(SystemTime::now());
                if let Some(f) = callback.as_mut() {
                    f();
                }
                match period {
                    Some(p) => deadline += p,
                    None => {
                        spent.store(true, Ordering::SeqCst);
                        armed = false;
                    }
                }
            }
            cmd = cmd_rx.recv() => match cmd {
                Some(Cmd::Reset(d)) => {
                    deadline = Instant::now() + d;
                    armed = true;
                }
                Some(Cmd::Stop) | None => return,
            },
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::Clock;

    // Generous bound for "fires at all" assertions on loaded CI machines.
    const PATIENCE: Duration = Duration::from_secs(5);

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(Clock: Send, Sync, Clone);
    }

    #[tokio::test]
    async fn system_timer_fires() {
        let clock = Clock::system();
        let before = SystemTime::now();

        let mut chan = clock.after(Duration::from_millis(5));
        let fired_at = tokio::time::timeout(PATIENCE, chan.recv())
            .await
            .expect("timer should fire")
            .expect("channel should stay open");

        assert!(fired_at >= before);
    }

    #[tokio::test]
    async fn system_ticker_fires_repeatedly() {
        let clock = Clock::system();

        let mut chan = clock.tick(Duration::from_millis(5));
        for _ in 0..3 {
            let fired = tokio::time::timeout(PATIENCE, chan.recv()).await;
            assert!(fired.is_ok());
        }
    }

    #[tokio::test]
    async fn stopped_system_timer_does_not_fire() {
        let clock = Clock::system();

        let mut timer = clock.new_timer(Duration::from_millis(20));
        assert!(timer.stop());
        assert!(!timer.stop());

        let waited = tokio::time::timeout(Duration::from_millis(60), timer.chan().recv()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn system_after_func_runs_the_callback() {
        let clock = Clock::system();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = Arc::clone(&fired);
        let _timer = clock.after_func(Duration::from_millis(5), move || {
            let _ = fired_in_cb.fetch_add(1, Ordering::SeqCst);
        });

        let deadline = Instant::now() + PATIENCE;
        while fired.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "callback should have run");
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn system_timer_reset_rearms() {
        let clock = Clock::system();

        let mut timer = clock.new_timer(Duration::from_millis(5));
        let first = tokio::time::timeout(PATIENCE, timer.chan().recv()).await;
        assert!(first.is_ok());

        assert!(timer.reset(Duration::from_millis(5)));
        let second = tokio::time::timeout(PATIENCE, timer.chan().recv()).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn closed_system_clock_stops_and_rejects_alarms() {
        let clock = Clock::system();

        let mut ticker = clock.new_ticker(Duration::from_millis(5));
        clock.close();
        assert!(!ticker.stop());

        // Registrations after close are inert.
        let mut timer = clock.new_timer(Duration::from_millis(5));
        assert!(!timer.stop());
        let waited = tokio::time::timeout(Duration::from_millis(40), timer.chan().recv()).await;
        assert!(waited.is_err());
    }
}
