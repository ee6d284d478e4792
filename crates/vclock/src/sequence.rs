// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::time::{Duration, SystemTime};

use crate::context::{background, CancelFn, DeadlineContext};
use crate::virtual_clock::{OUTSIDE_RANGE_MESSAGE, VirtualClock};

/// How long a scenario may run, in real time, before it is declared hung.
const DEFAULT_SCENARIO_TIMEOUT: Duration = Duration::from_secs(3);

/// A scripted test scenario against a [`VirtualClock`].
///
/// A sequence queues time advancements and side-effect events, then
/// [`run`][Self::run] plays them against the clock while the scenario body
/// executes as a task. The script drives every wake-up deterministically; a
/// real-time watchdog converts a hung scenario into an error instead of a
/// stuck test.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use vclock::{Sequence, VirtualClock};
///
/// # async fn example() -> Result<(), vclock::ScenarioError> {
/// let clock = VirtualClock::new();
/// let handle = clock.to_clock();
///
/// Sequence::new(&clock)
///     .wait(Duration::from_secs(30))
///     .run(async move {
///         handle.sleep(Duration::from_secs(30)).await;
///     })
///     .await
/// # }
/// ```
pub struct Sequence {
    clock: VirtualClock,
    scenario_timeout: Duration,
    /// Where simulated time will stand once every queued step has played.
    cursor: SystemTime,
    steps: Vec<Step>,
}

enum Step {
    Wait(Duration),
    Event(Box<dyn FnOnce() + Send>),
}

/// Why a scripted scenario did not complete.
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    /// The scenario was still running after the script finished and the
    /// real-time watchdog elapsed. Usually the scenario is waiting on a
    /// wake-up the script never schedules.
    #[error("scenario still running {0:?} after the script finished")]
    TimedOut(Duration),

    /// The scenario task panicked or was aborted.
    #[error("scenario failed: {0}")]
    Failed(#[from] tokio::task::JoinError),
}

impl Sequence {
    /// Starts an empty script against `clock`.
    #[must_use]
    pub fn new(clock: &VirtualClock) -> Self {
        Self {
            clock: clock.clone(),
            scenario_timeout: DEFAULT_SCENARIO_TIMEOUT,
            cursor: clock.now(),
            steps: Vec::new(),
        }
    }

    /// Replaces the real-time watchdog for the scenario body.
    #[must_use]
    pub fn scenario_timeout(mut self, timeout: Duration) -> Self {
        self.scenario_timeout = timeout;
        self
    }

    /// Queues an advancement of simulated time by `duration`.
    ///
    /// # Panics
    ///
    /// Panics if the accumulated script leaves the supported time range.
    #[must_use]
    pub fn wait(mut self, duration: Duration) -> Self {
        self.cursor = self.cursor.checked_add(duration).expect(OUTSIDE_RANGE_MESSAGE);
        self.steps.push(Step::Wait(duration));
        self
    }

    /// Queues a side effect to run between advancements.
    #[must_use]
    pub fn event(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.steps.push(Step::Event(Box::new(f)));
        self
    }

    /// Derives a context whose deadline is the end of the script so far.
    ///
    /// Queue the waits first, then hand this context to the scenario: it
    /// resolves with `DeadlineExceeded` exactly when the last queued wait
    /// completes.
    #[must_use = "dropping the context renders the deadline meaningless"]
    pub fn deadline_context(&self) -> (DeadlineContext, CancelFn) {
        self.clock.with_deadline(background(), self.cursor)
    }

    /// Plays the script while `scenario` runs as a task.
    ///
    /// The scenario is spawned, given one scheduling turn to park on its
    /// first wake-up, and then driven by the queued steps. After the script
    /// finishes, the scenario must complete within the real-time watchdog.
    ///
    /// # Errors
    ///
    /// Returns [`ScenarioError::TimedOut`] if the scenario outlives the
    /// watchdog and [`ScenarioError::Failed`] if it panics.
    pub async fn run<F>(self, scenario: F) -> Result<(), ScenarioError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Self {
            clock,
            scenario_timeout,
            steps,
            ..
        } = self;

        let body = tokio::spawn(scenario);
        // Let the scenario reach its first await before time moves.
        tokio::task::yield_now().await;

        for (index, step) in steps.into_iter().enumerate() {
            match step {
                Step::Wait(duration) => {
                    tracing::trace!(index, ?duration, "script wait");
                    clock.advance(duration, true).await;
                }
                Step::Event(f) => {
                    tracing::trace!(index, "script event");
                    f();
                }
            }
            // Let the scenario react to the step before the next one plays.
            tokio::task::yield_now().await;
        }

        match tokio::time::timeout(scenario_timeout, body).await {
            Ok(finished) => finished.map_err(ScenarioError::from),
            Err(_elapsed) => Err(ScenarioError::TimedOut(scenario_timeout)),
        }
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequence")
            .field("clock", &self.clock)
            .field("scenario_timeout", &self.scenario_timeout)
            .field("cursor", &self.cursor)
            .field("steps", &self.steps.len())
            .finish()
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::context::{Context, ContextError};

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(Sequence: Send);
        static_assertions::assert_impl_all!(ScenarioError: Send, Sync, std::error::Error);
    }

    #[tokio::test]
    async fn script_drives_the_scenario_to_completion() {
        let clock = VirtualClock::new();
        let handle = clock.to_clock();

        let finished = Arc::new(AtomicBool::new(false));
        let finished_in_body = Arc::clone(&finished);
        Sequence::new(&clock)
            .wait(Duration::from_secs(30))
            .wait(Duration::from_secs(30))
            .run(async move {
                handle.sleep(Duration::from_secs(30)).await;
                handle.sleep(Duration::from_secs(30)).await;
                finished_in_body.store(true, Ordering::SeqCst);
            })
            .await
            .expect("scenario should finish");

        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(clock.now(), SystemTime::UNIX_EPOCH + Duration::from_secs(60));
    }

    #[tokio::test]
    async fn events_interleave_with_waits() {
        let clock = VirtualClock::new();
        let handle = clock.to_clock();

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let order_in_event = Arc::clone(&order);
        let order_in_body = Arc::clone(&order);
        Sequence::new(&clock)
            .wait(Duration::from_secs(1))
            .event(move || order_in_event.lock().expect("lock").push("event"))
            .wait(Duration::from_secs(1))
            .run(async move {
                handle.sleep(Duration::from_secs(1)).await;
                order_in_body.lock().expect("lock").push("first wake");
                handle.sleep(Duration::from_secs(1)).await;
                order_in_body.lock().expect("lock").push("second wake");
            })
            .await
            .expect("scenario should finish");

        assert_eq!(
            *order.lock().expect("lock"),
            vec!["first wake", "event", "second wake"]
        );
    }

    #[tokio::test]
    async fn underscheduled_scenario_times_out() {
        let clock = VirtualClock::new();
        let handle = clock.to_clock();

        // The scenario needs 10 simulated seconds; the script provides 1.
        let result = Sequence::new(&clock)
            .scenario_timeout(Duration::from_millis(50))
            .wait(Duration::from_secs(1))
            .run(async move {
                handle.sleep(Duration::from_secs(10)).await;
            })
            .await;

        assert!(matches!(result, Err(ScenarioError::TimedOut(_))));
    }

    #[tokio::test]
    async fn panicking_scenario_reports_failure() {
        let clock = VirtualClock::new();

        let result = Sequence::new(&clock)
            .run(async move {
                panic!("scenario bug");
            })
            .await;

        assert!(matches!(result, Err(ScenarioError::Failed(_))));
    }

    #[tokio::test]
    async fn deadline_context_resolves_at_the_end_of_the_script() {
        let clock = VirtualClock::new();

        let sequence = Sequence::new(&clock).wait(Duration::from_secs(5));
        let (ctx, _cancel) = sequence.deadline_context();
        assert_eq!(
            ctx.deadline(),
            Some(SystemTime::UNIX_EPOCH + Duration::from_secs(5))
        );

        let resolved = Arc::new(AtomicUsize::new(0));
        let resolved_in_body = Arc::clone(&resolved);
        let body_ctx = ctx.clone();
        sequence
            .run(async move {
                body_ctx.done().cancelled().await;
                let _ = resolved_in_body.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .expect("scenario should finish");

        assert_eq!(resolved.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }
}
