// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(
    test,
    allow(
        clippy::arithmetic_side_effects,
        clippy::unchecked_time_subtraction,
        reason = "allow these lints in tests to improve the readability of the tests"
    )
)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A uniform interface over wall-clock time, timers, and tickers, with a
//! virtual clock that makes time-dependent code fast and deterministic
//! to test.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use vclock::Clock;
//!
//! async fn run_heartbeat(clock: &Clock) {
//!     let mut beats = clock.tick(Duration::from_secs(30));
//!     while let Some(at) = beats.recv().await {
//!         println!("heartbeat at {at:?}");
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let clock = Clock::system();
//!     run_heartbeat(&clock).await;
//! }
//!
//! #[cfg(test)]
//! mod tests {
//!     use super::*;
//!     use vclock::VirtualClock;
//!
//!     #[tokio::test]
//!     async fn heartbeats_are_emitted() {
//!         let clock = VirtualClock::new();
//!         let heartbeat = tokio::spawn({
//!             let clock = clock.to_clock();
//!             async move { run_heartbeat(&clock).await }
//!         });
//!
//!         // Ten minutes pass in microseconds of real time.
//!         clock.advance(Duration::from_secs(600), true).await;
//!         heartbeat.abort();
//!     }
//! }
//! ```
//!
//! # Why?
//!
//! Code that sleeps, times out, or runs periodic work is slow and flaky to
//! test against the operating system's clock. This crate splits the concern
//! in two:
//!
//! - Production code asks for a [`Clock`] and uses it for everything
//!   time-related. With [`Clock::system`] it behaves exactly like the
//!   operating system's clock.
//! - Tests build a [`VirtualClock`], hand [`VirtualClock::to_clock`] to the
//!   code under test, and move time explicitly with
//!   [`VirtualClock::advance`]. Every timer and ticker fires in a defined
//!   order, at exact instants, with no real waiting.
//!
//! The code under test cannot tell the two apart.
//!
//! # Overview
//!
//! - [`Clock`] - Source of the current time and factory for timers and
//!   tickers.
//! - [`Timer`] / [`Ticker`] - One-shot and repeating alarms; fires are
//!   announced on a [`TimeChan`].
//! - [`VirtualClock`] - Simulated time under test control.
//! - [`Context`] - Cancellation scopes in the style of Go's
//!   `context.Context`, with deadlines measured on a virtual clock; see
//!   [`background`], [`with_cancel`], and [`VirtualClock::with_deadline`].
//! - [`Sequence`] - Scripted scenarios: queue time advancements and events,
//!   then play them against a scenario task.
//!
//! # Determinism
//!
//! A virtual clock only moves when told to. Advancing it fires every due
//! alarm in schedule order (ties in registration order), delivers each fire
//! before the next one is considered, and runs timer callbacks synchronously
//! at the simulated instant of the fire. Run tests on Tokio's current-thread
//! scheduler and spawn consumers before advancing; the interleaving is then
//! reproducible run over run.

mod alarm;
mod clock;
mod context;
mod sequence;
mod system;
mod timer;
mod virtual_clock;

pub use clock::Clock;
pub use context::{background, CancelContext, CancelFn, Context, ContextError, DeadlineContext, with_cancel};
pub use sequence::{ScenarioError, Sequence};
pub use timer::{Ticker, TimeChan, Timer};
pub use virtual_clock::VirtualClock;
