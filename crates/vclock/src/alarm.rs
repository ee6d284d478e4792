// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;

use crate::virtual_clock::{ClockCore, OUTSIDE_RANGE_MESSAGE};

/// A callback attached to an alarm, invoked synchronously when the alarm fires.
pub(crate) type AlarmCallback = Box<dyn FnMut() + Send>;

/// Capacity of an alarm's delivery channel.
///
/// A single slot renders Go-style rendezvous delivery: the first fire always
/// lands, and subsequent fires must wait for the consumer to drain the slot
/// (or get dropped once the retry budget is exhausted).
pub(crate) const ALARM_CHANNEL_CAPACITY: usize = 1;

/// Unique, ordered identifier for a registered alarm.
///
/// Alarms are ordered by their due instant; ties are broken by the
/// registration sequence number so that two alarms due at the same instant
/// always fire in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct AlarmKey {
    due: SystemTime,

    /// Discriminator that keeps keys with the same due instant distinct and
    /// makes simultaneous fires deterministic (first registered fires first).
    seq: u64,
}

impl AlarmKey {
    pub(crate) const fn new(due: SystemTime, seq: u64) -> Self {
        Self { due, seq }
    }

    /// The instant at which the alarm is scheduled to fire.
    pub(crate) const fn due(&self) -> SystemTime {
        self.due
    }
}

/// The set of live alarms owned by a virtual clock, ordered by fire schedule.
///
/// Membership is guarded by the clock's registry lock; the mutable schedule
/// of each alarm is guarded by that alarm's own lock. Whenever both locks are
/// needed, the alarm lock is acquired first.
#[derive(Debug, Default)]
pub(crate) struct Alarms {
    map: BTreeMap<AlarmKey, Arc<VirtualAlarm>>,
}

impl Alarms {
    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub(crate) fn insert(&mut self, key: AlarmKey, alarm: Arc<VirtualAlarm>) {
        self.map.insert(key, alarm);
    }

    /// Removes an alarm by key. A stale key (already popped by the
    /// advancement loop or rewritten by a reset) is a no-op.
    pub(crate) fn remove(&mut self, key: AlarmKey) {
        self.map.remove(&key);
    }

    pub(crate) fn rekey(&mut self, old: AlarmKey, new: AlarmKey, alarm: &Arc<VirtualAlarm>) {
        self.map.remove(&old);
        self.map.insert(new, Arc::clone(alarm));
    }

    /// Pops the earliest alarm due at or before `target`, if any.
    pub(crate) fn pop_due(&mut self, target: SystemTime) -> Option<(AlarmKey, Arc<VirtualAlarm>)> {
        match self.map.first_key_value() {
            Some((key, _)) if key.due() <= target => self.map.pop_first(),
            _ => None,
        }
    }

    /// Removes every alarm, returning them so the caller can mark each one
    /// closed outside the registry lock.
    pub(crate) fn drain(&mut self) -> Vec<Arc<VirtualAlarm>> {
        let map = std::mem::take(&mut self.map);
        map.into_values().collect()
    }
}

/// One registered timer or ticker owned by a virtual clock.
///
/// The clock's registry is the sole owner; handles and the registry share the
/// alarm through `Arc`, and the alarm reaches back to its clock only through
/// a non-owning `Weak` reference (enough to ask "what is now" and to request
/// its own removal).
pub(crate) struct VirtualAlarm {
    owner: Weak<ClockCore>,
    seq: u64,
    oneshot: bool,
    tx: mpsc::Sender<SystemTime>,
    state: Mutex<AlarmState>,
}

struct AlarmState {
    next: SystemTime,
    period: Duration,
    closed: bool,
    /// A oneshot that has fired but can still be rearmed with `reset`.
    spent: bool,
    callback: Option<AlarmCallback>,
}

/// The decision taken for a popped alarm under its own lock.
pub(crate) enum FireOutcome {
    /// The alarm was stopped or rescheduled concurrently; nothing to do.
    Skip,
    /// The alarm fires. `repeat` is true for tickers, whose advanced schedule
    /// must be reinserted into the registry after delivery.
    Fire { callback: Option<AlarmCallback>, repeat: bool },
}

impl VirtualAlarm {
    /// Creates an alarm scheduled at `next`, returning it together with the
    /// receiving half of its delivery channel.
    pub(crate) fn new(
        owner: Weak<ClockCore>,
        seq: u64,
        next: SystemTime,
        period: Duration,
        oneshot: bool,
        callback: Option<AlarmCallback>,
    ) -> (Arc<Self>, mpsc::Receiver<SystemTime>) {
        let (tx, rx) = mpsc::channel(ALARM_CHANNEL_CAPACITY);

        let alarm = Arc::new(Self {
            owner,
            seq,
            oneshot,
            tx,
            state: Mutex::new(AlarmState {
                next,
                period,
                closed: false,
                spent: false,
                callback,
            }),
        });

        (alarm, rx)
    }

    pub(crate) fn sender(&self) -> &mpsc::Sender<SystemTime> {
        &self.tx
    }

    pub(crate) fn key(&self) -> AlarmKey {
        let state = self.lock_state();
        AlarmKey::new(state.next, self.seq)
    }

    /// Rewrites the alarm's schedule to fire `period` from now, rearming a
    /// fired oneshot.
    ///
    /// Returns false if the alarm is already closed. Safe against a
    /// simultaneous fire or stop via the alarm's own lock.
    pub(crate) fn reset(self: &Arc<Self>, period: Duration) -> bool {
        let Some(core) = self.owner.upgrade() else {
            return false;
        };
        let now = core.now();

        let mut state = self.lock_state();
        if state.closed {
            return false;
        }

        let old = AlarmKey::new(state.next, self.seq);
        state.period = period;
        state.next = now.checked_add(period).expect(OUTSIDE_RANGE_MESSAGE);
        state.spent = false;
        let new = AlarmKey::new(state.next, self.seq);

        // Alarm lock is still held; registry second is the crate-wide order.
        core.rekey(old, new, self);
        true
    }

    /// Marks the alarm closed and evicts it from its clock's registry.
    ///
    /// Returns false if it had already fired or been stopped. The delivery
    /// channel is left open so a blocked reader is not woken spuriously; it
    /// is simply never written to again.
    pub(crate) fn stop(&self) -> bool {
        let mut state = self.lock_state();
        if state.closed {
            return false;
        }
        state.closed = true;
        state.callback = None;
        let was_pending = !state.spent;
        let key = AlarmKey::new(state.next, self.seq);

        if let Some(core) = self.owner.upgrade() {
            core.evict(key);
        }
        was_pending
    }

    /// Marks the alarm closed without touching the registry. Used by clock
    /// close, which has already drained the registry.
    pub(crate) fn mark_closed(&self) {
        let mut state = self.lock_state();
        state.closed = true;
        state.callback = None;
    }

    /// Decides whether a popped alarm actually fires.
    ///
    /// A oneshot alarm is marked spent here, before its callback runs, so a
    /// fire in flight is never interrupted and never repeats; `reset` can
    /// still rearm it afterwards. A ticker advances its schedule anchored to
    /// the previous fire instant, so drift does not accumulate.
    pub(crate) fn begin_fire(&self, key: AlarmKey) -> FireOutcome {
        let mut state = self.lock_state();

        // A concurrent stop or reset between the registry pop and this lock
        // acquisition invalidates the popped key.
        if state.closed || state.next != key.due() || (self.oneshot && state.spent) {
            return FireOutcome::Skip;
        }

        if self.oneshot {
            state.spent = true;
            FireOutcome::Fire {
                callback: state.callback.take(),
                repeat: false,
            }
        } else {
            state.next = state.next.checked_add(state.period).expect(OUTSIDE_RANGE_MESSAGE);
            FireOutcome::Fire {
                callback: None,
                repeat: true,
            }
        }
    }

    /// Returns a callback taken by a fire, so a rearmed oneshot runs it
    /// again. Dropped instead if the alarm was stopped meanwhile.
    pub(crate) fn restore_callback(&self, callback: AlarmCallback) {
        let mut state = self.lock_state();
        if !state.closed {
            state.callback = Some(callback);
        }
    }

    /// Reinserts a ticker into the registry under its advanced schedule,
    /// unless it was stopped while its fire was being delivered.
    pub(crate) fn reinsert(self: &Arc<Self>) {
        let Some(core) = self.owner.upgrade() else {
            return;
        };

        let state = self.lock_state();
        if state.closed {
            return;
        }
        let key = AlarmKey::new(state.next, self.seq);

        // Alarm lock still held; see the lock-order note on `Alarms`.
        core.reregister(key, self);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, AlarmState> {
        self.state.lock().expect("alarm lock poisoned")
    }
}

impl fmt::Debug for VirtualAlarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("VirtualAlarm")
            .field("seq", &self.seq)
            .field("oneshot", &self.oneshot)
            .field("next", &state.next)
            .field("period", &state.period)
            .field("closed", &state.closed)
            .field("spent", &state.spent)
            .field("callback", &state.callback.as_ref().map(|_| "fn"))
            .finish()
    }
}
