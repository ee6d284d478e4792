// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

use crate::timer::Timer;
use crate::virtual_clock::VirtualClock;

/// Why a context was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// The context was canceled explicitly, or inherited cancellation from
    /// its parent.
    #[error("context canceled")]
    Canceled,

    /// The context's deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Requests cancellation of the context it was returned with.
///
/// Calling it more than once, or after the context resolved for another
/// reason, has no effect.
pub type CancelFn = Box<dyn Fn() + Send + Sync>;

/// A cancellation scope in the style of Go's `context.Context`.
///
/// A context resolves at most once; the first cause wins and later causes
/// are ignored. Resolution is observable two ways, and the two always agree:
/// [`err`][Self::err] returns the cause, and the token returned by
/// [`done`][Self::done] is cancelled.
///
/// Contexts form a tree: resolving a parent resolves every derived context,
/// while a derived context resolving leaves its parent untouched.
pub trait Context: fmt::Debug + Send + Sync {
    /// The instant at which this context resolves by itself, if it has one.
    fn deadline(&self) -> Option<SystemTime>;

    /// A token cancelled exactly when the context resolves.
    ///
    /// Await `done().cancelled()` to park until resolution.
    fn done(&self) -> CancellationToken;

    /// The cause of resolution, or `None` while the context is live.
    ///
    /// A context with no resolution of its own reports its parent's.
    fn err(&self) -> Option<ContextError>;

    /// Looks up a request-scoped value by type.
    ///
    /// None of the contexts in this crate carry values; they delegate to
    /// their parent, so a custom carrier anywhere up the chain is visible
    /// from every derived context.
    fn value(&self, key: TypeId) -> Option<Arc<dyn Any + Send + Sync>>;
}

/// Returns the root context: never resolved, no deadline, no values.
#[must_use]
pub fn background() -> Arc<dyn Context> {
    static INSTANCE: OnceLock<Arc<Background>> = OnceLock::new();
    let root = INSTANCE.get_or_init(|| {
        Arc::new(Background {
            done: CancellationToken::new(),
        })
    });
    Arc::clone(root) as Arc<dyn Context>
}

#[derive(Debug)]
struct Background {
    // Never cancelled; clones handed out by done() share its waiters.
    done: CancellationToken,
}

impl Context for Background {
    fn deadline(&self) -> Option<SystemTime> {
        None
    }

    fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    fn err(&self) -> Option<ContextError> {
        None
    }

    fn value(&self, _key: TypeId) -> Option<Arc<dyn Any + Send + Sync>> {
        None
    }
}

/// Derives a context that resolves when `cancel` is called or when `parent`
/// resolves, whichever happens first.
///
/// # Panics
///
/// Must be called within a Tokio runtime: parent resolution is observed by a
/// background watcher task.
#[must_use = "dropping the context cancels it"]
pub fn with_cancel(parent: Arc<dyn Context>) -> (CancelContext, CancelFn) {
    let inner = Arc::new(CancelInner {
        parent,
        latch: OnceLock::new(),
        done: CancellationToken::new(),
    });

    if let Some(cause) = inner.parent.err() {
        inner.resolve(cause);
    } else {
        spawn_parent_watcher(&inner.parent.done(), &inner.done, Arc::downgrade(&inner));
    }

    let cancel_target = Arc::clone(&inner);
    let cancel: CancelFn = Box::new(move || cancel_target.resolve(ContextError::Canceled));

    (CancelContext { inner }, cancel)
}

/// A context resolved by an explicit cancel call or by its parent.
///
/// Created by [`with_cancel`]. Clones share the same resolution state.
/// Dropping every clone (and the cancel procedure) resolves the context, so
/// an abandoned scope does not leak its watcher task.
#[derive(Debug, Clone)]
pub struct CancelContext {
    inner: Arc<CancelInner>,
}

#[derive(Debug)]
struct CancelInner {
    parent: Arc<dyn Context>,
    latch: OnceLock<ContextError>,
    done: CancellationToken,
}

impl Drop for CancelInner {
    fn drop(&mut self) {
        // Unblocks the watcher task once the scope is abandoned.
        self.resolve(ContextError::Canceled);
    }
}

impl Context for CancelContext {
    fn deadline(&self) -> Option<SystemTime> {
        self.inner.parent.deadline()
    }

    fn done(&self) -> CancellationToken {
        self.inner.done.clone()
    }

    fn err(&self) -> Option<ContextError> {
        self.inner.latch.get().copied().or_else(|| self.inner.parent.err())
    }

    fn value(&self, key: TypeId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.parent.value(key)
    }
}

/// A context resolved by a deadline on a virtual clock, by explicit cancel,
/// or by its parent, whichever happens first.
///
/// Created by [`VirtualClock::with_deadline`] or
/// [`VirtualClock::with_timeout`]. The deadline is measured in simulated
/// time: crossing it during [`VirtualClock::advance`] resolves the context
/// synchronously, before `advance` returns, so a test can assert on the
/// resolution immediately afterwards.
///
/// Clones share the same resolution state. Dropping every clone (and the
/// cancel procedure) resolves the context.
#[derive(Debug, Clone)]
pub struct DeadlineContext {
    inner: Arc<DeadlineInner>,
}

#[derive(Debug)]
struct DeadlineInner {
    deadline: SystemTime,
    parent: Arc<dyn Context>,
    latch: OnceLock<ContextError>,
    done: CancellationToken,
    alarm: Mutex<Option<Timer>>,
}

impl DeadlineContext {
    pub(crate) fn new(clock: &VirtualClock, parent: Arc<dyn Context>, deadline: SystemTime) -> (Self, CancelFn) {
        let inner = Arc::new(DeadlineInner {
            deadline,
            parent,
            latch: OnceLock::new(),
            done: CancellationToken::new(),
            alarm: Mutex::new(None),
        });

        if let Some(cause) = inner.parent.err() {
            // Already-resolved parent: no alarm, no watcher.
            inner.resolve(cause);
        } else {
            // A deadline at or before the current instant resolves on the
            // next advancement, like any other alarm already due.
            let until_deadline = deadline.duration_since(clock.now()).unwrap_or(Duration::ZERO);
            let weak = Arc::downgrade(&inner);
            let timer = clock.to_clock().after_func(until_deadline, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.resolve(ContextError::DeadlineExceeded);
                }
            });
            *inner.alarm.lock().expect(ALARM_SLOT_LOCK_MESSAGE) = Some(timer);

            spawn_parent_watcher(&inner.parent.done(), &inner.done, Arc::downgrade(&inner));
        }

        let cancel_target = Arc::clone(&inner);
        let cancel: CancelFn = Box::new(move || cancel_target.resolve(ContextError::Canceled));

        (Self { inner }, cancel)
    }
}

static ALARM_SLOT_LOCK_MESSAGE: &str = "deadline alarm slot lock poisoned";

impl Drop for DeadlineInner {
    fn drop(&mut self) {
        // Unblocks the watcher task and retires the deadline alarm once the
        // scope is abandoned.
        self.resolve(ContextError::Canceled);
    }
}

impl Context for DeadlineContext {
    fn deadline(&self) -> Option<SystemTime> {
        Some(self.inner.deadline)
    }

    fn done(&self) -> CancellationToken {
        self.inner.done.clone()
    }

    fn err(&self) -> Option<ContextError> {
        self.inner.latch.get().copied().or_else(|| self.inner.parent.err())
    }

    fn value(&self, key: TypeId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.parent.value(key)
    }
}

/// Shared resolution plumbing for derived contexts. The first cause to land
/// in the latch wins; the done token closes exactly when the latch is set.
trait Resolvable: Send + Sync + 'static {
    fn resolve(&self, cause: ContextError);
    fn parent_err(&self) -> Option<ContextError>;
}

impl Resolvable for CancelInner {
    fn resolve(&self, cause: ContextError) {
        if self.latch.set(cause).is_ok() {
            self.done.cancel();
        }
    }

    fn parent_err(&self) -> Option<ContextError> {
        self.parent.err()
    }
}

impl Resolvable for DeadlineInner {
    fn resolve(&self, cause: ContextError) {
        if self.latch.set(cause).is_ok() {
            self.done.cancel();
            tracing::trace!(%cause, deadline = ?self.deadline, "context resolved");
        }

        // The deadline alarm is pointless once resolved, whatever the cause.
        let timer = self.alarm.lock().expect(ALARM_SLOT_LOCK_MESSAGE).take();
        if let Some(timer) = timer {
            let _ = timer.stop();
        }
    }

    fn parent_err(&self) -> Option<ContextError> {
        self.parent.err()
    }
}

/// Races the parent's resolution against our own.
///
/// Holds only a weak reference to the context, so an abandoned scope is not
/// kept alive by its watcher; the context's drop resolution wakes the `own`
/// arm and lets the task exit.
fn spawn_parent_watcher<R: Resolvable>(parent_done: &CancellationToken, own_done: &CancellationToken, inner: std::sync::Weak<R>) {
    let parent_done = parent_done.clone();
    let own_done = own_done.clone();

    drop(tokio::spawn(async move {
        tokio::select! {
            () = parent_done.cancelled() => {
                if let Some(inner) = inner.upgrade() {
                    let cause = inner.parent_err().unwrap_or(ContextError::Canceled);
                    inner.resolve(cause);
                }
            }
            () = own_done.cancelled() => {}
        }
    }));
}
