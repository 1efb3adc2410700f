// Cancellable wait support
//
// A pair of sticky exit flags plus a notifier. All queue waits in the engine
// are loops of "arm notifier, check state, sleep" over one of these, so a
// signal is never lost between the check and the sleep.

use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::futures::Notified;
use tokio::sync::Notify;

const RUNNING: u8 = 0;
const EXIT_WHEN_DONE: u8 = 1;
const EXIT_FORCE: u8 = 2;

/// Result of a blocking pop on any engine queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopResult<T> {
    /// An element (or a non-empty batch) was dequeued.
    Element(T),
    /// The deadline passed before anything was available.
    Timeout,
    /// The queue is shutting down: exit-force fired, or exit-when-done
    /// fired and the queue is drained.
    Exit,
}

impl<T> PopResult<T> {
    pub fn into_element(self) -> Option<T> {
        match self {
            PopResult::Element(elem) => Some(elem),
            _ => None,
        }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, PopResult::Exit)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PopResult::Timeout)
    }
}

/// Sticky cancellation flags fused with a notifier.
///
/// The exit level only ever rises: running -> exit-when-done -> exit-force.
/// Both signals are idempotent and wake every waiter currently parked on
/// [`ExitFlags::notified`].
#[derive(Debug, Default)]
pub struct ExitFlags {
    level: AtomicU8,
    notify: Notify,
}

impl ExitFlags {
    pub fn new() -> Self {
        Self {
            level: AtomicU8::new(RUNNING),
            notify: Notify::new(),
        }
    }

    /// Stop accepting input and let consumers drain what is queued.
    pub fn signal_exit_when_done(&self) {
        self.raise(EXIT_WHEN_DONE);
    }

    /// Abort: waiters wake with `Exit` regardless of queue contents.
    pub fn signal_exit_force(&self) {
        self.raise(EXIT_FORCE);
    }

    fn raise(&self, target: u8) {
        let mut current = self.level.load(Ordering::Acquire);
        loop {
            if current >= target {
                // already at (or past) the requested level
                if target == EXIT_WHEN_DONE {
                    // still wake waiters so an empty queue can observe the
                    // repeated signal
                    self.notify.notify_waiters();
                }
                return;
            }
            match self.level.compare_exchange_weak(
                current,
                target,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.notify.notify_waiters();
    }

    pub fn is_exit_force(&self) -> bool {
        self.level.load(Ordering::Acquire) >= EXIT_FORCE
    }

    pub fn is_exit_when_done(&self) -> bool {
        self.level.load(Ordering::Acquire) >= EXIT_WHEN_DONE
    }

    /// Either flag: pushes must be refused.
    pub fn is_exit(&self) -> bool {
        self.level.load(Ordering::Acquire) != RUNNING
    }

    /// Wake a single waiter (an element was pushed).
    pub fn notify_one(&self) {
        self.notify.notify_one();
    }

    /// Wake every waiter (bulk push or a signal).
    pub fn notify_all(&self) {
        self.notify.notify_waiters();
    }

    /// A wakeup future. Callers pin it, call `enable()` on it, re-check the
    /// queue state and only then await, so nothing slips between the check
    /// and the sleep.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}
