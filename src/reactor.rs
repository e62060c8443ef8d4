//! The `Loop` contract: the reactor interface every backend implements, plus the
//! bookkeeping (timers, child-watches, the `loop_forever` stop flag) that's identical across
//! backends and so lives here as default trait methods over a shared [`LoopCore`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use nix::unistd::Pid;
use tracing::trace;

use crate::error::{ExitStatus, Result};
use crate::notifier::{add_recursive, remove_recursive, LoopFeedback, Notifier};
use crate::timer::{TimerId, TimerQueue};

/// Bookkeeping shared by every backend: the timer queue, per-pid exit callbacks, and the
/// `loop_forever` sentinel.
#[derive(Default)]
pub struct LoopCore {
    pub(crate) timers: TimerQueue,
    pub(crate) child_watches: HashMap<Pid, Vec<Box<dyn FnOnce(ExitStatus)>>>,
    pub(crate) running: bool,
}

impl LoopCore {
    pub fn new() -> LoopCore {
        LoopCore::default()
    }
}

/// The reactor interface implemented by both [`crate::poll_loop::PollLoop`] and
/// [`crate::external_loop::ExternalLoop`].
pub trait Loop: LoopFeedback + Sized {
    /// Shared timer/child-watch/stop-flag bookkeeping.
    fn core(&self) -> &RefCell<LoopCore>;

    /// A strong, type-erased handle to `self`, used to give newly-added notifier subtrees a
    /// `Weak<dyn LoopFeedback>` back-reference.
    fn feedback_handle(&self) -> Rc<dyn LoopFeedback>;

    /// Waits up to `timeout` (or forever if `None`) for a source to become ready, dispatches all
    /// ready fd sources and all expired timers, and returns the count of ready fd sources (0 on
    /// pure timeout).
    fn loop_once(&self, timeout: Option<Duration>) -> Result<usize>;

    /// Registers `notifier` and, recursively, its descendants. Fails if `notifier` already
    /// belongs to any `Loop`.
    fn add(&self, notifier: &Notifier) -> Result<()> {
        add_recursive(self.feedback_handle(), notifier)
    }

    /// Removes `notifier` and, recursively, its descendants.
    fn remove(&self, notifier: &Notifier) {
        remove_recursive(notifier);
    }

    /// Schedules `callback` to fire after `delay`. See [`TimerQueue::enqueue`].
    fn enqueue_timer(&self, delay: Duration, callback: impl FnOnce() + 'static) -> TimerId {
        let now = Instant::now();
        self.core().borrow_mut().timers.enqueue(now, delay, Box::new(callback))
    }

    /// Cancels a pending timer. A no-op if it already fired or doesn't exist.
    fn cancel_timer(&self, id: TimerId) {
        self.core().borrow_mut().timers.cancel(id);
    }

    /// Registers interest in `pid`'s exit. Multiple callbacks may be registered for the same
    /// pid; all fire once the pid is reaped.
    fn watch_child(&self, pid: Pid, callback: impl FnOnce(ExitStatus) + 'static) {
        self.core()
            .borrow_mut()
            .child_watches
            .entry(pid)
            .or_default()
            .push(Box::new(callback));
    }

    /// Drops all pending callbacks registered for `pid`.
    fn unwatch_child(&self, pid: Pid) {
        self.core().borrow_mut().child_watches.remove(&pid);
    }

    /// Runs `loop_once(None)` until [`Loop::loop_stop`] is called from within a callback.
    fn loop_forever(&self) -> Result<()> {
        self.core().borrow_mut().running = true;
        while self.core().borrow().running {
            self.loop_once(None)?;
        }
        trace!("loop_forever: stopped");
        Ok(())
    }

    /// Clears the `loop_forever` sentinel; takes effect once the current `loop_once` returns.
    fn loop_stop(&self) {
        self.core().borrow_mut().running = false;
    }
}

/// Dispatches every child-exit callback registered for `pid`, draining its entry from
/// `child_watches`. A reaped pid with no registered watcher is silently discarded.
pub(crate) fn dispatch_child_exit(core: &RefCell<LoopCore>, pid: Pid, status: ExitStatus) {
    let callbacks = core.borrow_mut().child_watches.remove(&pid);
    if let Some(callbacks) = callbacks {
        for cb in callbacks {
            cb(status);
        }
    }
}

/// Clamps a requested wait `timeout` to the queue's next deadline, and fires every timer whose
/// deadline has already passed relative to `now`. Returns the (possibly shortened) timeout to
/// actually wait with.
pub(crate) fn clamp_timeout_to_timers(
    timers: &mut TimerQueue,
    now: Instant,
    timeout: Option<Duration>,
) -> Option<Duration> {
    match timers.next_deadline() {
        None => timeout,
        Some(deadline) => {
            let until = deadline.saturating_duration_since(now);
            match timeout {
                None => Some(until),
                Some(t) => Some(t.min(until)),
            }
        }
    }
}
