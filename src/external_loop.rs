//! `ExternalLoop`: an adapter backend for embedding this reactor's notifier/timer/child-watch
//! model inside a host application's own main loop (GLib, libuv, Qt, ...) instead of driving a
//! multiplexer of our own.
//!
//! The host is abstracted as [`HostLoop`]: four primitives — register an fd source, remove a
//! source, register a one-shot timer source, and run one iteration. One source is registered per
//! (notifier, direction); a unified bidirectional handle gets two independent host sources on the
//! same fd rather than one combined-mask source, since that's how most host loop APIs (GLib's
//! `g_source_add_poll`, libuv's per-direction `uv_poll`) actually work. Timer cancellation maps
//! onto `remove_source`: a pending wait's bound is itself just a one-shot host timer, added
//! before `run_iteration` and removed right after, so the host always owns the actual sleep.

use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use slab::Slab;

use crate::error::Result;
use crate::notifier::{LoopFeedback, Notifier, NotifierKey, WeakNotifier};
use crate::reactor::{clamp_timeout_to_timers, Loop, LoopCore};

/// Which direction a host fd source watches.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Interest {
    Read,
    Write,
}

/// The host main loop primitives an [`ExternalLoop`] needs.
pub trait HostLoop {
    /// A handle identifying a source registered with the host, usable with [`HostLoop::remove_source`].
    type SourceHandle: Clone;

    /// Registers a callback to run whenever `fd` is ready for `interest`.
    fn add_fd_source(&self, fd: RawFd, interest: Interest, cb: Box<dyn FnMut()>) -> Self::SourceHandle;

    /// Tears down a previously registered fd or timer source.
    fn remove_source(&self, handle: Self::SourceHandle);

    /// Registers a one-shot timer source that fires `cb` after `millis`.
    fn add_timer(&self, millis: u64, cb: Box<dyn FnOnce()>) -> Self::SourceHandle;

    /// Runs a single iteration of the host's own loop, waiting up to `timeout` (or indefinitely
    /// if `None`) for any registered source to fire.
    fn run_iteration(&self, timeout: Option<Duration>);
}

struct SourceEntry<H: HostLoop> {
    notifier: WeakNotifier,
    read_handle: Option<H::SourceHandle>,
    write_handle: Option<H::SourceHandle>,
}

struct ExternalLoopInner<H: HostLoop> {
    host: H,
    sources: RefCell<Slab<SourceEntry<H>>>,
    core: RefCell<LoopCore>,
    self_weak: Weak<ExternalLoopInner<H>>,
    ready_counter: Rc<Cell<usize>>,
}

impl<H: HostLoop> ExternalLoopInner<H> {
    fn add_read_source(&self, key: NotifierKey, fd: RawFd) -> H::SourceHandle {
        let weak_self = self.self_weak.clone();
        let counter = self.ready_counter.clone();
        self.host.add_fd_source(
            fd,
            Interest::Read,
            Box::new(move || {
                counter.set(counter.get() + 1);
                if let Some(inner) = weak_self.upgrade() {
                    let notifier = inner.sources.borrow().get(key).and_then(|s| s.notifier.upgrade());
                    if let Some(notifier) = notifier {
                        notifier.fire_read_ready();
                    }
                }
            }),
        )
    }

    fn add_write_source(&self, key: NotifierKey, fd: RawFd) -> H::SourceHandle {
        let weak_self = self.self_weak.clone();
        let counter = self.ready_counter.clone();
        self.host.add_fd_source(
            fd,
            Interest::Write,
            Box::new(move || {
                counter.set(counter.get() + 1);
                if let Some(inner) = weak_self.upgrade() {
                    let notifier = inner.sources.borrow().get(key).and_then(|s| s.notifier.upgrade());
                    if let Some(notifier) = notifier {
                        notifier.fire_write_ready();
                    }
                }
            }),
        )
    }
}

impl<H: HostLoop> LoopFeedback for ExternalLoopInner<H> {
    fn register_one(&self, notifier: &Notifier) -> Result<NotifierKey> {
        let read_fd = notifier.read_fd();
        let write_fd = notifier.write_fd();
        let want_write = notifier.want_writeready_flag();

        let key = self.sources.borrow_mut().insert(SourceEntry {
            notifier: notifier.downgrade(),
            read_handle: None,
            write_handle: None,
        });

        if let Some(rfd) = read_fd {
            let handle = self.add_read_source(key, rfd);
            self.sources.borrow_mut()[key].read_handle = Some(handle);
        }
        if want_write {
            if let Some(wfd) = write_fd {
                let handle = self.add_write_source(key, wfd);
                self.sources.borrow_mut()[key].write_handle = Some(handle);
            }
        }
        Ok(key)
    }

    fn deregister_one(&self, notifier: &Notifier) {
        let Some(membership) = notifier.set_membership() else {
            return;
        };
        let entry = self.sources.borrow_mut().try_remove(membership.key);
        if let Some(entry) = entry {
            if let Some(h) = entry.read_handle {
                self.host.remove_source(h);
            }
            if let Some(h) = entry.write_handle {
                self.host.remove_source(h);
            }
        }
    }

    fn reregister_writeready(&self, notifier: &Notifier, want: bool) {
        let Some(membership) = notifier.set_membership() else {
            return;
        };
        let key = membership.key;
        let existing = {
            let sources = self.sources.borrow();
            sources.get(key).and_then(|e| e.write_handle.clone())
        };

        match (want, existing) {
            (true, None) => {
                if let Some(wfd) = notifier.write_fd() {
                    let handle = self.add_write_source(key, wfd);
                    if let Some(entry) = self.sources.borrow_mut().get_mut(key) {
                        entry.write_handle = Some(handle);
                    }
                }
            }
            (false, Some(h)) => {
                self.host.remove_source(h);
                if let Some(entry) = self.sources.borrow_mut().get_mut(key) {
                    entry.write_handle = None;
                }
            }
            _ => {}
        }
    }
}

/// The host-main-loop-integrated backend.
pub struct ExternalLoop<H: HostLoop> {
    inner: Rc<ExternalLoopInner<H>>,
}

impl<H: HostLoop> Clone for ExternalLoop<H> {
    fn clone(&self) -> Self {
        ExternalLoop { inner: self.inner.clone() }
    }
}

impl<H: HostLoop> ExternalLoop<H> {
    /// Wraps an existing host loop context.
    pub fn new(host: H) -> ExternalLoop<H> {
        let inner = Rc::new_cyclic(|weak: &Weak<ExternalLoopInner<H>>| ExternalLoopInner {
            host,
            sources: RefCell::new(Slab::new()),
            core: RefCell::new(LoopCore::new()),
            self_weak: weak.clone(),
            ready_counter: Rc::new(Cell::new(0)),
        });
        ExternalLoop { inner }
    }

    /// The wrapped host context.
    pub fn host(&self) -> &H {
        &self.inner.host
    }
}

impl<H: HostLoop + 'static> LoopFeedback for ExternalLoop<H> {
    fn register_one(&self, notifier: &Notifier) -> Result<NotifierKey> {
        self.inner.register_one(notifier)
    }

    fn deregister_one(&self, notifier: &Notifier) {
        self.inner.deregister_one(notifier)
    }

    fn reregister_writeready(&self, notifier: &Notifier, want: bool) {
        self.inner.reregister_writeready(notifier, want)
    }
}

impl<H: HostLoop + 'static> Loop for ExternalLoop<H> {
    fn core(&self) -> &RefCell<LoopCore> {
        &self.inner.core
    }

    fn feedback_handle(&self) -> Rc<dyn LoopFeedback> {
        self.inner
            .self_weak
            .upgrade()
            .expect("ExternalLoop's own inner is always alive while ExternalLoop is")
    }

    fn loop_once(&self, timeout: Option<Duration>) -> Result<usize> {
        let _span = tracing::debug_span!("loop_once", backend = "external").entered();
        let now = Instant::now();
        let effective_timeout = {
            let mut core = self.inner.core.borrow_mut();
            clamp_timeout_to_timers(&mut core.timers, now, timeout)
        };

        self.inner.ready_counter.set(0);

        // Bound the host's own wait by a one-shot host timer rather than assuming
        // `run_iteration` accepts a timeout natively; removing it if it didn't fire is just
        // "timer cancellation maps to remove_source".
        let bound_timer = effective_timeout.map(|d| {
            let millis = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
            self.inner.host.add_timer(millis, || {})
        });

        self.inner.host.run_iteration(effective_timeout);

        if let Some(handle) = bound_timer {
            self.inner.host.remove_source(handle);
        }

        self.inner.core.borrow_mut().timers.fire_expired(Instant::now());
        Ok(self.inner.ready_counter.get())
    }
}
