//! `Notifier`: the base event sink every other notifier type is built from.
//!
//! Ownership is single-threaded cooperative: a `Notifier` is an `Rc<RefCell<..>>` cell the
//! application holds onto (cloning the handle just bumps a refcount, same value), while a `Loop`
//! keeps only a `Weak` back-reference — the loop holds non-owning references, the caller retains
//! ownership. The `LoopFeedback` trait is a thin interface letting a `Notifier` reach whichever
//! concrete backend (`PollLoop`, `ExternalLoop<H>`) currently owns it without depending on either
//! type directly.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::trace;

use crate::error::{Error, Result};
use crate::handle::Handles;

/// A stable key identifying a registered notifier within a backend's bookkeeping (a slab index).
pub type NotifierKey = usize;

/// The backend-agnostic interface a `Notifier` uses to reach its owning `Loop`.
///
/// Implemented by the concrete backends' shared inner state, never called directly by users.
pub(crate) trait LoopFeedback {
    /// Installs OS interest for `notifier` (but not its children) and returns the key it was
    /// assigned.
    fn register_one(&self, notifier: &Notifier) -> Result<NotifierKey>;
    /// Tears down OS interest for `notifier` (but not its children).
    fn deregister_one(&self, notifier: &Notifier);
    /// Adjusts the write-interest bit for an already-registered notifier.
    fn reregister_writeready(&self, notifier: &Notifier, want: bool);
}

pub(crate) struct SetMembership {
    pub feedback: Weak<dyn LoopFeedback>,
    pub key: NotifierKey,
}

impl Clone for SetMembership {
    fn clone(&self) -> Self {
        SetMembership {
            feedback: self.feedback.clone(),
            key: self.key,
        }
    }
}

type ReadySlot = Option<Box<dyn FnMut()>>;

pub(crate) struct NotifierState {
    pub handles: Handles,
    pub want_writeready: bool,
    pub on_read_ready: ReadySlot,
    pub on_write_ready: ReadySlot,
    pub on_child_closed: Option<Box<dyn FnMut(Notifier)>>,
    pub parent: Option<Weak<RefCell<NotifierState>>>,
    pub children: Vec<Notifier>,
    pub set: Option<SetMembership>,
}

/// A recursive reference to an event sink bound to one or two OS handles.
///
/// Cloning a `Notifier` clones the handle, not the sink: both values name the same underlying
/// state (the `Rc` is the point). This is the idiomatic Rust stand-in for the source's "pass
/// around a reference to the same object" discipline.
#[derive(Clone)]
pub struct Notifier(pub(crate) Rc<RefCell<NotifierState>>);

/// Parameters accepted by [`Notifier::new`].
pub struct NotifierParams {
    pub handles: Handles,
    pub on_read_ready: Option<Box<dyn FnMut()>>,
    pub on_write_ready: Option<Box<dyn FnMut()>>,
    pub want_writeready: bool,
}

impl Notifier {
    /// Constructs a detached `Notifier`. Fails if neither a handle nor a read+write pair was
    /// supplied, or if there is no `on_read_ready` available.
    pub fn new(params: NotifierParams) -> Result<Notifier> {
        if params.handles.read_fd().is_none() && params.handles.write_fd().is_none() {
            return Err(Error::configuration(
                "Notifier requires at least one of read_handle or write_handle",
            ));
        }
        if params.handles.read_fd().is_some() && params.on_read_ready.is_none() {
            return Err(Error::configuration(
                "Notifier has a read_handle but no on_read_ready callback",
            ));
        }
        Ok(Notifier(Rc::new(RefCell::new(NotifierState {
            handles: params.handles,
            want_writeready: params.want_writeready,
            on_read_ready: params.on_read_ready,
            on_write_ready: params.on_write_ready,
            on_child_closed: None,
            parent: None,
            children: Vec::new(),
            set: None,
        }))))
    }

    /// Constructs a detached `Notifier` with no handles and no read-ready callback — the shape
    /// `ProcessWatcher` needs, which owns no fd of its own. Internal: the invariant that a
    /// `Notifier` normally requires `on_read_ready`/a handle is a rule for the *public*
    /// constructor; subtypes that bypass fd multiplexing entirely install their own empty shell.
    pub(crate) fn new_handleless() -> Notifier {
        Notifier(Rc::new(RefCell::new(NotifierState {
            handles: Handles::Split {
                read: None,
                write: None,
            },
            want_writeready: false,
            on_read_ready: None,
            on_write_ready: None,
            on_child_closed: None,
            parent: None,
            children: Vec::new(),
            set: None,
        })))
    }

    pub(crate) fn set_on_read_ready(&self, cb: Box<dyn FnMut()>) {
        self.0.borrow_mut().on_read_ready = Some(cb);
    }

    pub(crate) fn set_on_write_ready(&self, cb: Box<dyn FnMut()>) {
        self.0.borrow_mut().on_write_ready = Some(cb);
    }

    /// Sets the callback invoked when a child notifier is closed via [`Notifier::handle_closed`].
    pub fn set_on_child_closed(&self, cb: Box<dyn FnMut(Notifier)>) {
        self.0.borrow_mut().on_child_closed = Some(cb);
    }

    pub(crate) fn read_fd(&self) -> Option<std::os::unix::io::RawFd> {
        self.0.borrow().handles.read_fd()
    }

    pub(crate) fn write_fd(&self) -> Option<std::os::unix::io::RawFd> {
        self.0.borrow().handles.write_fd()
    }

    pub(crate) fn is_unified_fd(&self) -> bool {
        self.0.borrow().handles.is_unified()
    }

    pub fn want_writeready_flag(&self) -> bool {
        self.0.borrow().want_writeready
    }

    /// Records write-interest and, if currently registered with a `Loop`, signals it to adjust
    /// the write-handle's interest mask immediately.
    pub fn want_writeready(&self, want: bool) {
        let feedback = {
            let mut state = self.0.borrow_mut();
            state.want_writeready = want;
            state.set.as_ref().map(|s| s.feedback.clone())
        };
        trace!(want, "write-interest changed");
        if let Some(feedback) = feedback {
            if let Some(feedback) = feedback.upgrade() {
                feedback.reregister_writeready(self, want);
            }
        }
    }

    /// Whether this notifier currently belongs to a `Loop`.
    pub fn is_in_loop(&self) -> bool {
        self.0.borrow().set.is_some()
    }

    pub(crate) fn set_membership(&self) -> Option<SetMembership> {
        self.0.borrow().set.clone()
    }

    pub(crate) fn install_membership(&self, membership: SetMembership) {
        self.0.borrow_mut().set = Some(membership);
    }

    pub(crate) fn clear_membership(&self) {
        self.0.borrow_mut().set = None;
    }

    pub(crate) fn has_parent(&self) -> bool {
        self.0.borrow().parent.is_some()
    }

    /// An ordered snapshot of this notifier's children, for recursive add/remove.
    pub(crate) fn children(&self) -> Vec<Notifier> {
        self.0.borrow().children.clone()
    }

    /// Attaches `child`, recursively adding it to this notifier's `Loop` if one is set.
    /// Fails if `child` already has a parent, or already belongs to any `Loop`.
    pub fn add_child(&self, child: Notifier) -> Result<()> {
        if child.has_parent() {
            return Err(Error::configuration("child already has a parent"));
        }
        if child.is_in_loop() {
            return Err(Error::configuration("child already belongs to a Loop"));
        }

        let feedback = self.set_membership().and_then(|m| m.feedback.upgrade());
        if let Some(feedback) = &feedback {
            add_recursive(feedback.clone(), &child)?;
        }

        child.0.borrow_mut().parent = Some(Rc::downgrade(&self.0));
        self.0.borrow_mut().children.push(child);
        trace!("child attached");
        Ok(())
    }

    /// Detaches `child`; removes it (and its descendants) from its `Loop`, if any.
    pub fn remove_child(&self, child: &Notifier) {
        let mut state = self.0.borrow_mut();
        if let Some(pos) = state
            .children
            .iter()
            .position(|c| Rc::ptr_eq(&c.0, &child.0))
        {
            state.children.remove(pos);
        }
        drop(state);
        child.0.borrow_mut().parent = None;
        remove_recursive(child);
        trace!("child detached");
    }

    /// Called on unrecoverable read/write failure: detaches from the parent (if any) or removes
    /// itself from its `Loop`, then notifies the parent via `on_child_closed`.
    pub fn handle_closed(&self) {
        trace!("handle closed");
        let parent = self.0.borrow().parent.clone().and_then(|p| p.upgrade());
        match &parent {
            Some(parent_state) => {
                let parent_notifier = Notifier(parent_state.clone());
                let mut ps = parent_state.borrow_mut();
                if let Some(pos) = ps.children.iter().position(|c| Rc::ptr_eq(&c.0, &self.0)) {
                    ps.children.remove(pos);
                }
                drop(ps);
                self.0.borrow_mut().parent = None;
                remove_recursive(self);
                let mut cb = parent_notifier.0.borrow_mut().on_child_closed.take();
                if let Some(f) = cb.as_mut() {
                    f(self.clone());
                }
                if cb.is_some() && parent_notifier.0.borrow().on_child_closed.is_none() {
                    parent_notifier.0.borrow_mut().on_child_closed = cb;
                }
            }
            None => {
                remove_recursive(self);
            }
        }
    }

    fn fire_slot(&self, pick: impl Fn(&mut NotifierState) -> &mut ReadySlot) {
        let taken = pick(&mut self.0.borrow_mut()).take();
        if let Some(mut cb) = taken {
            cb();
            let mut state = self.0.borrow_mut();
            let slot = pick(&mut state);
            if slot.is_none() {
                *slot = Some(cb);
            }
        }
    }

    pub(crate) fn fire_read_ready(&self) {
        self.fire_slot(|s| &mut s.on_read_ready);
    }

    pub(crate) fn fire_write_ready(&self) {
        self.fire_slot(|s| &mut s.on_write_ready);
    }

    /// A non-owning reference suitable for a backend's notifier table: the backend must never
    /// be the thing keeping a `Notifier` alive.
    pub(crate) fn downgrade(&self) -> WeakNotifier {
        WeakNotifier(Rc::downgrade(&self.0))
    }

    /// A single nonblocking read through this notifier's read handle. `Ok(0)` with no handle
    /// present (the `ProcessWatcher` shape) is treated the same as end-of-file.
    pub(crate) fn read_chunk(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.0.borrow().handles.read_handle() {
            Some(h) => h.read(buf),
            None => Ok(0),
        }
    }

    /// A single nonblocking write through this notifier's write handle.
    pub(crate) fn write_chunk(&self, buf: &[u8]) -> std::io::Result<usize> {
        match self.0.borrow().handles.write_handle() {
            Some(h) => h.write(buf),
            None => Ok(0),
        }
    }
}

#[derive(Clone)]
pub(crate) struct WeakNotifier(Weak<RefCell<NotifierState>>);

impl WeakNotifier {
    pub(crate) fn upgrade(&self) -> Option<Notifier> {
        self.0.upgrade().map(Notifier)
    }
}

/// Recursively registers `notifier` and its descendants through `feedback`, used both by
/// `Loop::add` (via the backend's own `register_one`) and by [`Notifier::add_child`] (via the
/// parent's stored `LoopFeedback`, when the parent is already registered).
pub(crate) fn add_recursive(feedback: Rc<dyn LoopFeedback>, notifier: &Notifier) -> Result<()> {
    if notifier.is_in_loop() {
        return Err(Error::configuration("notifier already belongs to a Loop"));
    }
    let key = feedback.register_one(notifier)?;
    notifier.install_membership(SetMembership {
        feedback: Rc::downgrade(&feedback),
        key,
    });
    for child in notifier.children() {
        add_recursive(feedback.clone(), &child)?;
    }
    Ok(())
}

/// Recursively tears down `notifier` and its descendants from whatever `Loop` they're in.
pub(crate) fn remove_recursive(notifier: &Notifier) {
    for child in notifier.children() {
        remove_recursive(&child);
    }
    if let Some(membership) = notifier.set_membership() {
        if let Some(feedback) = membership.feedback.upgrade() {
            feedback.deregister_one(notifier);
        }
        notifier.clear_membership();
    }
}
