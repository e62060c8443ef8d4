//! A single-threaded, cooperative asynchronous I/O reactor.
//!
//! [`Loop`] is the reactor contract: add/remove [`Notifier`]s, flip a notifier's write-interest,
//! run one iteration or loop indefinitely, schedule one-shot timers, and watch child processes.
//! Two backends implement it — [`PollLoop`], a portable `poll`-based multiplexer built on `mio`,
//! and [`ExternalLoop`], an adapter for embedding the same notifier/timer/child-watch model
//! inside a host application's own main loop.
//!
//! Notifiers compose into a tree: [`Notifier::add_child`] attaches a child that is transparently
//! added to (or removed from) whatever `Loop` the parent belongs to. [`BufferedStream`] extends
//! a plain notifier with send/receive byte queues and a pull-parser drain loop; [`ProcessWatcher`]
//! extends one with a one-shot child-exit callback.
//!
//! ```no_run
//! use notiloop::{Handle, Handles, Loop, Notifier, NotifierParams, PollLoop};
//! use std::cell::Cell;
//! use std::rc::Rc;
//! use std::time::Duration;
//!
//! # fn run(fd: std::os::unix::io::RawFd) -> notiloop::Result<()> {
//! let lp = PollLoop::new()?;
//! let fired = Rc::new(Cell::new(false));
//! let f = fired.clone();
//!
//! let handle = Handle::new(fd, true)?;
//! let notifier = Notifier::new(NotifierParams {
//!     handles: Handles::Bidirectional(handle),
//!     on_read_ready: Some(Box::new(move || f.set(true))),
//!     on_write_ready: None,
//!     want_writeready: false,
//! })?;
//! lp.add(&notifier)?;
//! lp.loop_once(Some(Duration::from_millis(100)))?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod external_loop;
pub mod handle;
pub mod notifier;
pub mod process;
pub mod reactor;
pub mod poll_loop;
pub mod stream;
pub mod timer;

pub use error::{Error, ExitStatus, Result};
pub use external_loop::{ExternalLoop, HostLoop, Interest};
pub use handle::{Handle, Handles};
pub use notifier::{Notifier, NotifierParams};
pub use poll_loop::PollLoop;
pub use process::ProcessWatcher;
pub use reactor::{Loop, LoopCore};
pub use stream::BufferedStream;
pub use timer::{TimerId, TimerQueue};

use std::net::{TcpListener, ToSocketAddrs};
use std::os::unix::io::IntoRawFd;

/// A convenience used by tests and examples: binds a nonblocking TCP listener and hands back its
/// fd wrapped as an owning [`Handle`], ready to register on a [`Notifier`]'s read side. Not part
/// of the reactor's core contract — callers needing a Unix-domain or already-open listener can
/// just build a `Handle` directly with [`Handle::new`].
pub fn bind(addr: impl ToSocketAddrs) -> Result<Handle> {
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    Ok(Handle::new(listener.into_raw_fd(), true)?)
}
