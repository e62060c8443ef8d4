//! Crate-wide error type.
//!
//! The four kinds mirror the error taxonomy a reactor like this actually needs: failures
//! discovered synchronously at construction/add time, I/O failures surfaced through a handle,
//! child-watch bookkeeping failures, and multiplexer wait failures. Nothing here is caught or
//! matched on by the core itself — it exists for callers embedding the reactor.

use std::fmt;

/// Errors produced by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A construction-time or tree-shape invariant was violated: a notifier was built with no
    /// handle and no `on_read_ready`, a child already had a parent, or a notifier already
    /// belonged to a `Loop`.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A nonblocking read, write, or registration syscall failed for a reason other than
    /// "would block".
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A child-watch operation failed (e.g. sending a signal to a pid that no longer exists).
    #[error("child-watch error: {0}")]
    ChildWatch(String),

    /// The underlying readiness multiplexer's wait call failed.
    #[error("multiplexer error: {0}")]
    Multiplexer(String),
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn child_watch(msg: impl Into<String>) -> Self {
        Error::ChildWatch(msg.into())
    }

    pub fn multiplexer(msg: impl Into<String>) -> Self {
        Error::Multiplexer(msg.into())
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::Io(std::io::Error::from(e))
    }
}

/// The crate's result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// A raw wait status as returned by `waitpid`, handed to `ProcessWatcher::on_exit` verbatim.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct ExitStatus(pub i32);

impl ExitStatus {
    /// The `WIFEXITED`/`WEXITSTATUS` high byte, if the process exited normally.
    pub fn exit_code(self) -> Option<i32> {
        if libc::WIFEXITED(self.0) {
            Some(libc::WEXITSTATUS(self.0))
        } else {
            None
        }
    }

    /// The terminating signal, if the process was killed by one.
    pub fn signal(self) -> Option<i32> {
        if libc::WIFSIGNALED(self.0) {
            Some(libc::WTERMSIG(self.0))
        } else {
            None
        }
    }
}

impl fmt::Debug for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.exit_code(), self.signal()) {
            (Some(code), _) => write!(f, "ExitStatus(exited={code})"),
            (None, Some(sig)) => write!(f, "ExitStatus(signaled={sig})"),
            _ => write!(f, "ExitStatus(raw={})", self.0),
        }
    }
}
