//! The `Handle` abstraction: a thin, nonblocking wrapper over a raw OS descriptor.
//!
//! A `Notifier` never touches `libc`/`nix` directly; it goes through a `Handle`. This mirrors
//! the separation the upstream `gj` io layer draws between `TryRead`/`TryWrite` traits and the
//! concrete fd-bearing types (`TcpStream`, `SocketStream`): the reactor's bookkeeping doesn't
//! care what kind of descriptor it's multiplexing, only that it can be read, written, and polled.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};

const READ_CHUNK: usize = 8192;

/// A nonblocking OS handle. Read and write may refer to the same descriptor (a socket) or to two
/// distinct ones (the two ends of a pipe wired up as a bidirectional conduit).
#[derive(Debug)]
pub struct Handle {
    fd: RawFd,
    owns_fd: bool,
}

impl Handle {
    /// Wraps `fd`, putting it in nonblocking mode. If `owns_fd` is true, the fd is closed on
    /// drop.
    pub fn new(fd: RawFd, owns_fd: bool) -> io::Result<Handle> {
        let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
        let mut flags = OFlag::from_bits_truncate(flags);
        flags.insert(OFlag::O_NONBLOCK);
        fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
        Ok(Handle { fd, owns_fd })
    }

    /// Wraps an already-nonblocking fd without taking ownership of it (the caller is responsible
    /// for closing it).
    pub fn from_borrowed_fd(fd: RawFd) -> Handle {
        Handle { fd, owns_fd: false }
    }

    pub fn fileno(&self) -> RawFd {
        self.fd
    }

    /// A single nonblocking read of up to `READ_CHUNK` bytes, or fewer if `buf` is smaller.
    /// Returns `Ok(0)` on EOF, `Err(WouldBlock)` if nothing is available right now.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len().min(READ_CHUNK);
        match nix::unistd::read(self.fd, &mut buf[..len]) {
            Ok(n) => Ok(n),
            Err(nix::Error::EAGAIN) => Err(io::ErrorKind::WouldBlock.into()),
            Err(e) => Err(e.into()),
        }
    }

    /// A single nonblocking write of up to `READ_CHUNK` bytes from the front of `buf`.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let len = buf.len().min(READ_CHUNK);
        match nix::unistd::write(unsafe { std::os::fd::BorrowedFd::borrow_raw(self.fd) }, &buf[..len]) {
            Ok(n) => Ok(n),
            Err(nix::Error::EAGAIN) => Err(io::ErrorKind::WouldBlock.into()),
            Err(e) => Err(e.into()),
        }
    }
}

impl AsRawFd for Handle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.owns_fd {
            let _ = nix::unistd::close(self.fd);
        }
    }
}

/// The read/write handle configuration a `Notifier` is constructed with: either a single
/// bidirectional `handle`, or a `read_handle`/`write_handle` pair.
pub enum Handles {
    /// A single handle serves both directions.
    Bidirectional(Handle),
    /// Up to two distinct handles; at least one must be present.
    Split {
        read: Option<Handle>,
        write: Option<Handle>,
    },
}

impl Handles {
    pub fn read_fd(&self) -> Option<RawFd> {
        match self {
            Handles::Bidirectional(h) => Some(h.fileno()),
            Handles::Split { read, .. } => read.as_ref().map(Handle::fileno),
        }
    }

    pub fn write_fd(&self) -> Option<RawFd> {
        match self {
            Handles::Bidirectional(h) => Some(h.fileno()),
            Handles::Split { write, .. } => write.as_ref().map(Handle::fileno),
        }
    }

    /// True when the read and write directions share one underlying fd.
    pub fn is_unified(&self) -> bool {
        matches!(self, Handles::Bidirectional(_))
    }

    pub fn read_handle(&self) -> Option<&Handle> {
        match self {
            Handles::Bidirectional(h) => Some(h),
            Handles::Split { read, .. } => read.as_ref(),
        }
    }

    pub fn write_handle(&self) -> Option<&Handle> {
        match self {
            Handles::Bidirectional(h) => Some(h),
            Handles::Split { write, .. } => write.as_ref(),
        }
    }
}
