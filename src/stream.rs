//! `BufferedStream`: a `Notifier` plus send/receive byte queues driven by a caller-supplied
//! consumer. The consumer owns framing — it's handed a mutable `&mut BytesMut` and a
//! half-close flag, and keeps being invoked (the "drain loop") until it reports no progress.

use bytes::{Buf, BytesMut};
use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use tracing::trace;

use crate::error::Result;
use crate::handle::Handles;
use crate::notifier::{Notifier, NotifierParams};

const CHUNK: usize = 8192;

struct StreamState {
    sendbuf: BytesMut,
    recvbuf: BytesMut,
    on_incoming_data: Box<dyn FnMut(&mut BytesMut, bool) -> bool>,
    on_outgoing_empty: Option<Box<dyn FnMut()>>,
    closed: bool,
}

/// A stream notifier with nonblocking send/receive queues.
#[derive(Clone)]
pub struct BufferedStream {
    notifier: Notifier,
    state: Rc<RefCell<StreamState>>,
}

impl BufferedStream {
    /// Builds a stream over `handles`. `on_incoming_data` is the consumer driving the drain loop;
    /// `on_outgoing_empty`, if given, fires whenever `sendbuf` drains to empty.
    pub fn new(
        handles: Handles,
        on_incoming_data: impl FnMut(&mut BytesMut, bool) -> bool + 'static,
        on_outgoing_empty: Option<Box<dyn FnMut()>>,
    ) -> Result<BufferedStream> {
        let state = Rc::new(RefCell::new(StreamState {
            sendbuf: BytesMut::new(),
            recvbuf: BytesMut::new(),
            on_incoming_data: Box::new(on_incoming_data),
            on_outgoing_empty,
            closed: false,
        }));

        let notifier = Notifier::new(NotifierParams {
            handles,
            on_read_ready: None,
            on_write_ready: None,
            want_writeready: false,
        })?;

        let read_weak = notifier.downgrade();
        let read_state = state.clone();
        notifier.set_on_read_ready(Box::new(move || {
            if let Some(n) = read_weak.upgrade() {
                handle_read_ready(&n, &read_state);
            }
        }));

        let write_weak = notifier.downgrade();
        let write_state = state.clone();
        notifier.set_on_write_ready(Box::new(move || {
            if let Some(n) = write_weak.upgrade() {
                handle_write_ready(&n, &write_state);
            }
        }));

        Ok(BufferedStream { notifier, state })
    }

    /// The underlying notifier, for adding to a `Loop` or composing into a parent/child tree.
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Appends `data` to the outgoing queue and arms write-interest if not already armed.
    pub fn send(&self, data: &[u8]) {
        self.state.borrow_mut().sendbuf.extend_from_slice(data);
        trace!(bytes = data.len(), "queued outgoing data");
        self.notifier.want_writeready(true);
    }

    /// Whether a half-close has been observed on the read side.
    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    /// Bytes currently queued to be written.
    pub fn pending_send(&self) -> usize {
        self.state.borrow().sendbuf.len()
    }
}

fn handle_read_ready(notifier: &Notifier, state: &Rc<RefCell<StreamState>>) {
    let mut chunk = [0u8; CHUNK];
    match notifier.read_chunk(&mut chunk) {
        Ok(0) => {
            trace!("read returned eof, half-close observed");
            state.borrow_mut().closed = true;
        }
        Ok(n) => {
            state.borrow_mut().recvbuf.extend_from_slice(&chunk[..n]);
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
        Err(_) => {
            notifier.handle_closed();
            return;
        }
    }

    drain(state);

    if state.borrow().closed {
        notifier.handle_closed();
    }
}

/// Invokes the consumer until it reports no progress, or until the buffer is empty and the
/// stream isn't closed (the safety net against a consumer that returns `true` forever without
/// touching `recvbuf`).
fn drain(state: &Rc<RefCell<StreamState>>) {
    loop {
        let mut st = state.borrow_mut();
        let closed = st.closed;
        let StreamState {
            recvbuf,
            on_incoming_data,
            ..
        } = &mut *st;
        let again = on_incoming_data(recvbuf, closed);
        let now_empty = recvbuf.is_empty();
        drop(st);
        if !again || (now_empty && !closed) {
            break;
        }
    }
}

fn handle_write_ready(notifier: &Notifier, state: &Rc<RefCell<StreamState>>) {
    let front = {
        let st = state.borrow();
        if st.sendbuf.is_empty() {
            None
        } else {
            let len = st.sendbuf.len().min(CHUNK);
            Some(st.sendbuf[..len].to_vec())
        }
    };
    // A write-ready callback with nothing queued shouldn't happen (want_writeready implies a
    // non-empty sendbuf); if it does anyway, treat it as a no-op rather than writing zero bytes.
    let Some(chunk) = front else {
        return;
    };

    match notifier.write_chunk(&chunk) {
        Ok(0) => {
            notifier.handle_closed();
            return;
        }
        Ok(n) => {
            state.borrow_mut().sendbuf.advance(n);
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
        Err(_) => {
            notifier.handle_closed();
            return;
        }
    }

    let became_empty = state.borrow().sendbuf.is_empty();
    if became_empty {
        notifier.want_writeready(false);
        if let Some(cb) = state.borrow_mut().on_outgoing_empty.as_mut() {
            cb();
        }
    }
}
