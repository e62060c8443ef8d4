//! End-to-end `BufferedStream` behavior: framing via the drain loop, `send()`/`on_outgoing_empty`,
//! and half-close handling.

use std::cell::{Cell, RefCell};
use std::os::unix::io::IntoRawFd;
use std::rc::Rc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::{read, write};

use notiloop::{BufferedStream, Handle, Handles, Loop, PollLoop};

fn socket_pair_fds() -> (i32, i32) {
    let (a, b) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
    )
    .unwrap();
    (a.into_raw_fd(), b.into_raw_fd())
}

/// Pulls complete `\n`-terminated lines out of `buf`, leaving any partial trailing line in place.
fn line_consumer(lines: Rc<RefCell<Vec<String>>>) -> impl FnMut(&mut BytesMut, bool) -> bool {
    move |buf: &mut BytesMut, _closed: bool| {
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line = buf.split_to(pos + 1);
            let text = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            lines.borrow_mut().push(text);
            true
        } else {
            false
        }
    }
}

#[test]
fn drain_loop_strips_complete_lines_and_leaves_partial_ones() {
    let (s1, s2) = socket_pair_fds();
    let lp = PollLoop::new().unwrap();
    let lines = Rc::new(RefCell::new(Vec::new()));

    let handle = Handle::new(s1, true).unwrap();
    let stream = BufferedStream::new(Handles::Bidirectional(handle), line_consumer(lines.clone()), None).unwrap();
    lp.add(stream.notifier()).unwrap();

    write(unsafe { std::os::fd::BorrowedFd::borrow_raw(s2) }, b"hello\nworld\nparti").unwrap();
    lp.loop_once(Some(Duration::from_millis(100))).unwrap();

    assert_eq!(*lines.borrow(), vec!["hello".to_string(), "world".to_string()]);

    write(unsafe { std::os::fd::BorrowedFd::borrow_raw(s2) }, b"al\n").unwrap();
    lp.loop_once(Some(Duration::from_millis(100))).unwrap();

    assert_eq!(
        *lines.borrow(),
        vec!["hello".to_string(), "world".to_string(), "partial".to_string()]
    );

    let _ = nix::unistd::close(s2);
}

#[test]
fn send_drains_and_fires_on_outgoing_empty() {
    let (s1, s2) = socket_pair_fds();
    let lp = PollLoop::new().unwrap();
    let emptied = Rc::new(Cell::new(false));
    let e = emptied.clone();

    let handle = Handle::new(s1, true).unwrap();
    let stream = BufferedStream::new(
        Handles::Bidirectional(handle),
        |_buf: &mut BytesMut, _closed| false,
        Some(Box::new(move || e.set(true))),
    )
    .unwrap();
    lp.add(stream.notifier()).unwrap();

    stream.send(b"ping\n");
    assert_eq!(stream.pending_send(), 5);

    lp.loop_once(Some(Duration::from_millis(100))).unwrap();

    assert_eq!(stream.pending_send(), 0);
    assert!(emptied.get());
    assert!(!stream.notifier().want_writeready_flag());

    let mut buf = [0u8; 16];
    let got = read(s2, &mut buf).unwrap();
    assert_eq!(&buf[..got], b"ping\n");

    let _ = nix::unistd::close(s2);
}

#[test]
fn peer_close_surfaces_as_closed_true_then_self_removes() {
    let (s1, s2) = socket_pair_fds();
    let lp = PollLoop::new().unwrap();
    let saw_closed = Rc::new(Cell::new(false));
    let sc = saw_closed.clone();

    let handle = Handle::new(s1, true).unwrap();
    let stream = BufferedStream::new(
        Handles::Bidirectional(handle),
        move |_buf: &mut BytesMut, closed| {
            if closed {
                sc.set(true);
            }
            false
        },
        None,
    )
    .unwrap();
    lp.add(stream.notifier()).unwrap();

    nix::unistd::close(s2).unwrap();
    lp.loop_once(Some(Duration::from_millis(100))).unwrap();

    assert!(saw_closed.get());
    assert!(stream.is_closed());
    assert!(!stream.notifier().is_in_loop());
}
