// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use super::*;
use crate::sock;

use crossbeam_channel::{unbounded, Sender};

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

//==============================================================================
// Helpers
//==============================================================================

/// Reads whatever is available on its socket and reports it, then
/// unregisters itself.
struct ReadOnce {
    sock: OwnedFd,
    report: Sender<Vec<u8>>,
}

impl EventHandler for ReadOnce {
    fn fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    fn on_event(&self, lp: &EventLoop, token: Token, events: u32) {
        assert!(epoll::has_bits(events, epoll::IN));
        let mut buf = [0u8; 64];
        let n = sock::read(self.sock.as_raw_fd(), &mut buf).unwrap();
        lp.remove(token);
        self.report.send(buf[..n].to_vec()).unwrap();
    }

    fn on_timeout(&self, lp: &EventLoop, token: Token) {
        lp.remove(token);
        self.report.send(Vec::new()).unwrap();
    }
}

/// Reports the moment its idle deadline fires.
struct IdleProbe {
    sock: OwnedFd,
    report: Sender<Instant>,
}

impl EventHandler for IdleProbe {
    fn fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    fn on_event(&self, _lp: &EventLoop, _token: Token, _events: u32) {
        panic!("no event expected on an idle socket");
    }

    fn on_timeout(&self, lp: &EventLoop, token: Token) {
        lp.remove(token);
        self.report.send(Instant::now()).unwrap();
    }
}

fn nonblocking_pair() -> (UnixStream, OwnedFd) {
    let (ours, theirs) = UnixStream::pair().unwrap();
    theirs.set_nonblocking(true).unwrap();
    (ours, theirs.into())
}

//==============================================================================
// Tests
//==============================================================================

/// Tests that scheduled closures run, on a thread other than the caller's.
#[test]
fn schedule_runs_elsewhere() {
    let lp = EventLoop::new(Duration::from_secs(1));
    let (tx, rx) = unbounded();
    lp.schedule(move || {
        tx.send(thread::current().id()).unwrap();
    });
    let loop_thread = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_ne!(loop_thread, thread::current().id());
}

/// Tests that scheduled closures run in submission order.
#[test]
fn schedule_in_order() {
    let lp = EventLoop::new(Duration::from_secs(1));
    let (tx, rx) = unbounded();
    for i in 0..16 {
        let tx = tx.clone();
        lp.schedule(move || tx.send(i).unwrap());
    }
    for i in 0..16 {
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), i);
    }
}

/// Tests that a registered handler sees data written to its socket.
#[test]
fn dispatch_read_event() {
    let lp = EventLoop::new(Duration::from_secs(5));
    let (tx, rx) = unbounded();
    let (mut ours, theirs) = nonblocking_pair();

    let inner = lp.clone();
    lp.schedule(move || {
        let handler = Rc::new(ReadOnce {
            sock: theirs,
            report: tx,
        });
        inner.add(handler, epoll::IN);
    });

    ours.write_all(b"ping").unwrap();
    let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(got, b"ping");
}

/// Tests that `add` followed by `remove` leaves the loop with exactly the
/// registrations it had before.
#[test]
fn add_remove_is_symmetric() {
    let lp = EventLoop::new(Duration::from_secs(5));
    let (tx, rx) = unbounded();
    let (_ours, theirs) = nonblocking_pair();

    let inner = lp.clone();
    lp.schedule(move || {
        let before = inner.registered();
        let (probe_tx, _probe_rx) = unbounded();
        let handler = Rc::new(ReadOnce {
            sock: theirs,
            report: probe_tx,
        });
        let token = inner.add(handler, epoll::IN);
        assert_eq!(inner.registered(), before + 1);
        inner.remove(token);
        assert_eq!(inner.registered(), before);
        tx.send(()).unwrap();
    });
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
}

/// Tests that an idle handler's timeout fires once the loop's idle limit
/// has passed, and not before.
#[test]
fn idle_timeout_fires() {
    let timeout = Duration::from_millis(50);
    let lp = EventLoop::new(timeout);
    let (tx, rx) = unbounded();
    let (_ours, theirs) = nonblocking_pair();

    let inner = lp.clone();
    let armed_at = Instant::now();
    lp.schedule(move || {
        let handler = Rc::new(IdleProbe {
            sock: theirs,
            report: tx,
        });
        inner.add(handler, epoll::IN);
    });

    let fired_at = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let waited = fired_at - armed_at;
    // Fires within [timeout, timeout + one poll wait], with scheduling
    // slack on top.
    assert!(waited >= timeout, "fired early: {:?}", waited);
    assert!(waited < timeout * 20, "fired late: {:?}", waited);
}

/// Tests that fresh events keep pushing the idle deadline out.
#[test]
fn events_defer_timeout() {
    let timeout = Duration::from_millis(400);
    let lp = EventLoop::new(timeout);
    let (tx, rx) = unbounded();
    let (mut ours, theirs) = nonblocking_pair();

    let inner = lp.clone();
    lp.schedule(move || {
        let handler = Rc::new(ReadOnce {
            sock: theirs,
            report: tx,
        });
        inner.add(handler, epoll::IN);
    });

    // Stay quiet for part of the idle limit, then write. The handler must
    // observe data, not a timeout.
    thread::sleep(Duration::from_millis(100));
    ours.write_all(b"still here").unwrap();
    let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(got, b"still here");
}
