// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Asynchronous TCP connect. A non-blocking `connect()` is issued on the
//! caller's thread; completion is observed as write-readiness on the
//! connector's event loop and classified with `SO_ERROR`.

use crate::event_loop::{epoll, EventHandler, EventLoop, Token};
use crate::fail::{is_capacity_errno, OrDie};
use crate::sock;

use std::cell::RefCell;
use std::io;
use std::net::SocketAddrV4;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

#[cfg(test)]
mod tests;

//==============================================================================
// Constants & Structures
//==============================================================================

#[derive(Clone, Debug)]
pub struct Options {
    /// Give up if the socket has not become writable within this time.
    pub connect_timeout: Duration,
}

/// `None` on failure; the connected socket on success.
pub type Callback = Box<dyn FnOnce(Option<OwnedFd>) + Send>;

#[derive(Clone)]
pub struct Connector {
    event_loop: EventLoop,
}

struct ConnectHandler {
    fd: RawFd,
    sock: RefCell<Option<OwnedFd>>,
    cb: RefCell<Option<Callback>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Creates a socket and starts a non-blocking connect. `Ok(None)` means
/// the attempt failed in one of the survivable ways (no descriptors left,
/// immediate connect error); the chain is dropped but the proxy lives on.
fn connect_async(addr: &SocketAddrV4) -> io::Result<Option<OwnedFd>> {
    let sock = match sock::socket_stream() {
        Ok(sock) => sock,
        Err(e) => {
            error!("socket() failed: {}", e);
            if is_capacity_errno(e.raw_os_error().unwrap_or(0)) {
                return Ok(None);
            }
            return Err(e);
        },
    };
    let fd = sock.as_raw_fd();
    info!("[{}] connecting to {}", fd, addr);
    sock::set_tcp_nodelay(fd).or_die("TCP_NODELAY on connecting socket");
    match sock::connect(fd, addr) {
        Ok(_) => Ok(Some(sock)),
        Err(e) => {
            warn!("[{}] connect() failed: {}", fd, e);
            Ok(None)
        },
    }
}

/// Associate functions for [Connector].
impl Connector {
    pub fn new(opt: Options) -> Self {
        Self {
            event_loop: EventLoop::new(opt.connect_timeout),
        }
    }

    /// Connects to `addr` and calls `cb` with the connected socket, or
    /// with `None` on error or timeout. The callback may run
    /// synchronously. Does not block.
    pub fn connect(&self, addr: SocketAddrV4, cb: Callback) {
        let sock = match connect_async(&addr).or_die("create outbound socket") {
            Some(sock) => sock,
            None => {
                cb(None);
                return;
            },
        };
        let lp = self.event_loop.clone();
        self.event_loop.schedule_or_run(move || {
            let handler = Rc::new(ConnectHandler {
                fd: sock.as_raw_fd(),
                sock: RefCell::new(Some(sock)),
                cb: RefCell::new(Some(cb)),
            });
            lp.add(handler, epoll::OUT);
        });
    }
}

/// Associate functions for [ConnectHandler].
impl ConnectHandler {
    fn finish(&self, lp: &EventLoop, token: Token, err: i32) {
        lp.remove(token);
        let sock = self.sock.borrow_mut().take().expect("socket already taken");
        let cb = self.cb.borrow_mut().take().expect("callback already taken");
        if err == 0 {
            info!("[{}] connected", self.fd);
            cb(Some(sock));
        } else {
            warn!(
                "[{}] unable to connect: {}",
                self.fd,
                io::Error::from_raw_os_error(err)
            );
            cb(None);
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Default for Options {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl EventHandler for ConnectHandler {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn on_event(&self, lp: &EventLoop, token: Token, events: u32) {
        if epoll::has_bits(events, epoll::ERR) || epoll::has_bits(events, epoll::OUT) {
            let err = sock::so_error(self.fd).or_die("SO_ERROR on connecting socket");
            self.finish(lp, token, err);
        }
    }

    fn on_timeout(&self, lp: &EventLoop, token: Token) {
        self.finish(lp, token, libc::ETIMEDOUT);
    }
}
