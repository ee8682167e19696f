// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Reads one HTTP CONNECT request from a freshly accepted socket.
//!
//! Valid requests are at most `max_request_size_bytes` long and match
//! `CONNECT ([^ \r]*).*\r\n\r\n`; the capture is the `host:port` handed to
//! the resolver. Anything else is a reject, reported as a `None` target.

#[cfg(test)]
mod tests;

use crate::event_loop::{epoll, EventHandler, EventLoop, Token};
use crate::sock;

use std::cell::{Cell, RefCell};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

//==============================================================================
// Constants & Structures
//==============================================================================

const CONNECT_PREFIX: &[u8] = b"CONNECT ";
const TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Clone, Debug)]
pub struct Options {
    /// Reject the request if it grows beyond this many bytes.
    pub max_request_size_bytes: usize,
    /// Reject the request if it does not complete within this time.
    pub accept_timeout: Duration,
}

/// The client socket always comes back through the callback; a `None`
/// target means the request was rejected and the caller should close it.
pub type Callback = Box<dyn FnOnce(OwnedFd, Option<String>) + Send>;

/// Owns one event loop; every request being parsed is a handler on it.
#[derive(Clone)]
pub struct Parser {
    opt: Options,
    event_loop: EventLoop,
}

enum Status {
    /// Need more bytes; stay registered.
    Incomplete,
    /// Malformed, oversized, or truncated request.
    Reject,
    /// Parsed `host:port`.
    Complete(String),
}

struct ParseHandler {
    fd: RawFd,
    sock: RefCell<Option<OwnedFd>>,
    cb: RefCell<Option<Callback>>,
    buf: RefCell<Vec<u8>>,
    filled: Cell<usize>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Parser].
impl Parser {
    pub fn new(opt: Options) -> Self {
        assert!(opt.max_request_size_bytes > CONNECT_PREFIX.len());
        let event_loop = EventLoop::new(opt.accept_timeout);
        Self { opt, event_loop }
    }

    /// Reads and parses an HTTP CONNECT request from `sock`. On success
    /// the callback receives the socket and the request's `host:port`; on
    /// rejection it receives the socket and `None`. Does not block.
    pub fn parse_request(&self, sock: OwnedFd, cb: Callback) {
        let lp = self.event_loop.clone();
        let size = self.opt.max_request_size_bytes;
        self.event_loop.schedule_or_run(move || {
            let handler = Rc::new(ParseHandler {
                fd: sock.as_raw_fd(),
                sock: RefCell::new(Some(sock)),
                cb: RefCell::new(Some(cb)),
                buf: RefCell::new(vec![0u8; size]),
                filled: Cell::new(0),
            });
            lp.add(handler, epoll::IN);
        });
    }
}

/// Associate functions for [ParseHandler].
impl ParseHandler {
    /// Reads until the socket would block, checking the accumulated bytes
    /// after every read.
    fn read_more(&self) -> Status {
        let mut buf = self.buf.borrow_mut();
        let mut filled = self.filled.get();
        loop {
            debug_assert!(filled < buf.len());
            let n = match sock::read(self.fd, &mut buf[filled..]) {
                Ok(n) => n,
                Err(ref e) if sock::would_block(e) => {
                    self.filled.set(filled);
                    return Status::Incomplete;
                },
                Err(e) => {
                    warn!("[{}] error reading request: {}", self.fd, e);
                    return Status::Reject;
                },
            };
            // Weed out non-CONNECT requests as soon as the first bytes
            // diverge from the expected prefix.
            if filled < CONNECT_PREFIX.len() {
                let upto = (filled + n).min(CONNECT_PREFIX.len());
                if buf[filled..upto] != CONNECT_PREFIX[filled..upto] {
                    warn!("[{}] invalid request prefix", self.fd);
                    return Status::Reject;
                }
            }
            filled += n;
            if let Some(host_port) = extract_target(&buf[..filled]) {
                if host_port.is_empty() {
                    warn!("[{}] empty host:port in the request", self.fd);
                    return Status::Reject;
                }
                info!("[{}] CONNECT {}", self.fd, host_port);
                return Status::Complete(host_port);
            }
            if n == 0 {
                warn!("[{}] incomplete request", self.fd);
                return Status::Reject;
            }
            if filled == buf.len() {
                warn!("[{}] request too big", self.fd);
                return Status::Reject;
            }
        }
    }

    fn finish(&self, lp: &EventLoop, token: Token, host_port: Option<String>) {
        lp.remove(token);
        let sock = self.sock.borrow_mut().take().expect("socket already taken");
        let cb = self.cb.borrow_mut().take().expect("callback already taken");
        cb(sock, host_port);
    }
}

/// Returns the request target once the header terminator has arrived:
/// everything between `CONNECT ` and the first space or carriage return.
/// `None` while the request is still incomplete.
fn extract_target(req: &[u8]) -> Option<String> {
    req.windows(TERMINATOR.len())
        .position(|w| w == TERMINATOR)?;
    let start = CONNECT_PREFIX.len();
    // The prefix holds no '\r', so the terminator sits at or after
    // `start` and this search always terminates.
    let len = req[start..]
        .iter()
        .position(|&b| b == b' ' || b == b'\r')
        .unwrap_or(0);
    Some(String::from_utf8_lossy(&req[start..start + len]).into_owned())
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Default for Options {
    fn default() -> Self {
        Self {
            max_request_size_bytes: 1024,
            accept_timeout: Duration::from_secs(5),
        }
    }
}

impl EventHandler for ParseHandler {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn on_event(&self, lp: &EventLoop, token: Token, events: u32) {
        if epoll::has_bits(events, epoll::ERR) {
            warn!("[{}] error while waiting for request data", self.fd);
            self.finish(lp, token, None);
        } else if epoll::has_bits(events, epoll::IN) {
            match self.read_more() {
                Status::Incomplete => {},
                Status::Reject => self.finish(lp, token, None),
                Status::Complete(host_port) => self.finish(lp, token, Some(host_port)),
            }
        }
    }

    fn on_timeout(&self, lp: &EventLoop, token: Token) {
        warn!("[{}] timed out waiting for request data", self.fd);
        self.finish(lp, token, None);
    }
}
