// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Bidirectional zero-copy forwarding between the client and server
//! sockets of an established tunnel.
//!
//! Each direction is backed by an anonymous kernel pipe acting as a
//! bounded FIFO: bytes are spliced from one socket into the pipe and from
//! the pipe into the other socket without ever entering user space. The
//! pipe capacity is the flow-control window; a slow reader eventually
//! stalls the writer's side.
//!
//! The two halves of a tunnel are symmetric. `links[side].out` holds the
//! bytes flowing *towards* `side`: produced from the sibling's socket,
//! consumed by this side's socket. Reaching end-of-file on the sibling
//! closes the sibling for reading; draining the pipe afterwards closes
//! this side for writing. A side whose read and write halves are both
//! shut down is removed from the loop and its descriptors are released.


use crate::event_loop::{epoll, EventHandler, EventLoop, Token};
use crate::fail::{Fail, OrDie};
use crate::sock;

use std::cell::RefCell;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

//==============================================================================
// Constants & Structures
//==============================================================================

const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

const CLIENT: usize = 0;
const SERVER: usize = 1;

fn sibling(side: usize) -> usize {
    1 - side
}

#[derive(Clone, Debug)]
pub struct Options {
    /// Kernel buffer for bytes flowing from the client to the server.
    pub client_to_server_buffer_size_bytes: usize,
    /// Kernel buffer for bytes flowing from the server to the client.
    pub server_to_client_buffer_size_bytes: usize,
    /// Tear the tunnel down if neither socket moves a byte for this long.
    pub read_write_timeout: Duration,
}

#[derive(Clone)]
pub struct Forwarder {
    opt: Options,
    event_loop: EventLoop,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum IoStatus {
    /// Bytes moved.
    Data,
    /// End of stream reached.
    Eof,
    /// The descriptor is broken; the tunnel must die.
    Error,
    /// Nothing to do right now.
    NoOp,
}

/// An anonymous pipe used as a bounded in-kernel byte queue. `size` is
/// the exact number of bytes currently buffered: every producer and
/// consumer goes through this struct.
struct PipeBuf {
    rd: Option<OwnedFd>,
    wr: Option<OwnedFd>,
    capacity: usize,
    size: usize,
}

/// One half of a tunnel.
struct Link {
    sock: Option<OwnedFd>,
    fd: RawFd,
    out: PipeBuf,
    readable: bool,
    writable: bool,
    token: Option<Token>,
}

/// Shared parent of the two halves. Both handlers keep it alive; it dies
/// when the last half leaves the event loop.
struct Tunnel {
    links: [RefCell<Link>; 2],
}

struct LinkHandler {
    tunnel: Rc<Tunnel>,
    side: usize,
    fd: RawFd,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [PipeBuf].
impl PipeBuf {
    /// Allocates a pipe of roughly `size_bytes` capacity (the kernel
    /// rounds up to a page multiple). Failure is survivable: the caller
    /// aborts just this tunnel.
    fn new(size_bytes: usize) -> Result<Self, Fail> {
        let (rd, wr) = sock::pipe().map_err(|e| {
            warn!("pipe() failed: {}", e);
            Fail::OutOfResources {
                details: "tunnel buffer",
            }
        })?;
        let capacity = sock::set_pipe_size(wr.as_raw_fd(), size_bytes).map_err(|e| {
            warn!("F_SETPIPE_SZ failed: {}", e);
            Fail::OutOfResources {
                details: "tunnel buffer size",
            }
        })?;
        Ok(Self {
            rd: Some(rd),
            wr: Some(wr),
            capacity,
            size: 0,
        })
    }

    /// Seeds the buffer from user space. Only used for the 200 response;
    /// everything else arrives by splice.
    fn write(&mut self, data: &[u8]) {
        assert!(data.len() <= self.capacity - self.size);
        let wr = self.wr.as_ref().expect("pipe write end closed");
        let n = sock::write(wr.as_raw_fd(), data).or_die("seed tunnel buffer");
        assert_eq!(n, data.len());
        self.size += n;
    }

    /// Splices from `fd` into the pipe, up to the free space. `Eof` also
    /// closes the pipe's write end so the drain side can observe it.
    fn write_from(&mut self, fd: RawFd) -> IoStatus {
        debug_assert!(self.size <= self.capacity);
        if self.size == self.capacity {
            return IoStatus::NoOp;
        }
        let wr = self.wr.as_ref().expect("pipe write end closed").as_raw_fd();
        match sock::splice(fd, wr, self.capacity - self.size) {
            Ok(0) => {
                self.wr = None;
                IoStatus::Eof
            },
            Ok(n) => {
                self.size += n;
                IoStatus::Data
            },
            Err(ref e) if sock::would_block(e) => IoStatus::NoOp,
            Err(_) => {
                self.wr = None;
                IoStatus::Error
            },
        }
    }

    /// Splices from the pipe into `fd`. `Eof` means the buffer is drained
    /// and its write end is closed: nothing will ever be written to `fd`
    /// again.
    fn read_to(&mut self, fd: RawFd) -> IoStatus {
        if self.size == 0 {
            if self.wr.is_some() {
                return IoStatus::NoOp;
            }
            self.rd = None;
            return IoStatus::Eof;
        }
        // Probe the destination before splicing: some kernels discard
        // pipe contents when splice-to-socket hits EAGAIN, so do not
        // enter splice unless the socket will take bytes.
        match sock::send_probe(fd) {
            Ok(()) => {},
            Err(ref e) if sock::would_block(e) => return IoStatus::NoOp,
            Err(_) => {
                self.rd = None;
                return IoStatus::Error;
            },
        }
        let rd = self.rd.as_ref().expect("pipe read end closed").as_raw_fd();
        match sock::splice(rd, fd, self.size) {
            Ok(n) => {
                debug_assert!(n > 0);
                self.size -= n;
                IoStatus::Data
            },
            Err(ref e) if sock::would_block(e) => {
                // The probe said writable but splice disagreed. Benign
                // race unless the pipe lost bytes along the way.
                match sock::pipe_len(rd) {
                    Ok(n) if n == self.size => IoStatus::NoOp,
                    Ok(n) => {
                        warn!("splice dropped {} buffered bytes", self.size - n);
                        self.rd = None;
                        IoStatus::Error
                    },
                    Err(_) => {
                        self.rd = None;
                        IoStatus::Error
                    },
                }
            },
            Err(_) => {
                self.rd = None;
                IoStatus::Error
            },
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.size
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Associate functions for [Forwarder].
impl Forwarder {
    pub fn new(opt: Options) -> Self {
        let event_loop = EventLoop::new(opt.read_write_timeout);
        Self { opt, event_loop }
    }

    /// Sends the 200 response to the client, then proxies raw bytes
    /// between the two sockets until both directions are shut down, an
    /// error occurs, or the tunnel idles out. Does not block.
    pub fn forward(&self, client: OwnedFd, server: OwnedFd) {
        let lp = self.event_loop.clone();
        let opt = self.opt.clone();
        self.event_loop
            .schedule_or_run(move || start(&lp, &opt, client, server));
    }
}

fn start(lp: &EventLoop, opt: &Options, client: OwnedFd, server: OwnedFd) {
    let client_out = match PipeBuf::new(opt.server_to_client_buffer_size_bytes) {
        Ok(buf) => buf,
        Err(e) => {
            warn!("dropping tunnel: {}", e);
            return;
        },
    };
    let server_out = match PipeBuf::new(opt.client_to_server_buffer_size_bytes) {
        Ok(buf) => buf,
        Err(e) => {
            warn!("dropping tunnel: {}", e);
            return;
        },
    };
    let client_fd = client.as_raw_fd();
    let server_fd = server.as_raw_fd();
    debug!("[{}<->{}] tunnel open", client_fd, server_fd);
    let tunnel = Rc::new(Tunnel {
        links: [
            RefCell::new(Link {
                sock: Some(client),
                fd: client_fd,
                out: client_out,
                readable: true,
                writable: true,
                token: None,
            }),
            RefCell::new(Link {
                sock: Some(server),
                fd: server_fd,
                out: server_out,
                readable: true,
                writable: true,
                token: None,
            }),
        ],
    });
    for side in &[CLIENT, SERVER] {
        let handler = Rc::new(LinkHandler {
            tunnel: tunnel.clone(),
            side: *side,
            fd: tunnel.links[*side].borrow().fd,
        });
        let token = lp.add(handler, epoll::IN | epoll::OUT | epoll::ET);
        tunnel.links[*side].borrow_mut().token = Some(token);
    }
    tunnel.links[CLIENT].borrow_mut().out.write(RESPONSE);
}

/// Associate functions for [Tunnel].
impl Tunnel {
    /// Forwards as much as possible towards `side`: fill `side`'s pipe
    /// from the sibling's socket, drain the pipe into `side`'s socket,
    /// repeat until neither direction makes progress. Returns
    /// `(alive, moved)`; `alive` is false iff the tunnel was terminated.
    fn forward_into(&self, lp: &EventLoop, side: usize) -> (bool, bool) {
        let mut moved = false;
        loop {
            let mut io = false;
            let (sib_readable, sib_fd) = {
                let sib = self.links[sibling(side)].borrow();
                (sib.readable, sib.fd)
            };
            if sib_readable {
                let status = self.links[side].borrow_mut().out.write_from(sib_fd);
                match status {
                    IoStatus::Data => io = true,
                    IoStatus::Eof => {
                        io = true;
                        self.close_for_reading(lp, sibling(side));
                    },
                    IoStatus::Error => {
                        self.terminate(lp, side);
                        return (false, moved);
                    },
                    IoStatus::NoOp => {},
                }
            }
            let writable = self.links[side].borrow().writable;
            if writable {
                let status = {
                    let mut link = self.links[side].borrow_mut();
                    let fd = link.fd;
                    link.out.read_to(fd)
                };
                match status {
                    IoStatus::Data => io = true,
                    IoStatus::Eof => {
                        io = true;
                        self.close_for_writing(lp, side);
                    },
                    IoStatus::Error => {
                        self.terminate(lp, side);
                        return (false, moved);
                    },
                    IoStatus::NoOp => {},
                }
            }
            if !io {
                return (true, moved);
            }
            moved = true;
        }
    }

    /// `side`'s socket reached end-of-file. Stop reading from it; if it
    /// is also done writing, close it entirely.
    fn close_for_reading(&self, lp: &EventLoop, side: usize) {
        let still_writable = {
            let mut link = self.links[side].borrow_mut();
            debug_assert!(link.readable);
            if link.writable {
                link.readable = false;
                lp.modify(link.token.expect("link not registered"), epoll::OUT | epoll::ET);
                sock::shutdown_read(link.fd).or_die("shutdown(SHUT_RD)");
                true
            } else {
                false
            }
        };
        if !still_writable {
            self.close(lp, side);
        }
    }

    /// `side`'s outbound buffer is drained and will never refill. Stop
    /// writing to its socket; if it is also done reading, close it.
    fn close_for_writing(&self, lp: &EventLoop, side: usize) {
        let still_readable = {
            let mut link = self.links[side].borrow_mut();
            debug_assert!(link.writable);
            if link.readable {
                link.writable = false;
                lp.modify(link.token.expect("link not registered"), epoll::IN | epoll::ET);
                sock::shutdown_write(link.fd).or_die("shutdown(SHUT_WR)");
                true
            } else {
                false
            }
        };
        if !still_readable {
            self.close(lp, side);
        }
    }

    /// Closes `side` if it is still open: deregister, then release the
    /// socket and its pipe.
    fn close(&self, lp: &EventLoop, side: usize) {
        let mut link = self.links[side].borrow_mut();
        if link.readable || link.writable || link.sock.is_some() {
            link.readable = false;
            link.writable = false;
            if let Some(token) = link.token.take() {
                lp.remove(token);
            }
            debug!("[{}] tunnel side closed", link.fd);
            link.sock = None;
        }
    }

    /// Abnormally closes both sides, discarding buffered data.
    fn terminate(&self, lp: &EventLoop, side: usize) {
        self.close(lp, side);
        self.close(lp, sibling(side));
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Default for Options {
    fn default() -> Self {
        Self {
            client_to_server_buffer_size_bytes: 4 << 10,
            server_to_client_buffer_size_bytes: 8 << 10,
            read_write_timeout: Duration::from_secs(300),
        }
    }
}

impl EventHandler for LinkHandler {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn on_event(&self, lp: &EventLoop, _token: Token, events: u32) {
        if epoll::has_bits(events, epoll::ERR) {
            self.tunnel.terminate(lp, self.side);
            return;
        }
        let mut alive = true;
        let mut moved = false;
        if epoll::has_bits(events, epoll::OUT) {
            let (a, m) = self.tunnel.forward_into(lp, self.side);
            alive = a;
            moved |= m;
        }
        if alive && epoll::has_bits(events, epoll::IN) {
            let (a, m) = self.tunnel.forward_into(lp, sibling(self.side));
            alive = a;
            moved |= m;
        }
        // The loop refreshes this side's idle deadline after dispatch;
        // bytes moved here also count as activity for the sibling.
        if alive && moved {
            if let Some(token) = self.tunnel.links[sibling(self.side)].borrow().token {
                lp.refresh(token);
            }
        }
    }

    fn on_timeout(&self, lp: &EventLoop, _token: Token) {
        debug!("[{}] tunnel idle timeout", self.fd);
        self.tunnel.terminate(lp, self.side);
    }
}
