// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Blocking TCP listener. Accepted sockets come out non-blocking with
//! `TCP_NODELAY` set, ready to hand to the parser's event loop.

use crate::fail::{is_capacity_errno, Fail, OrDie};
use crate::sock;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, OwnedFd};

//==============================================================================
// Constants & Structures
//==============================================================================

#[derive(Clone, Debug)]
pub struct Options {
    /// IPv4 address to listen on.
    pub listen_addr: Ipv4Addr,
    pub listen_port: u16,
    /// Backlog passed to `listen(2)`.
    pub accept_queue_size: usize,
}

pub struct Acceptor {
    sock: OwnedFd,
    local_addr: SocketAddrV4,
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Default for Options {
    fn default() -> Self {
        Self {
            listen_addr: Ipv4Addr::UNSPECIFIED,
            listen_port: 8889,
            accept_queue_size: 64,
        }
    }
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Acceptor].
impl Acceptor {
    /// Binds and starts listening. Failing to claim the listen address is
    /// a startup error, not a runtime one.
    pub fn new(opt: &Options) -> Result<Self, Fail> {
        let addr = SocketAddrV4::new(opt.listen_addr, opt.listen_port);
        let sock = sock::socket_stream_blocking().map_err(|e| {
            error!("socket() failed: {}", e);
            Fail::OutOfResources {
                details: "listen socket",
            }
        })?;
        let fd = sock.as_raw_fd();
        sock::set_reuse_addr(fd).or_die("SO_REUSEADDR on listen socket");
        sock::bind(fd, &addr).map_err(|e| {
            error!("cannot bind {}: {}", addr, e);
            Fail::OutOfResources {
                details: "listen address",
            }
        })?;
        sock::listen(fd, opt.accept_queue_size).or_die("listen()");
        let local_addr = sock::local_addr(fd).or_die("getsockname on listen socket");
        info!("listening on {}", local_addr);
        Ok(Self { sock, local_addr })
    }

    /// The bound address; useful when listening on an ephemeral port.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    /// Accepts the next client. Blocks. Retries when the process is out
    /// of descriptors or buffers; anything else from `accept4(2)` is
    /// fatal.
    pub fn accept(&self) -> OwnedFd {
        loop {
            match sock::accept(self.sock.as_raw_fd()) {
                Ok((conn, peer)) => {
                    info!("[{}] accepted connection from {}", conn.as_raw_fd(), peer);
                    sock::set_tcp_nodelay(conn.as_raw_fd()).or_die("TCP_NODELAY on accepted socket");
                    return conn;
                },
                Err(e) => {
                    error!("accept4() failed: {}", e);
                    if !is_capacity_errno(e.raw_os_error().unwrap_or(0)) {
                        Err::<(), _>(e).or_die("accept4()");
                    }
                },
            }
        }
    }
}
