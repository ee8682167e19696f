// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Wires the stages together: accept, parse, resolve, connect, forward.
//! Each stage owns its own event loop thread; the chain for one client
//! hops from stage to stage through single-shot callbacks, handing the
//! client socket along. Any stage reporting failure drops the chain, and
//! with it the socket.

use crate::acceptor::{self, Acceptor};
use crate::connector::{self, Connector};
use crate::dns::{self, DnsResolver};
use crate::fail::{Fail, OrDie};
use crate::forwarder::{self, Forwarder};
use crate::parser::{self, Parser};
use crate::sock;

use std::collections::HashSet;
use std::net::SocketAddrV4;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::sync::Arc;

//==============================================================================
// Constants & Structures
//==============================================================================

#[derive(Clone, Debug, Default)]
pub struct Options {
    pub acceptor: acceptor::Options,
    pub parser: parser::Options,
    pub dns: dns::Options,
    pub connector: connector::Options,
    pub forwarder: forwarder::Options,
    /// Ports clients may CONNECT to. Empty means any port.
    pub allowed_ports: HashSet<String>,
    /// If positive, raise `RLIMIT_NOFILE` to this value at startup. Each
    /// tunnel needs six descriptors: two sockets and two pipes.
    pub max_num_open_files: u64,
}

pub struct Proxy {
    acceptor: Acceptor,
    parser: Parser,
    dns: DnsResolver,
    connector: Connector,
    forwarder: Forwarder,
    allowed_ports: Arc<HashSet<String>>,
    max_num_open_files: u64,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// The port is everything after the first ':'. A target without one can
/// never resolve, so it is rejected here regardless of the allow-list.
fn is_allowed_port(allowed: &HashSet<String>, host_port: &str) -> bool {
    match host_port.find(':') {
        Some(sep) => {
            let port = &host_port[sep + 1..];
            allowed.is_empty() || allowed.contains(port)
        },
        None => false,
    }
}

/// Associate functions for [Proxy].
impl Proxy {
    pub fn new(opt: Options) -> Result<Self, Fail> {
        let acceptor = Acceptor::new(&opt.acceptor)?;
        Ok(Self {
            acceptor,
            parser: Parser::new(opt.parser),
            dns: DnsResolver::new(opt.dns),
            connector: Connector::new(opt.connector),
            forwarder: Forwarder::new(opt.forwarder),
            allowed_ports: Arc::new(opt.allowed_ports),
            max_num_open_files: opt.max_num_open_files,
        })
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.acceptor.local_addr()
    }

    /// Serves clients forever on the calling thread.
    pub fn run(&self) -> ! {
        sock::ignore_sigpipe();
        if self.max_num_open_files > 0 {
            sock::set_max_open_files(self.max_num_open_files).or_die("setrlimit(RLIMIT_NOFILE)");
        }
        loop {
            let client = self.acceptor.accept();
            self.start_chain(client);
        }
    }

    /// Launches the parse → resolve → connect → forward chain for one
    /// freshly accepted client.
    pub fn start_chain(&self, client: OwnedFd) {
        let allowed = self.allowed_ports.clone();
        let dns = self.dns.clone();
        let connector = self.connector.clone();
        let forwarder = self.forwarder.clone();
        self.parser.parse_request(
            client,
            Box::new(move |client, host_port| {
                let host_port = match host_port {
                    Some(host_port) => host_port,
                    None => return,
                };
                if !is_allowed_port(&allowed, &host_port) {
                    warn!("[{}] refusing CONNECT to {}", client.as_raw_fd(), host_port);
                    return;
                }
                let target = host_port.clone();
                dns.resolve(
                    &target,
                    Box::new(move |addrs| {
                        let addr = match addrs.as_ref().and_then(|addrs| addrs.first().copied()) {
                            Some(addr) => addr,
                            None => {
                                warn!("[{}] DNS error: {}", client.as_raw_fd(), host_port);
                                return;
                            },
                        };
                        debug!("[{}] tunnel to {}", client.as_raw_fd(), addr.ip());
                        connector.connect(
                            addr,
                            Box::new(move |server| {
                                let server = match server {
                                    Some(server) => server,
                                    None => return,
                                };
                                forwarder.forward(client, server);
                            }),
                        );
                    }),
                );
            }),
        );
    }
}
