// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! An HTTP CONNECT tunnel proxy.
//!
//! Clients send exactly one `CONNECT host:port HTTP/1.1` request; the
//! proxy resolves the target, connects, answers `HTTP/1.1 200 OK`, and
//! then splices raw bytes in both directions until either side closes or
//! the tunnel idles out.
//!
//! One thread accepts; three single-threaded event loops drive request
//! parsing, asynchronous connects, and zero-copy forwarding; a small
//! thread pool performs the only blocking operation, DNS lookups.
//! Linux-only: the data path is built on `epoll(7)` and `splice(2)`.

#[macro_use]
extern crate log;

pub mod acceptor;
pub mod collections;
pub mod connector;
pub mod dns;
pub mod event_loop;
pub mod fail;
pub mod forwarder;
pub mod parser;
pub mod proxy;
pub mod sock;
pub mod sync;

pub use crate::fail::Fail;
pub use crate::proxy::{Options, Proxy};
