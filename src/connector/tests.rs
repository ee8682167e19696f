// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use super::*;

use crossbeam_channel::unbounded;

use std::io::Read;
use std::net::{Ipv4Addr, TcpListener};

fn local_v4(listener: &TcpListener) -> SocketAddrV4 {
    match listener.local_addr().unwrap() {
        std::net::SocketAddr::V4(addr) => addr,
        _ => panic!("expected an IPv4 listener"),
    }
}

/// Tests that connecting to a live listener yields a usable socket.
#[test]
fn connects_to_listener() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let addr = local_v4(&listener);
    let connector = Connector::new(Options {
        connect_timeout: Duration::from_secs(5),
    });

    let (tx, rx) = unbounded();
    connector.connect(addr, Box::new(move |sock| tx.send(sock).unwrap()));

    let sock = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();

    // Prove the socket really is connected to our listener.
    sock::write(sock.as_raw_fd(), b"hi").unwrap();
    let (mut peer, _) = listener.accept().unwrap();
    let mut buf = [0u8; 2];
    peer.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hi");
}

/// Tests that a refused connection reports failure rather than a socket.
#[test]
fn refused_connection_fails() {
    // Grab a port that nothing listens on.
    let addr = {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        local_v4(&listener)
    };
    let connector = Connector::new(Options {
        connect_timeout: Duration::from_secs(5),
    });

    let (tx, rx) = unbounded();
    connector.connect(addr, Box::new(move |sock| tx.send(sock).unwrap()));
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap().is_none());
}
