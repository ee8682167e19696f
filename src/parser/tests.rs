// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use super::*;

use crossbeam_channel::{unbounded, Receiver};

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::thread;

//==============================================================================
// Helpers
//==============================================================================

fn small_parser() -> Parser {
    Parser::new(Options {
        max_request_size_bytes: 1024,
        accept_timeout: Duration::from_secs(5),
    })
}

/// Hands one end of a socket pair to the parser; returns the other end
/// and the channel the parse result arrives on.
fn parse(parser: &Parser) -> (UnixStream, Receiver<Option<String>>) {
    let (ours, theirs) = UnixStream::pair().unwrap();
    theirs.set_nonblocking(true).unwrap();
    let (tx, rx) = unbounded();
    parser.parse_request(
        theirs.into(),
        Box::new(move |_sock, host_port| tx.send(host_port).unwrap()),
    );
    (ours, rx)
}

fn wait(rx: &Receiver<Option<String>>) -> Option<String> {
    rx.recv_timeout(Duration::from_secs(5)).unwrap()
}

//==============================================================================
// Tests
//==============================================================================

/// Tests that a well-formed request yields its host:port.
#[test]
fn well_formed_request() {
    let parser = small_parser();
    let (mut client, rx) = parse(&parser);
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .unwrap();
    assert_eq!(wait(&rx), Some("example.com:443".to_owned()));
}

/// Tests that a request arriving one byte at a time still parses.
#[test]
fn trickled_request() {
    let parser = small_parser();
    let (mut client, rx) = parse(&parser);
    for &b in b"CONNECT h:80 HTTP/1.1\r\n\r\n".iter() {
        client.write_all(&[b]).unwrap();
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(wait(&rx), Some("h:80".to_owned()));
}

/// Tests that a target followed directly by the terminator (no HTTP
/// version) is accepted verbatim.
#[test]
fn target_without_trailing_space() {
    let parser = small_parser();
    let (mut client, rx) = parse(&parser);
    client.write_all(b"CONNECT host:port\r\n\r\n").unwrap();
    assert_eq!(wait(&rx), Some("host:port".to_owned()));
}

/// Tests that a non-CONNECT method is rejected as soon as the prefix
/// diverges.
#[test]
fn wrong_method_rejected() {
    let parser = small_parser();
    let (mut client, rx) = parse(&parser);
    client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    assert_eq!(wait(&rx), None);
}

/// Tests that divergence after a matching partial prefix is caught too.
#[test]
fn late_prefix_divergence_rejected() {
    let parser = small_parser();
    let (mut client, rx) = parse(&parser);
    client.write_all(b"CONNECta:1\r\n\r\n").unwrap();
    assert_eq!(wait(&rx), None);
}

/// Tests that an empty target is a reject.
#[test]
fn empty_target_rejected() {
    let parser = small_parser();
    let (mut client, rx) = parse(&parser);
    client.write_all(b"CONNECT  HTTP/1.1\r\n\r\n").unwrap();
    assert_eq!(wait(&rx), None);
}

/// Tests the size boundary: a request of exactly the limit parses, one
/// byte more is rejected.
#[test]
fn size_boundary() {
    let opt = Options {
        max_request_size_bytes: 32,
        accept_timeout: Duration::from_secs(5),
    };
    let parser = Parser::new(opt);

    // Exactly 32 bytes, terminator included.
    let mut request = b"CONNECT a:1 ".to_vec();
    while request.len() < 32 - TERMINATOR.len() {
        request.push(b'x');
    }
    request.extend_from_slice(TERMINATOR);
    assert_eq!(request.len(), 32);

    let (mut client, rx) = parse(&parser);
    client.write_all(&request).unwrap();
    assert_eq!(wait(&rx), Some("a:1".to_owned()));

    // 33 bytes without a terminator in the first 32 overflow the buffer.
    let (mut client, rx) = parse(&parser);
    let mut oversized = b"CONNECT a:1 ".to_vec();
    oversized.extend_from_slice(&[b'x'; 21]);
    client.write_all(&oversized).unwrap();
    assert_eq!(wait(&rx), None);
}

/// Tests that EOF before the terminator rejects the request.
#[test]
fn truncated_request_rejected() {
    let parser = small_parser();
    let (mut client, rx) = parse(&parser);
    client.write_all(b"CONNECT half:80 HTT").unwrap();
    drop(client);
    assert_eq!(wait(&rx), None);
}

/// Tests that a silent client is cut off by the accept timeout.
#[test]
fn silent_client_times_out() {
    let parser = Parser::new(Options {
        max_request_size_bytes: 1024,
        accept_timeout: Duration::from_millis(80),
    });
    let (client, rx) = parse(&parser);
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), None);
    drop(client);
}
