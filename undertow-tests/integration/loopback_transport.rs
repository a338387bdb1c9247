//! Transports over real loopback sockets watched by the mio selector.

use std::io::{IoSlice, IoSliceMut, Write};
use std::net::{TcpListener, TcpStream as StdTcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::net::TcpStream;
use undertow_core::clock::SystemClock;
use undertow_core::config::SelectorConfig;
use undertow_core::network::{
    CipherFilter, MioSelector, PlainFilter, Transport, TransportError, TransportFilter,
    XorKeystream,
};
use undertow_core::waiter::EventWaiter;

const DEADLINE: Duration = Duration::from_secs(10);

struct Pair {
    selector: MioSelector,
    outbound: Transport,
    inbound: Transport,
}

fn connected_streams() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let outbound = StdTcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (inbound, _) = listener.accept().unwrap();
    outbound.set_nonblocking(true).unwrap();
    inbound.set_nonblocking(true).unwrap();
    (TcpStream::from_std(outbound), TcpStream::from_std(inbound))
}

fn plain(selector: &MioSelector, stream: TcpStream) -> Box<dyn TransportFilter> {
    Box::new(PlainFilter::new(selector.attach(stream).unwrap()))
}

fn xor(selector: &MioSelector, stream: TcpStream, key: &[u8]) -> Box<dyn TransportFilter> {
    Box::new(CipherFilter::new(
        plain(selector, stream),
        XorKeystream::new(key).unwrap(),
        XorKeystream::new(key).unwrap(),
    ))
}

fn connect(key: Option<&[u8]>) -> Pair {
    let selector = MioSelector::start(&SelectorConfig::default()).unwrap();
    let clock = SystemClock::new();
    let (out_stream, in_stream) = connected_streams();

    let (out_filter, in_filter) = match key {
        Some(key) => (xor(&selector, out_stream, key), xor(&selector, in_stream, key)),
        None => (plain(&selector, out_stream), plain(&selector, in_stream)),
    };

    let mut outbound = Transport::new(clock.clone());
    outbound.begin_connect();
    outbound.set_filter(out_filter);
    outbound.connected_outbound();

    let mut inbound = Transport::new(clock);
    inbound.set_filter(in_filter);
    inbound.connected_inbound();

    Pair {
        selector,
        outbound,
        inbound,
    }
}

/// Writes all of `data`, waiting on write readiness between partial writes.
fn write_all(transport: &mut Transport, mut data: &[u8]) {
    let waiter = Arc::new(EventWaiter::new());
    let started = Instant::now();

    while !data.is_empty() {
        assert!(started.elapsed() < DEADLINE, "write stalled");
        if !transport.is_ready_for_write(Some(waiter.clone())) {
            waiter.wait_timeout(Duration::from_millis(50));
            continue;
        }
        let written = transport.write(&[IoSlice::new(data)]).unwrap();
        data = &data[written..];
    }
}

/// Reads until `expected` bytes arrived, waiting on read readiness.
fn read_exact(transport: &mut Transport, expected: usize) -> Vec<u8> {
    let waiter = Arc::new(EventWaiter::new());
    let started = Instant::now();
    let mut received = Vec::with_capacity(expected);
    let mut buf = [0u8; 4096];

    while received.len() < expected {
        assert!(started.elapsed() < DEADLINE, "read stalled at {}", received.len());
        if transport.is_ready_for_read(Some(waiter.clone())) > 0 {
            waiter.wait_timeout(Duration::from_millis(50));
            continue;
        }
        let count = transport.read(&mut [IoSliceMut::new(&mut buf)]).unwrap();
        received.extend_from_slice(&buf[..count]);
    }
    received
}

/// Bytes in both directions share one pattern so the receiver can check order.
fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_plain_transfer_in_both_directions() {
    let mut pair = connect(None);

    write_all(&mut pair.outbound, b"ping");
    assert_eq!(read_exact(&mut pair.inbound, 4), b"ping");

    write_all(&mut pair.inbound, b"pong!");
    assert_eq!(read_exact(&mut pair.outbound, 5), b"pong!");

    assert_eq!(pair.outbound.bytes_written(), 4);
    assert_eq!(pair.outbound.bytes_read(), 5);
    assert_eq!(pair.outbound.encryption(false), "None (TCP)");
    assert_eq!(pair.outbound.protocol(), "TCP");
    assert!(!pair.outbound.is_encrypted());
    assert_eq!(pair.selector.socket_count(), 2);
}

#[test]
fn test_large_transfer_survives_partial_writes() {
    let mut pair = connect(None);
    let payload = pattern(4 * 1024 * 1024);

    let reader = std::thread::scope(|scope| {
        let inbound = &mut pair.inbound;
        let handle = scope.spawn(move || read_exact(inbound, 4 * 1024 * 1024));
        write_all(&mut pair.outbound, &payload);
        handle.join().unwrap()
    });

    assert_eq!(reader, payload);
}

#[test]
fn test_cipher_filter_round_trips_over_sockets() {
    let mut pair = connect(Some(b"undertow"));
    let payload = pattern(256 * 1024);

    let received = std::thread::scope(|scope| {
        let inbound = &mut pair.inbound;
        let handle = scope.spawn(move || read_exact(inbound, 256 * 1024));
        write_all(&mut pair.outbound, &payload);
        handle.join().unwrap()
    });

    assert_eq!(received, payload);
    assert!(pair.outbound.is_encrypted());
    assert_eq!(pair.outbound.encryption(false), "XOR (TCP)");
    assert!(pair.outbound.encryption(true).starts_with("XOR (TCP) over None (TCP)"));
}

#[test]
fn test_cipher_bytes_are_obfuscated_on_the_wire() {
    let selector = MioSelector::start(&SelectorConfig::default()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let outbound = StdTcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (mut raw_peer, _) = listener.accept().unwrap();
    outbound.set_nonblocking(true).unwrap();

    let mut transport = Transport::new(SystemClock::new());
    transport.set_filter(xor(&selector, TcpStream::from_std(outbound), b"\x55"));
    transport.connected_outbound();
    write_all(&mut transport, b"AAAA");

    let mut wire = [0u8; 4];
    std::io::Read::read_exact(&mut raw_peer, &mut wire).unwrap();
    assert_eq!(wire, [b'A' ^ 0x55; 4]);
}

#[test]
fn test_prepended_bytes_come_before_socket_bytes() {
    let mut pair = connect(None);

    pair.inbound.set_already_read(Bytes::from_static(b"world"));
    pair.inbound.set_already_read(Bytes::from_static(b"hello "));
    write_all(&mut pair.outbound, b"!");

    assert_eq!(read_exact(&mut pair.inbound, 12), b"hello world!");
}

#[test]
fn test_remote_close_surfaces_as_read_error() {
    let selector = MioSelector::start(&SelectorConfig::default()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let outbound = StdTcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (mut remote, _) = listener.accept().unwrap();
    outbound.set_nonblocking(true).unwrap();

    let mut transport = Transport::new(SystemClock::new());
    transport.set_filter(plain(&selector, TcpStream::from_std(outbound)));
    transport.connected_outbound();

    remote.write_all(b"bye").unwrap();
    drop(remote);

    assert_eq!(read_exact(&mut transport, 3), b"bye");

    let waiter = Arc::new(EventWaiter::new());
    let started = Instant::now();
    let error = loop {
        assert!(started.elapsed() < DEADLINE, "close never surfaced");
        if transport.is_ready_for_read(Some(waiter.clone())) > 0 {
            waiter.wait_timeout(Duration::from_millis(50));
            continue;
        }
        match transport.read(&mut [IoSliceMut::new(&mut [0u8; 16])]) {
            Ok(0) => continue,
            Ok(count) => panic!("unexpected {count} bytes after close"),
            Err(e) => break e,
        }
    };

    assert!(matches!(error, TransportError::Io(_)));
}

#[test]
fn test_closed_transport_rejects_io_and_cancels_selects() {
    let mut pair = connect(None);

    pair.outbound.close("test finished");
    pair.outbound.close("again");

    assert!(matches!(
        pair.outbound.write(&[IoSlice::new(b"late")]),
        Err(TransportError::Closed)
    ));
    assert!(matches!(
        pair.outbound.read(&mut [IoSliceMut::new(&mut [0u8; 4])]),
        Err(TransportError::Closed)
    ));
    assert_eq!(pair.outbound.encryption(false), "");
}
