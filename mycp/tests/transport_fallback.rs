//! End-to-end scenarios exercised over the kernel-socket fallback
//! transport: raw MyCP sockets need `CAP_NET_RAW`, which an unprivileged
//! test runner doesn't have, so these drive the same application-facing
//! `Stream`/`Listener` API against `TransportKind::Fallback` instead.

use mycp::{logging, Listener, Stream, TransportKind};
use std::net::Ipv4Addr;
use std::thread;

fn discard() -> logging::Logger {
    logging::discard()
}

/// Scenario 1 (small round-trip): client sends the 4-byte string "PING";
/// server echoes it back byte-identical.
#[test]
fn small_message_round_trips() {
    let listener = Listener::bind(TransportKind::Fallback, 0, discard()).unwrap();
    let port = listener.local_port(0);

    let server = thread::spawn(move || {
        let stream = listener.accept_one_client().unwrap();
        let mut buf = [0u8; 4];
        stream.recv(&mut buf).unwrap();
        stream.send(&buf).unwrap();
    });

    let client = Stream::connect(TransportKind::Fallback, Ipv4Addr::LOCALHOST, port, discard()).unwrap();
    client.send(b"PING").unwrap();
    let mut buf = [0u8; 4];
    client.recv(&mut buf).unwrap();
    assert_eq!(&buf, b"PING");

    server.join().unwrap();
}

/// Scenario 2 (large stream): client sends 262,144 little-endian u64s
/// `[0, 1, ..., 262143]`; every index i the server reads back satisfies
/// `buf[i] == i`.
#[test]
fn large_stream_round_trips_exactly() {
    let listener = Listener::bind(TransportKind::Fallback, 0, discard()).unwrap();
    let port = listener.local_port(0);

    const COUNT: usize = 262_144;
    let mut payload = Vec::with_capacity(COUNT * 8);
    for i in 0..COUNT as u64 {
        payload.extend_from_slice(&i.to_le_bytes());
    }
    let size = payload.len();

    let server = thread::spawn(move || {
        let stream = listener.accept_one_client().unwrap();
        let mut buf = vec![0u8; size];
        stream.recv(&mut buf).unwrap();
        stream.send(&buf).unwrap();
    });

    let client = Stream::connect(TransportKind::Fallback, Ipv4Addr::LOCALHOST, port, discard()).unwrap();
    client.send(&payload).unwrap();
    let mut echoed = vec![0u8; size];
    client.recv(&mut echoed).unwrap();

    for i in 0..COUNT {
        let word = u64::from_le_bytes(echoed[i * 8..i * 8 + 8].try_into().unwrap());
        assert_eq!(word, i as u64, "mismatch at index {i}");
    }

    server.join().unwrap();
}

/// Scenario 5 (concurrent connections): two server-accepted connections
/// each carry an independent 64 KiB stream, with no cross-contamination.
#[test]
fn handles_several_concurrent_connections() {
    let listener = Listener::bind(TransportKind::Fallback, 0, discard()).unwrap();
    let port = listener.local_port(0);

    const CLIENTS: usize = 2;
    const SIZE: usize = 64 * 1024;

    let server = thread::spawn(move || {
        let mut handlers = Vec::new();
        for _ in 0..CLIENTS {
            let stream = listener.accept_one_client().unwrap();
            handlers.push(thread::spawn(move || {
                let mut buf = vec![0u8; SIZE];
                stream.recv(&mut buf).unwrap();
                stream.send(&buf).unwrap();
            }));
        }
        for handler in handlers {
            handler.join().unwrap();
        }
    });

    let clients: Vec<_> = (0..CLIENTS)
        .map(|i| {
            thread::spawn(move || {
                let client = Stream::connect(TransportKind::Fallback, Ipv4Addr::LOCALHOST, port, discard()).unwrap();
                let payload: Vec<u8> = (0..SIZE).map(|b| ((b + i) % 256) as u8).collect();
                client.send(&payload).unwrap();
                let mut buf = vec![0u8; SIZE];
                client.recv(&mut buf).unwrap();
                assert_eq!(buf, payload, "stream {i} was cross-contaminated");
            })
        })
        .collect();

    for client in clients {
        client.join().unwrap();
    }
    server.join().unwrap();
}

#[test]
fn recv_reports_peer_closed_once_drained() {
    let listener = Listener::bind(TransportKind::Fallback, 0, discard()).unwrap();
    let port = listener.local_port(0);

    let server = thread::spawn(move || {
        let stream = listener.accept_one_client().unwrap();
        stream.send(b"hi").unwrap();
        stream.close();
    });

    let client = Stream::connect(TransportKind::Fallback, Ipv4Addr::LOCALHOST, port, discard()).unwrap();
    let mut buf = [0u8; 2];
    client.recv(&mut buf).unwrap();
    assert_eq!(&buf, b"hi");

    server.join().unwrap();
    let mut tail = [0u8; 1];
    assert!(client.recv(&mut tail).is_err());
}
