//! End-to-end scenarios driven against the real MyCP engine (handshake,
//! ACKs, retransmission, flow control) rather than `TransportKind::Fallback`.
//! A privileged raw socket isn't available to the test runner, so each test
//! starts its own `NetworkManager` over a `loopback::LoopbackSubstrate`
//! instead of the real `RawSocket` — same worker loop, same
//! `MyCpStream`/`MyCpListener` facade, an in-memory "wire" a test can drop
//! or corrupt packets on.

use mycp::loopback::{FaultPlan, LoopbackSubstrate};
use mycp::manager::NetworkManager;
use mycp::{logging, MyCpListener, MyCpStream};
use std::net::Ipv4Addr;
use std::thread;

fn discard() -> logging::Logger {
    logging::discard()
}

fn manager_with_fault(fault: FaultPlan) -> NetworkManager {
    NetworkManager::start_with_substrate(Box::new(LoopbackSubstrate::new(fault)), discard()).unwrap()
}

/// Scenario 3 (loss simulation): every 10th DATA packet is dropped on the
/// wire. The delivered byte sequence must still come out identical once
/// retransmission recovers the gaps.
#[test]
fn recovers_from_periodic_packet_loss() {
    let manager = manager_with_fault(FaultPlan { drop_every_nth_data: Some(10), ..FaultPlan::default() });
    let port = 41001;

    let listener = MyCpListener::bind_with_manager(manager.clone(), port).unwrap();
    const SIZE: usize = 50 * 1024;
    let payload: Vec<u8> = (0..SIZE).map(|i| (i % 256) as u8).collect();
    let expected = payload.clone();

    let server = thread::spawn(move || {
        let stream = listener.accept_one_client().unwrap();
        let mut buf = vec![0u8; SIZE];
        stream.recv(&mut buf).unwrap();
        buf
    });

    let client = MyCpStream::connect_with_manager(manager, Ipv4Addr::LOCALHOST, port).unwrap();
    client.send(&payload).unwrap();

    let received = server.join().unwrap();
    assert_eq!(received, expected);
}

/// Scenario 6 (integrity rejection): the first DATA packet sent has a
/// header byte flipped once. It must be dropped (checksum failure) rather
/// than delivered corrupted, and the subsequent clean retransmission must
/// still arrive and complete the stream.
#[test]
fn rejects_corrupted_packet_and_recovers_via_retransmission() {
    let manager = manager_with_fault(FaultPlan { corrupt_data_number: Some(0), ..FaultPlan::default() });
    let port = 41002;

    let listener = MyCpListener::bind_with_manager(manager.clone(), port).unwrap();
    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
    let expected = payload.clone();

    let server = thread::spawn(move || {
        let stream = listener.accept_one_client().unwrap();
        let mut buf = vec![0u8; expected.len()];
        stream.recv(&mut buf).unwrap();
        buf
    });

    let client = MyCpStream::connect_with_manager(manager, Ipv4Addr::LOCALHOST, port).unwrap();
    client.send(&payload).unwrap();

    let received = server.join().unwrap();
    assert_eq!(received, payload);
}

/// Scenario 4 (window back-pressure): the receiver pauses after the first
/// 32 KiB while the sender keeps submitting data. The sender must block
/// inside `send` until the receiver resumes reading; the bytes finally
/// received must equal the bytes sent.
#[test]
fn send_blocks_until_receiver_drains_window() {
    let manager = manager_with_fault(FaultPlan::default());
    let port = 41003;

    let listener = MyCpListener::bind_with_manager(manager.clone(), port).unwrap();
    // A reader that consumes 32 KiB then pauses lets at most (32 KiB read +
    // a full 128 KiB receive window) = 160 KiB reach the connection before
    // the advertised window collapses to zero, plus another 128 KiB that
    // can sit in the sender's own send queue before `send` itself blocks.
    // 384 KiB clears that ~288 KiB ceiling with margin, so the block below
    // is guaranteed rather than a coin flip on exactly the spec's
    // illustrative 256 KiB figure.
    const TOTAL: usize = 384 * 1024;
    const FIRST: usize = 32 * 1024;
    let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 256) as u8).collect();
    let expected = payload.clone();

    let server = thread::spawn(move || {
        let stream = listener.accept_one_client().unwrap();
        let mut received = vec![0u8; TOTAL];

        stream.recv(&mut received[..FIRST]).unwrap();
        // Pause here: nothing else is read for a while, so the receive
        // buffer fills, the advertised window collapses to zero, and the
        // sender's own send queue backs up behind it.
        thread::sleep(std::time::Duration::from_millis(200));

        stream.recv(&mut received[FIRST..]).unwrap();
        received
    });

    let client = MyCpStream::connect_with_manager(manager, Ipv4Addr::LOCALHOST, port).unwrap();

    let sender = thread::spawn(move || {
        client.send(&payload).unwrap();
    });

    // The sender must still be blocked while the receiver is paused: the
    // combined receive window and local send-queue capacity are well under
    // TOTAL - FIRST bytes.
    thread::sleep(std::time::Duration::from_millis(100));
    assert!(!sender.is_finished(), "send() returned before the receiver drained the window");

    sender.join().unwrap();
    let received = server.join().unwrap();
    assert_eq!(received, expected);
}
