//! An in-memory stand-in for `raw_socket.rs`'s `RawSocket`, used only by
//! integration tests that need the real `manager.rs` worker loop — handshake,
//! ACKs, retransmission, flow control — without `CAP_NET_RAW`. A single
//! `LoopbackSubstrate` represents one process's view of "the network": every
//! `send_to` is looped straight back to the same worker's `recv_from` queue,
//! exactly as a real raw socket would for two peers both addressed at
//! `127.0.0.1`, optionally dropping or corrupting a packet first so tests
//! can drive the loss-recovery and integrity paths the kernel won't
//! reproduce on demand.

use std::collections::HashSet;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use mio::{Evented, Poll, PollOpt, Ready, Registration, SetReadiness, Token};

use crate::packet::{self, PacketKind};
use crate::raw_socket::{Inbound, Substrate};

/// What to do to outbound DATA packets before they're "delivered" back to
/// the same worker.
#[derive(Clone, Debug, Default)]
pub struct FaultPlan {
    /// Every `n`-th DATA packet sent (1-indexed) is dropped instead of
    /// delivered, simulating lossy IP transport.
    pub drop_every_nth_data: Option<usize>,
    /// The first DATA packet carrying this `packet_number` has one payload
    /// byte flipped before delivery, so its checksum fails and `packet::decode`
    /// rejects it; later retransmissions of the same sequence number are
    /// left intact.
    pub corrupt_data_number: Option<u64>,
}

struct Inner {
    queue: std::collections::VecDeque<Vec<u8>>,
    data_seen: u64,
    corrupted_once: HashSet<u64>,
    fault: FaultPlan,
}

pub struct LoopbackSubstrate {
    inner: Mutex<Inner>,
    registration: Registration,
    set_readiness: SetReadiness,
}

impl LoopbackSubstrate {
    pub fn new(fault: FaultPlan) -> LoopbackSubstrate {
        let (registration, set_readiness) = Registration::new2();
        LoopbackSubstrate {
            inner: Mutex::new(Inner {
                queue: std::collections::VecDeque::new(),
                data_seen: 0,
                corrupted_once: HashSet::new(),
                fault,
            }),
            registration,
            set_readiness,
        }
    }
}

impl Substrate for LoopbackSubstrate {
    fn send_to(&self, _dst: Ipv4Addr, bytes: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let mut bytes = bytes.to_vec();

        if let Ok(packet) = packet::decode(&bytes) {
            if packet.header.kind == PacketKind::Data {
                inner.data_seen += 1;
                let seen = inner.data_seen;
                let seq = packet.header.packet_number;

                if let Some(n) = inner.fault.drop_every_nth_data {
                    if n != 0 && seen % n as u64 == 0 {
                        return Ok(bytes.len());
                    }
                }

                if inner.fault.corrupt_data_number == Some(seq) && !inner.corrupted_once.contains(&seq) {
                    inner.corrupted_once.insert(seq);
                    // Flip one bit inside the header region (covered by the
                    // header checksum), not the payload, to match a "crafted
                    // packet with a single header byte flipped".
                    bytes[1] ^= 0xff;
                }
            }
        }

        inner.queue.push_back(bytes.clone());
        drop(inner);
        let _ = self.set_readiness.set_readiness(Ready::readable());
        Ok(bytes.len())
    }

    fn recv_from(&self) -> io::Result<Option<Inbound>> {
        let mut inner = self.inner.lock().unwrap();
        match inner.queue.pop_front() {
            Some(payload) => Ok(Some(Inbound { src_ip: Ipv4Addr::LOCALHOST, payload })),
            None => Ok(None),
        }
    }
}

impl Evented for LoopbackSubstrate {
    fn register(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        self.registration.register(poll, token, interest, opts)
    }

    fn reregister(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        self.registration.reregister(poll, token, interest, opts)
    }

    fn deregister(&self, poll: &Poll) -> io::Result<()> {
        self.registration.deregister(poll)
    }
}
