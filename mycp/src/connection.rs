//! The shared, reference-counted Connection handle (§3, §4.4, §9). The
//! facade and the `NetworkManager`'s connection table each retain an `Arc`
//! to this; it carries only what the facade needs to block and what the
//! worker needs to deliver data and signal lifecycle changes. The
//! worker-private retransmission state (sequence counters, RTO, the
//! retransmit set itself) lives in `manager::ConnectionWorker` instead,
//! since §5 specifies it needs no lock and is touched only by the I/O
//! thread.

use std::sync::{Condvar, Mutex};

use crate::addr::AddrInfo;
use crate::error::{Error, Result};
use crate::recv_buffer::ReceiveBuffer;
use crate::send_queue::SendQueue;

/// Connection lifecycle state (§4.4). `SynSent` only exists on the client
/// side between `connect()` issuing a SYN and the SYN-ACK arriving.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LifecycleState {
    SynSent,
    Established,
    PeerClosed,
    Closed,
}

/// Why a connection stopped making progress, surfaced to blocked facade
/// calls per §7.
#[derive(Debug, Clone)]
pub enum Terminal {
    PeerClosed,
    IoError(String),
}

impl Terminal {
    fn into_error(self) -> Error {
        match self {
            Terminal::PeerClosed => Error::PeerClosed,
            Terminal::IoError(message) => Error::IoError(message),
        }
    }
}

struct RecvInner {
    buffer: ReceiveBuffer,
}

/// The Connection as seen by both the facade and the I/O worker.
pub struct ConnectionShared {
    pub addr: AddrInfo,
    pub send_queue: SendQueue,
    recv: Mutex<RecvInner>,
    recv_ready: Condvar,
    terminal: Mutex<Option<Terminal>>,
    lifecycle: Mutex<LifecycleState>,
    lifecycle_changed: Condvar,
    connect_error: Mutex<Option<Error>>,
}

impl ConnectionShared {
    pub fn new(addr: AddrInfo, initial_recv_sequence: u64) -> ConnectionShared {
        ConnectionShared {
            addr,
            send_queue: SendQueue::new(),
            recv: Mutex::new(RecvInner {
                buffer: ReceiveBuffer::new(initial_recv_sequence),
            }),
            recv_ready: Condvar::new(),
            terminal: Mutex::new(None),
            lifecycle: Mutex::new(LifecycleState::SynSent),
            lifecycle_changed: Condvar::new(),
            connect_error: Mutex::new(None),
        }
    }

    /// Used on the accepting side: a SYN was already answered with a
    /// SYN-ACK, so the connection starts life `Established` rather than
    /// `SynSent`.
    pub fn new_established(addr: AddrInfo, initial_recv_sequence: u64) -> ConnectionShared {
        let conn = ConnectionShared::new(addr, initial_recv_sequence);
        conn.set_lifecycle(LifecycleState::Established);
        conn
    }

    #[inline]
    pub fn lifecycle(&self) -> LifecycleState {
        *self.lifecycle.lock().unwrap()
    }

    /// Moves the connection to a new lifecycle state and wakes anyone
    /// blocked on `wait_for_established`.
    pub fn set_lifecycle(&self, state: LifecycleState) {
        *self.lifecycle.lock().unwrap() = state;
        self.lifecycle_changed.notify_all();
    }

    /// Used by `connect()`: blocks until the handshake resolves one way or
    /// the other.
    pub fn wait_for_established(&self) -> Result<()> {
        let mut guard = self.lifecycle.lock().unwrap();
        while *guard == LifecycleState::SynSent {
            guard = self.lifecycle_changed.wait(guard).unwrap();
        }
        match *guard {
            LifecycleState::Established => Ok(()),
            _ => {
                drop(guard);
                let err = self.connect_error.lock().unwrap().take();
                Err(err.unwrap_or_else(|| Error::HandshakeFailed("connection closed before SYN-ACK arrived".into())))
            }
        }
    }

    /// Records why the handshake failed and flips lifecycle to `Closed`,
    /// waking any thread blocked in `wait_for_established`. Called only by
    /// the I/O worker.
    pub fn fail_handshake(&self, err: Error) {
        *self.connect_error.lock().unwrap() = Some(err);
        self.set_lifecycle(LifecycleState::Closed);
    }

    /// Called by the worker when it inserts a DATA packet into the receive
    /// buffer, so a blocked `recv` can observe it.
    pub fn insert_data(&self, sequence: u64, payload: Vec<u8>) {
        let mut guard = self.recv.lock().unwrap();
        guard.buffer.insert(sequence, payload);
        drop(guard);
        self.recv_ready.notify_one();
    }

    /// Highest contiguous sequence number the receive buffer currently
    /// covers — used by the worker to build the next ACK.
    pub fn max_contiguous_sequence(&self) -> u64 {
        self.recv.lock().unwrap().buffer.max_contiguous_sequence()
    }

    /// Free bytes the receive buffer can still advertise.
    pub fn free_window_bytes(&self) -> usize {
        self.recv.lock().unwrap().buffer.free_window_bytes()
    }

    /// Marks the connection terminal (peer close or fatal I/O error) and
    /// wakes every facade thread that might be blocked on it. Takes the
    /// `recv` lock before notifying, the same way `insert_data` does, so a
    /// `recv()` thread that just observed `terminal() == None` can't miss
    /// this wakeup and wait forever.
    pub fn mark_terminal(&self, terminal: Terminal) {
        let guard = self.recv.lock().unwrap();
        *self.terminal.lock().unwrap() = Some(terminal);
        self.send_queue.close();
        drop(guard);
        self.recv_ready.notify_all();
        self.set_lifecycle(LifecycleState::PeerClosed);
    }

    fn terminal(&self) -> Option<Terminal> {
        self.terminal.lock().unwrap().clone()
    }

    /// Blocking, exact-length send (§4.7): returns once every byte has been
    /// accepted into the send queue. Does not imply delivery.
    pub fn send(&self, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if let Some(terminal) = self.terminal() {
            return Err(terminal.into_error());
        }
        if self.send_queue.write(buf) {
            Ok(())
        } else {
            let terminal = self.terminal().unwrap_or_else(|| Terminal::IoError("connection closed".into()));
            Err(terminal.into_error())
        }
    }

    /// Blocking, exact-length receive (§4.7): returns once exactly
    /// `buf.len()` bytes have been copied, or fails with `PeerClosed` once
    /// the connection is peer-closed and the buffer has been drained.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut copied = 0usize;
        let mut guard = self.recv.lock().unwrap();
        loop {
            copied += guard.buffer.read(&mut buf[copied..]);
            if copied == buf.len() {
                return Ok(copied);
            }
            if let Some(terminal) = self.terminal() {
                return Err(terminal.into_error());
            }
            guard = self.recv_ready.wait(guard).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn addr() -> AddrInfo {
        AddrInfo::new(1, Ipv4Addr::LOCALHOST, 2)
    }

    #[test]
    fn zero_length_send_and_recv_return_immediately() {
        let conn = ConnectionShared::new(addr(), 0);
        conn.send(&[]).unwrap();
        assert_eq!(conn.recv(&mut []).unwrap(), 0);
    }

    #[test]
    fn recv_blocks_until_data_arrives() {
        let conn = Arc::new(ConnectionShared::new(addr(), 0));
        let reader = conn.clone();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 4];
            reader.recv(&mut buf).unwrap();
            buf
        });

        thread::sleep(Duration::from_millis(30));
        conn.insert_data(0, vec![b'P', b'I', b'N', b'G']);

        let buf = handle.join().unwrap();
        assert_eq!(&buf, b"PING");
    }

    #[test]
    fn recv_fails_with_peer_closed_once_buffer_drained() {
        let conn = ConnectionShared::new(addr(), 0);
        conn.insert_data(0, vec![1, 2]);
        conn.mark_terminal(Terminal::PeerClosed);

        let mut buf = [0u8; 2];
        assert!(conn.recv(&mut buf).is_ok());

        let mut buf2 = [0u8; 1];
        assert!(matches!(conn.recv(&mut buf2), Err(Error::PeerClosed)));
    }

    #[test]
    fn send_fails_once_terminal() {
        let conn = ConnectionShared::new(addr(), 0);
        conn.mark_terminal(Terminal::IoError("boom".into()));
        assert!(matches!(conn.send(&[1, 2, 3]), Err(Error::IoError(_))));
    }
}
