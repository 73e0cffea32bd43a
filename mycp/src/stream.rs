//! The blocking MyCP stream facade (§4.6, §4.7): `MyCpStream::connect`,
//! `MyCpListener::bind`/`accept_one_client`, and `send`/`recv` on the
//! resulting stream. Everything here is a thin wrapper over
//! `ConnectionShared` and the singleton `NetworkManager`.

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::connection::{ConnectionShared, Terminal};
use crate::error::{Error, Result};
use crate::logging::Logger;
use crate::manager::{ListenerState, NetworkManager};

/// One end of an established MyCP connection.
pub struct MyCpStream {
    conn: Arc<ConnectionShared>,
    manager: NetworkManager,
}

impl MyCpStream {
    /// Opens a connection to `(remote_ip, remote_port)`, blocking until the
    /// handshake completes or exhausts its retries (§4.6).
    pub fn connect(remote_ip: Ipv4Addr, remote_port: u16, log: Logger) -> Result<MyCpStream> {
        let manager = NetworkManager::global(log)?;
        Self::connect_with_manager(manager, remote_ip, remote_port)
    }

    /// Same as `connect`, but against an explicit `NetworkManager` rather
    /// than the process-wide singleton. Exposed for test harnesses (e.g.
    /// `loopback.rs`-backed fault injection) that need several independent
    /// managers in one process; production code always goes through
    /// `connect`.
    pub fn connect_with_manager(manager: NetworkManager, remote_ip: Ipv4Addr, remote_port: u16) -> Result<MyCpStream> {
        if remote_ip.is_unspecified() || remote_port == 0 {
            return Err(Error::Addressing(format!("{remote_ip}:{remote_port} is not a connectable MyCP address")));
        }
        let local_port = manager.allocate_ephemeral_port();
        let conn = manager.connect(local_port, remote_ip, remote_port);
        conn.wait_for_established()?;
        Ok(MyCpStream { conn, manager })
    }

    /// Blocking, exact-length send: returns once every byte in `buf` has
    /// been accepted by the send queue (§4.7).
    pub fn send(&self, buf: &[u8]) -> Result<()> {
        self.conn.send(buf)
    }

    /// Blocking, exact-length receive: returns once `buf` is full, or once
    /// the peer has closed and no more bytes will ever arrive (§4.7).
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.conn.recv(buf)
    }

    /// Closes the connection from this side. There is no half-close (the
    /// Non-goals rule it out): both `send` and `recv` fail with
    /// `Error::PeerClosed` immediately after this call, the same contract
    /// `Stream::close` gives over the `Fallback` transport's
    /// `shutdown(Both)`. Any bytes still queued and not yet transmitted are
    /// discarded rather than silently buffered forever.
    pub fn close(&self) {
        self.conn.mark_terminal(Terminal::PeerClosed);
        self.manager.close(self.conn.addr);
    }
}

impl Drop for MyCpStream {
    fn drop(&mut self) {
        self.manager.close(self.conn.addr);
    }
}

/// A bound MyCP listening port, producing one `MyCpStream` per completed
/// inbound handshake.
pub struct MyCpListener {
    listener: Arc<ListenerState>,
    manager: NetworkManager,
}

impl MyCpListener {
    /// Registers `port` for inbound SYNs. Port 0 has no meaning for MyCP,
    /// which has no kernel ephemeral-port allocator behind it: a listener
    /// bound to 0 would register but never match an inbound SYN's
    /// destination port.
    pub fn bind(port: u16, log: Logger) -> Result<MyCpListener> {
        let manager = NetworkManager::global(log)?;
        Self::bind_with_manager(manager, port)
    }

    /// Same as `bind`, but against an explicit `NetworkManager` rather than
    /// the process-wide singleton. See `MyCpStream::connect_with_manager`.
    pub fn bind_with_manager(manager: NetworkManager, port: u16) -> Result<MyCpListener> {
        if port == 0 {
            return Err(Error::Misuse("cannot bind a MyCP listener to port 0".into()));
        }
        let listener = manager.listen(port);
        Ok(MyCpListener { listener, manager })
    }

    /// Blocks until the next handshake completes, returning the resulting
    /// stream (§4.6). Matches the spec's `accept_one_client` name.
    pub fn accept_one_client(&self) -> Result<MyCpStream> {
        let conn = self.listener.accept_one()?;
        Ok(MyCpStream {
            conn,
            manager: self.manager.clone(),
        })
    }
}

impl Drop for MyCpListener {
    fn drop(&mut self) {
        self.listener.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;

    #[test]
    fn connect_rejects_unspecified_address() {
        let err = MyCpStream::connect(Ipv4Addr::UNSPECIFIED, 9000, logging::discard()).unwrap_err();
        assert!(matches!(err, Error::Addressing(_)));
    }

    #[test]
    fn connect_rejects_port_zero() {
        let err = MyCpStream::connect(Ipv4Addr::LOCALHOST, 0, logging::discard()).unwrap_err();
        assert!(matches!(err, Error::Addressing(_)));
    }

    #[test]
    fn bind_rejects_port_zero() {
        let err = MyCpListener::bind(0, logging::discard()).unwrap_err();
        assert!(matches!(err, Error::Misuse(_)));
    }
}
