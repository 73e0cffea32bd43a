//! Kernel-socket fallback transport (ambient stack, not in the original
//! protocol spec): a `std::net::TcpStream`-backed stream with the same
//! blocking, exact-length `send`/`recv` contract as `MyCpStream`, so the
//! application layer can run the same code path without `CAP_NET_RAW`.
//! This is what the integration tests in `tests/` drive, since raw
//! sockets need root.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::Mutex;

use crate::error::{Error, Result};

pub struct FallbackStream {
    stream: Mutex<TcpStream>,
}

impl FallbackStream {
    pub fn connect(remote_ip: Ipv4Addr, remote_port: u16) -> Result<FallbackStream> {
        let stream = TcpStream::connect(SocketAddrV4::new(remote_ip, remote_port))?;
        Ok(FallbackStream { stream: Mutex::new(stream) })
    }

    fn from_tcp(stream: TcpStream) -> FallbackStream {
        FallbackStream { stream: Mutex::new(stream) }
    }

    pub fn send(&self, buf: &[u8]) -> Result<()> {
        self.stream.lock().unwrap().write_all(buf)?;
        Ok(())
    }

    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.stream.lock().unwrap().read_exact(buf) {
            Ok(()) => Ok(buf.len()),
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::PeerClosed),
            Err(err) => Err(err.into()),
        }
    }

    pub fn close(&self) {
        let _ = self.stream.lock().unwrap().shutdown(std::net::Shutdown::Both);
    }
}

pub struct FallbackListener {
    listener: TcpListener,
}

impl FallbackListener {
    pub fn bind(port: u16) -> Result<FallbackListener> {
        let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))?;
        Ok(FallbackListener { listener })
    }

    /// The port actually bound, useful when `bind` was called with `0`.
    pub fn local_port(&self) -> u16 {
        self.listener.local_addr().expect("bound listener always has a local address").port()
    }

    pub fn accept_one_client(&self) -> Result<FallbackStream> {
        let (stream, _) = self.listener.accept()?;
        Ok(FallbackStream::from_tcp(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn exact_length_round_trip() {
        let listener = FallbackListener::bind(0).unwrap();
        let port = listener.local_port();

        let server = thread::spawn(move || {
            let stream = listener.accept_one_client().unwrap();
            let mut buf = [0u8; 5];
            stream.recv(&mut buf).unwrap();
            stream.send(&buf).unwrap();
        });

        let client = FallbackStream::connect(Ipv4Addr::LOCALHOST, port).unwrap();
        client.send(b"hello").unwrap();
        let mut buf = [0u8; 5];
        client.recv(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        server.join().unwrap();
    }

    #[test]
    fn recv_after_close_fails_with_peer_closed() {
        let listener = FallbackListener::bind(0).unwrap();
        let port = listener.local_port();

        let server = thread::spawn(move || {
            let stream = listener.accept_one_client().unwrap();
            stream.close();
        });

        let client = FallbackStream::connect(Ipv4Addr::LOCALHOST, port).unwrap();
        let mut buf = [0u8; 1];
        server.join().unwrap();
        assert!(matches!(client.recv(&mut buf), Err(Error::PeerClosed)));
    }
}
