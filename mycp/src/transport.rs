//! Transport selection (ambient stack): lets the application layer choose
//! between the real MyCP protocol and the kernel-socket fallback without
//! duplicating its dispatch logic, the way `authenticator`'s `main.rs`
//! picks a listen address from a `clap` flag and hands it to one code
//! path.

use std::net::Ipv4Addr;

use crate::error::Result;
use crate::fallback::{FallbackListener, FallbackStream};
use crate::logging::Logger;
use crate::stream::{MyCpListener, MyCpStream};

/// Which substrate a `Transport` should use. `Fallback` is the default
/// since `Mycp` requires `CAP_NET_RAW`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransportKind {
    Mycp,
    Fallback,
}

impl Default for TransportKind {
    fn default() -> Self {
        TransportKind::Fallback
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "mycp" => Ok(TransportKind::Mycp),
            "fallback" => Ok(TransportKind::Fallback),
            other => Err(format!("unknown transport kind: {other}")),
        }
    }
}

/// A connected stream, either backed by MyCP or the kernel fallback.
pub enum Stream {
    Mycp(MyCpStream),
    Fallback(FallbackStream),
}

impl Stream {
    pub fn connect(kind: TransportKind, remote_ip: Ipv4Addr, remote_port: u16, log: Logger) -> Result<Stream> {
        match kind {
            TransportKind::Mycp => Ok(Stream::Mycp(MyCpStream::connect(remote_ip, remote_port, log)?)),
            TransportKind::Fallback => Ok(Stream::Fallback(FallbackStream::connect(remote_ip, remote_port)?)),
        }
    }

    pub fn send(&self, buf: &[u8]) -> Result<()> {
        match self {
            Stream::Mycp(stream) => stream.send(buf),
            Stream::Fallback(stream) => stream.send(buf),
        }
    }

    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Stream::Mycp(stream) => stream.recv(buf),
            Stream::Fallback(stream) => stream.recv(buf),
        }
    }

    pub fn close(&self) {
        match self {
            Stream::Mycp(stream) => stream.close(),
            Stream::Fallback(stream) => stream.close(),
        }
    }
}

/// A bound listening port, either backed by MyCP or the kernel fallback.
pub enum Listener {
    Mycp(MyCpListener),
    Fallback(FallbackListener),
}

impl Listener {
    pub fn bind(kind: TransportKind, port: u16, log: Logger) -> Result<Listener> {
        match kind {
            TransportKind::Mycp => Ok(Listener::Mycp(MyCpListener::bind(port, log)?)),
            TransportKind::Fallback => Ok(Listener::Fallback(FallbackListener::bind(port)?)),
        }
    }

    pub fn accept_one_client(&self) -> Result<Stream> {
        match self {
            Listener::Mycp(listener) => Ok(Stream::Mycp(listener.accept_one_client()?)),
            Listener::Fallback(listener) => Ok(Stream::Fallback(listener.accept_one_client()?)),
        }
    }

    /// The bound port, useful for the `Fallback` transport when `bind` was
    /// called with port `0`. MyCP listeners always know their port already,
    /// since it's supplied by the caller.
    pub fn local_port(&self, requested: u16) -> u16 {
        match self {
            Listener::Mycp(_) => requested,
            Listener::Fallback(listener) => listener.local_port(),
        }
    }
}
