//! Error taxonomy for MyCP.
//!
//! `Error` covers the kinds surfaced to user code (§7, §6). `DropReason`
//! covers the kinds that are purely local to the I/O worker — malformed
//! framing, integrity failures and window exhaustion are never returned to
//! a caller, they just cause a silent drop (visible only via retransmission
//! and, at `trace` level, the log).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure kinds surfaced across the blocking stream façade.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to create socket: {0}")]
    SocketCreate(String),

    #[error("invalid address: {0}")]
    Addressing(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("connection refused: no SYN-ACK received after {0} attempts")]
    ConnectRefused(u32),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("misuse of the API: {0}")]
    Misuse(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err.to_string())
    }
}

/// Reasons a datagram never makes it past the I/O worker. Purely internal;
/// `std::fmt::Display`/`Debug` only, since these are logged, not surfaced.
#[derive(Debug, Copy, Clone)]
pub enum DropReason {
    Malformed(&'static str),
    IntegrityFailure(&'static str),
    WindowExhausted,
    AddressMismatch,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::Malformed(reason) => write!(f, "malformed packet: {reason}"),
            DropReason::IntegrityFailure(reason) => write!(f, "integrity failure: {reason}"),
            DropReason::WindowExhausted => write!(f, "receive buffer has no space"),
            DropReason::AddressMismatch => write!(f, "source address does not match connection"),
        }
    }
}
