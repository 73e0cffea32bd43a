//! MyCP: a reliable byte-stream transport built directly on raw IPv4
//! (`IPPROTO_MYCP`), with a blocking `std::net`-shaped facade on top of a
//! single shared socket and a background I/O worker.
//!
//! [`stream::MyCpStream`] / [`stream::MyCpListener`] are the protocol
//! itself; [`transport`] lets callers fall back to a kernel TCP socket
//! when raw sockets aren't available (no `CAP_NET_RAW`), behind the same
//! blocking, exact-length `send`/`recv` contract.

pub mod addr;
pub mod connection;
pub mod error;
pub mod fallback;
pub mod loopback;
pub mod logging;
pub mod manager;
pub mod packet;
pub mod raw_socket;
pub mod recv_buffer;
pub mod retransmit;
pub mod send_queue;
pub mod stream;
pub mod transport;

pub use error::{Error, Result};
pub use stream::{MyCpListener, MyCpStream};
pub use transport::{Listener, Stream, TransportKind};
