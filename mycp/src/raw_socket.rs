//! The single SOCK_RAW socket all MyCP traffic is multiplexed over (§4.4,
//! §5). Exactly one of these is created per process; `NetworkManager` owns
//! it and registers it with its `mio::Poll` the way `Endpoint` registers its
//! `TcpListener`.

use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::{AsRawFd, RawFd};

use mio::unix::EventedFd;
use mio::{Evented, Poll, PollOpt, Ready, Token};

use crate::packet::IPPROTO_MYCP;

/// A received datagram with the IP header already stripped, tagged with the
/// peer address it arrived from.
pub struct Inbound {
    pub src_ip: Ipv4Addr,
    pub payload: Vec<u8>,
}

/// Thin wrapper over a non-blocking `SOCK_RAW` socket bound to
/// `IPPROTO_MYCP`. Every `sendto`/`recvfrom` goes through here; nothing
/// above this layer touches libc directly.
pub struct RawSocket {
    fd: RawFd,
}

impl RawSocket {
    /// Opens the raw socket and switches it to non-blocking mode. Requires
    /// `CAP_NET_RAW` (typically root) per §4.4 / §9.
    pub fn open() -> io::Result<RawSocket> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_RAW, IPPROTO_MYCP) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        if flags < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        Ok(RawSocket { fd })
    }

    /// Sends one datagram to `dst`. A raw IPv4 socket does its own framing
    /// of the IP header on send; MyCP datagrams never exceed the MTU (§3),
    /// so fragmentation is not handled here.
    pub fn send_to(&self, dst: Ipv4Addr, bytes: &[u8]) -> io::Result<usize> {
        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 0,
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(dst.octets()),
            },
            sin_zero: [0; 8],
        };

        let sent = unsafe {
            libc::sendto(
                self.fd,
                bytes.as_ptr() as *const libc::c_void,
                bytes.len(),
                0,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };

        if sent < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(sent as usize)
        }
    }

    /// Reads one pending datagram, stripping the IPv4 header the kernel
    /// leaves in place for `SOCK_RAW` receives. Returns `None` on
    /// `EAGAIN`/`EWOULDBLOCK`, meaning there is nothing left to drain this
    /// tick (§4.5 step 1).
    pub fn recv_from(&self) -> io::Result<Option<Inbound>> {
        let mut buf = [0u8; crate::packet::MTU];
        let mut src: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut src_len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

        let received = unsafe {
            libc::recvfrom(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut src as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut src_len,
            )
        };

        if received < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock => Ok(None),
                _ => Err(err),
            };
        }

        let received = received as usize;
        if received < crate::packet::IP_HEADER_SIZE {
            return Ok(None);
        }

        let ihl = (buf[0] & 0x0f) as usize * 4;
        if ihl > received {
            return Ok(None);
        }

        let src_ip = Ipv4Addr::from(u32::from_be(src.sin_addr.s_addr));
        let payload = buf[ihl..received].to_vec();
        Ok(Some(Inbound { src_ip, payload }))
    }
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

impl AsRawFd for RawSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

/// Registers the raw socket's descriptor with a `mio::Poll` the way
/// `neutronium`'s `TcpListener`/`TcpStream` register themselves, via
/// `EventedFd`.
impl Evented for RawSocket {
    fn register(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        EventedFd(&self.fd).register(poll, token, interest, opts)
    }

    fn reregister(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        EventedFd(&self.fd).reregister(poll, token, interest, opts)
    }

    fn deregister(&self, poll: &Poll) -> io::Result<()> {
        EventedFd(&self.fd).deregister(poll)
    }
}

unsafe impl Send for RawSocket {}

/// What `manager.rs`'s worker actually needs from "the network": send one
/// datagram, non-blockingly drain the next one, and be `mio`-registerable so
/// the worker's single `Poll` can wait on it alongside the wake source.
/// `RawSocket` is the only substrate used outside tests; `loopback.rs`
/// provides the other so the worker loop itself can be exercised without
/// `CAP_NET_RAW`.
pub trait Substrate: Evented + Send {
    fn send_to(&self, dst: Ipv4Addr, bytes: &[u8]) -> io::Result<usize>;
    fn recv_from(&self) -> io::Result<Option<Inbound>>;
}

impl Substrate for RawSocket {
    fn send_to(&self, dst: Ipv4Addr, bytes: &[u8]) -> io::Result<usize> {
        RawSocket::send_to(self, dst, bytes)
    }

    fn recv_from(&self) -> io::Result<Option<Inbound>> {
        RawSocket::recv_from(self)
    }
}

impl Evented for Box<dyn Substrate> {
    fn register(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        (**self).register(poll, token, interest, opts)
    }

    fn reregister(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        (**self).reregister(poll, token, interest, opts)
    }

    fn deregister(&self, poll: &Poll) -> io::Result<()> {
        (**self).deregister(poll)
    }
}
