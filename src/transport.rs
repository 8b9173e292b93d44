//! Generic transport abstraction [`PeerIo`](crate::peer_io::PeerIo) is built on.
//!
//! A non-blocking socket that can report readiness and do best-effort
//! reads/writes, with a `connect`/`set_tos` pair added so
//! [`BufferedSocket`](crate::buffered_socket::BufferedSocket) and
//! [`PeerIo`](crate::peer_io::PeerIo) never need to know they are talking
//! to a real TCP socket.

use async_trait::async_trait;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::TcpStream;

/// Non-blocking, readiness-driven socket. Implemented for [`TcpStream`];
/// tests substitute [`crate::transport::DuplexTransport`].
#[async_trait]
pub trait Transport: Send + Sync + Unpin + 'static {
    /// Opens a fresh connection to `addr:port`. Used by construction and by
    /// `reconnect`.
    async fn connect(addr: Ipv4Addr, port: u16) -> io::Result<Self>
    where
        Self: Sized;

    /// Waits for the socket to become readable.
    async fn readable(&self) -> io::Result<()>;

    /// Waits for the socket to become writable.
    async fn writable(&self) -> io::Result<()>;

    /// Non-blocking read; `WouldBlock` means "not actually readable yet".
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Non-blocking write; `WouldBlock` means "not actually writable yet".
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Remote peer address, if the transport is connected.
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Applies a IP ToS byte to the underlying socket. A best-effort knob;
    /// most test transports no-op it.
    fn set_tos(&self, tos: u8) -> io::Result<()>;
}

#[async_trait]
impl Transport for TcpStream {
    async fn connect(addr: Ipv4Addr, port: u16) -> io::Result<Self> {
        let target = SocketAddrV4::new(addr, port);
        TcpStream::connect(target).await
    }

    async fn readable(&self) -> io::Result<()> {
        self.readable().await
    }

    async fn writable(&self) -> io::Result<()> {
        self.writable().await
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.try_read(buf)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        self.try_write(buf)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.peer_addr()
    }

    fn set_tos(&self, tos: u8) -> io::Result<()> {
        let sock_ref = socket2::SockRef::from(self);
        sock_ref.set_tos(tos as u32)
    }
}

#[cfg(test)]
pub use duplex::DuplexTransport;
