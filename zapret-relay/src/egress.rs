//! Sockets toward real destinations
//!
//! The relays only see the [`Egress`], [`RealStream`] and [`RealDatagram`]
//! traits. [`DirectEgress`] is the production implementation: protected
//! sockets created through socket2 and driven by tokio.

use crate::protect::SocketProtector;
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tracing::debug;

/// Connected byte stream to a real destination
pub trait RealStream: AsyncRead + AsyncWrite + Send + Unpin {
    /// Set the IP TTL for segments sent from now on
    fn set_ttl(&self, ttl: u32) -> io::Result<()>;
}

impl RealStream for TcpStream {
    fn set_ttl(&self, ttl: u32) -> io::Result<()> {
        TcpStream::set_ttl(self, ttl)
    }
}

/// Connected datagram socket to a real destination
#[async_trait]
pub trait RealDatagram: Send + Sync {
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
    /// Set the IP TTL for datagrams sent from now on
    fn set_ttl(&self, ttl: u32) -> io::Result<()>;
}

#[async_trait]
impl RealDatagram for UdpSocket {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        UdpSocket::send(self, buf).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        UdpSocket::recv(self, buf).await
    }

    fn set_ttl(&self, ttl: u32) -> io::Result<()> {
        UdpSocket::set_ttl(self, ttl)
    }
}

/// Opens connections to real destinations
#[async_trait]
pub trait Egress: Send + Sync {
    async fn connect_stream(&self, dst: SocketAddrV4) -> io::Result<Box<dyn RealStream>>;

    /// Open a datagram socket connected to `dst`. Never blocks.
    fn open_datagram(&self, dst: SocketAddrV4) -> io::Result<Box<dyn RealDatagram>>;
}

/// Protected direct sockets
#[derive(Debug, Clone, Default)]
pub struct DirectEgress {
    protector: SocketProtector,
}

impl DirectEgress {
    pub fn new(protector: SocketProtector) -> Self {
        Self { protector }
    }

    /// Connect a TCP stream with Nagle disabled, so every write leaves as its own segment.
    pub async fn connect_tcp(&self, dst: SocketAddrV4) -> io::Result<TcpStream> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        self.protector.protect(&socket)?;
        socket.set_nodelay(true)?;
        socket.set_nonblocking(true)?;

        let socket = TcpSocket::from_std_stream(socket.into());
        let stream = socket.connect(SocketAddr::V4(dst)).await?;
        debug!("Connected to {}", dst);
        Ok(stream)
    }

    pub fn bind_udp(&self, dst: SocketAddrV4) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        self.protector.protect(&socket)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).into())?;
        socket.connect(&SocketAddr::V4(dst).into())?;
        UdpSocket::from_std(socket.into())
    }
}

#[async_trait]
impl Egress for DirectEgress {
    async fn connect_stream(&self, dst: SocketAddrV4) -> io::Result<Box<dyn RealStream>> {
        Ok(Box::new(self.connect_tcp(dst).await?))
    }

    fn open_datagram(&self, dst: SocketAddrV4) -> io::Result<Box<dyn RealDatagram>> {
        Ok(Box::new(self.bind_udp(dst)?))
    }
}
