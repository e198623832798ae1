//! Shared test doubles for relay integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Once};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use zapret_packet::{parse_ipv4, parse_tcp, parse_udp, TcpFlags, IPPROTO_TCP, IPPROTO_UDP};
use zapret_relay::{
    Egress, FrameReceiver, InboundDatagram, InboundSegment, RealDatagram, RealStream,
    RelayConfig, RelayStats, TcpRelay, UdpRelay,
};

pub const TUNNEL: Ipv4Addr = Ipv4Addr::new(10, 120, 0, 1);
pub const DEVICE: Ipv4Addr = Ipv4Addr::new(10, 120, 0, 2);
pub const REMOTE: Ipv4Addr = Ipv4Addr::new(1, 2, 3, 4);

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("zapret_relay=debug")
            .with_test_writer()
            .try_init();
    });
}

/// What the relay did to a real stream, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireOp {
    Ttl(u32),
    Write(Vec<u8>),
    Shutdown,
}

pub struct MockStream {
    inner: DuplexStream,
    log: Arc<Mutex<Vec<WireOp>>>,
}

impl AsyncRead for MockStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let polled = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &polled {
            self.log.lock().push(WireOp::Write(buf[..*n].to_vec()));
        }
        polled
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let polled = Pin::new(&mut self.inner).poll_shutdown(cx);
        if let Poll::Ready(Ok(())) = &polled {
            self.log.lock().push(WireOp::Shutdown);
        }
        polled
    }
}

impl RealStream for MockStream {
    fn set_ttl(&self, ttl: u32) -> io::Result<()> {
        self.log.lock().push(WireOp::Ttl(ttl));
        Ok(())
    }
}

/// Destination side of a relayed TCP connection
pub struct RemoteStream {
    pub dst: SocketAddrV4,
    pub stream: DuplexStream,
    pub log: Arc<Mutex<Vec<WireOp>>>,
}

impl RemoteStream {
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.log
            .lock()
            .iter()
            .filter_map(|op| match op {
                WireOp::Write(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }
}

pub struct MockDatagram {
    ttl: AtomicU32,
    sent: Arc<Mutex<Vec<(u32, Vec<u8>)>>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

#[async_trait]
impl RealDatagram for MockDatagram {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.sent.lock().push((self.ttl.load(Ordering::SeqCst), buf.to_vec()));
        Ok(buf.len())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            None => Err(io::Error::new(io::ErrorKind::ConnectionReset, "remote gone")),
        }
    }

    fn set_ttl(&self, ttl: u32) -> io::Result<()> {
        self.ttl.store(ttl, Ordering::SeqCst);
        Ok(())
    }
}

/// Destination side of a relayed UDP flow
pub struct RemoteDatagram {
    pub dst: SocketAddrV4,
    pub sent: Arc<Mutex<Vec<(u32, Vec<u8>)>>>,
    pub reply: mpsc::UnboundedSender<Vec<u8>>,
}

impl RemoteDatagram {
    /// Wait until at least `count` datagrams were sent
    pub async fn wait_sent(&self, count: usize) -> Vec<(u32, Vec<u8>)> {
        for _ in 0..200 {
            {
                let sent = self.sent.lock();
                if sent.len() >= count {
                    return sent.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} datagrams, got {}", count, self.sent.lock().len());
    }
}

pub struct Remotes {
    pub streams: mpsc::UnboundedReceiver<RemoteStream>,
    pub datagrams: mpsc::UnboundedReceiver<RemoteDatagram>,
}

impl Remotes {
    pub async fn next_stream(&mut self) -> RemoteStream {
        tokio::time::timeout(Duration::from_secs(2), self.streams.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("egress dropped")
    }

    pub async fn next_datagram(&mut self) -> RemoteDatagram {
        tokio::time::timeout(Duration::from_secs(2), self.datagrams.recv())
            .await
            .expect("timed out waiting for a socket")
            .expect("egress dropped")
    }
}

/// In-memory egress: every connection and socket is handed to the test
pub struct MockEgress {
    streams: mpsc::UnboundedSender<RemoteStream>,
    datagrams: mpsc::UnboundedSender<RemoteDatagram>,
    pub fail_connect: AtomicBool,
    pub fail_open: AtomicBool,
    pub connect_delay: Mutex<Option<Duration>>,
}

impl MockEgress {
    pub fn new() -> (Arc<Self>, Remotes) {
        let (streams, streams_rx) = mpsc::unbounded_channel();
        let (datagrams, datagrams_rx) = mpsc::unbounded_channel();
        let egress = Arc::new(Self {
            streams,
            datagrams,
            fail_connect: AtomicBool::new(false),
            fail_open: AtomicBool::new(false),
            connect_delay: Mutex::new(None),
        });
        (egress, Remotes { streams: streams_rx, datagrams: datagrams_rx })
    }
}

#[async_trait]
impl Egress for MockEgress {
    async fn connect_stream(&self, dst: SocketAddrV4) -> io::Result<Box<dyn RealStream>> {
        let delay = *self.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }

        let (near, far) = tokio::io::duplex(256 * 1024);
        let log = Arc::new(Mutex::new(Vec::new()));
        let _ = self.streams.send(RemoteStream { dst, stream: far, log: log.clone() });
        Ok(Box::new(MockStream { inner: near, log }))
    }

    fn open_datagram(&self, dst: SocketAddrV4) -> io::Result<Box<dyn RealDatagram>> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "not protected"));
        }

        let sent = Arc::new(Mutex::new(Vec::new()));
        let (reply, inbound) = mpsc::unbounded_channel();
        let _ = self.datagrams.send(RemoteDatagram { dst, sent: sent.clone(), reply });
        Ok(Box::new(MockDatagram {
            ttl: AtomicU32::new(64),
            sent,
            inbound: tokio::sync::Mutex::new(inbound),
        }))
    }
}

pub struct TcpHarness {
    pub relay: TcpRelay,
    pub frames: FrameReceiver,
    pub remotes: Remotes,
    pub egress: Arc<MockEgress>,
    pub stats: Arc<RelayStats>,
}

pub fn tcp_harness(config: RelayConfig) -> TcpHarness {
    init_tracing();
    let (egress, remotes) = MockEgress::new();
    let stats = Arc::new(RelayStats::new());
    let (frames_tx, frames) = mpsc::unbounded_channel();
    let relay = TcpRelay::spawn(Arc::new(config), egress.clone(), frames_tx, stats.clone());
    TcpHarness { relay, frames, remotes, egress, stats }
}

pub struct UdpHarness {
    pub relay: UdpRelay,
    pub frames: FrameReceiver,
    pub remotes: Remotes,
    pub egress: Arc<MockEgress>,
    pub stats: Arc<RelayStats>,
}

pub fn udp_harness(config: RelayConfig) -> UdpHarness {
    init_tracing();
    let (egress, remotes) = MockEgress::new();
    let stats = Arc::new(RelayStats::new());
    let (frames_tx, frames) = mpsc::unbounded_channel();
    let relay = UdpRelay::spawn(Arc::new(config), egress.clone(), frames_tx, stats.clone());
    UdpHarness { relay, frames, remotes, egress, stats }
}

pub async fn next_frame(frames: &mut FrameReceiver) -> Bytes {
    tokio::time::timeout(Duration::from_secs(2), frames.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("relay dropped the frame channel")
}

/// True when no frame arrives within `wait`
pub async fn no_frame(frames: &mut FrameReceiver, wait: Duration) -> bool {
    !matches!(tokio::time::timeout(wait, frames.recv()).await, Ok(Some(_)))
}

/// Owned view of a synthesized TCP frame
#[derive(Debug, Clone)]
pub struct TcpFrame {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub payload: Vec<u8>,
}

pub fn tcp_frame(frame: &[u8]) -> TcpFrame {
    let ip = parse_ipv4(frame).expect("valid IPv4 frame");
    assert_eq!(ip.protocol, IPPROTO_TCP);
    let tcp = parse_tcp(ip.payload).expect("valid TCP segment");
    TcpFrame {
        src: SocketAddrV4::new(ip.src_addr, tcp.src_port),
        dst: SocketAddrV4::new(ip.dst_addr, tcp.dst_port),
        seq: tcp.seq,
        ack: tcp.ack,
        flags: tcp.flags,
        window: tcp.window,
        payload: tcp.payload.to_vec(),
    }
}

/// Owned view of a synthesized UDP frame
#[derive(Debug, Clone)]
pub struct UdpFrame {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub payload: Vec<u8>,
}

pub fn udp_frame(frame: &[u8]) -> UdpFrame {
    let ip = parse_ipv4(frame).expect("valid IPv4 frame");
    assert_eq!(ip.protocol, IPPROTO_UDP);
    let udp = parse_udp(ip.payload).expect("valid UDP datagram");
    UdpFrame {
        src: SocketAddrV4::new(ip.src_addr, udp.src_port),
        dst: SocketAddrV4::new(ip.dst_addr, udp.dst_port),
        payload: udp.payload.to_vec(),
    }
}

pub fn segment(
    src_port: u16,
    dst_port: u16,
    seq: u32,
    flags: TcpFlags,
    payload: &[u8],
) -> InboundSegment {
    InboundSegment {
        src_addr: DEVICE,
        dst_addr: REMOTE,
        src_port,
        dst_port,
        seq,
        ack: 0,
        flags,
        payload: Bytes::copy_from_slice(payload),
    }
}

pub fn syn(src_port: u16, seq: u32) -> InboundSegment {
    segment(src_port, 443, seq, TcpFlags { syn: true, ..Default::default() }, &[])
}

pub fn data(src_port: u16, seq: u32, payload: &[u8]) -> InboundSegment {
    segment(src_port, 443, seq, TcpFlags::psh_ack(), payload)
}

pub fn datagram(src_port: u16, dst_port: u16, payload: &[u8]) -> InboundDatagram {
    InboundDatagram {
        src_addr: DEVICE,
        dst_addr: REMOTE,
        src_port,
        dst_port,
        payload: Bytes::copy_from_slice(payload),
    }
}

/// TLS 1.2 handshake record carrying a ClientHello, padded to `len`
pub fn client_hello(len: usize) -> Vec<u8> {
    let mut hello: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    let body = (len - 5) as u16;
    hello[..6].copy_from_slice(&[0x16, 0x03, 0x01, (body >> 8) as u8, body as u8, 0x01]);
    hello
}

/// QUIC v1 long-header Initial
pub fn quic_initial(len: usize) -> Vec<u8> {
    let mut packet = vec![0u8; len];
    packet[..5].copy_from_slice(&[0xc3, 0x00, 0x00, 0x00, 0x01]);
    packet
}
