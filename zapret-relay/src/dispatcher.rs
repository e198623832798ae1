//! Packet dispatcher
//!
//! The only component that touches the virtual interface. It reads frame
//! batches, routes TCP and UDP to their relays and writes relay-produced
//! frames back. It keeps no session state.

use crate::stats::RelayStats;
use crate::tcp::{InboundSegment, TcpRelay};
use crate::udp::{InboundDatagram, UdpRelay};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};
use zapret_packet::{parse_ipv4, parse_tcp, parse_udp, IPPROTO_TCP, IPPROTO_UDP};

/// Frames produced by the relays, drained by the dispatcher's writer
pub type FrameSender = mpsc::UnboundedSender<Bytes>;
pub type FrameReceiver = mpsc::UnboundedReceiver<Bytes>;

/// Address family tag attached to every frame crossing the interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
    Inet6,
    Other(u32),
}

/// Virtual interface contract
#[async_trait]
pub trait PacketFlow: Send + Sync {
    /// Wait for the next batch of captured frames
    async fn read_packets(&self) -> io::Result<Vec<(Bytes, AddressFamily)>>;

    async fn write_packet(&self, frame: Bytes, family: AddressFamily) -> io::Result<()>;
}

/// In-memory [`PacketFlow`] backed by channels.
///
/// The platform side holds a [`FlowHandle`]: it pushes captured frames in and
/// takes synthesized frames out.
pub struct ChannelFlow {
    inbound: Mutex<mpsc::Receiver<(Bytes, AddressFamily)>>,
    outbound: mpsc::Sender<(Bytes, AddressFamily)>,
    batch_size: usize,
}

/// Platform end of a [`ChannelFlow`]
pub struct FlowHandle {
    pub to_relay: mpsc::Sender<(Bytes, AddressFamily)>,
    pub from_relay: mpsc::Receiver<(Bytes, AddressFamily)>,
}

impl ChannelFlow {
    pub fn pair(capacity: usize) -> (Self, FlowHandle) {
        let (to_relay, inbound) = mpsc::channel(capacity);
        let (outbound, from_relay) = mpsc::channel(capacity);
        let flow = Self {
            inbound: Mutex::new(inbound),
            outbound,
            batch_size: 64,
        };
        (flow, FlowHandle { to_relay, from_relay })
    }
}

#[async_trait]
impl PacketFlow for ChannelFlow {
    async fn read_packets(&self) -> io::Result<Vec<(Bytes, AddressFamily)>> {
        let mut inbound = self.inbound.lock().await;
        let first = inbound
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "interface closed"))?;

        let mut batch = vec![first];
        while batch.len() < self.batch_size {
            match inbound.try_recv() {
                Ok(item) => batch.push(item),
                Err(_) => break,
            }
        }
        Ok(batch)
    }

    async fn write_packet(&self, frame: Bytes, family: AddressFamily) -> io::Result<()> {
        self.outbound
            .send((frame, family))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "interface closed"))
    }
}

/// What [`PacketDispatcher::dispatch`] did with a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Tcp,
    Udp,
    /// Well-formed, but not a protocol the relay handles
    Ignored,
    /// Malformed and dropped
    Invalid,
}

pub struct PacketDispatcher {
    tcp: Arc<TcpRelay>,
    udp: Arc<UdpRelay>,
    stats: Arc<RelayStats>,
}

impl PacketDispatcher {
    pub fn new(tcp: Arc<TcpRelay>, udp: Arc<UdpRelay>, stats: Arc<RelayStats>) -> Self {
        Self { tcp, udp, stats }
    }

    /// Classify one IPv4 frame and hand it to its relay
    pub fn dispatch(&self, frame: &Bytes) -> Dispatched {
        self.stats.record_received(frame.len());

        let ip = match parse_ipv4(frame) {
            Ok(ip) => ip,
            Err(e) => {
                trace!("Dropping malformed frame: {}", e);
                self.stats.record_invalid();
                return Dispatched::Invalid;
            }
        };

        match ip.protocol {
            IPPROTO_TCP => match parse_tcp(ip.payload) {
                Ok(tcp) => {
                    self.tcp.process(InboundSegment {
                        src_addr: ip.src_addr,
                        dst_addr: ip.dst_addr,
                        src_port: tcp.src_port,
                        dst_port: tcp.dst_port,
                        seq: tcp.seq,
                        ack: tcp.ack,
                        flags: tcp.flags,
                        payload: frame.slice_ref(tcp.payload),
                    });
                    Dispatched::Tcp
                }
                Err(e) => {
                    trace!("Dropping malformed TCP segment: {}", e);
                    self.stats.record_invalid();
                    Dispatched::Invalid
                }
            },
            IPPROTO_UDP => match parse_udp(ip.payload) {
                Ok(udp) => {
                    self.udp.process(InboundDatagram {
                        src_addr: ip.src_addr,
                        dst_addr: ip.dst_addr,
                        src_port: udp.src_port,
                        dst_port: udp.dst_port,
                        payload: frame.slice_ref(udp.payload),
                    });
                    Dispatched::Udp
                }
                Err(e) => {
                    trace!("Dropping malformed UDP datagram: {}", e);
                    self.stats.record_invalid();
                    Dispatched::Invalid
                }
            },
            other => {
                trace!("Ignoring IP protocol {}", other);
                self.stats.record_ignored();
                Dispatched::Ignored
            }
        }
    }

    /// Pump frames between `flow` and the relays until cancelled.
    ///
    /// Reading and writing run concurrently; routing never waits on a relay.
    pub async fn run<F>(&self, flow: &F, mut frames: FrameReceiver, cancel: CancellationToken)
    where
        F: PacketFlow + ?Sized,
    {
        let reader = async {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    batch = flow.read_packets() => match batch {
                        Ok(batch) => {
                            for (frame, family) in batch {
                                if family == AddressFamily::Inet {
                                    self.dispatch(&frame);
                                } else {
                                    self.stats.record_ignored();
                                }
                            }
                        }
                        Err(e) if is_transient(&e) => {
                            debug!("Interface read interrupted, retrying: {}", e);
                        }
                        Err(e) => {
                            error!("Interface read failed: {}", e);
                            break;
                        }
                    },
                }
            }
            debug!("Dispatcher reader stopped");
        };

        let writer = async {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = frames.recv() => {
                        let Some(frame) = frame else {
                            break;
                        };
                        let len = frame.len();
                        match flow.write_packet(frame, AddressFamily::Inet).await {
                            Ok(()) => self.stats.record_sent(len),
                            Err(e) => warn!("Interface write failed: {}", e),
                        }
                    }
                }
            }
            debug!("Dispatcher writer stopped");
        };

        tokio::join!(reader, writer);
    }
}

/// Read errors after which the interface is still usable
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
