//! zapret-relay - user-space IPv4 relay with DPI evasion
//!
//! The data plane of a censorship-circumvention VPN client. Frames captured on
//! a virtual interface are relayed to their real destinations over protected
//! sockets, and the first handshake of each flow is reshaped so that
//! signature-matching middleboxes miss it.
//!
//! # Features
//!
//! - Synthetic TCP toward the captured application: optimistic SYN-ACK,
//!   immediate ACKs, mirrored FIN/RST, idle reset after 300s
//! - TLS ClientHello split at a configurable offset, optionally delivered out
//!   of order
//! - QUIC Initial decoy bursts at low TTL ahead of the real datagram
//! - One actor task per relay; no shared session maps
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                   Virtual interface (PacketFlow)            |
//! +-------------------------------------------------------------+
//!                   |  frames in            ^  frames out
//!                   v                       |
//! +-------------------------------------------------------------+
//! |                   PacketDispatcher                          |
//! |        parse IPv4 -> route by protocol / write back         |
//! +-------------------------------------------------------------+
//!            |                                   |
//!            v                                   v
//! +----------------------+            +----------------------+
//! | TcpRelay (actor)     |            | UdpRelay (actor)     |
//! | sessions: FlowKey -> |            | sessions: FlowKey -> |
//! |   TcpSession + task  |            |   UdpSession + task  |
//! +----------------------+            +----------------------+
//!            |                                   |
//!            v                                   v
//! +-------------------------------------------------------------+
//! |              Egress (protected real-network sockets)        |
//! +-------------------------------------------------------------+
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use zapret_relay::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> zapret_relay::Result<()> {
//!     let (flow, handle) = ChannelFlow::pair(4096);
//!     let egress = DirectEgress::new(SocketProtector::new(|fd| vpn_protect(fd)));
//!     let config = RelayConfig::builder().use_disorder(true).build()?;
//!
//!     let engine = RelayEngine::new(Arc::new(flow), Arc::new(egress), Arc::new(config));
//!     engine.start().await?;
//!
//!     // Feed captured frames into handle.to_relay, write handle.from_relay
//!     // back to the interface.
//!
//!     engine.handle_command("restart").await?;
//!     engine.stop().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatcher;
pub mod egress;
pub mod engine;
pub mod error;
pub mod flow;
pub mod logging;
pub mod protect;
pub mod stats;
pub mod tcp;
pub mod udp;


// Re-exports for convenience
pub use config::{
    ConfigSource, DpiConfig, LogLevel, RelayConfig, RelayConfigBuilder, TcpRelayConfig,
    UdpRelayConfig,
};
pub use dispatcher::{
    AddressFamily, ChannelFlow, Dispatched, FlowHandle, FrameReceiver, FrameSender,
    PacketDispatcher, PacketFlow,
};
pub use egress::{DirectEgress, Egress, RealDatagram, RealStream};
pub use engine::{RelayEngine, RESTART_COMMAND};
pub use error::{RelayError, Result};
pub use flow::FlowKey;
pub use logging::init_logging;
pub use protect::{ProtectCallback, SocketProtector};
pub use stats::{RelayStats, StatsSnapshot};
pub use tcp::{InboundSegment, TcpRelay, TcpSequencer, TcpState};
pub use udp::{InboundDatagram, UdpRelay};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::config::{ConfigSource, DpiConfig, RelayConfig};
    pub use crate::dispatcher::{AddressFamily, ChannelFlow, PacketFlow};
    pub use crate::egress::{DirectEgress, Egress};
    pub use crate::engine::RelayEngine;
    pub use crate::error::{RelayError, Result};
    pub use crate::protect::SocketProtector;
}
