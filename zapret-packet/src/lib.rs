//! zapret-packet - IPv4 frame codec for the zapret relay
//!
//! Pure, allocation-bounded parsing and building of the raw frames that cross
//! the virtual interface, plus the handshake signature detectors the relay
//! uses to decide when to apply DPI evasion.
//!
//! # Overview
//!
//! - [`parse_ipv4`], [`parse_tcp`], [`parse_udp`] return borrowed views and
//!   report malformed input as [`PacketError`], never by panicking
//! - [`build_ipv4_tcp`], [`build_ipv4_udp`] produce complete frames with
//!   valid IPv4 and L4 checksums
//! - [`is_tls_client_hello`], [`is_quic_initial`] classify first payloads
//!
//! IPv6 is not handled: frames with any version other than 4 are rejected.
//!
//! ```rust
//! use std::net::Ipv4Addr;
//! use zapret_packet::{build_ipv4_tcp, parse_ipv4, parse_tcp, TcpFlags};
//!
//! let frame = build_ipv4_tcp(
//!     Ipv4Addr::new(1, 2, 3, 4),
//!     Ipv4Addr::new(10, 120, 0, 1),
//!     443,
//!     40001,
//!     0x1000,
//!     1001,
//!     TcpFlags::syn_ack(),
//!     32768,
//!     &[],
//! )
//! .unwrap();
//!
//! let ip = parse_ipv4(&frame).unwrap();
//! let tcp = parse_tcp(ip.payload).unwrap();
//! assert!(tcp.flags.syn && tcp.flags.ack);
//! assert_eq!(tcp.ack, 1001);
//! ```

pub mod detect;
pub mod error;
pub mod packet;

#[cfg(test)]
mod tests;

pub use detect::{is_quic_initial, is_tls_client_hello, QUIC_V1, QUIC_V2};
pub use error::{PacketError, Result};
pub use packet::{
    build_ipv4_tcp, build_ipv4_udp, parse_ipv4, parse_tcp, parse_udp, Ipv4View, TcpFlags,
    TcpSegment, UdpDatagram, DEFAULT_TTL, IPPROTO_TCP, IPPROTO_UDP, MAX_FRAME_LEN,
};
