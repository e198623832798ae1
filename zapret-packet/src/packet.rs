//! IPv4/TCP/UDP frame parsing and building using smoltcp wire types

use crate::error::{PacketError, Result};
use smoltcp::wire::{Ipv4Packet, TcpPacket, UdpPacket};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// TTL carried by every synthesized frame and restored on real sockets
pub const DEFAULT_TTL: u8 = 64;

pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

/// Largest frame expressible in the IPv4 total length field
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

static IP_ID: AtomicU16 = AtomicU16::new(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
}

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;

    pub fn syn_ack() -> Self {
        Self { syn: true, ack: true, ..Default::default() }
    }
    pub fn ack_only() -> Self {
        Self { ack: true, ..Default::default() }
    }
    pub fn fin_ack() -> Self {
        Self { fin: true, ack: true, ..Default::default() }
    }
    pub fn rst_ack() -> Self {
        Self { rst: true, ack: true, ..Default::default() }
    }
    pub fn rst_only() -> Self {
        Self { rst: true, ..Default::default() }
    }
    pub fn psh_ack() -> Self {
        Self { psh: true, ack: true, ..Default::default() }
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            fin: byte & Self::FIN != 0,
            syn: byte & Self::SYN != 0,
            rst: byte & Self::RST != 0,
            psh: byte & Self::PSH != 0,
            ack: byte & Self::ACK != 0,
        }
    }

    pub fn to_byte(&self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= Self::FIN; }
        if self.syn { flags |= Self::SYN; }
        if self.rst { flags |= Self::RST; }
        if self.psh { flags |= Self::PSH; }
        if self.ack { flags |= Self::ACK; }
        flags
    }

    /// Sequence space consumed by the control flags alone: SYN and FIN count one each.
    pub fn sequence_len(&self) -> u32 {
        u32::from(self.syn || self.fin)
    }
}

/// Borrowed view of an IPv4 frame
#[derive(Debug, Clone, Copy)]
pub struct Ipv4View<'a> {
    pub protocol: u8,
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub ttl: u8,
    /// L4 bytes, bounded by the header's total length
    pub payload: &'a [u8],
}

/// Borrowed view of a TCP segment
#[derive(Debug, Clone, Copy)]
pub struct TcpSegment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub payload: &'a [u8],
}

/// Borrowed view of a UDP datagram
#[derive(Debug, Clone, Copy)]
pub struct UdpDatagram<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

/// Parse an IPv4 frame
pub fn parse_ipv4(data: &[u8]) -> Result<Ipv4View<'_>> {
    if data.len() < IPV4_HEADER_LEN {
        return Err(PacketError::TooShort { expected: IPV4_HEADER_LEN, actual: data.len() });
    }

    let version = data[0] >> 4;
    if version != 4 {
        return Err(PacketError::InvalidVersion(version));
    }

    let ihl = ((data[0] & 0x0F) as usize) * 4;
    if ihl < IPV4_HEADER_LEN || ihl > data.len() {
        return Err(PacketError::InvalidHeaderLength(ihl));
    }

    let pkt = Ipv4Packet::new_checked(data)
        .map_err(|e| PacketError::Malformed(format!("IPv4: {}", e)))?;

    Ok(Ipv4View {
        protocol: pkt.next_header().into(),
        src_addr: pkt.src_addr(),
        dst_addr: pkt.dst_addr(),
        ttl: pkt.hop_limit(),
        payload: pkt.payload(),
    })
}

/// Parse a TCP segment (the L4 bytes of an IPv4 frame)
pub fn parse_tcp(data: &[u8]) -> Result<TcpSegment<'_>> {
    if data.len() < TCP_HEADER_LEN {
        return Err(PacketError::TooShort { expected: TCP_HEADER_LEN, actual: data.len() });
    }

    let pkt = TcpPacket::new_checked(data)
        .map_err(|e| PacketError::Malformed(format!("TCP: {}", e)))?;
    let header_len = pkt.header_len() as usize;

    Ok(TcpSegment {
        src_port: pkt.src_port(),
        dst_port: pkt.dst_port(),
        seq: pkt.seq_number().0 as u32,
        ack: pkt.ack_number().0 as u32,
        flags: TcpFlags {
            fin: pkt.fin(),
            syn: pkt.syn(),
            rst: pkt.rst(),
            psh: pkt.psh(),
            ack: pkt.ack(),
        },
        window: pkt.window_len(),
        payload: &data[header_len..],
    })
}

/// Parse a UDP datagram (the L4 bytes of an IPv4 frame)
pub fn parse_udp(data: &[u8]) -> Result<UdpDatagram<'_>> {
    if data.len() < UDP_HEADER_LEN {
        return Err(PacketError::TooShort { expected: UDP_HEADER_LEN, actual: data.len() });
    }

    let pkt = UdpPacket::new_checked(data)
        .map_err(|e| PacketError::Malformed(format!("UDP: {}", e)))?;
    let len = pkt.len() as usize;

    Ok(UdpDatagram {
        src_port: pkt.src_port(),
        dst_port: pkt.dst_port(),
        payload: &data[UDP_HEADER_LEN..len],
    })
}

/// Build an IPv4+TCP frame.
///
/// Fails only when the frame would not fit the IPv4 total length field.
#[allow(clippy::too_many_arguments)]
pub fn build_ipv4_tcp(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let total_len = IPV4_HEADER_LEN + TCP_HEADER_LEN + payload.len();
    if total_len > MAX_FRAME_LEN {
        return Err(PacketError::PayloadTooLarge(payload.len()));
    }

    let mut pkt = vec![0u8; total_len];
    write_ipv4_header(&mut pkt, IPPROTO_TCP, src_ip, dst_ip);

    let tcp = &mut pkt[IPV4_HEADER_LEN..];
    tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
    tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&ack.to_be_bytes());
    tcp[12] = ((TCP_HEADER_LEN / 4) as u8) << 4;
    tcp[13] = flags.to_byte();
    tcp[14..16].copy_from_slice(&window.to_be_bytes());
    tcp[TCP_HEADER_LEN..].copy_from_slice(payload);

    let cksum = transport_checksum(src_ip, dst_ip, IPPROTO_TCP, tcp);
    tcp[16..18].copy_from_slice(&cksum.to_be_bytes());

    Ok(pkt)
}

/// Build an IPv4+UDP frame
pub fn build_ipv4_udp(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let total_len = IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len();
    if total_len > MAX_FRAME_LEN {
        return Err(PacketError::PayloadTooLarge(payload.len()));
    }

    let mut pkt = vec![0u8; total_len];
    write_ipv4_header(&mut pkt, IPPROTO_UDP, src_ip, dst_ip);

    let udp = &mut pkt[IPV4_HEADER_LEN..];
    let udp_len = (UDP_HEADER_LEN + payload.len()) as u16;
    udp[0..2].copy_from_slice(&src_port.to_be_bytes());
    udp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    udp[4..6].copy_from_slice(&udp_len.to_be_bytes());
    udp[UDP_HEADER_LEN..].copy_from_slice(payload);

    // A zero UDP checksum means "no checksum"; a computed zero is sent as all ones.
    let cksum = match transport_checksum(src_ip, dst_ip, IPPROTO_UDP, udp) {
        0 => 0xFFFF,
        c => c,
    };
    udp[6..8].copy_from_slice(&cksum.to_be_bytes());

    Ok(pkt)
}

fn write_ipv4_header(pkt: &mut [u8], protocol: u8, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) {
    let total_len = pkt.len() as u16;
    pkt[0] = 0x45;
    pkt[1] = 0x00;
    pkt[2..4].copy_from_slice(&total_len.to_be_bytes());

    let ip_id = IP_ID.fetch_add(1, Ordering::Relaxed);
    pkt[4..6].copy_from_slice(&ip_id.to_be_bytes());

    // Don't fragment
    pkt[6..8].copy_from_slice(&0x4000u16.to_be_bytes());
    pkt[8] = DEFAULT_TTL;
    pkt[9] = protocol;
    pkt[12..16].copy_from_slice(&src_ip.octets());
    pkt[16..20].copy_from_slice(&dst_ip.octets());

    let cksum = fold(sum_words(0, &pkt[..IPV4_HEADER_LEN]));
    pkt[10..12].copy_from_slice(&cksum.to_be_bytes());
}

fn transport_checksum(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, data: &[u8]) -> u16 {
    let mut sum = sum_words(0, &src.octets());
    sum = sum_words(sum, &dst.octets());
    sum = sum.wrapping_add(proto as u32);
    sum = sum.wrapping_add(data.len() as u32);
    fold(sum_words(sum, data))
}

fn sum_words(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}
