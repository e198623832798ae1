//! Property-based tests for the frame codec
//!
//! - Parsing arbitrary bytes never panics
//! - Frames built by the codec parse back to the fields they were built from
//! - Detectors agree with their byte-level definitions

use crate::detect::{is_quic_initial, is_tls_client_hello, QUIC_V1, QUIC_V2};
use crate::packet::*;
use proptest::prelude::*;
use std::net::Ipv4Addr;

fn ipv4_strategy() -> impl Strategy<Value = Ipv4Addr> {
    any::<[u8; 4]>().prop_map(Ipv4Addr::from)
}

fn flags_strategy() -> impl Strategy<Value = TcpFlags> {
    (0u8..0x20).prop_map(TcpFlags::from_byte)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Malformed input is reported, never a panic
    #[test]
    fn prop_parse_never_panics(data in prop::collection::vec(any::<u8>(), 0..128)) {
        if let Ok(ip) = parse_ipv4(&data) {
            prop_assert!(ip.payload.len() <= data.len());
            let _ = parse_tcp(ip.payload);
            let _ = parse_udp(ip.payload);
        }
        let _ = parse_tcp(&data);
        let _ = parse_udp(&data);
    }

    /// A built TCP frame parses back to the same fields
    #[test]
    fn prop_tcp_frame_fields_survive(
        src in ipv4_strategy(),
        dst in ipv4_strategy(),
        sport in any::<u16>(),
        dport in any::<u16>(),
        seq in any::<u32>(),
        ack in any::<u32>(),
        flags in flags_strategy(),
        window in any::<u16>(),
        payload in prop::collection::vec(any::<u8>(), 0..1500),
    ) {
        let frame = build_ipv4_tcp(src, dst, sport, dport, seq, ack, flags, window, &payload).unwrap();
        prop_assert_eq!(frame.len(), 40 + payload.len());

        let ip = parse_ipv4(&frame).unwrap();
        prop_assert_eq!(ip.protocol, IPPROTO_TCP);
        prop_assert_eq!(ip.src_addr, src);
        prop_assert_eq!(ip.dst_addr, dst);

        let tcp = parse_tcp(ip.payload).unwrap();
        prop_assert_eq!(tcp.src_port, sport);
        prop_assert_eq!(tcp.dst_port, dport);
        prop_assert_eq!(tcp.seq, seq);
        prop_assert_eq!(tcp.ack, ack);
        prop_assert_eq!(tcp.flags, flags);
        prop_assert_eq!(tcp.window, window);
        prop_assert_eq!(tcp.payload, &payload[..]);
    }

    /// A built UDP frame parses back to the same fields
    #[test]
    fn prop_udp_frame_fields_survive(
        src in ipv4_strategy(),
        dst in ipv4_strategy(),
        sport in any::<u16>(),
        dport in any::<u16>(),
        payload in prop::collection::vec(any::<u8>(), 0..1500),
    ) {
        let frame = build_ipv4_udp(src, dst, sport, dport, &payload).unwrap();
        let ip = parse_ipv4(&frame).unwrap();
        prop_assert_eq!(ip.protocol, IPPROTO_UDP);
        let udp = parse_udp(ip.payload).unwrap();
        prop_assert_eq!(udp.src_port, sport);
        prop_assert_eq!(udp.dst_port, dport);
        prop_assert_eq!(udp.payload, &payload[..]);
        // Zero is reserved for "no checksum"
        prop_assert_ne!(&frame[26..28], &[0u8, 0u8]);
    }

    #[test]
    fn prop_client_hello_detector(data in prop::collection::vec(any::<u8>(), 0..16)) {
        let expected = data.len() >= 6 && data[0] == 0x16 && data[5] == 0x01;
        prop_assert_eq!(is_tls_client_hello(&data), expected);
    }

    #[test]
    fn prop_quic_detector(first in any::<u8>(), use_v2 in any::<bool>(), tail in prop::collection::vec(any::<u8>(), 0..16)) {
        let version = if use_v2 { QUIC_V2 } else { QUIC_V1 };
        let mut data = vec![first];
        data.extend_from_slice(&version.to_be_bytes());
        data.extend_from_slice(&tail);
        prop_assert_eq!(is_quic_initial(&data), first & 0x80 != 0);
    }
}
