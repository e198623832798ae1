//! Protocol signature detectors
//!
//! Both detectors inspect a fixed-size prefix of the payload and never parse
//! the full record.

/// TLS record content type for handshake messages
pub const TLS_HANDSHAKE: u8 = 0x16;
/// TLS handshake message type for ClientHello
pub const TLS_CLIENT_HELLO: u8 = 0x01;

/// QUIC version 1 (RFC 9000)
pub const QUIC_V1: u32 = 0x0000_0001;
/// QUIC version 2 (RFC 9369)
pub const QUIC_V2: u32 = 0x6b33_43cf;

/// Returns true when `payload` starts a TLS handshake record carrying a ClientHello.
///
/// Layout: `[0]` content type, `[1..3]` legacy version, `[3..5]` record
/// length, `[5]` handshake type.
pub fn is_tls_client_hello(payload: &[u8]) -> bool {
    payload.len() >= 6 && payload[0] == TLS_HANDSHAKE && payload[5] == TLS_CLIENT_HELLO
}

/// Returns true when `payload` is a QUIC long-header packet for version 1 or 2.
pub fn is_quic_initial(payload: &[u8]) -> bool {
    if payload.len() < 5 || payload[0] & 0x80 == 0 {
        return false;
    }
    let version = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
    version == QUIC_V1 || version == QUIC_V2
}
