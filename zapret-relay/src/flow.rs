//! Flow keys identifying relay sessions

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Identifies one relay session.
///
/// The source address is not part of the key: every captured frame comes from
/// the single local device behind the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_port: u16,
    pub dst_addr: Ipv4Addr,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn new(src_port: u16, dst_addr: Ipv4Addr, dst_port: u16) -> Self {
        Self { src_port, dst_addr, dst_port }
    }

    /// Real destination this flow is relayed to
    pub fn destination(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.dst_addr, self.dst_port)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{} -> {}:{}", self.src_port, self.dst_addr, self.dst_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_key_identity() {
        let a = FlowKey::new(40001, Ipv4Addr::new(1, 2, 3, 4), 443);
        let b = FlowKey::new(40001, Ipv4Addr::new(1, 2, 3, 4), 443);
        let c = FlowKey::new(40002, Ipv4Addr::new(1, 2, 3, 4), 443);

        let mut map = HashMap::new();
        map.insert(a, 1);
        assert_eq!(map.get(&b), Some(&1));
        assert!(map.get(&c).is_none());
    }

    #[test]
    fn test_display_and_destination() {
        let key = FlowKey::new(40001, Ipv4Addr::new(1, 2, 3, 4), 443);
        assert_eq!(key.to_string(), ":40001 -> 1.2.3.4:443");
        assert_eq!(key.destination(), "1.2.3.4:443".parse().unwrap());
    }
}
