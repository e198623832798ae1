//! Relay configuration
//!
//! [`DpiConfig`] is the persisted evasion settings value object; it is loaded
//! by the embedding application and handed to the relay through a
//! [`ConfigSource`]. [`RelayConfig`] wraps it together with the tunnel-side
//! addressing and per-protocol tuning that a platform shell rarely changes.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

pub const DEFAULT_FAKE_TTL: u8 = 3;
pub const DEFAULT_FAKE_REPEATS: u32 = 6;
pub const DEFAULT_SPLIT_POSITION: usize = 1;
pub const DEFAULT_DISORDER_TTL: u8 = 1;

/// Local tunnel address used as source/destination of synthesized frames
pub const DEFAULT_TUNNEL_ADDRESS: Ipv4Addr = Ipv4Addr::new(10, 120, 0, 1);

pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Silent,
}

impl LogLevel {
    /// Filter directive value, `None` for [`LogLevel::Silent`]
    pub fn as_directive(&self) -> Option<&'static str> {
        match self {
            LogLevel::Trace => Some("trace"),
            LogLevel::Debug => Some("debug"),
            LogLevel::Info => Some("info"),
            LogLevel::Warning => Some("warn"),
            LogLevel::Error => Some("error"),
            LogLevel::Silent => None,
        }
    }
}

/// DPI evasion settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DpiConfig {
    /// Decoy sent ahead of a QUIC Initial; `None` disables decoy injection
    pub fake_payload: Option<Vec<u8>>,
    /// TTL of decoy datagrams
    pub fake_ttl: u8,
    /// Number of decoy datagrams per burst
    pub fake_repeats: u32,
    /// Byte offset at which the first TLS ClientHello is split
    pub split_position: usize,
    /// Deliver the second ClientHello fragment before the first
    pub use_disorder: bool,
    /// TTL of the first fragment when disorder is enabled
    pub disorder_ttl: u8,
}

impl Default for DpiConfig {
    fn default() -> Self {
        Self {
            fake_payload: None,
            fake_ttl: DEFAULT_FAKE_TTL,
            fake_repeats: DEFAULT_FAKE_REPEATS,
            split_position: DEFAULT_SPLIT_POSITION,
            use_disorder: false,
            disorder_ttl: DEFAULT_DISORDER_TTL,
        }
    }
}

impl DpiConfig {
    /// Apply the fallbacks used for persisted settings: zero means "unset".
    pub fn normalized(mut self) -> Self {
        if self.split_position == 0 {
            self.split_position = DEFAULT_SPLIT_POSITION;
        }
        if self.fake_ttl == 0 {
            self.fake_ttl = DEFAULT_FAKE_TTL;
        }
        if self.fake_repeats == 0 {
            self.fake_repeats = DEFAULT_FAKE_REPEATS;
        }
        if self.disorder_ttl == 0 {
            self.disorder_ttl = DEFAULT_DISORDER_TTL;
        }
        if self.fake_payload.as_ref().is_some_and(|p| p.is_empty()) {
            self.fake_payload = None;
        }
        self
    }
}

/// TCP relay tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpRelayConfig {
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_sessions: usize,
    /// Receive window advertised in synthesized segments
    pub window: u16,
    /// Largest payload carried by one synthesized segment
    pub mss: usize,
    /// Read buffer for the real connection
    pub read_buffer: usize,
}

impl Default for TcpRelayConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(30),
            max_sessions: 2048,
            window: 32768,
            mss: 1360,
            read_buffer: 65536,
        }
    }
}

/// UDP relay tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpRelayConfig {
    pub idle_timeout: Duration,
    pub max_sessions: usize,
    pub recv_buffer: usize,
}

impl Default for UdpRelayConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(120),
            max_sessions: 4096,
            recv_buffer: 65536,
        }
    }
}

/// Complete relay configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub dpi: DpiConfig,
    pub tunnel_address: Ipv4Addr,
    pub cleanup_interval: Duration,
    pub tcp: TcpRelayConfig,
    pub udp: UdpRelayConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            dpi: DpiConfig::default(),
            tunnel_address: DEFAULT_TUNNEL_ADDRESS,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            tcp: TcpRelayConfig::default(),
            udp: UdpRelayConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.dpi.fake_ttl == 0 || self.dpi.fake_ttl >= zapret_packet::DEFAULT_TTL {
            return Err(RelayError::config(format!(
                "fake_ttl must be in 1..{}, got {}",
                zapret_packet::DEFAULT_TTL,
                self.dpi.fake_ttl
            )));
        }
        if self.dpi.disorder_ttl == 0 || self.dpi.disorder_ttl >= zapret_packet::DEFAULT_TTL {
            return Err(RelayError::config(format!(
                "disorder_ttl must be in 1..{}, got {}",
                zapret_packet::DEFAULT_TTL,
                self.dpi.disorder_ttl
            )));
        }
        if self.tcp.mss == 0 || self.tcp.window == 0 || self.tcp.read_buffer == 0 {
            return Err(RelayError::config("tcp mss, window and read buffer must be non-zero"));
        }
        if self.tcp.max_sessions == 0 || self.udp.max_sessions == 0 {
            return Err(RelayError::config("session limits must be non-zero"));
        }
        if self.udp.recv_buffer == 0 {
            return Err(RelayError::config("udp receive buffer must be non-zero"));
        }
        if self.tcp.idle_timeout.is_zero()
            || self.tcp.connect_timeout.is_zero()
            || self.udp.idle_timeout.is_zero()
            || self.cleanup_interval.is_zero()
        {
            return Err(RelayError::config("timeouts and cleanup interval must be non-zero"));
        }
        Ok(())
    }
}

/// Fluent builder for [`RelayConfig`]; `build` normalizes then validates.
#[derive(Debug, Default)]
pub struct RelayConfigBuilder {
    config: RelayConfig,
}

impl RelayConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dpi(mut self, dpi: DpiConfig) -> Self {
        self.config.dpi = dpi;
        self
    }

    pub fn fake_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.config.dpi.fake_payload = Some(payload.into());
        self
    }

    pub fn split_position(mut self, pos: usize) -> Self {
        self.config.dpi.split_position = pos;
        self
    }

    pub fn use_disorder(mut self, enabled: bool) -> Self {
        self.config.dpi.use_disorder = enabled;
        self
    }

    pub fn tunnel_address(mut self, addr: Ipv4Addr) -> Self {
        self.config.tunnel_address = addr;
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.config.cleanup_interval = interval;
        self
    }

    pub fn tcp_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.tcp.idle_timeout = timeout;
        self
    }

    pub fn tcp_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.tcp.connect_timeout = timeout;
        self
    }

    pub fn tcp_max_sessions(mut self, max: usize) -> Self {
        self.config.tcp.max_sessions = max;
        self
    }

    pub fn mss(mut self, mss: usize) -> Self {
        self.config.tcp.mss = mss;
        self
    }

    pub fn udp_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.udp.idle_timeout = timeout;
        self
    }

    pub fn udp_max_sessions(mut self, max: usize) -> Self {
        self.config.udp.max_sessions = max;
        self
    }

    pub fn build(mut self) -> Result<RelayConfig> {
        self.config.dpi = self.config.dpi.normalized();
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Supplies configuration each time the engine (re)starts
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> RelayConfig;
}

impl ConfigSource for RelayConfig {
    fn load(&self) -> RelayConfig {
        self.clone()
    }
}

impl<F> ConfigSource for F
where
    F: Fn() -> RelayConfig + Send + Sync,
{
    fn load(&self) -> RelayConfig {
        self()
    }
}
