//! Statistics tracking for the relay
//!
//! One [`RelayStats`] is shared by the dispatcher and both relays of an engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Relay-wide statistics
#[derive(Debug)]
pub struct RelayStats {
    start_time: Instant,

    // Interface side
    pub frames_received: AtomicU64,
    pub frames_sent: AtomicU64,
    pub frames_invalid: AtomicU64,
    pub frames_ignored: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,

    // Sessions
    pub tcp_sessions_total: AtomicU64,
    pub tcp_sessions_active: AtomicU64,
    pub tcp_sessions_rejected: AtomicU64,
    pub tcp_connect_failures: AtomicU64,
    pub udp_sessions_total: AtomicU64,
    pub udp_sessions_active: AtomicU64,
    pub udp_sessions_rejected: AtomicU64,

    // Evasion
    pub tls_splits: AtomicU64,
    pub quic_decoys: AtomicU64,

    // Real network side
    pub bytes_to_remote: AtomicU64,
    pub bytes_from_remote: AtomicU64,
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            frames_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_invalid: AtomicU64::new(0),
            frames_ignored: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            tcp_sessions_total: AtomicU64::new(0),
            tcp_sessions_active: AtomicU64::new(0),
            tcp_sessions_rejected: AtomicU64::new(0),
            tcp_connect_failures: AtomicU64::new(0),
            udp_sessions_total: AtomicU64::new(0),
            udp_sessions_active: AtomicU64::new(0),
            udp_sessions_rejected: AtomicU64::new(0),
            tls_splits: AtomicU64::new(0),
            quic_decoys: AtomicU64::new(0),
            bytes_to_remote: AtomicU64::new(0),
            bytes_from_remote: AtomicU64::new(0),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Frame read from the interface
    pub fn record_received(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Frame written to the interface
    pub fn record_sent(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_invalid(&self) {
        self.frames_invalid.fetch_add(1, Ordering::Relaxed);
    }

    /// Well-formed frame of a protocol the relay does not handle
    pub fn record_ignored(&self) {
        self.frames_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp_session(&self) {
        self.tcp_sessions_total.fetch_add(1, Ordering::Relaxed);
        self.tcp_sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp_closed(&self) {
        self.tcp_sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_tcp_rejected(&self) {
        self.tcp_sessions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_failure(&self) {
        self.tcp_connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp_session(&self) {
        self.udp_sessions_total.fetch_add(1, Ordering::Relaxed);
        self.udp_sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp_closed(&self) {
        self.udp_sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_udp_rejected(&self) {
        self.udp_sessions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tls_split(&self) {
        self.tls_splits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_quic_decoy(&self) {
        self.quic_decoys.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_to_remote(&self, bytes: usize) {
        self.bytes_to_remote.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_from_remote(&self, bytes: usize) {
        self.bytes_from_remote.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime: self.uptime(),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_invalid: self.frames_invalid.load(Ordering::Relaxed),
            frames_ignored: self.frames_ignored.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            tcp_sessions_total: self.tcp_sessions_total.load(Ordering::Relaxed),
            tcp_sessions_active: self.tcp_sessions_active.load(Ordering::Relaxed),
            tcp_sessions_rejected: self.tcp_sessions_rejected.load(Ordering::Relaxed),
            tcp_connect_failures: self.tcp_connect_failures.load(Ordering::Relaxed),
            udp_sessions_total: self.udp_sessions_total.load(Ordering::Relaxed),
            udp_sessions_active: self.udp_sessions_active.load(Ordering::Relaxed),
            udp_sessions_rejected: self.udp_sessions_rejected.load(Ordering::Relaxed),
            tls_splits: self.tls_splits.load(Ordering::Relaxed),
            quic_decoys: self.quic_decoys.load(Ordering::Relaxed),
            bytes_to_remote: self.bytes_to_remote.load(Ordering::Relaxed),
            bytes_from_remote: self.bytes_from_remote.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters except the active session gauges
    pub fn reset(&self) {
        self.frames_received.store(0, Ordering::Relaxed);
        self.frames_sent.store(0, Ordering::Relaxed);
        self.frames_invalid.store(0, Ordering::Relaxed);
        self.frames_ignored.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.tcp_sessions_total.store(0, Ordering::Relaxed);
        self.tcp_sessions_rejected.store(0, Ordering::Relaxed);
        self.tcp_connect_failures.store(0, Ordering::Relaxed);
        self.udp_sessions_total.store(0, Ordering::Relaxed);
        self.udp_sessions_rejected.store(0, Ordering::Relaxed);
        self.tls_splits.store(0, Ordering::Relaxed);
        self.quic_decoys.store(0, Ordering::Relaxed);
        self.bytes_to_remote.store(0, Ordering::Relaxed);
        self.bytes_from_remote.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of statistics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub uptime: Duration,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub frames_invalid: u64,
    pub frames_ignored: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub tcp_sessions_total: u64,
    pub tcp_sessions_active: u64,
    pub tcp_sessions_rejected: u64,
    pub tcp_connect_failures: u64,
    pub udp_sessions_total: u64,
    pub udp_sessions_active: u64,
    pub udp_sessions_rejected: u64,
    pub tls_splits: u64,
    pub quic_decoys: u64,
    pub bytes_to_remote: u64,
    pub bytes_from_remote: u64,
}

impl StatsSnapshot {
    pub fn active_sessions(&self) -> u64 {
        self.tcp_sessions_active + self.udp_sessions_active
    }
}
