//! UDP relay
//!
//! One connected socket per flow, created on the first datagram. When a decoy
//! payload is configured, every QUIC Initial is preceded by a burst of
//! low-TTL decoys that expire before reaching the destination.

use crate::config::RelayConfig;
use crate::dispatcher::FrameSender;
use crate::egress::{Egress, RealDatagram};
use crate::flow::FlowKey;
use crate::stats::RelayStats;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use zapret_packet::{build_ipv4_udp, is_quic_initial, DEFAULT_TTL};

/// UDP datagram captured from the interface
#[derive(Debug, Clone)]
pub struct InboundDatagram {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Bytes,
}

impl InboundDatagram {
    pub fn flow_key(&self) -> FlowKey {
        FlowKey::new(self.src_port, self.dst_addr, self.dst_port)
    }
}

/// Send operation queued for the real socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DatagramOp {
    Forward(Bytes),
    /// `repeats` copies of `decoy` at `ttl`, then `payload` at the default TTL
    Decoy { payload: Bytes, decoy: Bytes, ttl: u8, repeats: u32 },
}

pub(crate) struct UdpSession {
    key: FlowKey,
    id: u64,
    last_activity: Instant,
    ops: mpsc::UnboundedSender<DatagramOp>,
    task: Option<JoinHandle<()>>,
}

impl UdpSession {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }
}

pub(crate) enum UdpCommand {
    Datagram(InboundDatagram),
    Received { key: FlowKey, id: u64, data: Bytes },
    Closed { key: FlowKey, id: u64 },
    Sweep,
    SessionCount(oneshot::Sender<usize>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running UDP relay
pub struct UdpRelay {
    tx: mpsc::UnboundedSender<UdpCommand>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpRelay {
    /// Spawn the relay on the current tokio runtime
    pub fn spawn(
        config: Arc<RelayConfig>,
        egress: Arc<dyn Egress>,
        frames: FrameSender,
        stats: Arc<RelayStats>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = UdpRelayActor {
            decoy: config.dpi.fake_payload.clone().map(Bytes::from),
            config,
            egress,
            frames,
            stats,
            events: tx.downgrade(),
            sessions: HashMap::new(),
            next_id: 0,
        };
        let task = tokio::spawn(actor.run(rx));
        Self { tx, task: Mutex::new(Some(task)) }
    }

    /// Queue a captured datagram. Never blocks.
    pub fn process(&self, datagram: InboundDatagram) {
        if self.tx.send(UdpCommand::Datagram(datagram)).is_err() {
            trace!("UDP relay stopped, dropping datagram");
        }
    }

    /// Queue an idle sweep
    pub fn sweep(&self) {
        let _ = self.tx.send(UdpCommand::Sweep);
    }

    /// Number of live sessions; zero once destroyed
    pub async fn session_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(UdpCommand::SessionCount(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Close every session and stop the relay.
    ///
    /// Returns once every socket is closed and no receive task is left
    /// running. Later calls return immediately.
    pub async fn destroy(&self) {
        let Some(task) = self.task.lock().take() else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(UdpCommand::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        let _ = task.await;
    }
}

impl Drop for UdpRelay {
    fn drop(&mut self) {
        if self.task.lock().is_some() {
            let (ack_tx, _) = oneshot::channel();
            let _ = self.tx.send(UdpCommand::Shutdown(ack_tx));
        }
    }
}

struct UdpRelayActor {
    config: Arc<RelayConfig>,
    egress: Arc<dyn Egress>,
    frames: FrameSender,
    stats: Arc<RelayStats>,
    decoy: Option<Bytes>,
    events: mpsc::WeakUnboundedSender<UdpCommand>,
    sessions: HashMap<FlowKey, UdpSession>,
    next_id: u64,
}

impl UdpRelayActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<UdpCommand>) {
        debug!("UDP relay started");
        while let Some(cmd) = rx.recv().await {
            match cmd {
                UdpCommand::Datagram(datagram) => self.on_datagram(datagram),
                UdpCommand::Received { key, id, data } => self.on_received(key, id, data),
                UdpCommand::Closed { key, id } => self.on_closed(key, id).await,
                UdpCommand::Sweep => self.sweep().await,
                UdpCommand::SessionCount(reply) => {
                    let _ = reply.send(self.sessions.len());
                }
                UdpCommand::Shutdown(ack) => {
                    self.close_all().await;
                    let _ = ack.send(());
                    break;
                }
            }
        }
        self.close_all().await;
        debug!("UDP relay stopped");
    }

    fn on_datagram(&mut self, datagram: InboundDatagram) {
        let key = datagram.flow_key();

        if !self.sessions.contains_key(&key) && !self.open_session(key) {
            return;
        }
        let Some(session) = self.sessions.get_mut(&key) else {
            return;
        };
        session.touch();

        let payload = datagram.payload;
        self.stats.record_to_remote(payload.len());
        let op = match &self.decoy {
            Some(decoy) if is_quic_initial(&payload) => {
                self.stats.record_quic_decoy();
                debug!(
                    "QUIC Initial on {}, sending {} decoys at TTL {}",
                    key, self.config.dpi.fake_repeats, self.config.dpi.fake_ttl
                );
                DatagramOp::Decoy {
                    payload,
                    decoy: decoy.clone(),
                    ttl: self.config.dpi.fake_ttl,
                    repeats: self.config.dpi.fake_repeats,
                }
            }
            _ => DatagramOp::Forward(payload),
        };
        let _ = session.ops.send(op);
    }

    /// Open a socket for `key`; the triggering datagram is dropped on failure.
    fn open_session(&mut self, key: FlowKey) -> bool {
        if self.sessions.len() >= self.config.udp.max_sessions {
            warn!(
                "UDP session limit ({}) reached, dropping datagram for {}",
                self.config.udp.max_sessions, key
            );
            self.stats.record_udp_rejected();
            return false;
        }

        let socket = match self.egress.open_datagram(key.destination()) {
            Ok(socket) => socket,
            Err(e) => {
                debug!("UDP socket for {} failed: {}", key, e);
                return false;
            }
        };
        let Some(events) = self.events.upgrade() else {
            return false;
        };

        self.next_id += 1;
        let id = self.next_id;
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let task = DatagramTask {
            key,
            id,
            socket,
            recv_buffer: self.config.udp.recv_buffer,
            events,
            ops: ops_rx,
        };

        self.sessions.insert(
            key,
            UdpSession {
                key,
                id,
                last_activity: Instant::now(),
                ops: ops_tx,
                task: Some(tokio::spawn(task.run())),
            },
        );
        self.stats.record_udp_session();
        debug!("UDP session {} created ({} active)", key, self.sessions.len());
        true
    }

    fn on_received(&mut self, key: FlowKey, id: u64, data: Bytes) {
        let Some(session) = self.sessions.get_mut(&key).filter(|s| s.id == id) else {
            return;
        };
        session.touch();
        self.stats.record_from_remote(data.len());

        let tunnel = self.config.tunnel_address;
        match build_ipv4_udp(key.dst_addr, tunnel, key.dst_port, key.src_port, &data) {
            Ok(frame) => {
                if self.frames.send(Bytes::from(frame)).is_err() {
                    trace!("Interface writer gone, frame for {} dropped", key);
                }
            }
            Err(e) => debug!("Discarding frame for {}: {}", key, e),
        }
    }

    async fn on_closed(&mut self, key: FlowKey, id: u64) {
        if !self.sessions.get(&key).is_some_and(|s| s.id == id) {
            return;
        }
        if let Some(session) = self.sessions.remove(&key) {
            self.close_session(session).await;
        }
    }

    async fn sweep(&mut self) {
        let now = Instant::now();
        let timeout = self.config.udp.idle_timeout;
        let expired: Vec<FlowKey> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_idle(now, timeout))
            .map(|(k, _)| *k)
            .collect();

        for key in &expired {
            if let Some(session) = self.sessions.remove(key) {
                self.close_session(session).await;
            }
        }

        if !expired.is_empty() {
            info!("Swept {} idle UDP sessions, {} remain", expired.len(), self.sessions.len());
        }
    }

    async fn close_session(&self, mut session: UdpSession) {
        if let Some(task) = session.task.take() {
            task.abort();
            let _ = task.await;
        }
        self.stats.record_udp_closed();
        debug!("UDP session {} closed", session.key);
    }

    async fn close_all(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        let count = self.sessions.len();
        for (_, session) in std::mem::take(&mut self.sessions) {
            self.close_session(session).await;
        }
        info!("Closed {} UDP sessions", count);
    }
}

/// Per-session I/O: owns the socket, sends queued datagrams, forwards replies.
struct DatagramTask {
    key: FlowKey,
    id: u64,
    socket: Box<dyn RealDatagram>,
    recv_buffer: usize,
    events: mpsc::UnboundedSender<UdpCommand>,
    ops: mpsc::UnboundedReceiver<DatagramOp>,
}

impl DatagramTask {
    async fn run(mut self) {
        let (key, id) = (self.key, self.id);
        let mut buf = vec![0u8; self.recv_buffer];

        loop {
            tokio::select! {
                op = self.ops.recv() => {
                    let Some(op) = op else {
                        return;
                    };
                    if let Err(e) = send_op(self.socket.as_ref(), op).await {
                        debug!("UDP send for {} failed: {}", key, e);
                    }
                }
                received = self.socket.recv(&mut buf) => {
                    match received {
                        Ok(n) => {
                            let data = Bytes::copy_from_slice(&buf[..n]);
                            if self.events.send(UdpCommand::Received { key, id, data }).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            debug!("UDP receive for {} failed: {}", key, e);
                            let _ = self.events.send(UdpCommand::Closed { key, id });
                            return;
                        }
                    }
                }
            }
        }
    }
}

pub(crate) async fn send_op(socket: &dyn RealDatagram, op: DatagramOp) -> io::Result<()> {
    match op {
        DatagramOp::Forward(payload) => socket.send(&payload).await.map(|_| ()),
        DatagramOp::Decoy { payload, decoy, ttl, repeats } => {
            // Decoys are best-effort; the original always goes out
            match socket.set_ttl(u32::from(ttl)) {
                Ok(()) => {
                    let burst = async {
                        for _ in 0..repeats {
                            socket.send(&decoy).await?;
                        }
                        Ok::<_, io::Error>(())
                    }
                    .await;
                    if let Err(e) = burst {
                        debug!("Decoy burst interrupted: {}", e);
                    }
                }
                Err(e) => debug!("Cannot lower TTL to {}, skipping decoys: {}", ttl, e),
            }
            if let Err(e) = socket.set_ttl(u32::from(DEFAULT_TTL)) {
                warn!("Failed to restore TTL {}: {}", DEFAULT_TTL, e);
            }
            socket.send(&payload).await.map(|_| ())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct RecordingSocket {
        ttl: AtomicU32,
        sent: parking_lot::Mutex<Vec<(u32, Vec<u8>)>>,
        fail_after: Option<usize>,
        /// Refuse every TTL other than the default
        reject_low_ttl: bool,
    }

    #[async_trait]
    impl RealDatagram for RecordingSocket {
        async fn send(&self, buf: &[u8]) -> io::Result<usize> {
            let mut sent = self.sent.lock();
            if self.fail_after.is_some_and(|n| sent.len() >= n) {
                return Err(io::Error::new(io::ErrorKind::Other, "send failed"));
            }
            sent.push((self.ttl.load(Ordering::SeqCst), buf.to_vec()));
            Ok(buf.len())
        }

        async fn recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
            std::future::pending().await
        }

        fn set_ttl(&self, ttl: u32) -> io::Result<()> {
            if self.reject_low_ttl && ttl != u32::from(DEFAULT_TTL) {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "IP_TTL refused"));
            }
            self.ttl.store(ttl, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_decoy_burst_precedes_original() {
        let socket = RecordingSocket { ttl: AtomicU32::new(64), ..Default::default() };
        let op = DatagramOp::Decoy {
            payload: Bytes::from_static(b"ORIGINAL"),
            decoy: Bytes::from_static(b"DECOY"),
            ttl: 3,
            repeats: 6,
        };
        send_op(&socket, op).await.unwrap();

        let sent = socket.sent.lock();
        assert_eq!(sent.len(), 7);
        for (ttl, data) in &sent[..6] {
            assert_eq!(*ttl, 3);
            assert_eq!(data, b"DECOY");
        }
        assert_eq!(sent[6], (64, b"ORIGINAL".to_vec()));
        assert_eq!(socket.ttl.load(Ordering::SeqCst), 64);
    }

    #[tokio::test]
    async fn test_failed_burst_restores_ttl() {
        let socket = RecordingSocket {
            ttl: AtomicU32::new(64),
            fail_after: Some(2),
            ..Default::default()
        };
        let op = DatagramOp::Decoy {
            payload: Bytes::from_static(b"ORIGINAL"),
            decoy: Bytes::from_static(b"DECOY"),
            ttl: 3,
            repeats: 6,
        };
        assert!(send_op(&socket, op).await.is_err());
        assert_eq!(socket.ttl.load(Ordering::SeqCst), 64);
        assert_eq!(socket.sent.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_original_sent_when_ttl_cannot_be_lowered() {
        let socket = RecordingSocket {
            ttl: AtomicU32::new(64),
            reject_low_ttl: true,
            ..Default::default()
        };
        let op = DatagramOp::Decoy {
            payload: Bytes::from_static(b"ORIGINAL"),
            decoy: Bytes::from_static(b"DECOY"),
            ttl: 3,
            repeats: 6,
        };
        send_op(&socket, op).await.unwrap();

        assert_eq!(*socket.sent.lock(), vec![(64, b"ORIGINAL".to_vec())]);
    }

    #[tokio::test]
    async fn test_forward_sends_once_unchanged() {
        let socket = RecordingSocket { ttl: AtomicU32::new(64), ..Default::default() };
        send_op(&socket, DatagramOp::Forward(Bytes::from_static(b"dns query"))).await.unwrap();
        assert_eq!(*socket.sent.lock(), vec![(64, b"dns query".to_vec())]);
    }

    #[tokio::test]
    async fn test_idle_detection() {
        let (ops, _rx) = mpsc::unbounded_channel();
        let session = UdpSession {
            key: FlowKey::new(50000, Ipv4Addr::new(8, 8, 8, 8), 53),
            id: 1,
            last_activity: Instant::now(),
            ops,
            task: None,
        };
        let later = session.last_activity + Duration::from_secs(121);
        assert!(session.is_idle(later, Duration::from_secs(120)));
        let later = session.last_activity + Duration::from_secs(60);
        assert!(!session.is_idle(later, Duration::from_secs(120)));
    }
}
