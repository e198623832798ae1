//! TCP relay
//!
//! Speaks synthetic TCP toward the captured application and plain TCP toward
//! the real destination. The relay never runs a TCP stack of its own: it
//! answers SYNs optimistically, acknowledges every data segment as soon as it
//! is queued for the real connection and mirrors closes in both directions.
//!
//! All session state lives in one actor task. Each session owns a second task
//! that connects, drains queued writes and reads the real connection; its
//! events re-enter the actor tagged with the session id, so events from a
//! replaced or closed session are discarded.

use crate::config::{DpiConfig, RelayConfig};
use crate::dispatcher::FrameSender;
use crate::egress::{Egress, RealStream};
use crate::flow::FlowKey;
use crate::stats::RelayStats;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use zapret_packet::{build_ipv4_tcp, is_tls_client_hello, TcpFlags, DEFAULT_TTL};

/// TCP session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// SYN seen, SYN-ACK not yet emitted
    SynReceived,
    /// SYN-ACK emitted, real connection in progress
    Connecting,
    Established,
    /// Application sent FIN; real side still open
    Closing,
    Closed,
}

/// TCP segment captured from the interface
#[derive(Debug, Clone)]
pub struct InboundSegment {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub payload: Bytes,
}

impl InboundSegment {
    pub fn flow_key(&self) -> FlowKey {
        FlowKey::new(self.src_port, self.dst_addr, self.dst_port)
    }
}

/// Synthetic sequence space of one session.
///
/// `seq` is the next sequence number the relay sends; `ack` is the next byte
/// expected from the application. Both wrap modulo 2^32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSequencer {
    seq: u32,
    ack: u32,
}

impl TcpSequencer {
    /// Start a sequence space answering a SYN carrying `client_seq`
    pub fn new(isn: u32, client_seq: u32) -> Self {
        Self { seq: isn, ack: client_seq.wrapping_add(1) }
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn ack(&self) -> u32 {
        self.ack
    }

    /// Record a segment from the application
    pub fn acknowledge(&mut self, client_seq: u32, payload_len: usize, fin: bool) {
        self.ack = client_seq
            .wrapping_add(payload_len as u32)
            .wrapping_add(u32::from(fin));
    }

    /// Build a frame toward the application, then advance past it.
    ///
    /// The frame impersonates the real destination: source is `key`'s
    /// destination, destination is the tunnel address. On error nothing
    /// advances.
    pub fn build(
        &mut self,
        key: &FlowKey,
        tunnel: Ipv4Addr,
        flags: TcpFlags,
        window: u16,
        payload: &[u8],
    ) -> zapret_packet::Result<Vec<u8>> {
        let frame = build_ipv4_tcp(
            key.dst_addr,
            tunnel,
            key.dst_port,
            key.src_port,
            self.seq,
            self.ack,
            flags,
            window,
            payload,
        )?;
        self.seq = self
            .seq
            .wrapping_add(payload.len() as u32)
            .wrapping_add(flags.sequence_len());
        Ok(frame)
    }
}

/// Write operation queued for the real connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StreamOp {
    Write(Bytes),
    /// Write with a temporary TTL, restored to the default afterwards
    WriteWithTtl { data: Bytes, ttl: u8 },
    /// Half-close the send side
    Shutdown,
}

/// Plan the writes for one application payload.
///
/// The first TLS ClientHello longer than the split position is cut in two.
/// With disorder the first fragment leaves with a short TTL so it expires in
/// transit; the kernel retransmits it after the second fragment has arrived,
/// and the byte stream stays intact.
pub(crate) fn plan_writes(payload: Bytes, first_data_sent: bool, dpi: &DpiConfig) -> Vec<StreamOp> {
    let split = dpi.split_position;
    if first_data_sent || split == 0 || payload.len() <= split || !is_tls_client_hello(&payload) {
        return vec![StreamOp::Write(payload)];
    }

    let first = payload.slice(..split);
    let second = payload.slice(split..);
    if dpi.use_disorder {
        vec![
            StreamOp::WriteWithTtl { data: first, ttl: dpi.disorder_ttl },
            StreamOp::Write(second),
        ]
    } else {
        vec![StreamOp::Write(first), StreamOp::Write(second)]
    }
}

fn generate_isn(key: &FlowKey) -> u32 {
    rand::random::<u32>() ^ (((key.dst_port as u32) << 16) | key.src_port as u32)
}

pub(crate) struct TcpSession {
    key: FlowKey,
    id: u64,
    state: TcpState,
    seq: TcpSequencer,
    first_data_sent: bool,
    last_activity: Instant,
    writer: mpsc::UnboundedSender<StreamOp>,
    task: Option<JoinHandle<()>>,
}

impl TcpSession {
    fn new(
        key: FlowKey,
        id: u64,
        seq: TcpSequencer,
        writer: mpsc::UnboundedSender<StreamOp>,
    ) -> Self {
        Self {
            key,
            id,
            state: TcpState::SynReceived,
            seq,
            first_data_sent: false,
            last_activity: Instant::now(),
            writer,
            task: None,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }

    /// Queue an application payload; returns true when it was split
    fn forward(&mut self, payload: Bytes, dpi: &DpiConfig) -> bool {
        let ops = plan_writes(payload, self.first_data_sent, dpi);
        self.first_data_sent = true;
        let split = ops.len() > 1;
        for op in ops {
            // A closed writer means the task already reported its end
            let _ = self.writer.send(op);
        }
        split
    }
}

pub(crate) enum TcpCommand {
    Segment(InboundSegment),
    Connected { key: FlowKey, id: u64 },
    ConnectFailed { key: FlowKey, id: u64, error: io::Error },
    Received { key: FlowKey, id: u64, data: Bytes },
    RemoteClosed { key: FlowKey, id: u64 },
    Sweep,
    SessionCount(oneshot::Sender<usize>),
    SessionState(FlowKey, oneshot::Sender<Option<TcpState>>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running TCP relay
pub struct TcpRelay {
    tx: mpsc::UnboundedSender<TcpCommand>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpRelay {
    /// Spawn the relay on the current tokio runtime
    pub fn spawn(
        config: Arc<RelayConfig>,
        egress: Arc<dyn Egress>,
        frames: FrameSender,
        stats: Arc<RelayStats>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = TcpRelayActor {
            emitter: TcpEmitter {
                frames,
                tunnel: config.tunnel_address,
                window: config.tcp.window,
            },
            config,
            egress,
            stats,
            events: tx.downgrade(),
            sessions: HashMap::new(),
            next_id: 0,
        };
        let task = tokio::spawn(actor.run(rx));
        Self { tx, task: Mutex::new(Some(task)) }
    }

    /// Queue a captured segment. Never blocks.
    pub fn process(&self, segment: InboundSegment) {
        if self.tx.send(TcpCommand::Segment(segment)).is_err() {
            trace!("TCP relay stopped, dropping segment");
        }
    }

    /// Queue an idle sweep
    pub fn sweep(&self) {
        let _ = self.tx.send(TcpCommand::Sweep);
    }

    /// Number of live sessions; zero once destroyed
    pub async fn session_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(TcpCommand::SessionCount(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// State of the session for `key`, if one is live
    pub async fn session_state(&self, key: FlowKey) -> Option<TcpState> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(TcpCommand::SessionState(key, tx)).ok()?;
        rx.await.ok().flatten()
    }

    /// Close every session and stop the relay.
    ///
    /// Returns once every real connection is closed and no session task is
    /// left running. Later calls return immediately.
    pub async fn destroy(&self) {
        let Some(task) = self.task.lock().take() else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(TcpCommand::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        let _ = task.await;
    }
}

impl Drop for TcpRelay {
    fn drop(&mut self) {
        if self.task.lock().is_some() {
            let (ack_tx, _) = oneshot::channel();
            let _ = self.tx.send(TcpCommand::Shutdown(ack_tx));
        }
    }
}

struct TcpEmitter {
    frames: FrameSender,
    tunnel: Ipv4Addr,
    window: u16,
}

impl TcpEmitter {
    fn emit(&self, key: &FlowKey, seq: &mut TcpSequencer, flags: TcpFlags, payload: &[u8]) {
        match seq.build(key, self.tunnel, flags, self.window, payload) {
            Ok(frame) => {
                if self.frames.send(Bytes::from(frame)).is_err() {
                    trace!("Interface writer gone, frame for {} dropped", key);
                }
            }
            Err(e) => debug!("Discarding frame for {}: {}", key, e),
        }
    }

    /// Refuse a SYN without creating a session
    fn reject(&self, key: &FlowKey, client_seq: u32) {
        let mut seq = TcpSequencer::new(0, client_seq);
        self.emit(key, &mut seq, TcpFlags::rst_ack(), &[]);
    }
}

struct TcpRelayActor {
    config: Arc<RelayConfig>,
    egress: Arc<dyn Egress>,
    stats: Arc<RelayStats>,
    emitter: TcpEmitter,
    events: mpsc::WeakUnboundedSender<TcpCommand>,
    sessions: HashMap<FlowKey, TcpSession>,
    next_id: u64,
}

impl TcpRelayActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<TcpCommand>) {
        debug!("TCP relay started");
        while let Some(cmd) = rx.recv().await {
            match cmd {
                TcpCommand::Segment(segment) => self.on_segment(segment).await,
                TcpCommand::Connected { key, id } => self.on_connected(key, id),
                TcpCommand::ConnectFailed { key, id, error } => {
                    self.on_connect_failed(key, id, error).await
                }
                TcpCommand::Received { key, id, data } => self.on_received(key, id, data),
                TcpCommand::RemoteClosed { key, id } => self.on_remote_closed(key, id).await,
                TcpCommand::Sweep => self.sweep().await,
                TcpCommand::SessionCount(reply) => {
                    let _ = reply.send(self.sessions.len());
                }
                TcpCommand::SessionState(key, reply) => {
                    let _ = reply.send(self.sessions.get(&key).map(|s| s.state));
                }
                TcpCommand::Shutdown(ack) => {
                    self.close_all().await;
                    let _ = ack.send(());
                    break;
                }
            }
        }
        self.close_all().await;
        debug!("TCP relay stopped");
    }

    async fn on_segment(&mut self, segment: InboundSegment) {
        let key = segment.flow_key();

        if segment.flags.rst {
            if let Some(session) = self.sessions.remove(&key) {
                debug!("RST from application for {}", key);
                self.close_session(session).await;
            }
            return;
        }

        if segment.flags.syn {
            self.on_syn(key, segment).await;
            return;
        }

        let Some(session) = self.sessions.get_mut(&key) else {
            trace!("No TCP session for {}, ignoring segment", key);
            return;
        };

        let fin = segment.flags.fin;
        if segment.payload.is_empty() && !fin {
            return;
        }

        let payload_len = segment.payload.len();
        if payload_len > 0 {
            session.touch();
            if matches!(session.state, TcpState::Connecting | TcpState::Established) {
                self.stats.record_to_remote(payload_len);
                if session.forward(segment.payload, &self.config.dpi) {
                    self.stats.record_tls_split();
                    debug!(
                        "Split ClientHello for {} at {} (disorder: {})",
                        key, self.config.dpi.split_position, self.config.dpi.use_disorder
                    );
                }
            }
        }

        session.seq.acknowledge(segment.seq, payload_len, fin);

        if fin && session.state != TcpState::Closing {
            debug!("FIN from application for {}", key);
            session.state = TcpState::Closing;
            let _ = session.writer.send(StreamOp::Shutdown);
        }

        self.emitter.emit(&key, &mut session.seq, TcpFlags::ack_only(), &[]);
    }

    async fn on_syn(&mut self, key: FlowKey, segment: InboundSegment) {
        if let Some(old) = self.sessions.remove(&key) {
            debug!("SYN on live flow {}, replacing session", key);
            self.close_session(old).await;
        }

        if self.sessions.len() >= self.config.tcp.max_sessions {
            warn!(
                "TCP session limit ({}) reached, rejecting {}",
                self.config.tcp.max_sessions, key
            );
            self.stats.record_tcp_rejected();
            self.emitter.reject(&key, segment.seq);
            return;
        }

        let Some(events) = self.events.upgrade() else {
            return;
        };

        self.next_id += 1;
        let id = self.next_id;
        let (writer, ops) = mpsc::unbounded_channel();
        let seq = TcpSequencer::new(generate_isn(&key), segment.seq);
        let mut session = TcpSession::new(key, id, seq, writer);

        self.emitter.emit(&key, &mut session.seq, TcpFlags::syn_ack(), &[]);

        let task = StreamTask {
            key,
            id,
            dst: key.destination(),
            egress: self.egress.clone(),
            connect_timeout: self.config.tcp.connect_timeout,
            read_buffer: self.config.tcp.read_buffer,
            events,
            ops,
        };
        session.task = Some(tokio::spawn(task.run()));
        session.state = TcpState::Connecting;

        self.stats.record_tcp_session();
        info!("TCP session {} created ({} active)", key, self.sessions.len() + 1);
        self.sessions.insert(key, session);
    }

    fn on_connected(&mut self, key: FlowKey, id: u64) {
        if let Some(session) = self.live_session(key, id) {
            if session.state == TcpState::Connecting {
                session.state = TcpState::Established;
            }
            debug!("TCP session {} connected", key);
        }
    }

    async fn on_connect_failed(&mut self, key: FlowKey, id: u64, error: io::Error) {
        if self.live_session(key, id).is_none() {
            return;
        }
        if let Some(mut session) = self.sessions.remove(&key) {
            warn!("Connect to {} failed: {}", key.destination(), error);
            self.stats.record_connect_failure();
            self.emitter.emit(&key, &mut session.seq, TcpFlags::rst_only(), &[]);
            self.close_session(session).await;
        }
    }

    fn on_received(&mut self, key: FlowKey, id: u64, data: Bytes) {
        // An unvalidated zero MSS still has to make progress
        let mss = self.config.tcp.mss.max(1);
        let Some(session) = self.sessions.get_mut(&key).filter(|s| s.id == id) else {
            return;
        };
        session.touch();
        self.stats.record_from_remote(data.len());
        for chunk in data.chunks(mss) {
            self.emitter.emit(&key, &mut session.seq, TcpFlags::psh_ack(), chunk);
        }
    }

    async fn on_remote_closed(&mut self, key: FlowKey, id: u64) {
        if self.live_session(key, id).is_none() {
            return;
        }
        if let Some(mut session) = self.sessions.remove(&key) {
            debug!("Remote closed {}", key);
            self.emitter.emit(&key, &mut session.seq, TcpFlags::fin_ack(), &[]);
            self.close_session(session).await;
        }
    }

    async fn sweep(&mut self) {
        let now = Instant::now();
        let timeout = self.config.tcp.idle_timeout;
        let expired: Vec<FlowKey> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_idle(now, timeout))
            .map(|(k, _)| *k)
            .collect();

        for key in &expired {
            if let Some(mut session) = self.sessions.remove(key) {
                self.emitter.emit(key, &mut session.seq, TcpFlags::rst_only(), &[]);
                self.close_session(session).await;
            }
        }

        if !expired.is_empty() {
            info!("Swept {} idle TCP sessions, {} remain", expired.len(), self.sessions.len());
        }
    }

    fn live_session(&mut self, key: FlowKey, id: u64) -> Option<&mut TcpSession> {
        self.sessions.get_mut(&key).filter(|s| s.id == id)
    }

    /// Cancel the session task and wait for it, which drops the real connection.
    async fn close_session(&self, mut session: TcpSession) {
        session.state = TcpState::Closed;
        if let Some(task) = session.task.take() {
            task.abort();
            let _ = task.await;
        }
        self.stats.record_tcp_closed();
        debug!("TCP session {} closed", session.key);
    }

    async fn close_all(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        let count = self.sessions.len();
        for (_, session) in std::mem::take(&mut self.sessions) {
            self.close_session(session).await;
        }
        info!("Closed {} TCP sessions", count);
    }
}

/// Per-session I/O: connect, then interleave queued writes with reads.
struct StreamTask {
    key: FlowKey,
    id: u64,
    dst: SocketAddrV4,
    egress: Arc<dyn Egress>,
    connect_timeout: Duration,
    read_buffer: usize,
    events: mpsc::UnboundedSender<TcpCommand>,
    ops: mpsc::UnboundedReceiver<StreamOp>,
}

impl StreamTask {
    async fn run(mut self) {
        let (key, id) = (self.key, self.id);

        let connect =
            tokio::time::timeout(self.connect_timeout, self.egress.connect_stream(self.dst));
        let mut stream = match connect.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => {
                let _ = self.events.send(TcpCommand::ConnectFailed { key, id, error });
                return;
            }
            Err(_) => {
                let error = io::Error::new(io::ErrorKind::TimedOut, "connect timed out");
                let _ = self.events.send(TcpCommand::ConnectFailed { key, id, error });
                return;
            }
        };
        let _ = self.events.send(TcpCommand::Connected { key, id });

        let mut buf = vec![0u8; self.read_buffer];
        let mut write_open = true;

        loop {
            tokio::select! {
                op = self.ops.recv(), if write_open => {
                    let Some(op) = op else {
                        return;
                    };
                    if matches!(op, StreamOp::Shutdown) {
                        write_open = false;
                    }
                    if let Err(e) = apply(&mut stream, op).await {
                        debug!("Write to {} failed: {}", self.dst, e);
                        let _ = self.events.send(TcpCommand::RemoteClosed { key, id });
                        return;
                    }
                }
                read = stream.read(&mut buf) => {
                    match read {
                        Ok(0) => {
                            let _ = self.events.send(TcpCommand::RemoteClosed { key, id });
                            return;
                        }
                        Ok(n) => {
                            let data = Bytes::copy_from_slice(&buf[..n]);
                            if self.events.send(TcpCommand::Received { key, id, data }).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            debug!("Read from {} failed: {}", self.dst, e);
                            let _ = self.events.send(TcpCommand::RemoteClosed { key, id });
                            return;
                        }
                    }
                }
            }
        }
    }
}

async fn apply(stream: &mut Box<dyn RealStream>, op: StreamOp) -> io::Result<()> {
    match op {
        StreamOp::Write(data) => stream.write_all(&data).await,
        StreamOp::WriteWithTtl { data, ttl } => {
            stream.set_ttl(u32::from(ttl))?;
            let written = stream.write_all(&data).await;
            stream.set_ttl(u32::from(DEFAULT_TTL))?;
            written
        }
        StreamOp::Shutdown => stream.shutdown().await,
    }
}
