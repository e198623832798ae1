//! Relay engine
//!
//! Owns one TCP relay, one UDP relay, the dispatcher and the idle sweep for a
//! virtual interface. Configuration is pulled from a [`ConfigSource`] on every
//! start, which is how the `restart` control command picks up new settings.

use crate::config::{ConfigSource, RelayConfig};
use crate::dispatcher::{PacketDispatcher, PacketFlow};
use crate::egress::Egress;
use crate::error::{RelayError, Result};
use crate::stats::RelayStats;
use crate::tcp::TcpRelay;
use crate::udp::UdpRelay;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Control command that rebuilds the engine with fresh configuration
pub const RESTART_COMMAND: &str = "restart";

struct Running {
    config: Arc<RelayConfig>,
    tcp: Arc<TcpRelay>,
    udp: Arc<UdpRelay>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct RelayEngine {
    flow: Arc<dyn PacketFlow>,
    egress: Arc<dyn Egress>,
    source: Arc<dyn ConfigSource>,
    stats: Arc<RelayStats>,
    running: Mutex<Option<Running>>,
}

impl RelayEngine {
    pub fn new(
        flow: Arc<dyn PacketFlow>,
        egress: Arc<dyn Egress>,
        source: Arc<dyn ConfigSource>,
    ) -> Self {
        Self {
            flow,
            egress,
            source,
            stats: Arc::new(RelayStats::new()),
            running: Mutex::new(None),
        }
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        self.stats.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Configuration of the current run
    pub async fn config(&self) -> Option<RelayConfig> {
        self.running.lock().await.as_ref().map(|r| (*r.config).clone())
    }

    /// Load configuration and start relaying
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(RelayError::AlreadyRunning);
        }
        *running = Some(self.launch()?);
        Ok(())
    }

    /// Stop relaying; returns after every session is closed
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        if let Some(run) = running.take() {
            Self::shutdown(run).await;
        }
    }

    /// Tear down and start again with freshly loaded configuration
    pub async fn restart(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if let Some(run) = running.take() {
            Self::shutdown(run).await;
        }
        info!("Restarting relay engine");
        *running = Some(self.launch()?);
        Ok(())
    }

    /// Handle a control-channel command; returns whether it was recognized
    pub async fn handle_command(&self, command: &str) -> Result<bool> {
        match command.trim() {
            RESTART_COMMAND => {
                self.restart().await?;
                Ok(true)
            }
            other => {
                debug!("Ignoring control command {:?}", other);
                Ok(false)
            }
        }
    }

    fn launch(&self) -> Result<Running> {
        let mut config = self.source.load();
        config.dpi = config.dpi.normalized();
        config.validate()?;
        let config = Arc::new(config);

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let tcp = Arc::new(TcpRelay::spawn(
            config.clone(),
            self.egress.clone(),
            frames_tx.clone(),
            self.stats.clone(),
        ));
        let udp = Arc::new(UdpRelay::spawn(
            config.clone(),
            self.egress.clone(),
            frames_tx,
            self.stats.clone(),
        ));
        let cancel = CancellationToken::new();

        let dispatcher = PacketDispatcher::new(tcp.clone(), udp.clone(), self.stats.clone());
        let flow = self.flow.clone();
        let dispatch_cancel = cancel.clone();
        let dispatch_task = tokio::spawn(async move {
            dispatcher.run(flow.as_ref(), frames_rx, dispatch_cancel).await;
        });

        let sweep_task = tokio::spawn(run_sweeper(
            tcp.clone(),
            udp.clone(),
            config.cleanup_interval,
            cancel.clone(),
        ));

        info!(
            "Relay engine started (split: {}, disorder: {}, decoy: {})",
            config.dpi.split_position,
            config.dpi.use_disorder,
            config.dpi.fake_payload.is_some()
        );

        Ok(Running {
            config,
            tcp,
            udp,
            cancel,
            tasks: vec![dispatch_task, sweep_task],
        })
    }

    async fn shutdown(run: Running) {
        run.cancel.cancel();
        for task in run.tasks {
            let _ = task.await;
        }
        run.tcp.destroy().await;
        run.udp.destroy().await;
        info!("Relay engine stopped");
    }
}

async fn run_sweeper(
    tcp: Arc<TcpRelay>,
    udp: Arc<UdpRelay>,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                tcp.sweep();
                udp.sweep();
            }
        }
    }
}
