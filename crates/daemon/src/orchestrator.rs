//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that builds the remote shell
//! connector, the session broker with its idle reaper, and the WebSocket
//! bridge, and tears them down in order on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::{BridgeServer, BridgeSettings};
use crate::broker::{BrokerConfig, SessionBroker};
use crate::config::Config;
use crate::connector::{ShellConnector, SshConnector};

/// How long `stop` waits for the accept loop to exit.
const BRIDGE_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, initializing components.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// The bridge is accepting clients.
    BridgeListening { addr: SocketAddr },
    /// Error occurred.
    Error { message: String },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator<C: ShellConnector = SshConnector> {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Terminal session broker.
    broker: Arc<SessionBroker<C>>,
    /// Stops the bridge accept loop and its clients.
    bridge_shutdown: Option<CancellationToken>,
    /// Accept loop task.
    bridge_task: Option<JoinHandle<()>>,
    /// Address the bridge is bound to while running.
    bridge_addr: Option<SocketAddr>,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator<SshConnector> {
    /// Creates an orchestrator that opens shells over SSH.
    pub fn new(config: Config) -> Result<Self> {
        let connector = Arc::new(SshConnector::from_config(&config.ssh));
        Self::with_connector(config, connector)
    }
}

impl<C: ShellConnector> DaemonOrchestrator<C> {
    /// Creates an orchestrator around an existing connector.
    pub fn with_connector(config: Config, connector: Arc<C>) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let broker = Arc::new(SessionBroker::new(connector, BrokerConfig::from_config(&config)));
        let (event_tx, _) = broadcast::channel(64);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            broker,
            bridge_shutdown: None,
            bridge_task: None,
            bridge_addr: None,
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Starts the daemon orchestrator.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        let bind_addr = self.config.bridge.bind_addr.clone();
        let server = match BridgeServer::bind(
            &bind_addr,
            Arc::clone(&self.broker),
            BridgeSettings::from_config(&self.config.bridge),
        )
        .await
        {
            Ok(server) => server,
            Err(e) => {
                self.emit_event(OrchestratorEvent::Error {
                    message: e.to_string(),
                });
                *self.state.write().await = OrchestratorState::Stopped;
                self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));
                return Err(e).context("Failed to start terminal bridge");
            }
        };

        let addr = server
            .local_addr()
            .context("Failed to read bridge address")?;
        self.bridge_shutdown = Some(server.shutdown_token());
        self.bridge_addr = Some(addr);
        self.bridge_task = Some(tokio::spawn(server.run()));
        self.emit_event(OrchestratorEvent::BridgeListening { addr });

        self.broker.start_reaper();
        debug!("Started idle reaper");

        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Running;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!(
            bridge = %addr,
            ssh_host = %self.config.ssh.host,
            ssh_port = self.config.ssh.port,
            "Daemon orchestrator started successfully"
        );
        Ok(())
    }

    /// Stops the daemon orchestrator.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        if let Some(token) = self.bridge_shutdown.take() {
            token.cancel();
        }
        if let Some(mut task) = self.bridge_task.take() {
            if tokio::time::timeout(BRIDGE_STOP_TIMEOUT, &mut task).await.is_err() {
                warn!("Terminal bridge did not stop in time");
                task.abort();
            }
        }
        self.bridge_addr = None;

        self.broker.cleanup().await;

        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Stopped;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the session broker.
    pub fn broker(&self) -> &Arc<SessionBroker<C>> {
        &self.broker
    }

    /// Returns the bridge address while running.
    pub fn bridge_addr(&self) -> Option<SocketAddr> {
        self.bridge_addr
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.bridge.bind_addr = "127.0.0.1:0".to_string();
        config
    }

    #[tokio::test]
    async fn test_orchestrator_creation() {
        let orchestrator = DaemonOrchestrator::new(test_config()).unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(orchestrator.bridge_addr().is_none());
        assert_eq!(orchestrator.broker().session_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = test_config();
        config.session.idle_timeout_secs = 0;
        assert!(DaemonOrchestrator::new(config).is_err());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let mut orchestrator = DaemonOrchestrator::new(test_config()).unwrap();
        let mut events = orchestrator.subscribe();

        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        let addr = orchestrator.bridge_addr().unwrap();
        assert_ne!(addr.port(), 0);

        assert!(orchestrator.start().await.is_err());

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(orchestrator.bridge_addr().is_none());

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let OrchestratorEvent::StateChanged(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                OrchestratorState::Starting,
                OrchestratorState::Running,
                OrchestratorState::ShuttingDown,
                OrchestratorState::Stopped,
            ]
        );

        // Stopping again is a no-op.
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_fails_when_address_taken() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = test_config();
        config.bridge.bind_addr = listener.local_addr().unwrap().to_string();

        let mut orchestrator = DaemonOrchestrator::new(config).unwrap();
        assert!(orchestrator.start().await.is_err());
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
    }
}
