//! WebSocket accept loop.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::serve;
use super::BridgeError;
use crate::broker::SessionBroker;
use crate::config::BridgeConfig;
use crate::connector::ShellConnector;

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Header holding the username verified upstream.
    pub identity_header: String,
    /// Largest accepted inbound message.
    pub max_message_bytes: usize,
}

impl BridgeSettings {
    /// Extracts bridge settings from the `[bridge]` configuration section.
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            identity_header: config.identity_header.clone(),
            max_message_bytes: config.max_message_bytes,
        }
    }
}

/// Accepts WebSocket clients and hands each one to the broker.
pub struct BridgeServer<C: ShellConnector> {
    listener: TcpListener,
    broker: Arc<SessionBroker<C>>,
    settings: Arc<BridgeSettings>,
    shutdown: CancellationToken,
}

impl<C: ShellConnector> BridgeServer<C> {
    /// Binds the listener.
    pub async fn bind(
        addr: &str,
        broker: Arc<SessionBroker<C>>,
        settings: BridgeSettings,
    ) -> Result<Self, BridgeError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| BridgeError::Bind {
                addr: addr.to_string(),
                source,
            })?;

        Ok(Self {
            listener,
            broker,
            settings: Arc::new(settings),
            shutdown: CancellationToken::new(),
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, BridgeError> {
        Ok(self.listener.local_addr()?)
    }

    /// Token that stops the accept loop and every client when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs the accept loop until shut down.
    pub async fn run(self) {
        match self.listener.local_addr() {
            Ok(addr) => info!(addr = %addr, "Terminal bridge listening"),
            Err(e) => warn!(error = %e, "Terminal bridge listening on unknown address"),
        }

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            };

            let broker = Arc::clone(&self.broker);
            let settings = Arc::clone(&self.settings);
            let shutdown = self.shutdown.child_token();
            tokio::spawn(async move {
                match serve(stream, peer_addr, broker, settings, shutdown).await {
                    Ok(()) => {}
                    Err(BridgeError::Handshake(tungstenite::Error::Http(response))) => {
                        warn!(
                            peer = %peer_addr,
                            status = %response.status(),
                            "Rejected terminal client upgrade"
                        );
                    }
                    Err(e) => debug!(peer = %peer_addr, error = %e, "Terminal client connection failed"),
                }
            });
        }

        info!("Terminal bridge stopped");
    }
}
