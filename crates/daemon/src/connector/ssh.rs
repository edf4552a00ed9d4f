//! SSH implementation of [`ShellConnector`] on top of russh.
//!
//! Each call opens a fresh SSH connection, authenticates with a password,
//! requests a pty and a login shell, then hands the channel to a pump task
//! that moves bytes between the russh channel and a [`ChannelPeer`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use tracing::{debug, trace, warn};

use super::channel::{ChannelCommand, ChannelEvent, ChannelPeer, ShellChannel};
use super::{ConnectError, ShellConnector, ShellRequest};
use crate::config::SshConfig;

/// Queue depth between a session and its pump task.
const CHANNEL_CAPACITY: usize = 256;

/// Host key policy for one connection.
struct HostKeyPolicy {
    host: String,
    pinned_fingerprint: Option<String>,
}

#[async_trait]
impl client::Handler for HostKeyPolicy {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let Some(expected) = &self.pinned_fingerprint else {
            return Ok(true);
        };

        let actual = server_public_key.fingerprint();
        let expected = expected.strip_prefix("SHA256:").unwrap_or(expected);
        if actual != expected {
            warn!(
                target: "security",
                host = %self.host,
                fingerprint = %actual,
                "Host key fingerprint does not match pinned value"
            );
            return Ok(false);
        }
        Ok(true)
    }
}

/// Opens pty shells over SSH with password authentication.
#[derive(Debug, Clone)]
pub struct SshConnector {
    term: String,
    host_key_fingerprint: Option<String>,
}

impl SshConnector {
    /// Creates a connector that requests `term` for every pty.
    pub fn new(term: impl Into<String>, host_key_fingerprint: Option<String>) -> Self {
        Self {
            term: term.into(),
            host_key_fingerprint,
        }
    }

    /// Creates a connector from the `[ssh]` configuration section.
    pub fn from_config(config: &SshConfig) -> Self {
        Self::new(config.term.clone(), config.host_key_fingerprint.clone())
    }

    async fn open(
        &self,
        request: &ShellRequest,
    ) -> Result<(Handle<HostKeyPolicy>, Channel<Msg>), ConnectError> {
        let policy = HostKeyPolicy {
            host: request.host.clone(),
            pinned_fingerprint: self.host_key_fingerprint.clone(),
        };
        let config = Arc::new(client::Config::default());

        let mut handle = client::connect(config, (request.host.as_str(), request.port), policy)
            .await
            .map_err(|e| ConnectError::Connect(e.to_string()))?;

        let credentials = &request.credentials;
        let accepted = handle
            .authenticate_password(&credentials.username, &credentials.password)
            .await
            .map_err(|e| ConnectError::Connect(e.to_string()))?;
        if !accepted {
            disconnect(&handle).await;
            return Err(ConnectError::AuthRejected {
                username: credentials.username.clone(),
            });
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| ConnectError::ChannelOpen(e.to_string()))?;

        let dims = request.dimensions;
        channel
            .request_pty(true, &self.term, dims.cols.into(), dims.rows.into(), 0, 0, &[])
            .await
            .map_err(|e| ConnectError::ChannelOpen(format!("pty request: {}", e)))?;
        channel
            .request_shell(true)
            .await
            .map_err(|e| ConnectError::ChannelOpen(format!("shell request: {}", e)))?;

        Ok((handle, channel))
    }
}

#[async_trait]
impl ShellConnector for SshConnector {
    async fn connect_and_open_shell(&self, request: ShellRequest) -> Result<ShellChannel, ConnectError> {
        debug!(
            host = %request.host,
            port = request.port,
            username = %request.credentials.username,
            "Opening SSH shell"
        );

        // Dropping the in-flight future drops the russh handle, which ends
        // its session task and the TCP connection with it.
        let (handle, channel) = tokio::time::timeout(request.timeout, self.open(&request))
            .await
            .map_err(|_| ConnectError::Timeout(request.timeout))??;

        let (shell, peer) = ShellChannel::pair(CHANNEL_CAPACITY);
        let label = format!("{}@{}:{}", request.credentials.username, request.host, request.port);
        tokio::spawn(pump(handle, channel, peer, label));
        Ok(shell)
    }
}

enum Step {
    Local(Option<ChannelCommand>),
    Remote(Option<ChannelMsg>),
}

/// Moves bytes until either side closes, then tears the connection down.
async fn pump(
    handle: Handle<HostKeyPolicy>,
    mut channel: Channel<Msg>,
    mut peer: ChannelPeer,
    label: String,
) {
    loop {
        let step = tokio::select! {
            command = peer.next_command() => Step::Local(command),
            message = channel.wait() => Step::Remote(message),
        };

        match step {
            Step::Local(None) => {
                trace!(remote = %label, "Shell channel closed locally");
                break;
            }
            Step::Local(Some(ChannelCommand::Write(data))) => {
                if let Err(e) = channel.data(&data[..]).await {
                    peer.emit(ChannelEvent::Error(format!("write failed: {}", e))).await;
                }
            }
            Step::Local(Some(ChannelCommand::Resize(dims))) => {
                if let Err(e) = channel
                    .window_change(dims.cols.into(), dims.rows.into(), 0, 0)
                    .await
                {
                    peer.emit(ChannelEvent::Error(format!("resize failed: {}", e))).await;
                }
            }
            Step::Remote(Some(ChannelMsg::Data { data }))
            | Step::Remote(Some(ChannelMsg::ExtendedData { data, .. })) => {
                if !peer.emit(ChannelEvent::Data(Bytes::copy_from_slice(&data))).await {
                    break;
                }
            }
            Step::Remote(Some(ChannelMsg::ExitStatus { exit_status })) => {
                debug!(remote = %label, exit_status, "Remote shell exited");
            }
            Step::Remote(Some(ChannelMsg::Eof)) => {
                trace!(remote = %label, "Remote sent EOF");
            }
            Step::Remote(Some(ChannelMsg::Close)) | Step::Remote(None) => {
                debug!(remote = %label, "Remote closed shell channel");
                peer.emit(ChannelEvent::Closed).await;
                break;
            }
            Step::Remote(Some(_)) => {}
        }
    }

    if let Err(e) = channel.eof().await {
        trace!(remote = %label, error = %e, "EOF on teardown failed");
    }
    if let Err(e) = channel.close().await {
        trace!(remote = %label, error = %e, "Channel close on teardown failed");
    }
    disconnect(&handle).await;
}

async fn disconnect(handle: &Handle<HostKeyPolicy>) {
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "", "English")
        .await
    {
        trace!(error = %e, "SSH disconnect failed");
    }
}
