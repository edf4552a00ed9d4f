//! In-process duplex channel between a session and its remote shell.
//!
//! [`ShellChannel::pair`] creates two ends: the session side ([`ChannelHandle`]
//! plus an event receiver) and the driver side ([`ChannelPeer`]) that a
//! connector uses to pump bytes to and from the actual remote channel.
//! Shutdown is signalled through a cancellation token so that either side can
//! observe it without racing on queue state.

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::session::Dimensions;

/// Command sent from a session towards the remote shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCommand {
    /// Bytes to write to the shell's stdin.
    Write(Bytes),
    /// New pty window size.
    Resize(Dimensions),
}

/// Event produced by the remote shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Output from the shell (stdout and stderr are merged).
    Data(Bytes),
    /// A failure on the live channel. Detail is for logs only.
    Error(String),
    /// The remote side closed the channel.
    Closed,
}

/// Errors from operations on a channel handle.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel has been shut down or its driver has exited.
    #[error("channel closed")]
    Closed,
}

/// Session-side handle for writing to and resizing a remote shell.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    commands: mpsc::Sender<ChannelCommand>,
    shutdown: CancellationToken,
}

impl ChannelHandle {
    /// Queues bytes for the remote shell, preserving submission order.
    pub async fn write(&self, data: Bytes) -> Result<(), ChannelError> {
        self.send(ChannelCommand::Write(data)).await
    }

    /// Requests a new pty window size.
    pub async fn resize(&self, dimensions: Dimensions) -> Result<(), ChannelError> {
        self.send(ChannelCommand::Resize(dimensions)).await
    }

    /// Ends the channel. The driver tears down the remote connection.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    async fn send(&self, command: ChannelCommand) -> Result<(), ChannelError> {
        if self.shutdown.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(ChannelError::Closed),
            sent = self.commands.send(command) => sent.map_err(|_| ChannelError::Closed),
        }
    }
}

/// Session side of an open remote shell.
#[derive(Debug)]
pub struct ShellChannel {
    handle: ChannelHandle,
    events: mpsc::Receiver<ChannelEvent>,
}

impl ShellChannel {
    /// Creates a connected channel pair with bounded queues in each direction.
    pub fn pair(capacity: usize) -> (ShellChannel, ChannelPeer) {
        let (command_tx, command_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let shutdown = CancellationToken::new();

        let channel = ShellChannel {
            handle: ChannelHandle {
                commands: command_tx,
                shutdown: shutdown.clone(),
            },
            events: event_rx,
        };
        let peer = ChannelPeer {
            commands: command_rx,
            events: event_tx,
            shutdown,
        };
        (channel, peer)
    }

    /// Returns the command handle.
    pub fn handle(&self) -> &ChannelHandle {
        &self.handle
    }

    /// Splits into the command handle and the event stream.
    pub fn into_parts(self) -> (ChannelHandle, mpsc::Receiver<ChannelEvent>) {
        (self.handle, self.events)
    }
}

/// Driver side of a channel, held by whatever talks to the remote shell.
#[derive(Debug)]
pub struct ChannelPeer {
    commands: mpsc::Receiver<ChannelCommand>,
    events: mpsc::Sender<ChannelEvent>,
    shutdown: CancellationToken,
}

impl ChannelPeer {
    /// Next command from the session.
    ///
    /// Returns `None` once the session closed the channel or dropped every
    /// handle. Cancel-safe.
    pub async fn next_command(&mut self) -> Option<ChannelCommand> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            command = self.commands.recv() => command,
        }
    }

    /// Delivers an event to the session. Returns false if nobody listens.
    pub async fn emit(&self, event: ChannelEvent) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }

    /// Resolves when the session closes the channel.
    pub fn shutdown_requested(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    /// Returns true once the session closed the channel.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
