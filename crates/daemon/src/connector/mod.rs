//! Remote shell connector.
//!
//! A connector opens one authenticated connection to the managed host and a
//! pty-backed shell channel on it. It holds no session state; the broker
//! calls it once per `start`.

pub mod channel;
pub mod ssh;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::session::Dimensions;

pub use channel::{ChannelCommand, ChannelError, ChannelEvent, ChannelHandle, ChannelPeer, ShellChannel};
pub use ssh::SshConnector;

/// Username and password for the remote host.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Remote account name.
    pub username: String,
    /// Remote account password.
    pub password: String,
}

impl Credentials {
    /// Creates a credential pair.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything a connector needs to open one shell.
#[derive(Debug, Clone)]
pub struct ShellRequest {
    /// Managed host name or address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Login credentials.
    pub credentials: Credentials,
    /// Initial pty size.
    pub dimensions: Dimensions,
    /// Deadline for connect, authenticate and channel open together.
    pub timeout: Duration,
}

/// Connector failures. Detail strings are for logs only.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The deadline expired before the shell was open.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The remote host rejected the credentials.
    #[error("authentication rejected for {username}")]
    AuthRejected {
        /// Account that was rejected.
        username: String,
    },

    /// TCP or SSH handshake failure.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The pty or shell request was refused.
    #[error("failed to open shell channel: {0}")]
    ChannelOpen(String),

    /// The session was closed while the connect was in flight.
    #[error("connect cancelled")]
    Cancelled,
}

/// Factory for remote shell channels.
#[async_trait]
pub trait ShellConnector: Send + Sync + 'static {
    /// Connects, authenticates and opens a pty shell within `request.timeout`.
    ///
    /// Any partial connection is torn down before an error is returned.
    async fn connect_and_open_shell(&self, request: ShellRequest) -> Result<ShellChannel, ConnectError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new("alice", "hunter2");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("alice"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_connect_error_messages() {
        assert_eq!(
            ConnectError::AuthRejected {
                username: "alice".to_string()
            }
            .to_string(),
            "authentication rejected for alice"
        );
        assert_eq!(
            ConnectError::Timeout(Duration::from_secs(10)).to_string(),
            "timed out after 10s"
        );
    }
}
