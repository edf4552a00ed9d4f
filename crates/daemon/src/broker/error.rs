//! Broker error types.

use thiserror::Error;

use crate::session::InvalidDimensions;

/// Error category, used to decide what is logged and what reaches a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any remote work was attempted.
    Validation,
    /// The remote host rejected the credentials.
    Authentication,
    /// The connect deadline expired.
    Timeout,
    /// A live channel operation failed.
    Runtime,
    /// The channel went away underneath the request.
    Protocol,
}

/// Errors returned by [`SessionBroker`](super::SessionBroker) operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// The session id was empty.
    #[error("session id must not be empty")]
    InvalidSessionId,

    /// Username or password was missing.
    #[error("username and password are required")]
    MissingCredentials,

    /// Rows or columns outside [5, 500].
    #[error(transparent)]
    InvalidDimensions(#[from] InvalidDimensions),

    /// The claimed username differs from the verified identity.
    #[error("claimed username {claimed:?} does not match authenticated user {authenticated:?}")]
    IdentityMismatch {
        /// Username sent with the start request.
        claimed: String,
        /// Username bound to the client connection.
        authenticated: String,
    },

    /// A session with this id is already registered.
    #[error("session {0} is already active")]
    AlreadyActive(String),

    /// The live session cap was reached.
    #[error("session limit of {0} reached")]
    TooManySessions(usize),

    /// No session with this id is `Active`.
    #[error("no active session {0}")]
    NoActiveSession(String),

    /// The remote host rejected the credentials or the channel could not be opened.
    #[error("remote authentication failed")]
    AuthenticationFailed,

    /// Connect, authenticate and channel open did not finish in time.
    #[error("remote connect timed out")]
    ConnectTimeout,

    /// The session was closed before the operation completed.
    #[error("session {0} was closed")]
    SessionClosed(String),
}

impl BrokerError {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::InvalidSessionId
            | BrokerError::MissingCredentials
            | BrokerError::InvalidDimensions(_)
            | BrokerError::IdentityMismatch { .. }
            | BrokerError::AlreadyActive(_)
            | BrokerError::TooManySessions(_) => ErrorKind::Validation,
            BrokerError::AuthenticationFailed => ErrorKind::Authentication,
            BrokerError::ConnectTimeout => ErrorKind::Timeout,
            BrokerError::NoActiveSession(_) => ErrorKind::Runtime,
            BrokerError::SessionClosed(_) => ErrorKind::Protocol,
        }
    }

    /// Message safe to show in the browser.
    ///
    /// Authentication and timeout failures share one message so a client
    /// cannot probe the remote host.
    pub fn client_message(&self) -> &'static str {
        match self {
            BrokerError::InvalidSessionId => "Invalid session",
            BrokerError::MissingCredentials => "Credentials required",
            BrokerError::InvalidDimensions(_) => "Invalid terminal dimensions",
            BrokerError::IdentityMismatch { .. } => "Invalid username",
            BrokerError::AlreadyActive(_) => "Terminal session already active",
            BrokerError::TooManySessions(_) => "Too many terminal sessions",
            BrokerError::NoActiveSession(_) => "Terminal session not active",
            BrokerError::AuthenticationFailed | BrokerError::ConnectTimeout => {
                "Authentication failed or connection timed out"
            }
            BrokerError::SessionClosed(_) => "Terminal session closed",
        }
    }
}
