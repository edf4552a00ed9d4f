//! Terminal bridge message definitions.
//!
//! Every message is a JSON object tagged by its `type` field, mirroring the
//! event names the dashboard's socket layer uses (`terminal:start`,
//! `terminal:output`, ...).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Rows used when a start request omits them.
pub const DEFAULT_ROWS: u32 = 24;

/// Columns used when a start request omits them.
pub const DEFAULT_COLS: u32 = 80;

fn default_rows() -> u32 {
    DEFAULT_ROWS
}

fn default_cols() -> u32 {
    DEFAULT_COLS
}

/// Commands accepted from a browser client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TerminalCommand {
    /// Open a remote shell for this client.
    #[serde(rename = "terminal:start")]
    Start(StartTerminal),
    /// Keystrokes for the remote shell.
    #[serde(rename = "terminal:input")]
    Input(TerminalInput),
    /// The browser terminal changed size.
    #[serde(rename = "terminal:resize")]
    Resize(ResizeTerminal),
    /// Tear the shell down.
    #[serde(rename = "terminal:close")]
    Close,
}

/// Payload of `terminal:start`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartTerminal {
    /// Requested terminal rows.
    #[serde(default = "default_rows")]
    pub rows: u32,
    /// Requested terminal columns.
    #[serde(default = "default_cols")]
    pub cols: u32,
    /// Username claimed by the client. Must match the authenticated identity.
    #[serde(default)]
    pub username: String,
    /// Password for the remote host. Never logged.
    #[serde(default)]
    pub password: String,
}

impl fmt::Debug for StartTerminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartTerminal")
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Payload of `terminal:input`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalInput {
    /// Raw input as typed into the browser terminal.
    pub input: String,
}

/// Payload of `terminal:resize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeTerminal {
    /// New terminal rows.
    pub rows: u32,
    /// New terminal columns.
    pub cols: u32,
}

/// Events emitted to a browser client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TerminalEvent {
    /// The remote shell is open.
    #[serde(rename = "terminal:ready")]
    Ready {
        /// Identifier of the session that is now active.
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Output produced by the remote shell.
    #[serde(rename = "terminal:output")]
    Output {
        /// Decoded terminal output.
        data: String,
    },
    /// A categorical, client-safe error message.
    #[serde(rename = "terminal:error")]
    Error {
        /// Human readable message.
        error: String,
    },
    /// The session has been fully torn down.
    #[serde(rename = "terminal:closed")]
    Closed,
}

impl TerminalEvent {
    /// Shorthand for an error event.
    pub fn error(message: impl Into<String>) -> Self {
        TerminalEvent::Error {
            error: message.into(),
        }
    }
}
