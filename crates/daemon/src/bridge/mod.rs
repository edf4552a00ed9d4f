//! WebSocket transport bridge.
//!
//! Browsers connect over WebSocket through a fronting authenticator that
//! stamps the verified username into a request header. Each connection is
//! one client with one terminal session id; JSON commands are dispatched to
//! the [`SessionBroker`](crate::broker::SessionBroker) and session events are
//! written back in order.

mod connection;
mod server;

pub use connection::{to_wire_events, ClientConnection};
pub use server::{BridgeServer, BridgeSettings};

use std::io;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors from the transport bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The listener could not be bound.
    #[error("failed to bind WebSocket listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The WebSocket upgrade failed or was rejected.
    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[from] tungstenite::Error),

    /// The upgrade request carried no verified identity.
    #[error("missing identity header")]
    MissingIdentity,

    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
