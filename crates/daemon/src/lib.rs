//! # HostDeck Daemon Library
//!
//! This crate provides the terminal side of the HostDeck host dashboard: it
//! opens interactive shells on the managed host on behalf of browser clients
//! and keeps them alive, bounded and cleanly torn down.
//!
//! ## Overview
//!
//! - **Session Broker**: start, input, resize and close operations with a
//!   per-session lifecycle state machine and an idle reaper
//! - **Remote Shell Connector**: SSH connection, password authentication and
//!   pty shell channel, behind a trait so tests can script it
//! - **Transport Bridge**: WebSocket server speaking the dashboard's JSON
//!   terminal protocol
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   Daemon Orchestrator                    │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │           WebSocket Bridge (one per client)        │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │   Session Broker ── Session Registry ── Reaper     │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │         Shell Connector (SSH over russh)           │  │
//! │  └────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load_default()?;
//!     config.apply_env_overrides();
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Serve clients until shutdown is requested...
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Session entity, lifecycle states and registry
//! - [`connector`]: Remote shell connector trait and SSH implementation
//! - [`broker`]: Session broker operations and idle reaper
//! - [`bridge`]: WebSocket transport bridge
//! - [`orchestrator`]: Main daemon coordinator

pub mod bridge;
pub mod broker;
pub mod config;
pub mod connector;
pub mod orchestrator;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::Config;

// Re-export session types for convenience
pub use session::{Dimensions, Session, SessionEvent, SessionId, SessionInfo, SessionState};

// Re-export connector types for convenience
pub use connector::{
    ChannelEvent, ChannelHandle, ChannelPeer, ConnectError, Credentials, ShellChannel,
    ShellConnector, ShellRequest, SshConnector,
};

// Re-export broker types for convenience
pub use broker::{
    BrokerConfig, BrokerError, ErrorKind, PendingSession, SessionBroker, StartRequest,
};

// Re-export bridge types for convenience
pub use bridge::{BridgeError, BridgeServer, BridgeSettings, ClientConnection};

// Re-export orchestrator types for convenience
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
