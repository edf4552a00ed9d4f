//! # HostDeck Protocol Library
//!
//! Wire definitions for the real-time terminal bridge between the HostDeck
//! dashboard and the daemon.
//!
//! ## Overview
//!
//! - **Message Definitions**: commands sent by the browser and events sent back
//! - **Message Codec**: JSON text encoding with a maximum message size
//! - **UTF-8 Decoder**: incremental decoding of terminal output chunks
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   TerminalCommand / TerminalEvent       │  JSON, tagged by "type"
//! ├─────────────────────────────────────────┤
//! │             MessageCodec                │  size-limited text frames
//! ├─────────────────────────────────────────┤
//! │         Transport (WebSocket)           │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{MessageCodec, TerminalCommand, TerminalEvent};
//!
//! let codec = MessageCodec::new();
//!
//! let command = codec
//!     .decode_command(r#"{"type":"terminal:resize","rows":40,"cols":120}"#)
//!     .unwrap();
//! assert!(matches!(command, TerminalCommand::Resize(_)));
//!
//! let text = codec.encode_event(&TerminalEvent::Closed).unwrap();
//! assert_eq!(text, r#"{"type":"terminal:closed"}"#);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Command and event definitions
//! - [`codec`]: Text codec with size limits
//! - [`utf8`]: Streaming UTF-8 decoder
//! - [`error`]: Error types

pub mod codec;
pub mod error;
pub mod messages;
pub mod utf8;

pub use codec::{MessageCodec, MAX_MESSAGE_SIZE};
pub use error::{ProtocolError, Result};
pub use messages::{
    ResizeTerminal, StartTerminal, TerminalCommand, TerminalEvent, TerminalInput,
    DEFAULT_COLS, DEFAULT_ROWS,
};
pub use utf8::Utf8Decoder;
