//! Text codec for bridge messages.
//!
//! Messages travel as single WebSocket text frames holding one JSON object.
//! Inbound messages are size-checked before parsing. The transport is
//! expected to enforce the same limit while reading frames, so an oversize
//! payload is never buffered in the first place.

use crate::error::{ProtocolError, Result};
use crate::messages::{TerminalCommand, TerminalEvent};

/// Default maximum inbound message size (64 KB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Encoder for events and decoder for commands.
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    max_message_size: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    /// Create a codec with the default size limit.
    pub fn new() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Create a codec with a custom size limit.
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    /// Returns the configured size limit.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Decode a command from a text frame.
    pub fn decode_command(&self, text: &str) -> Result<TerminalCommand> {
        self.check_size(text.len())?;
        Ok(serde_json::from_str(text)?)
    }

    /// Decode a command from a binary frame holding UTF-8 JSON.
    pub fn decode_command_bytes(&self, bytes: &[u8]) -> Result<TerminalCommand> {
        self.check_size(bytes.len())?;
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Encode an event into a text frame.
    ///
    /// Outbound events are not size-limited; terminal output is already
    /// chunked by the remote channel.
    pub fn encode_event(&self, event: &TerminalEvent) -> Result<String> {
        serde_json::to_string(event).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    fn check_size(&self, size: usize) -> Result<()> {
        if size > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        Ok(())
    }
}
