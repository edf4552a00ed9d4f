//! Terminal session model.
//!
//! This module provides the session entity with its lifecycle state machine
//! and the concurrent registry that tracks every live session.

pub mod registry;
pub mod state;

pub use registry::{ExpiryReason, ReaperHandle, RegisterError, SessionRegistry};
pub use state::{
    Dimensions, EventSender, InvalidDimensions, Session, SessionEvent, SessionId, SessionInfo,
    SessionState, MAX_DIMENSION, MIN_DIMENSION,
};
