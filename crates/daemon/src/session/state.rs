//! Terminal session entity.
//!
//! A [`Session`] is the state and resources of one remote shell bound to one
//! browser client. Every lifecycle transition goes through a single guarded
//! method here so that the broker never has to reason about partial states.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, trace};

use crate::connector::ChannelHandle;

/// Unique identifier for a session.
pub type SessionId = String;

/// Smallest accepted value for rows and columns.
pub const MIN_DIMENSION: u32 = 5;

/// Largest accepted value for rows and columns.
pub const MAX_DIMENSION: u32 = 500;

/// How long a `Closed` event may wait for a full client queue.
pub const CLOSED_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Terminal dimensions outside the accepted range.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("terminal dimensions {rows}x{cols} outside [5, 500]")]
pub struct InvalidDimensions {
    /// Requested rows.
    pub rows: u32,
    /// Requested columns.
    pub cols: u32,
}

/// Validated terminal size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    /// Terminal height in rows.
    pub rows: u16,
    /// Terminal width in columns.
    pub cols: u16,
}

impl Dimensions {
    /// Validates and builds a terminal size. Both values must lie in [5, 500].
    pub fn new(rows: u32, cols: u32) -> Result<Self, InvalidDimensions> {
        let range = MIN_DIMENSION..=MAX_DIMENSION;
        if !range.contains(&rows) || !range.contains(&cols) {
            return Err(InvalidDimensions { rows, cols });
        }
        // Both values are at most 500, so the narrowing is lossless.
        Ok(Self {
            rows: rows as u16,
            cols: cols as u16,
        })
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// Lifecycle state of a session.
///
/// `Connecting → Active → Closing → Closed`; `Connecting` may also move
/// straight to `Closing` (client closed mid-connect) or to `Closed`
/// (connect failed, nothing was ever handed to the client).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Authenticating and opening the remote channel.
    Connecting,
    /// Channel open, bytes flowing.
    Active,
    /// Teardown in progress.
    Closing,
    /// Terminal. The session is no longer registered.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Events a session emits towards its client's transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The channel is open.
    Ready {
        /// The now-active session.
        session_id: SessionId,
    },
    /// A chunk of remote output, in channel order.
    Output(Bytes),
    /// A client-safe error message scoped to this session.
    Error(String),
    /// The session has been fully torn down.
    Closed,
}

/// Sender half of a client's event stream.
pub type EventSender = mpsc::Sender<SessionEvent>;

/// Snapshot of a session for inspection and logging.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Session identifier.
    pub id: SessionId,
    /// Authenticated user that opened the session.
    pub owner: String,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Current terminal size.
    pub dimensions: Dimensions,
    /// Creation time as Unix seconds.
    pub created_at_unix: u64,
    /// Time since the last input or resize.
    pub idle: Duration,
}

struct SessionInner {
    state: SessionState,
    dimensions: Dimensions,
    last_activity_at: Instant,
    channel: Option<ChannelHandle>,
}

/// Event sink guarded so that nothing follows `Closed`.
struct Outbox {
    sender: EventSender,
    closed: bool,
}

/// One interactive remote shell bound to one client connection.
pub struct Session {
    id: SessionId,
    owner: String,
    created_at: Instant,
    created_at_unix: u64,
    cancel: CancellationToken,
    inner: Mutex<SessionInner>,
    outbox: tokio::sync::Mutex<Outbox>,
}

impl Session {
    /// Creates a session in the `Connecting` state.
    pub fn new(
        id: impl Into<SessionId>,
        owner: impl Into<String>,
        dimensions: Dimensions,
        events: EventSender,
    ) -> Self {
        let now = Instant::now();
        let created_at_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        Self {
            id: id.into(),
            owner: owner.into(),
            created_at: now,
            created_at_unix,
            cancel: CancellationToken::new(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Connecting,
                dimensions,
                last_activity_at: now,
                channel: None,
            }),
            outbox: tokio::sync::Mutex::new(Outbox {
                sender: events,
                closed: false,
            }),
        }
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the authenticated user that owns the session.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Returns the current terminal size.
    pub fn dimensions(&self) -> Dimensions {
        self.inner.lock().dimensions
    }

    /// Returns when the session last saw input or a resize.
    pub fn last_activity_at(&self) -> Instant {
        self.inner.lock().last_activity_at
    }

    /// Returns when the session was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Time elapsed since the last activity, as of `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity_at())
    }

    /// Time elapsed since creation, as of `now`.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Marks the session as used right now.
    pub fn touch(&self) {
        self.inner.lock().last_activity_at = Instant::now();
    }

    /// Records a new terminal size and refreshes activity.
    pub fn set_dimensions(&self, dimensions: Dimensions) {
        let mut inner = self.inner.lock();
        inner.dimensions = dimensions;
        inner.last_activity_at = Instant::now();
    }

    /// Returns the channel if the session is `Active`.
    pub fn active_channel(&self) -> Option<ChannelHandle> {
        let inner = self.inner.lock();
        match inner.state {
            SessionState::Active => inner.channel.clone(),
            _ => None,
        }
    }

    /// `Connecting → Active`, taking ownership of the channel.
    ///
    /// Hands the channel back if the session left `Connecting` meanwhile
    /// (closed while the connect was in flight).
    pub fn activate(&self, channel: ChannelHandle) -> Result<(), ChannelHandle> {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Connecting {
            return Err(channel);
        }
        inner.state = SessionState::Active;
        inner.channel = Some(channel);
        inner.last_activity_at = Instant::now();
        Ok(())
    }

    /// `Connecting → Closed` after a failed connect. Returns false if the
    /// session had already left `Connecting`.
    ///
    /// The caller deregisters the session first, so a `Closed` session is
    /// never visible in the registry.
    pub fn abandon(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Connecting {
            return false;
        }
        inner.state = SessionState::Closed;
        true
    }

    /// `Connecting | Active → Closing`.
    ///
    /// Returns `None` if a close is already underway or done. Otherwise
    /// returns the channel to tear down (absent while still connecting) and
    /// cancels any in-flight connect.
    pub fn begin_close(&self) -> Option<Option<ChannelHandle>> {
        let channel = {
            let mut inner = self.inner.lock();
            match inner.state {
                SessionState::Connecting | SessionState::Active => {
                    inner.state = SessionState::Closing;
                    inner.channel.take()
                }
                SessionState::Closing | SessionState::Closed => return None,
            }
        };
        self.cancel.cancel();
        Some(channel)
    }

    /// `Closing → Closed`.
    pub fn finish_close(&self) {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Closing {
            inner.state = SessionState::Closed;
        }
    }

    /// Resolves once a close has started.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Sends an event to the client.
    ///
    /// Events after `Closed` are dropped. Ordinary events wait for queue
    /// space, but give up once a close has started. `Closed` never waits:
    /// when the queue is full it is handed to a background task that
    /// delivers it once the client catches up, or drops it after
    /// [`CLOSED_DELIVERY_TIMEOUT`]. Returns false when the event was dropped
    /// or the client is gone.
    pub async fn emit(&self, event: SessionEvent) -> bool {
        let mut outbox = self.outbox.lock().await;
        if outbox.closed {
            return false;
        }
        if matches!(event, SessionEvent::Closed) {
            outbox.closed = true;
            return self.deliver_closed(&outbox.sender);
        }

        let sent = tokio::select! {
            biased;
            sent = outbox.sender.send(event) => sent.is_ok(),
            _ = self.cancel.cancelled() => {
                trace!(session_id = %self.id, "Dropped event for a closing session");
                return false;
            }
        };
        if !sent {
            trace!(session_id = %self.id, "Client event receiver dropped");
        }
        sent
    }

    fn deliver_closed(&self, sender: &EventSender) -> bool {
        match sender.try_send(SessionEvent::Closed) {
            Ok(()) => true,
            Err(TrySendError::Closed(_)) => {
                trace!(session_id = %self.id, "Client event receiver dropped");
                false
            }
            Err(TrySendError::Full(event)) => {
                let sender = sender.clone();
                let session_id = self.id.clone();
                tokio::spawn(async move {
                    if sender.send_timeout(event, CLOSED_DELIVERY_TIMEOUT).await.is_err() {
                        debug!(session_id = %session_id, "Gave up delivering closed event to a stalled client");
                    }
                });
                true
            }
        }
    }

    /// Returns a snapshot of the session as of `now`.
    pub fn info(&self, now: Instant) -> SessionInfo {
        let inner = self.inner.lock();
        SessionInfo {
            id: self.id.clone(),
            owner: self.owner.clone(),
            state: inner.state,
            dimensions: inner.dimensions,
            created_at_unix: self.created_at_unix,
            idle: now.saturating_duration_since(inner.last_activity_at),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("state", &self.state())
            .finish()
    }
}
