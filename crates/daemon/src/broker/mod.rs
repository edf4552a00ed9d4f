//! Terminal session broker.
//!
//! The broker owns the session registry and drives every session through
//! its lifecycle: validate and register on `start`, open the remote shell
//! through a [`ShellConnector`], forward channel output to the client, and
//! tear down through a single idempotent close path that the client, the
//! remote side, the idle reaper and process shutdown all share.

mod error;

pub use error::{BrokerError, ErrorKind};

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connector::{ChannelEvent, ConnectError, Credentials, ShellConnector, ShellRequest};
use crate::session::{
    Dimensions, EventSender, ExpiryReason, ReaperHandle, RegisterError, Session, SessionEvent,
    SessionId, SessionInfo, SessionRegistry,
};

/// Client-facing text for a failed write.
const WRITE_FAILED: &str = "Terminal write failed";

/// Client-facing text for a failed resize.
const RESIZE_FAILED: &str = "Terminal resize failed";

/// Client-facing text for an error reported by the remote channel.
const CHANNEL_FAILED: &str = "Terminal channel error";

/// Broker settings, resolved from [`Config`].
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Managed host.
    pub host: String,
    /// SSH port on the managed host.
    pub port: u16,
    /// Deadline for connect, authenticate and channel open.
    pub connect_timeout: Duration,
    /// Sessions idle for longer than this are reaped.
    pub idle_timeout: Duration,
    /// Absolute age ceiling, if any.
    pub max_age: Option<Duration>,
    /// Reaper sweep period.
    pub reap_interval: Duration,
    /// Live session cap.
    pub max_sessions: usize,
}

impl BrokerConfig {
    /// Extracts broker settings from the daemon configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.ssh.host.clone(),
            port: config.ssh.port,
            connect_timeout: config.ssh.connect_timeout(),
            idle_timeout: config.session.idle_timeout(),
            max_age: config.session.max_age(),
            reap_interval: config.session.reap_interval(),
            max_sessions: config.session.max_sessions,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// A client's request to open a terminal.
#[derive(Debug, Clone)]
pub struct StartRequest {
    /// Id derived from the client connection.
    pub session_id: SessionId,
    /// Username the transport already verified for this client.
    pub authenticated_user: String,
    /// Credentials typed by the user for the remote host.
    pub credentials: Credentials,
    /// Requested terminal rows.
    pub rows: u32,
    /// Requested terminal columns.
    pub cols: u32,
}

/// A registered session whose remote shell is not open yet.
#[derive(Debug)]
pub struct PendingSession {
    session: Arc<Session>,
    credentials: Credentials,
}

impl PendingSession {
    /// Returns the id the session was registered under.
    pub fn session_id(&self) -> &str {
        self.session.id()
    }
}

/// Opens, drives and closes terminal sessions.
pub struct SessionBroker<C: ShellConnector> {
    connector: Arc<C>,
    registry: SessionRegistry,
    config: BrokerConfig,
}

impl<C: ShellConnector> SessionBroker<C> {
    /// Creates a broker with an empty registry.
    pub fn new(connector: Arc<C>, config: BrokerConfig) -> Self {
        Self {
            connector,
            registry: SessionRegistry::new(),
            config,
        }
    }

    /// Returns the broker settings.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Opens a remote shell for a client.
    ///
    /// Emits `Ready` on `events` once the channel is open, followed by the
    /// channel's output. Validation failures never reach the remote host.
    /// Equivalent to [`prepare`](Self::prepare) followed by
    /// [`open`](Self::open).
    pub async fn start(
        self: &Arc<Self>,
        request: StartRequest,
        events: EventSender,
    ) -> Result<SessionId, BrokerError> {
        let pending = self.prepare(request, events)?;
        self.open(pending).await
    }

    /// Validates a start request and registers its session as `Connecting`.
    ///
    /// Runs synchronously, so a `close` issued right after it always finds
    /// the session, even before [`open`](Self::open) has been polled.
    pub fn prepare(
        &self,
        request: StartRequest,
        events: EventSender,
    ) -> Result<PendingSession, BrokerError> {
        let StartRequest {
            session_id,
            authenticated_user,
            credentials,
            rows,
            cols,
        } = request;

        if session_id.trim().is_empty() {
            return Err(BrokerError::InvalidSessionId);
        }

        if credentials.username != authenticated_user {
            warn!(
                target: "security",
                session_id = %session_id,
                claimed = %credentials.username,
                authenticated = %authenticated_user,
                "Terminal start with mismatched username"
            );
            return Err(BrokerError::IdentityMismatch {
                claimed: credentials.username,
                authenticated: authenticated_user,
            });
        }

        if credentials.username.is_empty() || credentials.password.is_empty() {
            return Err(BrokerError::MissingCredentials);
        }

        let dimensions = Dimensions::new(rows, cols)?;

        let session = Arc::new(Session::new(
            session_id,
            authenticated_user,
            dimensions,
            events,
        ));
        self.registry
            .register(Arc::clone(&session), self.config.max_sessions)
            .map_err(|e| match e {
                RegisterError::AlreadyActive(id) => BrokerError::AlreadyActive(id),
                RegisterError::Full(max) => BrokerError::TooManySessions(max),
            })?;

        Ok(PendingSession {
            session,
            credentials,
        })
    }

    /// Connects a prepared session to the remote host.
    ///
    /// A close that lands before or during the connect aborts it and yields
    /// [`BrokerError::SessionClosed`]; the close path has already told the
    /// client.
    pub async fn open(self: &Arc<Self>, pending: PendingSession) -> Result<SessionId, BrokerError> {
        let PendingSession {
            session,
            credentials,
        } = pending;
        let session_id = session.id().clone();
        let dimensions = session.dimensions();

        debug!(
            session_id = %session_id,
            username = %credentials.username,
            rows = dimensions.rows,
            cols = dimensions.cols,
            "Opening terminal session"
        );

        let shell_request = ShellRequest {
            host: self.config.host.clone(),
            port: self.config.port,
            credentials,
            dimensions,
            timeout: self.config.connect_timeout,
        };
        let connected = tokio::select! {
            biased;
            _ = session.cancelled() => Err(ConnectError::Cancelled),
            result = self.connector.connect_and_open_shell(shell_request) => result,
        };

        let shell = match connected {
            Ok(shell) => shell,
            Err(ConnectError::Cancelled) => {
                debug!(session_id = %session_id, "Terminal session closed while connecting");
                return Err(BrokerError::SessionClosed(session_id));
            }
            Err(e) => {
                warn!(
                    session_id = %session_id,
                    username = %session.owner(),
                    error = %e,
                    "Failed to open terminal session"
                );
                self.registry.remove(&session_id, &session);
                if !session.abandon() {
                    return Err(BrokerError::SessionClosed(session_id));
                }
                return Err(match e {
                    ConnectError::Timeout(_) => BrokerError::ConnectTimeout,
                    _ => BrokerError::AuthenticationFailed,
                });
            }
        };

        let (channel, channel_events) = shell.into_parts();
        if let Err(channel) = session.activate(channel) {
            // Closed while the connect was resolving.
            channel.close();
            return Err(BrokerError::SessionClosed(session_id));
        }

        session
            .emit(SessionEvent::Ready {
                session_id: session_id.clone(),
            })
            .await;
        tokio::spawn(Arc::clone(self).forward(Arc::clone(&session), channel_events));

        info!(
            session_id = %session_id,
            username = %session.owner(),
            "Terminal session started"
        );
        Ok(session_id)
    }

    /// Writes client input to the session's shell.
    ///
    /// A failed write is reported to the client as an error event; the
    /// session stays up unless the channel itself closes.
    pub async fn input(&self, session_id: &str, data: impl Into<Bytes>) -> Result<(), BrokerError> {
        let session = self
            .registry
            .get(session_id)
            .ok_or_else(|| BrokerError::NoActiveSession(session_id.to_string()))?;
        let channel = session
            .active_channel()
            .ok_or_else(|| BrokerError::NoActiveSession(session_id.to_string()))?;

        session.touch();
        if let Err(e) = channel.write(data.into()).await {
            warn!(session_id = %session_id, error = %e, "Terminal write failed");
            session.emit(SessionEvent::Error(WRITE_FAILED.to_string())).await;
        }
        Ok(())
    }

    /// Changes the terminal size.
    ///
    /// Bounds are checked first. A missing or not yet active session is
    /// ignored, since resizes routinely race with disconnects.
    pub async fn resize(&self, session_id: &str, rows: u32, cols: u32) -> Result<(), BrokerError> {
        let dimensions = Dimensions::new(rows, cols)?;

        let Some(session) = self.registry.get(session_id) else {
            return Ok(());
        };
        let Some(channel) = session.active_channel() else {
            return Ok(());
        };

        session.touch();
        if let Err(e) = channel.resize(dimensions).await {
            warn!(session_id = %session_id, error = %e, "Terminal resize failed");
            session.emit(SessionEvent::Error(RESIZE_FAILED.to_string())).await;
            return Ok(());
        }
        session.set_dimensions(dimensions);

        debug!(session_id = %session_id, rows, cols, "Terminal resized");
        Ok(())
    }

    /// Closes a session. Returns false if there was nothing to close.
    pub async fn close(&self, session_id: &str) -> bool {
        match self.registry.get(session_id) {
            Some(session) => self.close_session(&session).await,
            None => false,
        }
    }

    /// Returns whether a session with this id is registered.
    pub fn has_session(&self, session_id: &str) -> bool {
        self.registry.contains(session_id)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Snapshots of every live session.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let now = Instant::now();
        self.registry
            .snapshot()
            .iter()
            .map(|session| session.info(now))
            .collect()
    }

    /// Closes every session past the idle threshold or the age ceiling.
    ///
    /// Returns the number of sessions closed.
    pub async fn sweep_idle(&self) -> usize {
        let expired = self.registry.expired(
            Instant::now(),
            self.config.idle_timeout,
            self.config.max_age,
        );

        let mut closed = 0;
        for (session, reason) in expired {
            match reason {
                ExpiryReason::Idle(idle) => info!(
                    session_id = %session.id(),
                    idle_secs = idle.as_secs(),
                    "Closing idle terminal session"
                ),
                ExpiryReason::MaxAge(age) => info!(
                    session_id = %session.id(),
                    age_secs = age.as_secs(),
                    "Closing terminal session past maximum age"
                ),
            }
            if self.close_session(&session).await {
                closed += 1;
            }
        }
        closed
    }

    /// Starts the periodic idle sweep, replacing any running one.
    pub fn start_reaper(self: &Arc<Self>) {
        let token = CancellationToken::new();
        let stop = token.clone();
        let broker = Arc::downgrade(self);
        let period = self.config.reap_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(broker) = broker.upgrade() else {
                            break;
                        };
                        let closed = broker.sweep_idle().await;
                        if closed > 0 {
                            debug!(closed, "Idle sweep closed sessions");
                        }
                    }
                }
            }
            debug!("Idle reaper stopped");
        });

        self.registry.install_reaper(ReaperHandle::new(token, task));
        debug!(interval_secs = period.as_secs(), "Started idle reaper");
    }

    /// Stops the reaper and force-closes every session.
    pub async fn cleanup(&self) {
        self.registry.stop_reaper();

        let sessions = self.registry.snapshot();
        if !sessions.is_empty() {
            info!(count = sessions.len(), "Closing all terminal sessions");
        }
        for session in sessions {
            self.close_session(&session).await;
        }
    }

    /// The one teardown path. Only the first caller for a session proceeds.
    async fn close_session(&self, session: &Arc<Session>) -> bool {
        let Some(channel) = session.begin_close() else {
            return false;
        };
        if let Some(channel) = channel {
            channel.close();
        }
        self.registry.remove(session.id(), session);
        session.finish_close();
        session.emit(SessionEvent::Closed).await;

        info!(
            session_id = %session.id(),
            username = %session.owner(),
            "Terminal session closed"
        );
        true
    }

    /// Forwards channel events to the client until the session ends.
    async fn forward(self: Arc<Self>, session: Arc<Session>, mut events: mpsc::Receiver<ChannelEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                _ = session.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Some(ChannelEvent::Data(data)) => {
                    session.emit(SessionEvent::Output(data)).await;
                }
                Some(ChannelEvent::Error(detail)) => {
                    warn!(session_id = %session.id(), error = %detail, "Terminal channel error");
                    session.emit(SessionEvent::Error(CHANNEL_FAILED.to_string())).await;
                }
                Some(ChannelEvent::Closed) | None => {
                    self.close_session(&session).await;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ChannelCommand, ChannelPeer, ShellChannel};
    use crate::session::SessionState;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, Copy)]
    enum Outcome {
        Open,
        Reject,
        Timeout,
        Hang,
    }

    /// In-memory connector; opened channels are handed to the test.
    struct ScriptedConnector {
        outcome: Mutex<Outcome>,
        requests: Mutex<Vec<ShellRequest>>,
        peers: mpsc::UnboundedSender<ChannelPeer>,
    }

    #[async_trait]
    impl ShellConnector for ScriptedConnector {
        async fn connect_and_open_shell(
            &self,
            request: ShellRequest,
        ) -> Result<ShellChannel, ConnectError> {
            self.requests.lock().push(request.clone());
            let outcome = *self.outcome.lock();
            match outcome {
                Outcome::Open => {
                    let (shell, peer) = ShellChannel::pair(64);
                    let _ = self.peers.send(peer);
                    Ok(shell)
                }
                Outcome::Reject => Err(ConnectError::AuthRejected {
                    username: request.credentials.username,
                }),
                Outcome::Timeout => Err(ConnectError::Timeout(request.timeout)),
                Outcome::Hang => std::future::pending().await,
            }
        }
    }

    struct Harness {
        broker: Arc<SessionBroker<ScriptedConnector>>,
        connector: Arc<ScriptedConnector>,
        peers: mpsc::UnboundedReceiver<ChannelPeer>,
    }

    fn test_config() -> BrokerConfig {
        BrokerConfig {
            host: "managed-host".to_string(),
            port: 2222,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(120),
            max_age: None,
            reap_interval: Duration::from_secs(60),
            max_sessions: 4,
        }
    }

    fn harness_with(outcome: Outcome, config: BrokerConfig) -> Harness {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(ScriptedConnector {
            outcome: Mutex::new(outcome),
            requests: Mutex::new(Vec::new()),
            peers: tx,
        });
        Harness {
            broker: Arc::new(SessionBroker::new(Arc::clone(&connector), config)),
            connector,
            peers: rx,
        }
    }

    fn harness(outcome: Outcome) -> Harness {
        harness_with(outcome, test_config())
    }

    fn request(id: &str, username: &str, rows: u32, cols: u32) -> StartRequest {
        StartRequest {
            session_id: id.to_string(),
            authenticated_user: "alice".to_string(),
            credentials: Credentials::new(username, "x"),
            rows,
            cols,
        }
    }

    impl Harness {
        async fn open(&mut self, id: &str) -> (mpsc::Receiver<SessionEvent>, ChannelPeer) {
            let (tx, mut rx) = mpsc::channel(64);
            let started = self
                .broker
                .start(request(id, "alice", 24, 80), tx)
                .await
                .unwrap();
            assert_eq!(started, id);
            assert_eq!(
                rx.recv().await,
                Some(SessionEvent::Ready {
                    session_id: id.to_string()
                })
            );
            let peer = self.peers.recv().await.unwrap();
            (rx, peer)
        }

        fn connect_attempts(&self) -> usize {
            self.connector.requests.lock().len()
        }

        fn info(&self, id: &str) -> SessionInfo {
            self.broker
                .sessions()
                .into_iter()
                .find(|info| info.id == id)
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_start_emits_ready_then_output_in_order() {
        let mut h = harness(Outcome::Open);
        let (mut rx, peer) = h.open("s1").await;

        assert!(h.broker.has_session("s1"));
        assert_eq!(h.broker.session_count(), 1);

        let sent = h.connector.requests.lock()[0].clone();
        assert_eq!(sent.host, "managed-host");
        assert_eq!(sent.port, 2222);
        assert_eq!(sent.credentials, Credentials::new("alice", "x"));
        assert_eq!(sent.dimensions, Dimensions::new(24, 80).unwrap());

        peer.emit(ChannelEvent::Data(Bytes::from_static(b"A"))).await;
        peer.emit(ChannelEvent::Data(Bytes::from_static(b"B"))).await;
        assert_eq!(rx.recv().await, Some(SessionEvent::Output(Bytes::from_static(b"A"))));
        assert_eq!(rx.recv().await, Some(SessionEvent::Output(Bytes::from_static(b"B"))));

        let info = h.info("s1");
        assert_eq!(info.owner, "alice");
        assert_eq!(info.state, SessionState::Active);
    }

    #[tokio::test]
    async fn test_identity_mismatch_never_connects() {
        let h = harness(Outcome::Open);
        let (tx, _rx) = mpsc::channel(8);

        let result = h.broker.start(request("s1", "bob", 24, 80), tx).await;
        assert_eq!(
            result,
            Err(BrokerError::IdentityMismatch {
                claimed: "bob".to_string(),
                authenticated: "alice".to_string(),
            })
        );
        assert_eq!(h.connect_attempts(), 0);
        assert!(!h.broker.has_session("s1"));
    }

    #[tokio::test]
    async fn test_missing_credentials_rejected() {
        let h = harness(Outcome::Open);
        let (tx, _rx) = mpsc::channel(8);

        let mut req = request("s1", "alice", 24, 80);
        req.credentials.password.clear();
        assert_eq!(
            h.broker.start(req, tx.clone()).await,
            Err(BrokerError::MissingCredentials)
        );

        let mut req = request("s1", "", 24, 80);
        req.authenticated_user.clear();
        assert_eq!(h.broker.start(req, tx).await, Err(BrokerError::MissingCredentials));

        assert_eq!(h.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_empty_session_id_rejected() {
        let h = harness(Outcome::Open);
        let (tx, _rx) = mpsc::channel(8);
        assert_eq!(
            h.broker.start(request(" ", "alice", 24, 80), tx).await,
            Err(BrokerError::InvalidSessionId)
        );
    }

    #[tokio::test]
    async fn test_start_rejects_out_of_range_dimensions() {
        let h = harness(Outcome::Open);
        for (rows, cols) in [(4, 80), (24, 4), (501, 80), (24, 501), (0, 0), (3, 1000)] {
            let (tx, _rx) = mpsc::channel(8);
            let result = h.broker.start(request("s1", "alice", rows, cols), tx).await;
            assert!(
                matches!(result, Err(BrokerError::InvalidDimensions(_))),
                "{rows}x{cols} accepted"
            );
        }
        assert_eq!(h.connect_attempts(), 0);
        assert_eq!(h.broker.session_count(), 0);
    }

    #[tokio::test]
    async fn test_start_accepts_boundary_dimensions() {
        let h = harness(Outcome::Open);
        for (i, (rows, cols)) in [(5, 5), (500, 500), (5, 500)].into_iter().enumerate() {
            let (tx, _rx) = mpsc::channel(8);
            let id = format!("s{i}");
            h.broker
                .start(request(&id, "alice", rows, cols), tx)
                .await
                .unwrap();
            let info = h.info(&id);
            assert_eq!(info.dimensions, Dimensions::new(rows, cols).unwrap());
        }
    }

    #[tokio::test]
    async fn test_duplicate_start_leaves_existing_session() {
        let mut h = harness(Outcome::Open);
        let (_rx, _peer) = h.open("s1").await;

        let (tx, _rx2) = mpsc::channel(8);
        let result = h.broker.start(request("s1", "alice", 40, 120), tx).await;
        assert_eq!(result, Err(BrokerError::AlreadyActive("s1".to_string())));

        let info = h.info("s1");
        assert_eq!(info.state, SessionState::Active);
        assert_eq!(info.dimensions, Dimensions::new(24, 80).unwrap());
        assert_eq!(h.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_session_cap() {
        let mut config = test_config();
        config.max_sessions = 1;
        let mut h = harness_with(Outcome::Open, config);
        let (_rx, _peer) = h.open("s1").await;

        let (tx, _rx2) = mpsc::channel(8);
        let result = h.broker.start(request("s2", "alice", 24, 80), tx).await;
        assert_eq!(result, Err(BrokerError::TooManySessions(1)));
        assert!(!h.broker.has_session("s2"));
    }

    #[tokio::test]
    async fn test_auth_rejection_deregisters() {
        let h = harness(Outcome::Reject);
        let (tx, mut rx) = mpsc::channel(8);

        let result = h.broker.start(request("s1", "alice", 24, 80), tx).await;
        assert_eq!(result, Err(BrokerError::AuthenticationFailed));
        assert!(!h.broker.has_session("s1"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_timeout_deregisters() {
        let h = harness(Outcome::Timeout);
        let (tx, _rx) = mpsc::channel(8);

        let result = h.broker.start(request("s1", "alice", 24, 80), tx).await;
        assert_eq!(result, Err(BrokerError::ConnectTimeout));
        assert!(!h.broker.has_session("s1"));

        // The id is free again once the failure is handled.
        *h.connector.outcome.lock() = Outcome::Open;
        let (tx, _rx) = mpsc::channel(8);
        assert!(h.broker.start(request("s1", "alice", 24, 80), tx).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut h = harness(Outcome::Open);
        let (mut rx, peer) = h.open("s1").await;

        assert!(h.broker.close("s1").await);
        assert!(!h.broker.has_session("s1"));
        assert_eq!(rx.recv().await, Some(SessionEvent::Closed));
        assert!(peer.is_shutdown());

        assert!(!h.broker.close("s1").await);
        assert!(!h.broker.close("never-existed").await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_while_connecting_aborts_start() {
        let h = harness(Outcome::Hang);
        let (tx, mut rx) = mpsc::channel(8);

        let broker = Arc::clone(&h.broker);
        let start = tokio::spawn(async move { broker.start(request("s1", "alice", 24, 80), tx).await });
        while !h.broker.has_session("s1") {
            tokio::task::yield_now().await;
        }

        assert!(h.broker.close("s1").await);
        assert_eq!(
            start.await.unwrap(),
            Err(BrokerError::SessionClosed("s1".to_string()))
        );
        assert!(!h.broker.has_session("s1"));
        assert_eq!(rx.recv().await, Some(SessionEvent::Closed));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_close_before_open_skips_connect() {
        let h = harness(Outcome::Open);
        let (tx, mut rx) = mpsc::channel(8);

        let pending = h.broker.prepare(request("s1", "alice", 24, 80), tx).unwrap();
        assert_eq!(pending.session_id(), "s1");
        assert_eq!(h.info("s1").state, SessionState::Connecting);

        assert!(h.broker.close("s1").await);
        assert_eq!(
            h.broker.open(pending).await,
            Err(BrokerError::SessionClosed("s1".to_string()))
        );
        assert_eq!(h.connect_attempts(), 0);
        assert!(!h.broker.has_session("s1"));
        assert_eq!(rx.recv().await, Some(SessionEvent::Closed));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_prepare_validates_without_registering() {
        let h = harness(Outcome::Open);
        let (tx, _rx) = mpsc::channel(8);
        assert!(matches!(
            h.broker.prepare(request("s1", "bob", 24, 80), tx.clone()),
            Err(BrokerError::IdentityMismatch { .. })
        ));
        assert!(matches!(
            h.broker.prepare(request("s1", "alice", 2, 80), tx),
            Err(BrokerError::InvalidDimensions(_))
        ));
        assert_eq!(h.broker.session_count(), 0);
    }

    #[tokio::test]
    async fn test_input_reaches_channel_in_order() {
        let mut h = harness(Outcome::Open);
        let (_rx, mut peer) = h.open("s1").await;

        h.broker.input("s1", "ls\r").await.unwrap();
        h.broker.input("s1", Bytes::from_static(b"pwd\r")).await.unwrap();

        assert_eq!(
            peer.next_command().await,
            Some(ChannelCommand::Write(Bytes::from_static(b"ls\r")))
        );
        assert_eq!(
            peer.next_command().await,
            Some(ChannelCommand::Write(Bytes::from_static(b"pwd\r")))
        );
    }

    #[tokio::test]
    async fn test_input_without_active_session() {
        let h = harness(Outcome::Hang);
        assert_eq!(
            h.broker.input("s1", "x").await,
            Err(BrokerError::NoActiveSession("s1".to_string()))
        );

        let (tx, _rx) = mpsc::channel(8);
        let broker = Arc::clone(&h.broker);
        let start = tokio::spawn(async move { broker.start(request("s1", "alice", 24, 80), tx).await });
        while !h.broker.has_session("s1") {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            h.broker.input("s1", "x").await,
            Err(BrokerError::NoActiveSession("s1".to_string()))
        );
        h.broker.close("s1").await;
        let _ = start.await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_and_resize_refresh_activity() {
        let mut h = harness(Outcome::Open);
        let (_rx, _peer) = h.open("s1").await;

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(h.info("s1").idle, Duration::from_secs(30));

        h.broker.input("s1", "x").await.unwrap();
        assert_eq!(h.info("s1").idle, Duration::ZERO);

        tokio::time::advance(Duration::from_secs(10)).await;
        h.broker.resize("s1", 30, 100).await.unwrap();
        assert_eq!(h.info("s1").idle, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_resize_updates_channel_and_dimensions() {
        let mut h = harness(Outcome::Open);
        let (_rx, mut peer) = h.open("s1").await;

        h.broker.resize("s1", 40, 132).await.unwrap();
        let dims = Dimensions::new(40, 132).unwrap();
        assert_eq!(peer.next_command().await, Some(ChannelCommand::Resize(dims)));
        assert_eq!(h.info("s1").dimensions, dims);
    }

    #[tokio::test]
    async fn test_invalid_resize_leaves_dimensions() {
        let mut h = harness(Outcome::Open);
        let (_rx, _peer) = h.open("s1").await;

        let result = h.broker.resize("s1", 3, 80).await;
        assert!(matches!(result, Err(BrokerError::InvalidDimensions(_))));
        assert_eq!(h.info("s1").dimensions, Dimensions::new(24, 80).unwrap());
    }

    #[tokio::test]
    async fn test_resize_missing_session_is_ignored() {
        let h = harness(Outcome::Open);
        assert_eq!(h.broker.resize("gone", 24, 80).await, Ok(()));
        assert!(matches!(
            h.broker.resize("gone", 2, 80).await,
            Err(BrokerError::InvalidDimensions(_))
        ));
    }

    #[tokio::test]
    async fn test_remote_close_tears_down_once() {
        let mut h = harness(Outcome::Open);
        let (mut rx, peer) = h.open("s1").await;

        peer.emit(ChannelEvent::Data(Bytes::from_static(b"bye"))).await;
        peer.emit(ChannelEvent::Closed).await;

        assert_eq!(rx.recv().await, Some(SessionEvent::Output(Bytes::from_static(b"bye"))));
        assert_eq!(rx.recv().await, Some(SessionEvent::Closed));
        assert!(!h.broker.has_session("s1"));

        // A client close racing in afterwards is a no-op.
        assert!(!h.broker.close("s1").await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_channel_tears_down() {
        let mut h = harness(Outcome::Open);
        let (mut rx, peer) = h.open("s1").await;

        drop(peer);
        assert_eq!(rx.recv().await, Some(SessionEvent::Closed));
        assert!(!h.broker.has_session("s1"));
    }

    #[tokio::test]
    async fn test_channel_error_keeps_session_alive() {
        let mut h = harness(Outcome::Open);
        let (mut rx, peer) = h.open("s1").await;

        peer.emit(ChannelEvent::Error("broken pipe on 10.0.0.5".to_string()))
            .await;
        assert_eq!(
            rx.recv().await,
            Some(SessionEvent::Error(CHANNEL_FAILED.to_string()))
        );
        assert_eq!(h.info("s1").state, SessionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_closes_idle_sessions_once() {
        let mut h = harness(Outcome::Open);
        let (mut idle_rx, _idle_peer) = h.open("idle").await;

        tokio::time::advance(Duration::from_secs(100)).await;
        let (mut busy_rx, _busy_peer) = h.open("busy").await;
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(h.broker.sweep_idle().await, 1);
        assert!(!h.broker.has_session("idle"));
        assert!(h.broker.has_session("busy"));
        assert_eq!(idle_rx.recv().await, Some(SessionEvent::Closed));

        assert_eq!(h.broker.sweep_idle().await, 0);
        assert!(idle_rx.try_recv().is_err());
        assert!(busy_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_enforces_max_age() {
        let mut config = test_config();
        config.max_age = Some(Duration::from_secs(300));
        let mut h = harness_with(Outcome::Open, config);
        let (mut rx, _peer) = h.open("s1").await;

        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(100)).await;
            h.broker.input("s1", "x").await.unwrap();
            if h.broker.sweep_idle().await > 0 {
                break;
            }
        }

        assert!(!h.broker.has_session("s1"));
        assert_eq!(rx.recv().await, Some(SessionEvent::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_closes_idle_session() {
        let mut h = harness(Outcome::Open);
        h.broker.start_reaper();
        let (mut rx, _peer) = h.open("s1").await;

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(rx.recv().await, Some(SessionEvent::Closed));
        assert!(!h.broker.has_session("s1"));

        h.broker.cleanup().await;
    }

    #[tokio::test]
    async fn test_cleanup_closes_everything() {
        let mut h = harness(Outcome::Open);
        h.broker.start_reaper();
        let (mut rx1, peer1) = h.open("s1").await;
        let (mut rx2, peer2) = h.open("s2").await;

        h.broker.cleanup().await;

        assert_eq!(h.broker.session_count(), 0);
        assert_eq!(rx1.recv().await, Some(SessionEvent::Closed));
        assert_eq!(rx2.recv().await, Some(SessionEvent::Closed));
        assert!(peer1.is_shutdown());
        assert!(peer2.is_shutdown());
    }

    #[tokio::test]
    async fn test_cleanup_not_blocked_by_stalled_client() {
        let mut h = harness(Outcome::Open);

        // `Ready` fills this client's queue and nothing ever reads it.
        let (stalled_tx, mut stalled_rx) = mpsc::channel(1);
        h.broker
            .start(request("stalled", "alice", 24, 80), stalled_tx)
            .await
            .unwrap();
        let stalled_peer = h.peers.recv().await.unwrap();
        stalled_peer
            .emit(ChannelEvent::Data(Bytes::from_static(b"more")))
            .await;

        let (mut rx, peer) = h.open("healthy").await;

        tokio::time::timeout(Duration::from_secs(5), h.broker.cleanup())
            .await
            .expect("cleanup finished");

        assert_eq!(h.broker.session_count(), 0);
        assert!(stalled_peer.is_shutdown());
        assert!(peer.is_shutdown());
        assert_eq!(rx.recv().await, Some(SessionEvent::Closed));

        // The stalled client still gets `Closed` once it reads again.
        assert_eq!(
            stalled_rx.recv().await,
            Some(SessionEvent::Ready {
                session_id: "stalled".to_string()
            })
        );
        assert_eq!(stalled_rx.recv().await, Some(SessionEvent::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_not_blocked_by_stalled_client() {
        let mut h = harness(Outcome::Open);

        let (stalled_tx, _stalled_rx) = mpsc::channel(1);
        h.broker
            .start(request("stalled", "alice", 24, 80), stalled_tx)
            .await
            .unwrap();
        let _stalled_peer = h.peers.recv().await.unwrap();
        let (mut rx, _peer) = h.open("other").await;

        tokio::time::advance(Duration::from_secs(200)).await;
        assert_eq!(h.broker.sweep_idle().await, 2);
        assert_eq!(h.broker.session_count(), 0);
        assert_eq!(rx.recv().await, Some(SessionEvent::Closed));
    }

    #[test]
    fn test_broker_config_from_config() {
        let mut config = Config::default();
        config.ssh.host = "box".to_string();
        config.session.max_age_secs = 0;

        let broker_config = BrokerConfig::from_config(&config);
        assert_eq!(broker_config.host, "box");
        assert_eq!(broker_config.port, 22);
        assert_eq!(broker_config.connect_timeout, Duration::from_secs(10));
        assert_eq!(broker_config.idle_timeout, Duration::from_secs(1800));
        assert_eq!(broker_config.max_age, None);
        assert_eq!(broker_config.max_sessions, 32);
    }
}
