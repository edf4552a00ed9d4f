//! One WebSocket client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use protocol::{MessageCodec, TerminalCommand, TerminalEvent, Utf8Decoder};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{BridgeError, BridgeSettings};
use crate::broker::{BrokerError, ErrorKind, SessionBroker, StartRequest};
use crate::connector::{Credentials, ShellConnector};
use crate::session::{EventSender, SessionEvent, SessionId};

/// Depth of the per-client event queue.
const EVENT_QUEUE_CAPACITY: usize = 256;

/// How long a disconnecting client's writer may take to flush.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Client-facing text for an undecodable message.
const INVALID_MESSAGE: &str = "Invalid message";

/// Command dispatch for one connected client.
///
/// The session id is derived from the connection, so a client can only ever
/// address its own session.
pub struct ClientConnection<C: ShellConnector> {
    client_id: Uuid,
    session_id: SessionId,
    username: String,
    broker: Arc<SessionBroker<C>>,
    events: EventSender,
}

impl<C: ShellConnector> ClientConnection<C> {
    /// Binds a new client to its verified username.
    pub fn new(username: impl Into<String>, broker: Arc<SessionBroker<C>>, events: EventSender) -> Self {
        let client_id = Uuid::new_v4();
        Self {
            client_id,
            session_id: format!("term-{}", client_id),
            username: username.into(),
            broker,
            events,
        }
    }

    /// Returns the connection's unique id.
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    /// Returns the terminal session id owned by this client.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Returns the verified username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Dispatches one command.
    ///
    /// `start` registers its session before returning and connects in its
    /// own task, so a `close` or a disconnect read next always finds the
    /// session and can interrupt a slow connect.
    pub async fn handle_command(&self, command: TerminalCommand) {
        match command {
            TerminalCommand::Start(start) => {
                let request = StartRequest {
                    session_id: self.session_id.clone(),
                    authenticated_user: self.username.clone(),
                    credentials: Credentials::new(start.username, start.password),
                    rows: start.rows,
                    cols: start.cols,
                };
                let pending = match self.broker.prepare(request, self.events.clone()) {
                    Ok(pending) => pending,
                    Err(e) => {
                        report(&self.events, &e).await;
                        return;
                    }
                };
                let broker = Arc::clone(&self.broker);
                let events = self.events.clone();
                tokio::spawn(async move {
                    if let Err(e) = broker.open(pending).await {
                        report(&events, &e).await;
                    }
                });
            }
            TerminalCommand::Input(input) => {
                if let Err(e) = self.broker.input(&self.session_id, input.input).await {
                    report(&self.events, &e).await;
                }
            }
            TerminalCommand::Resize(resize) => {
                if let Err(e) = self
                    .broker
                    .resize(&self.session_id, resize.rows, resize.cols)
                    .await
                {
                    report(&self.events, &e).await;
                }
            }
            TerminalCommand::Close => {
                self.broker.close(&self.session_id).await;
            }
        }
    }

    /// Tells the client its message could not be decoded.
    pub async fn reject_message(&self) {
        let _ = self
            .events
            .send(SessionEvent::Error(INVALID_MESSAGE.to_string()))
            .await;
    }

    /// Closes the client's session, if any.
    pub async fn disconnect(&self) -> bool {
        self.broker.close(&self.session_id).await
    }
}

async fn report(events: &EventSender, error: &BrokerError) {
    // A session closed mid-start has already produced its `closed` event.
    if error.kind() == ErrorKind::Protocol {
        return;
    }
    debug!(error = %error, "Terminal command rejected");
    let _ = events
        .send(SessionEvent::Error(error.client_message().to_string()))
        .await;
}

/// Converts a session event into wire events.
///
/// Output passes through `decoder` so characters split across chunks come
/// out whole. `Closed` flushes whatever the decoder still holds.
pub fn to_wire_events(decoder: &mut Utf8Decoder, event: SessionEvent) -> Vec<TerminalEvent> {
    match event {
        SessionEvent::Ready { session_id } => vec![TerminalEvent::Ready { session_id }],
        SessionEvent::Output(data) => {
            let text = decoder.decode(&data);
            if text.is_empty() {
                Vec::new()
            } else {
                vec![TerminalEvent::Output { data: text }]
            }
        }
        SessionEvent::Error(message) => vec![TerminalEvent::error(message)],
        SessionEvent::Closed => {
            let rest = decoder.finish();
            let mut events = Vec::with_capacity(2);
            if !rest.is_empty() {
                events.push(TerminalEvent::Output { data: rest });
            }
            events.push(TerminalEvent::Closed);
            events
        }
    }
}

/// Extracts the verified username from an upgrade request.
fn identity_from_request(request: &Request, header: &str) -> Option<String> {
    request
        .headers()
        .get(header)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// WebSocket limits matching the codec's message size.
///
/// Oversize frames are refused while their header is read, before the
/// payload is buffered.
fn websocket_config(settings: &BridgeSettings) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(settings.max_message_bytes);
    config.max_frame_size = Some(settings.max_message_bytes);
    config
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("Unauthorized".to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

/// Runs one client connection to completion.
pub(super) async fn serve<C: ShellConnector>(
    stream: TcpStream,
    peer_addr: SocketAddr,
    broker: Arc<SessionBroker<C>>,
    settings: Arc<BridgeSettings>,
    shutdown: CancellationToken,
) -> Result<(), BridgeError> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
    }

    let mut identity = None;
    let header = settings.identity_header.as_str();
    let websocket = accept_hdr_async_with_config(
        stream,
        |request: &Request, response: Response| match identity_from_request(request, header) {
            Some(username) => {
                identity = Some(username);
                Ok(response)
            }
            None => Err(unauthorized()),
        },
        Some(websocket_config(&settings)),
    )
    .await?;
    let username = identity.ok_or(BridgeError::MissingIdentity)?;

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let client = ClientConnection::new(username, broker, events_tx);
    info!(
        client_id = %client.client_id(),
        peer = %peer_addr,
        username = %client.username(),
        "Terminal client connected"
    );

    let codec = MessageCodec::with_max_message_size(settings.max_message_bytes);
    let (sink, mut incoming) = websocket.split();
    let mut writer = tokio::spawn(write_events(sink, events_rx, codec));

    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = incoming.next() => message,
        };

        let decoded = match message {
            Some(Ok(Message::Text(text))) => codec.decode_command(&text),
            Some(Ok(Message::Binary(data))) => codec.decode_command_bytes(&data),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(WsError::Capacity(e))) => {
                debug!(client_id = %client.client_id(), error = %e, "Client message over size limit");
                client.reject_message().await;
                break;
            }
            Some(Err(e)) => {
                debug!(client_id = %client.client_id(), error = %e, "WebSocket receive error");
                break;
            }
        };

        match decoded {
            Ok(command) => client.handle_command(command).await,
            Err(e) => {
                debug!(client_id = %client.client_id(), error = %e, "Rejected client message");
                client.reject_message().await;
            }
        }
    }

    client.disconnect().await;
    let client_id = client.client_id();
    drop(client);

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        warn!(client_id = %client_id, "Event writer did not drain in time");
        writer.abort();
    }

    info!(client_id = %client_id, "Terminal client disconnected");
    Ok(())
}

/// Serializes session events onto the socket in order.
async fn write_events(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut events: mpsc::Receiver<SessionEvent>,
    codec: MessageCodec,
) {
    let mut decoder = Utf8Decoder::new();

    while let Some(event) = events.recv().await {
        for wire in to_wire_events(&mut decoder, event) {
            let text = match codec.encode_event(&wire) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to encode terminal event");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                trace!(error = %e, "WebSocket send failed");
                return;
            }
        }
    }

    let _ = sink.close().await;
}
