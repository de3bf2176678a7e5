//! Owns the physical WebSocket connection to the Rabbithole server.
//!
//! One connection is active at a time. Each connection runs in its own task
//! that reads frames, decodes their tag, and forwards [`ConnectionEvent`]s to
//! the session task. Events are stamped with a [`ConnectionId`] so anything
//! emitted by a superseded connection can be discarded.

use crate::events::SessionEvent;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use rabbithole_core::protocol::{self, ClientMessage, MessageType};
use std::fmt;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        Error as WsError,
        error::ProtocolError,
        protocol::{CloseFrame, Message, frame::coding::CloseCode},
    },
};
use tracing::{debug, error, info, instrument, warn};

/// Close reason sent when a new `connect` supersedes the current connection.
pub const RESTART_REASON: &str = "Restarting connection";
/// Close reason sent when the session shuts down.
pub const SHUTDOWN_REASON: &str = "Session closed";

/// Coarse classification of transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The socket is gone; the session reconnects on its own.
    NotConnected,
    /// The connection was torn down locally.
    Cancelled,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn from_ws(err: &WsError) -> Self {
        Self::new(classify(err), err.to_string())
    }
}

/// Maps a WebSocket error onto a [`TransportErrorKind`].
pub fn classify(err: &WsError) -> TransportErrorKind {
    use std::io::ErrorKind;
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportErrorKind::NotConnected,
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            TransportErrorKind::NotConnected
        }
        WsError::Io(io) => match io.kind() {
            ErrorKind::NotConnected
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => TransportErrorKind::NotConnected,
            _ => TransportErrorKind::Other,
        },
        _ => TransportErrorKind::Other,
    }
}

/// Best known state of the physical connection, as last reported by its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    #[default]
    Idle,
    Connecting,
    Running,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport callbacks, delivered to the session task in receive order.
#[derive(Debug)]
pub enum ConnectionEvent {
    Opened,
    /// A text frame whose tag decoded successfully.
    Data { kind: MessageType, frame: Bytes },
    Closed { reason: Option<String> },
    /// The connection failed; its task has exited.
    Failed(TransportError),
    /// A frame could not be written. The connection state is unaffected.
    SendFailed(TransportError),
}

/// Anything that can deliver outbound messages to the server.
#[cfg_attr(test, mockall::automock)]
pub trait MessageSink {
    fn send(&mut self, message: ClientMessage);
}

#[derive(Debug)]
enum Outgoing {
    Frame(String),
    Close(&'static str),
}

pub struct ConnectionManager {
    url: String,
    current_id: ConnectionId,
    outgoing: Option<mpsc::UnboundedSender<Outgoing>>,
    state: TransportState,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl ConnectionManager {
    /// Creates an idle manager for `url`. Nothing connects until [`connect`](Self::connect).
    pub fn new(url: impl Into<String>, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            url: url.into(),
            current_id: ConnectionId::default(),
            outgoing: None,
            state: TransportState::Idle,
            events,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> TransportState {
        self.state
    }

    pub fn current_id(&self) -> ConnectionId {
        self.current_id
    }

    /// Closes the current connection, if any, and opens a new one.
    ///
    /// `url` replaces the endpoint for this and every later connection.
    pub fn connect(&mut self, url: Option<String>) -> ConnectionId {
        if let Some(url) = url {
            self.url = url;
        }
        self.cancel(RESTART_REASON);

        self.current_id = ConnectionId(self.current_id.0 + 1);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_connection(
            self.current_id,
            self.url.clone(),
            rx,
            self.events.clone(),
        ));
        self.outgoing = Some(tx);
        self.state = TransportState::Connecting;
        self.current_id
    }

    /// Gracefully closes the current connection without opening another.
    pub fn close(&mut self, reason: &'static str) {
        self.cancel(reason);
        self.state = TransportState::Closed;
    }

    fn cancel(&mut self, reason: &'static str) {
        if let Some(outgoing) = self.outgoing.take() {
            if outgoing.send(Outgoing::Close(reason)).is_err() {
                debug!(id = %self.current_id, "Connection task already finished");
            }
        }
    }

    /// Applies a transport event to the connection state.
    ///
    /// Returns the event when it should reach the dispatcher, or `None` when it
    /// came from a superseded connection or reports a local cancellation. A lost
    /// link schedules a reconnect through the event channel instead of
    /// reconnecting inline.
    pub fn handle_event(
        &mut self,
        id: ConnectionId,
        event: ConnectionEvent,
    ) -> Option<ConnectionEvent> {
        if id != self.current_id {
            debug!(%id, current = %self.current_id, "Ignoring event from superseded connection");
            return None;
        }

        match &event {
            ConnectionEvent::Opened => {
                info!(%id, "Connection open");
                self.state = TransportState::Running;
            }
            ConnectionEvent::Data { .. } => {}
            ConnectionEvent::Closed { reason } => {
                info!(%id, ?reason, "Connection closed");
                self.state = TransportState::Closed;
                self.outgoing = None;
            }
            ConnectionEvent::Failed(err) => {
                self.state = TransportState::Closed;
                self.outgoing = None;
                match err.kind {
                    TransportErrorKind::Cancelled => {
                        debug!(%id, "Connection cancelled");
                        return None;
                    }
                    TransportErrorKind::NotConnected => {
                        warn!(%id, error = %err, "Connection lost. Reconnecting");
                        if self
                            .events
                            .send(SessionEvent::Reconnect { url: None })
                            .is_err()
                        {
                            debug!("Session task is gone; not reconnecting");
                        }
                    }
                    TransportErrorKind::Other => {
                        error!(%id, error = %err, "Connection failed");
                    }
                }
            }
            ConnectionEvent::SendFailed(err) => {
                warn!(%id, error = %err, "Failed to send message");
            }
        }
        Some(event)
    }

    /// Serializes and queues a message on the active connection.
    ///
    /// Failures are reported as [`ConnectionEvent::SendFailed`].
    pub fn send_message(&self, message: &ClientMessage) {
        let frame = match protocol::encode(message) {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "Dropping message that failed to encode");
                return;
            }
        };

        let delivered = self
            .outgoing
            .as_ref()
            .is_some_and(|outgoing| outgoing.send(Outgoing::Frame(frame)).is_ok());
        if !delivered {
            let err = TransportError::new(TransportErrorKind::NotConnected, "no active connection");
            let _ = self.events.send(SessionEvent::Connection {
                id: self.current_id,
                event: ConnectionEvent::SendFailed(err),
            });
        }
    }
}

impl MessageSink for ConnectionManager {
    fn send(&mut self, message: ClientMessage) {
        debug!(kind = %message.kind(), "Sending message");
        self.send_message(&message);
    }
}

/// Characters of an unparseable frame kept in the log.
const LOG_PREVIEW_CHARS: usize = 64;

fn log_preview(text: &str) -> &str {
    match text.char_indices().nth(LOG_PREVIEW_CHARS) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

/// Drives one physical connection until it closes, fails, or is cancelled.
#[instrument(name = "connection", skip_all, fields(id = %id, url = %url))]
async fn run_connection(
    id: ConnectionId,
    url: String,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let emit = |event: ConnectionEvent| {
        let _ = events.send(SessionEvent::Connection { id, event });
    };

    info!("Connecting");
    let connect = connect_async(url.as_str());
    tokio::pin!(connect);
    // Frames sent before the handshake completes are held until it does.
    let mut queued = Vec::new();
    let ws_stream = loop {
        tokio::select! {
            // Commands already waiting are applied before the handshake result.
            biased;
            command = outgoing.recv() => match command {
                Some(Outgoing::Frame(frame)) => queued.push(frame),
                Some(Outgoing::Close(reason)) => {
                    debug!(dropped = queued.len(), "Connection cancelled before the handshake completed");
                    emit(ConnectionEvent::Failed(TransportError::new(TransportErrorKind::Cancelled, reason)));
                    return;
                }
                None => {
                    emit(ConnectionEvent::Failed(TransportError::new(TransportErrorKind::Cancelled, "connection dropped")));
                    return;
                }
            },
            result = &mut connect => match result {
                Ok((stream, _response)) => break stream,
                Err(e) => {
                    let err = TransportError::from_ws(&e);
                    warn!(error = %err, undelivered = queued.len(), "Failed to connect");
                    for _ in &queued {
                        emit(ConnectionEvent::SendFailed(err.clone()));
                    }
                    emit(ConnectionEvent::Failed(err));
                    return;
                }
            },
        }
    };

    emit(ConnectionEvent::Opened);
    let (mut sink, mut stream) = ws_stream.split();

    for frame in queued {
        if let Err(e) = sink.send(Message::Text(frame.into())).await {
            emit(ConnectionEvent::SendFailed(TransportError::from_ws(&e)));
        }
    }

    loop {
        tokio::select! {
            command = outgoing.recv() => match command {
                Some(Outgoing::Frame(frame)) => {
                    if let Err(e) = sink.send(Message::Text(frame.into())).await {
                        emit(ConnectionEvent::SendFailed(TransportError::from_ws(&e)));
                    }
                }
                Some(Outgoing::Close(reason)) => {
                    info!(reason, "Closing connection");
                    let close = Message::Close(Some(CloseFrame {
                        code: CloseCode::Away,
                        reason: reason.to_string().into(),
                    }));
                    if let Err(e) = sink.send(close).await {
                        debug!(error = %e, "Failed to send close frame");
                    }
                    return;
                }
                None => {
                    debug!("Connection handle dropped");
                    let _ = sink.close().await;
                    return;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match protocol::decode_tag(text.as_bytes()) {
                    Ok(kind) => emit(ConnectionEvent::Data {
                        kind,
                        frame: Bytes::copy_from_slice(text.as_bytes()),
                    }),
                    Err(e) => warn!(
                        error = %e,
                        len = text.len(),
                        frame = %log_preview(text.as_str()),
                        "Failed to parse packet"
                    ),
                },
                Some(Ok(Message::Binary(data))) => {
                    debug!(len = data.len(), "Ignoring binary frame");
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.as_str().to_string());
                    emit(ConnectionEvent::Closed { reason });
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    emit(ConnectionEvent::Failed(TransportError::from_ws(&e)));
                    return;
                }
                None => {
                    emit(ConnectionEvent::Closed { reason: None });
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio_tungstenite::accept_async;

    async fn next_event(rx: &mut UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed")
    }

    async fn next_connection_event(
        rx: &mut UnboundedReceiver<SessionEvent>,
    ) -> (ConnectionId, ConnectionEvent) {
        match next_event(rx).await {
            SessionEvent::Connection { id, event } => (id, event),
            other => panic!("expected a connection event, got {:?}", other),
        }
    }

    async fn local_listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    #[test]
    fn test_classify_errors() {
        assert_eq!(
            classify(&WsError::ConnectionClosed),
            TransportErrorKind::NotConnected
        );
        assert_eq!(
            classify(&WsError::AlreadyClosed),
            TransportErrorKind::NotConnected
        );
        assert_eq!(
            classify(&WsError::Protocol(
                ProtocolError::ResetWithoutClosingHandshake
            )),
            TransportErrorKind::NotConnected
        );
        assert_eq!(
            classify(&WsError::Io(std::io::Error::from(
                std::io::ErrorKind::NotConnected
            ))),
            TransportErrorKind::NotConnected
        );
        assert_eq!(
            classify(&WsError::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused
            ))),
            TransportErrorKind::Other
        );
        assert_eq!(
            classify(&WsError::Io(std::io::Error::other("boom"))),
            TransportErrorKind::Other
        );
    }

    #[tokio::test]
    async fn test_receives_tagged_frames_in_order() {
        let (listener, url) = local_listener().await;
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            for frame in [
                r#"{"type":"message","data":"first"}"#,
                "not an envelope",
                r#"{"type":"meeting","data":"not a bool"}"#,
            ] {
                ws.send(Message::Text(frame.to_string().into())).await.unwrap();
            }
            ws.send(Message::Binary(vec![1, 2, 3].into())).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut manager = ConnectionManager::new(url, tx);
        let id = manager.connect(None);
        assert_eq!(manager.status(), TransportState::Connecting);

        let (event_id, event) = next_connection_event(&mut rx).await;
        assert_eq!(event_id, id);
        assert!(manager.handle_event(event_id, event).is_some());
        assert_eq!(manager.status(), TransportState::Running);

        let (_, event) = next_connection_event(&mut rx).await;
        let ConnectionEvent::Data { kind, frame } = event else {
            panic!("expected data");
        };
        assert_eq!(kind, MessageType::Text);
        assert_eq!(&frame[..], br#"{"type":"message","data":"first"}"#);

        // The garbage frame is dropped; the malformed body still carries a valid tag.
        let (_, event) = next_connection_event(&mut rx).await;
        assert!(matches!(
            event,
            ConnectionEvent::Data {
                kind: MessageType::Meeting,
                ..
            }
        ));

        let (event_id, event) = next_connection_event(&mut rx).await;
        assert!(matches!(event, ConnectionEvent::Closed { .. }));
        manager.handle_event(event_id, event);
        assert_eq!(manager.status(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_send_writes_encoded_frame() {
        let (listener, url) = local_listener().await;
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let message = ws.next().await.unwrap().unwrap();
            message.to_text().unwrap().to_string()
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut manager = ConnectionManager::new(url, tx);
        manager.connect(None);
        // Queued before the handshake completes.
        MessageSink::send(&mut manager, ClientMessage::Text("hello".to_string()));

        let received = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            received,
            protocol::encode(&ClientMessage::Text("hello".to_string())).unwrap()
        );
        let (_, event) = next_connection_event(&mut rx).await;
        assert!(matches!(event, ConnectionEvent::Opened));
    }

    #[tokio::test]
    async fn test_lost_link_schedules_exactly_one_reconnect() {
        let (listener, url) = local_listener().await;
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = accept_async(tcp).await.unwrap();
            drop(ws);
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut manager = ConnectionManager::new(url.clone(), tx);
        manager.connect(None);

        let (id, event) = next_connection_event(&mut rx).await;
        manager.handle_event(id, event);

        let (id, event) = next_connection_event(&mut rx).await;
        let forwarded = manager.handle_event(id, event).expect("failure is forwarded");
        let ConnectionEvent::Failed(err) = forwarded else {
            panic!("expected a failure");
        };
        assert_eq!(err.kind, TransportErrorKind::NotConnected);
        assert_eq!(manager.status(), TransportState::Closed);

        assert!(matches!(
            next_event(&mut rx).await,
            SessionEvent::Reconnect { url: None }
        ));
        assert!(rx.try_recv().is_err());
        assert_eq!(manager.url(), url);
    }

    #[tokio::test]
    async fn test_refused_connection_is_not_retried() {
        let (listener, url) = local_listener().await;
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut manager = ConnectionManager::new(url, tx);
        manager.connect(None);

        let (id, event) = next_connection_event(&mut rx).await;
        let Some(ConnectionEvent::Failed(err)) = manager.handle_event(id, event) else {
            panic!("expected a failure");
        };
        assert_eq!(err.kind, TransportErrorKind::Other);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_log_preview_truncates_on_char_boundary() {
        assert_eq!(log_preview("short"), "short");

        let audio = format!("{{\"audio\":\"{}\"}}", "A".repeat(10_000));
        assert_eq!(log_preview(&audio).chars().count(), LOG_PREVIEW_CHARS);

        let wide = "é".repeat(LOG_PREVIEW_CHARS + 5);
        assert_eq!(log_preview(&wide), "é".repeat(LOG_PREVIEW_CHARS));
    }

    #[tokio::test]
    async fn test_frames_queued_before_failed_handshake_are_reported() {
        let (listener, url) = local_listener().await;
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut manager = ConnectionManager::new(url, tx);
        manager.connect(None);
        manager.send_message(&ClientMessage::Text("one".to_string()));
        manager.send_message(&ClientMessage::Text("two".to_string()));

        let mut send_failures = 0;
        loop {
            let (id, event) = next_connection_event(&mut rx).await;
            match manager.handle_event(id, event) {
                Some(ConnectionEvent::SendFailed(err)) => {
                    assert_eq!(err.kind, TransportErrorKind::Other);
                    send_failures += 1;
                }
                Some(ConnectionEvent::Failed(_)) => break,
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(send_failures, 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_new_connect_supersedes_previous() {
        let (listener, url) = local_listener().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut manager = ConnectionManager::new(url, tx);

        let first = manager.connect(None);
        let second = manager.connect(None);
        assert_ne!(first, second);
        assert_eq!(manager.current_id(), second);

        assert!(manager.handle_event(first, ConnectionEvent::Opened).is_none());
        assert_eq!(manager.status(), TransportState::Connecting);

        // The first attempt is cancelled; its report is ignored.
        loop {
            let (id, event) = next_connection_event(&mut rx).await;
            if id == first {
                assert!(manager.handle_event(id, event).is_none());
                break;
            }
        }
        drop(listener);
    }

    #[tokio::test]
    async fn test_send_without_connection_reports_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new("ws://127.0.0.1:1", tx);

        manager.send_message(&ClientMessage::Meeting(false));

        let (id, event) = next_connection_event(&mut rx).await;
        assert_eq!(id, ConnectionId::default());
        let ConnectionEvent::SendFailed(err) = event else {
            panic!("expected a send failure");
        };
        assert_eq!(err.kind, TransportErrorKind::NotConnected);
        assert_eq!(manager.status(), TransportState::Idle);
    }
}
