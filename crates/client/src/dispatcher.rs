//! Interprets server messages and owns the observable session state.

use crate::connection::{MessageSink, TransportError};
use crate::credentials::{CredentialStore, Credentials};
use crate::events::SessionEvent;
use crate::playback::PlaybackQueue;
use bytes::Bytes;
use rabbithole_core::models::{Author, ChatRecord, ConnectionStatus, RecordKind, SessionState};
use rabbithole_core::protocol::{self, ClientMessage, MessageType, ServerMessage};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Body of a `logon` reply that rejects the presented credentials.
pub const AUTH_FAILURE: &str = "failure";

pub const CONNECTED_NOTICE: &str = "Connected to Rabbithole";
pub const CLOSED_NOTICE: &str = "Connection closed";
pub const ERROR_NOTICE: &str = "Unexpected error occurred";
pub const AUTHENTICATED_NOTICE: &str = "Authenticated Successfully";
pub const REGISTERED_NOTICE: &str = "Registered";

pub struct Dispatcher {
    state: SessionState,
    records: Vec<ChatRecord>,
    last_images: Vec<String>,
    credentials: CredentialStore,
    playback: PlaybackQueue,
    auto_login: bool,
    auth_timeout: Duration,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Dispatcher {
    pub fn new(
        credentials: CredentialStore,
        playback: PlaybackQueue,
        auto_login: bool,
        auth_timeout: Duration,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let state = SessionState {
            has_stored_credentials: credentials.has_credentials(),
            ..SessionState::default()
        };
        Self {
            state,
            records: Vec::new(),
            last_images: Vec::new(),
            credentials,
            playback,
            auto_login,
            auth_timeout,
            events,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn records(&self) -> &[ChatRecord] {
        &self.records
    }

    pub fn last_images(&self) -> &[String] {
        &self.last_images
    }

    pub fn playback(&self) -> &PlaybackQueue {
        &self.playback
    }

    pub fn playback_mut(&mut self) -> &mut PlaybackQueue {
        &mut self.playback
    }

    fn append(&mut self, record: ChatRecord) {
        self.records.push(record);
    }

    fn refresh_stored_credentials(&mut self) {
        self.state.has_stored_credentials = self.credentials.has_credentials();
    }

    /// Resets the state at the start of a connection attempt.
    pub fn begin_reconnect(&mut self) {
        self.state = SessionState::connecting(self.credentials.has_credentials());
    }

    pub fn on_connect(&mut self, sink: &mut dyn MessageSink) {
        self.state.connection_status = ConnectionStatus::Open;
        self.state.is_meeting_active = false;
        self.append(ChatRecord::system(CONNECTED_NOTICE));
        self.state.can_authenticate = true;

        if !self.auto_login {
            return;
        }
        if let Some(credentials) = self.credentials.load_credentials() {
            self.start_login(sink, &credentials);
        }
    }

    pub fn on_close(&mut self, reason: Option<&str>) {
        debug!(?reason, "Session closed");
        self.state.connection_status = ConnectionStatus::Closed;
        self.state.is_authenticated = false;
        self.state.can_authenticate = false;
        self.state.is_authenticating = false;
        self.append(ChatRecord::system(CLOSED_NOTICE));
    }

    pub fn on_error(&mut self, err: &TransportError) {
        warn!(error = %err, kind = ?err.kind, "Transport error");
        self.state.connection_status = ConnectionStatus::Closed;
        self.state.can_authenticate = false;
        self.append(ChatRecord::system(ERROR_NOTICE));
    }

    /// A write failed. The connection status is left to the transport callbacks.
    pub fn on_send_failed(&mut self, err: &TransportError) {
        warn!(error = %err, "Message was not delivered");
        self.append(ChatRecord::system(ERROR_NOTICE));
    }

    /// Marks the session closed without a transport callback, e.g. after a status refresh.
    pub fn mark_closed(&mut self) {
        self.state.connection_status = ConnectionStatus::Closed;
        self.state.can_authenticate = false;
    }

    /// Decodes and applies one inbound frame. Malformed bodies are dropped.
    pub fn on_data(&mut self, kind: MessageType, frame: &Bytes, sink: &mut dyn MessageSink) {
        let message = match protocol::decode_body(frame, kind) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping message with undecodable body");
                return;
            }
        };

        self.state.connection_status = ConnectionStatus::Open;
        match message {
            ServerMessage::Text(text) => {
                self.append(ChatRecord::new(Author::Remote, RecordKind::Text, text));
            }
            ServerMessage::Audio(item) => self.playback.enqueue(item),
            ServerMessage::Authenticate(reply) => {
                if reply == AUTH_FAILURE {
                    warn!("Server rejected the stored credentials");
                    self.state.is_authenticating = false;
                    self.reset_credentials();
                    return;
                }
                info!(%reply, "Authenticated");
                self.state.can_authenticate = false;
                self.state.is_authenticating = false;
                self.state.is_authenticated = true;
                self.append(ChatRecord::system(AUTHENTICATED_NOTICE));
            }
            ServerMessage::Register(registration) => {
                info!(user = %registration.user_name, "Device registered");
                let credentials = Credentials::new(registration.imei, registration.account_key);
                self.credentials.save_credentials(&credentials);
                self.refresh_stored_credentials();
                sink.send(ClientMessage::authenticate(
                    credentials.imei,
                    credentials.account_key,
                ));
                self.append(ChatRecord::system(REGISTERED_NOTICE));
            }
            ServerMessage::PushToTalk(transcript) => {
                self.append(ChatRecord::new(Author::Local, RecordKind::Audio, transcript));
            }
            ServerMessage::Long(long) => {
                let body = long.images.join("\n");
                self.last_images = long.images;
                self.append(ChatRecord::new(Author::Remote, RecordKind::Image, body));
            }
            ServerMessage::Meeting(active) => self.state.is_meeting_active = active,
        }
    }

    /// Sends an authentication request and arms the watchdog.
    pub fn start_login(&mut self, sink: &mut dyn MessageSink, credentials: &Credentials) {
        self.state.can_authenticate = false;
        self.state.is_authenticating = true;

        let events = self.events.clone();
        let timeout = self.auth_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(SessionEvent::AuthWatchdogExpired);
        });

        sink.send(ClientMessage::authenticate(
            credentials.imei.clone(),
            credentials.account_key.clone(),
        ));
    }

    /// The watchdog fires unconditionally, even when a reply already arrived.
    pub fn on_auth_watchdog(&mut self) {
        if self.state.is_authenticating {
            debug!("No authentication reply before the watchdog fired");
        }
        self.state.is_authenticating = false;
    }

    /// Stores `credentials` and logs in with them.
    pub fn sign_in(&mut self, sink: &mut dyn MessageSink, credentials: Credentials) {
        self.credentials.save_credentials(&credentials);
        self.refresh_stored_credentials();
        self.start_login(sink, &credentials);
    }

    pub fn reset_credentials(&mut self) {
        self.credentials.clear_credentials();
        self.state.has_stored_credentials = false;
    }
}
