//! The session actor and its public handle.
//!
//! [`RabbitHole::spawn`] starts one task that owns the connection manager,
//! the dispatcher and the playback queue. Every transport event, timer,
//! playback completion and command is applied by that task in arrival order,
//! and the resulting state is published as a [`SessionSnapshot`].

use crate::config::ClientConfig;
use crate::connection::{
    ConnectionEvent, ConnectionManager, MessageSink, SHUTDOWN_REASON, TransportState,
};
use crate::credentials::{CredentialStore, Credentials};
use crate::dispatcher::Dispatcher;
use crate::events::{Command, SessionEvent};
use crate::playback::{AudioEngine, HapticEngine, NowPlaying, PlaybackQueue};
use rabbithole_core::models::{ChatRecord, ConnectionStatus, SessionState};
use rabbithole_core::protocol::ClientMessage;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span};

/// Everything the presentation layer observes about a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub records: Vec<ChatRecord>,
    pub last_images: Vec<String>,
    pub now_playing: Option<NowPlaying>,
}

/// Handle to a running Rabbithole session.
///
/// Commands are fire-and-forget; their effects show up in the published
/// snapshot. Dropping the handle shuts the session down.
pub struct RabbitHole {
    events: mpsc::UnboundedSender<SessionEvent>,
    snapshot: watch::Receiver<SessionSnapshot>,
    credentials: CredentialStore,
    task: Option<JoinHandle<()>>,
}

impl RabbitHole {
    /// Starts a session and immediately connects to `config.url`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        config: &ClientConfig,
        credentials: CredentialStore,
        audio: Box<dyn AudioEngine>,
        haptics: Box<dyn HapticEngine>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let playback = PlaybackQueue::new(audio, haptics, config.volume, events_tx.clone());
        let dispatcher = Dispatcher::new(
            credentials.clone(),
            playback,
            config.auto_login,
            config.auth_timeout,
            events_tx.clone(),
        );
        let connection = ConnectionManager::new(config.url.clone(), events_tx.clone());

        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let runtime = SessionRuntime {
            connection,
            dispatcher,
            events: events_rx,
            snapshot: snapshot_tx,
        };

        let span = info_span!("session", url = %config.url);
        let task = tokio::spawn(runtime.run().instrument(span));

        Self {
            events: events_tx,
            snapshot: snapshot_rx,
            credentials,
            task: Some(task),
        }
    }

    /// A receiver that is notified every time the snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    fn command(&self, command: Command) {
        if self.events.send(SessionEvent::Command(command)).is_err() {
            debug!("Session is no longer running");
        }
    }

    pub fn send_text(&self, text: impl Into<String>) {
        self.command(Command::SendText(text.into()));
    }

    /// Toggles push-to-talk, optionally attaching a JPEG snapshot.
    pub fn send_ptt(&self, active: bool, image: Option<Vec<u8>>) {
        self.command(Command::SendPushToTalk { active, image });
    }

    /// Sends recorded WAV audio.
    pub fn send_audio(&self, wav: Vec<u8>) {
        self.command(Command::SendAudio(wav));
    }

    /// Redeems a registration link.
    pub fn register(&self, url: impl Into<String>) {
        self.command(Command::Register(url.into()));
    }

    /// Ends the active meeting. Does nothing unless a meeting is active on an open connection.
    pub fn stop_meeting(&self) {
        self.command(Command::StopMeeting);
    }

    pub fn sign_in(&self, imei: impl Into<String>, account_key: impl Into<String>) {
        self.command(Command::SignIn(Credentials::new(imei, account_key)));
    }

    pub fn reset_credentials(&self) {
        self.command(Command::ResetCredentials);
    }

    /// The stored credentials, if any.
    pub fn credentials(&self) -> Option<Credentials> {
        if !self.snapshot.borrow().state.has_stored_credentials {
            return None;
        }
        self.credentials.usable_credentials()
    }

    /// Reconnects, switching to `url` when given.
    pub fn reconnect(&self, url: Option<String>) {
        self.command(Command::Reconnect(url));
    }

    pub fn refresh_status(&self) {
        self.command(Command::RefreshStatus);
    }

    /// Lifecycle hook for when the host application returns to the foreground.
    pub fn app_became_active(&self) {
        self.command(Command::AppBecameActive);
    }

    /// Closes the connection and waits for the session task to finish.
    pub async fn shutdown(mut self) {
        self.command(Command::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                debug!(error = %e, "Session task did not finish cleanly");
            }
        }
    }
}

impl Drop for RabbitHole {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.events.send(SessionEvent::Command(Command::Shutdown));
        }
    }
}

struct SessionRuntime {
    connection: ConnectionManager,
    dispatcher: Dispatcher,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    snapshot: watch::Sender<SessionSnapshot>,
}

impl SessionRuntime {
    async fn run(mut self) {
        info!("Session started");
        self.reconnect(None);
        self.publish();

        while let Some(event) = self.events.recv().await {
            if !self.handle(event) {
                break;
            }
            self.publish();
        }

        self.connection.close(SHUTDOWN_REASON);
        info!("Session finished");
    }

    /// Applies one event. Returns `false` once the session should stop.
    fn handle(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Connection { id, event } => {
                if let Some(event) = self.connection.handle_event(id, event) {
                    self.dispatch(event);
                }
            }
            SessionEvent::Reconnect { url } => self.reconnect(url),
            SessionEvent::AuthWatchdogExpired => self.dispatcher.on_auth_watchdog(),
            SessionEvent::PlaybackFinished { token } => {
                self.dispatcher.playback_mut().on_finished(token)
            }
            SessionEvent::Command(Command::Shutdown) => return false,
            SessionEvent::Command(command) => self.handle_command(command),
        }
        true
    }

    fn dispatch(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened => self.dispatcher.on_connect(&mut self.connection),
            ConnectionEvent::Data { kind, frame } => {
                self.dispatcher
                    .on_data(kind, &frame, &mut self.connection)
            }
            ConnectionEvent::Closed { reason } => self.dispatcher.on_close(reason.as_deref()),
            ConnectionEvent::Failed(err) => self.dispatcher.on_error(&err),
            ConnectionEvent::SendFailed(err) => self.dispatcher.on_send_failed(&err),
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SendText(text) => self.connection.send(ClientMessage::Text(text)),
            Command::SendPushToTalk { active, image } => self
                .connection
                .send(ClientMessage::push_to_talk(active, image.as_deref())),
            Command::SendAudio(wav) => self.connection.send(ClientMessage::audio(&wav)),
            Command::Register(url) => self.connection.send(ClientMessage::Register(url)),
            Command::StopMeeting => {
                let state = self.dispatcher.state();
                if state.is_meeting_active && state.connection_status == ConnectionStatus::Open {
                    self.connection.send(ClientMessage::Meeting(false));
                } else {
                    debug!("No active meeting to stop");
                }
            }
            Command::SignIn(credentials) => {
                self.dispatcher.sign_in(&mut self.connection, credentials)
            }
            Command::ResetCredentials => self.dispatcher.reset_credentials(),
            Command::Reconnect(url) => self.reconnect(url),
            Command::RefreshStatus => match self.connection.status() {
                TransportState::Idle | TransportState::Closed => self.dispatcher.mark_closed(),
                TransportState::Connecting | TransportState::Running => {}
            },
            Command::AppBecameActive => {
                if self.connection.status() != TransportState::Running {
                    info!(status = ?self.connection.status(), "Connection not running. Reconnecting");
                    self.reconnect(None);
                }
            }
            Command::Shutdown => {}
        }
    }

    fn reconnect(&mut self, url: Option<String>) {
        self.dispatcher.begin_reconnect();
        let id = self.connection.connect(url);
        debug!(%id, url = %self.connection.url(), "Connecting");
    }

    /// Updates the published snapshot in place. Records are append-only, so
    /// only the ones added since the last publish are copied.
    fn publish(&self) {
        let state = self.dispatcher.state();
        let records = self.dispatcher.records();
        let last_images = self.dispatcher.last_images();
        let now_playing = self.dispatcher.playback().now_playing();

        self.snapshot.send_if_modified(|current| {
            let mut modified = false;
            if current.state != *state {
                current.state = state.clone();
                modified = true;
            }
            if let Some(added) = records.get(current.records.len()..) {
                if !added.is_empty() {
                    current.records.extend_from_slice(added);
                    modified = true;
                }
            }
            if current.last_images != last_images {
                current.last_images = last_images.to_vec();
                modified = true;
            }
            if current.now_playing.as_ref() != now_playing {
                current.now_playing = now_playing.cloned();
                modified = true;
            }
            modified
        });
    }
}
