//! Events delivered to the session task.
//!
//! Transport callbacks, timers, playback completion and user commands all
//! travel through one channel, so the session state is only ever mutated by
//! one task, in arrival order.

use crate::connection::{ConnectionEvent, ConnectionId};
use crate::credentials::Credentials;

/// Operations requested through the public session handle.
#[derive(Debug)]
pub enum Command {
    SendText(String),
    SendPushToTalk { active: bool, image: Option<Vec<u8>> },
    SendAudio(Vec<u8>),
    Register(String),
    StopMeeting,
    SignIn(Credentials),
    ResetCredentials,
    Reconnect(Option<String>),
    RefreshStatus,
    AppBecameActive,
    Shutdown,
}

#[derive(Debug)]
pub enum SessionEvent {
    /// Something happened on a physical connection.
    Connection {
        id: ConnectionId,
        event: ConnectionEvent,
    },
    /// A reconnect scheduled after the link was lost; `None` reuses the last endpoint.
    Reconnect { url: Option<String> },
    /// The authentication watchdog has fired.
    AuthWatchdogExpired,
    /// The audio engine finished (or abandoned) the item started with `token`.
    PlaybackFinished { token: u64 },
    Command(Command),
}
