//! Client session for the Rabbithole protocol.
//!
//! A [`RabbitHole`] keeps one WebSocket connection to the server alive,
//! authenticates with stored credentials, turns server messages into chat
//! records, and plays spoken responses one at a time with word-synchronized
//! haptics. Audio output and haptic hardware are supplied by the host through
//! the [`AudioEngine`] and [`HapticEngine`] traits.

pub mod config;
pub mod connection;
pub mod credentials;
pub mod dispatcher;
pub mod events;
pub mod playback;
pub mod session;

pub use config::{ClientConfig, ConfigError};
pub use connection::{TransportError, TransportErrorKind};
pub use credentials::{CredentialStore, CredentialStoreError, Credentials, SecretBackend};
pub use playback::{AudioEngine, HapticEngine, NoHaptics, NowPlaying, PlaybackDone, PlaybackError};
pub use session::{RabbitHole, SessionSnapshot};
