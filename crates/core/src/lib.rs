//! Runtime-free building blocks of the Rabbithole client.
//!
//! - `protocol`: the tagged JSON envelope format and its two-pass decoder.
//! - `haptics`: word-onset pulse patterns derived from speech timing.
//! - `models`: the observable session state and chat log records.

pub mod haptics;
pub mod models;
pub mod protocol;

pub use models::{Author, ChatRecord, ConnectionStatus, RecordKind, SessionState};
pub use protocol::{AudioItem, ClientMessage, MessageType, ServerMessage, TimingMetadata};
