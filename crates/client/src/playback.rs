//! Serialized playback of spoken responses with synchronized haptics.
//!
//! Items play strictly one at a time. While an item is playing, new arrivals
//! wait in a stack: when playback finishes, the most recently queued item plays
//! next, so fresh speech takes priority over stale speech.

use crate::events::SessionEvent;
use rabbithole_core::haptics::{HapticPattern, generate_pattern};
use rabbithole_core::protocol::AudioItem;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("audio engine failed to start: {0}")]
    AudioInit(String),
    #[error("haptic engine failed: {0}")]
    Haptics(String),
}

/// Notifies the queue that the item it was handed with has stopped playing.
///
/// The audio engine should call [`finish`](Self::finish) once playback completes
/// or is interrupted. Dropping the handle without finishing reports the same.
#[derive(Debug)]
pub struct PlaybackDone {
    token: u64,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl PlaybackDone {
    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn finish(mut self) {
        self.report();
    }

    fn report(&mut self) {
        let Some(events) = self.events.take() else {
            return;
        };
        if events
            .send(SessionEvent::PlaybackFinished { token: self.token })
            .is_err()
        {
            debug!(token = self.token, "Playback finished after session shut down");
        }
    }
}

impl Drop for PlaybackDone {
    fn drop(&mut self) {
        if self.events.is_some() {
            warn!(token = self.token, "Audio engine dropped playback handle without finishing");
            self.report();
        }
    }
}

/// Decodes and plays one audio buffer at a time.
pub trait AudioEngine: Send {
    /// Prepares `audio` for playback. Fails if the buffer cannot be decoded.
    fn load(&mut self, audio: &[u8], volume: Option<f32>) -> Result<(), PlaybackError>;
    /// Starts the loaded buffer and reports its end through `done`.
    fn play(&mut self, done: PlaybackDone);
}

/// Plays haptic patterns.
pub trait HapticEngine: Send {
    fn supports_haptics(&self) -> bool;
    /// Starts (or restarts) the underlying engine.
    fn prepare(&mut self) -> Result<(), PlaybackError>;
    /// Plays `pattern` with its offsets relative to now.
    fn start(&mut self, pattern: &HapticPattern) -> Result<(), PlaybackError>;
}

/// A haptic engine for hardware without haptics.
#[derive(Debug, Default)]
pub struct NoHaptics;

impl HapticEngine for NoHaptics {
    fn supports_haptics(&self) -> bool {
        false
    }

    fn prepare(&mut self) -> Result<(), PlaybackError> {
        Ok(())
    }

    fn start(&mut self, _pattern: &HapticPattern) -> Result<(), PlaybackError> {
        Ok(())
    }
}

/// The item currently playing and when it started.
#[derive(Debug, Clone, PartialEq)]
pub struct NowPlaying {
    pub item: Arc<AudioItem>,
    pub started_at: Instant,
}

pub struct PlaybackQueue {
    audio: Box<dyn AudioEngine>,
    haptics: Box<dyn HapticEngine>,
    volume: Option<f32>,
    pending: Vec<Arc<AudioItem>>,
    now_playing: Option<NowPlaying>,
    current_token: Option<u64>,
    next_token: u64,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl PlaybackQueue {
    pub fn new(
        audio: Box<dyn AudioEngine>,
        haptics: Box<dyn HapticEngine>,
        volume: Option<f32>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            audio,
            haptics,
            volume,
            pending: Vec::new(),
            now_playing: None,
            current_token: None,
            next_token: 0,
            events,
        }
    }

    pub fn now_playing(&self) -> Option<&NowPlaying> {
        self.now_playing.as_ref()
    }

    pub fn is_playing(&self) -> bool {
        self.current_token.is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Plays `item` now if idle, otherwise queues it.
    pub fn enqueue(&mut self, item: AudioItem) {
        if self.haptics.supports_haptics() {
            if let Err(e) = self.haptics.prepare() {
                warn!(error = %e, "There was an error creating the haptic engine");
            }
        }

        let item = Arc::new(item);
        if self.is_playing() {
            self.pending.push(item);
            debug!(pending = self.pending.len(), "Queued audio behind current item");
        } else {
            self.play_next_from(Some(item));
        }
    }

    /// Handles the audio engine's completion report for `token`.
    pub fn on_finished(&mut self, token: u64) {
        if self.current_token != Some(token) {
            debug!(token, current = ?self.current_token, "Ignoring stale playback completion");
            return;
        }
        self.current_token = None;
        self.play_next_from(None);
    }

    /// Starts `first`, or the most recently queued item, skipping items that fail to start.
    fn play_next_from(&mut self, mut first: Option<Arc<AudioItem>>) {
        while let Some(item) = first.take().or_else(|| self.pending.pop()) {
            if self.start(item) {
                return;
            }
        }
        self.now_playing = None;
    }

    fn start(&mut self, item: Arc<AudioItem>) -> bool {
        let pattern = if self.haptics.supports_haptics() {
            generate_pattern(item.timing.as_ref())
        } else {
            HapticPattern::default()
        };

        if let Err(e) = self.audio.load(&item.audio, self.volume) {
            warn!(error = %e, "Error initializing audio player");
            self.now_playing = None;
            return false;
        }

        if !pattern.is_empty() {
            if let Err(e) = self.haptics.start(&pattern) {
                warn!(error = %e, "Failed to play haptic pattern");
            }
        }

        let token = self.next_token;
        self.next_token += 1;
        self.current_token = Some(token);
        self.audio.play(PlaybackDone {
            token,
            events: Some(self.events.clone()),
        });
        info!(token, bytes = item.audio.len(), pulses = pattern.len(), "Playing audio");
        self.now_playing = Some(NowPlaying {
            item,
            started_at: Instant::now(),
        });
        true
    }
}
