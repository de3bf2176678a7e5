//! Haptic pattern generation from per-character speech timing.
//!
//! A pulse marks the onset of each new word, approximated as the first
//! non-separator character that follows a separator. The first character of an
//! utterance never pulses because nothing precedes it.

use crate::protocol::TimingMetadata;
use tracing::debug;

/// Intensity of every generated pulse.
pub const PULSE_INTENSITY: f32 = 1.0;
/// Sharpness of every generated pulse.
pub const PULSE_SHARPNESS: f32 = 1.0;

/// A single transient tap, relative to the start of playback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HapticPulse {
    pub at_ms: u64,
    pub intensity: f32,
    pub sharpness: f32,
}

impl HapticPulse {
    fn at(at_ms: u64) -> Self {
        Self {
            at_ms,
            intensity: PULSE_INTENSITY,
            sharpness: PULSE_SHARPNESS,
        }
    }
}

/// An ordered, sparse sequence of pulses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HapticPattern {
    pulses: Vec<HapticPulse>,
}

impl HapticPattern {
    pub fn pulses(&self) -> &[HapticPulse] {
        &self.pulses
    }

    pub fn is_empty(&self) -> bool {
        self.pulses.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pulses.len()
    }

    /// Pulse offsets in milliseconds.
    pub fn offsets_ms(&self) -> Vec<u64> {
        self.pulses.iter().map(|p| p.at_ms).collect()
    }
}

/// Whether a timed character separates words.
fn is_separator(character: &str) -> bool {
    !character.is_empty()
        && character
            .chars()
            .all(|c| c.is_whitespace() || matches!(c, ',' | '.' | '!' | '?' | ';' | ':'))
}

/// Derives the pulse pattern for a spoken response.
///
/// Returns an empty pattern when timing is absent, empty, or its sequences are
/// not index-aligned.
pub fn generate_pattern(timing: Option<&TimingMetadata>) -> HapticPattern {
    let Some(timing) = timing else {
        return HapticPattern::default();
    };
    if timing.characters.is_empty() {
        return HapticPattern::default();
    }
    if !timing.is_aligned() {
        debug!(
            chars = timing.characters.len(),
            starts = timing.char_start_ms.len(),
            durations = timing.char_duration_ms.len(),
            "Timing metadata is not aligned; skipping haptics"
        );
        return HapticPattern::default();
    }

    let mut after_separator = false;
    let mut pulses = Vec::new();
    for (character, &start_ms) in timing.characters.iter().zip(&timing.char_start_ms) {
        if is_separator(character) {
            after_separator = true;
            continue;
        }
        if after_separator {
            pulses.push(HapticPulse::at(start_ms));
            after_separator = false;
        }
    }

    debug!(pulses = pulses.len(), "Generated haptic pattern");
    HapticPattern { pulses }
}
