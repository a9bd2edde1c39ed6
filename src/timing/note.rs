use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier of a note, unique within one loaded collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoteId(String);

impl NoteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NoteId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NoteId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

pub const MAX_PITCH: u8 = 127;

/// One timed musical event. Times are seconds from the start of the piece.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteEvent {
    pub id: NoteId,
    pub pitch: u8,
    pub start_time: f64,
    pub duration: f64,
    /// 0.0 -> 1.0
    pub velocity: f64,
    #[serde(default)]
    pub track_index: usize,
    /// Display-only, defaulted by the presentation layer when absent.
    #[serde(default)]
    pub visual_x: Option<f64>,
    #[serde(default)]
    pub visual_width: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NoteError {
    #[error("pitch {0} is outside the MIDI range 0-127")]
    PitchOutOfRange(u8),
    #[error("start time must be finite and non-negative, got {0}")]
    InvalidStartTime(f64),
    #[error("duration must be finite and positive, got {0}")]
    InvalidDuration(f64),
    #[error("velocity must be within [0, 1], got {0}")]
    InvalidVelocity(f64),
}

impl NoteEvent {
    /// Checked constructor.
    pub fn new(
        id: impl Into<NoteId>,
        pitch: u8,
        start_time: f64,
        duration: f64,
        velocity: f64,
    ) -> Result<Self, NoteError> {
        let note = Self {
            id: id.into(),
            pitch,
            start_time,
            duration,
            velocity,
            track_index: 0,
            visual_x: None,
            visual_width: None,
        };
        note.validate()?;
        Ok(note)
    }

    pub fn validate(&self) -> Result<(), NoteError> {
        if self.pitch > MAX_PITCH {
            return Err(NoteError::PitchOutOfRange(self.pitch));
        }
        if !self.start_time.is_finite() || self.start_time < 0.0 {
            return Err(NoteError::InvalidStartTime(self.start_time));
        }
        if !self.duration.is_finite() || self.duration <= 0.0 {
            return Err(NoteError::InvalidDuration(self.duration));
        }
        if !(0.0..=1.0).contains(&self.velocity) {
            return Err(NoteError::InvalidVelocity(self.velocity));
        }
        Ok(())
    }

    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

/// Sorts by ascending start time, keeping input order for ties.
pub fn sort_by_start(notes: &mut [NoteEvent]) {
    notes.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));
}

/// End of the last sounding note, in piece seconds.
pub fn piece_duration(notes: &[NoteEvent]) -> f64 {
    notes.iter().map(NoteEvent::end_time).fold(0.0, f64::max)
}
