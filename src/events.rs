use std::fmt;

use serde::{Deserialize, Serialize};

use crate::timing::NoteId;

/// Generation number of a loaded note set. Bumped on every load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    SpawnVisual,
    TriggerAudio,
    ReleaseAudio,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledAction {
    pub kind: ActionKind,
    /// Absolute clock time.
    pub fire_at: f64,
    pub note_id: NoteId,
}

/// One attack on the audio sink. Releases name the voice they end, so two
/// notes sounding the same pitch never stop each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct VoiceId(pub u64);

impl fmt::Display for VoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Identifies one spawned visual. Arrival reports hand it back so reports
/// from a superseded session can be told apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpawnTicket {
    pub session: SessionId,
    pub note_id: NoteId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisplayAttrs {
    pub pitch: u8,
    pub velocity: f64,
    pub track_index: usize,
    pub x: Option<f64>,
    pub width: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpawnRequest {
    pub ticket: SpawnTicket,
    pub display: DisplayAttrs,
    /// Seconds the visual takes to reach the target line.
    pub fall_duration: f64,
}

/// Failure reported by a collaborator. Never aborts the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("command queue is full")]
    QueueFull,
    #[error("{0}")]
    Other(String),
}
