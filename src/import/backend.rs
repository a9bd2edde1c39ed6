//! The file service's JSON rendition of a MIDI file.
//!
//! ```json
//! { "filename": "song.mid", "tempo": 120.0, "time_signature": "4/4",
//!   "duration": 3.5, "ticks_per_beat": 480,
//!   "tracks": [{ "track_name": "Piano", "notes": [
//!       { "note": 60, "time": 0.0, "duration": 0.5, "velocity": 100 } ] }] }
//! ```
//!
//! Times are already seconds. Notes the service could not pair with a
//! note-off come through with duration 0 and are dropped.

use serde::{Deserialize, Serialize};

use super::{DEFAULT_VELOCITY, ImportError};
use crate::timing::{NoteEvent, NoteId, sort_by_start};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MidiDocument {
    #[serde(default)]
    pub filename: String,
    /// BPM
    #[serde(default)]
    pub tempo: Option<f64>,
    #[serde(default)]
    pub time_signature: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub ticks_per_beat: Option<u32>,
    pub tracks: Vec<TrackDocument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackDocument {
    #[serde(default)]
    pub track_name: Option<String>,
    pub notes: Vec<NoteDocument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteDocument {
    pub note: u8,
    pub time: f64,
    pub duration: f64,
    /// 0-127
    #[serde(default)]
    pub velocity: Option<u8>,
}

impl MidiDocument {
    pub fn into_notes(self) -> Vec<NoteEvent> {
        let mut notes = Vec::new();
        let mut dropped = 0;
        for (track_index, track) in self.tracks.into_iter().enumerate() {
            for (index, note) in track.notes.into_iter().enumerate() {
                let velocity = note
                    .velocity
                    .map(super::velocity_from_midi)
                    .unwrap_or(DEFAULT_VELOCITY);
                let event = NoteEvent {
                    id: NoteId::new(format!("t{track_index}n{index}")),
                    pitch: note.note,
                    start_time: note.time,
                    duration: note.duration,
                    velocity,
                    track_index,
                    visual_x: None,
                    visual_width: None,
                };
                match event.validate() {
                    Ok(()) => notes.push(event),
                    Err(err) => {
                        tracing::debug!(note = %event.id, error = %err, "dropped note");
                        dropped += 1;
                    }
                }
            }
        }
        if dropped > 0 {
            tracing::warn!(file = %self.filename, dropped, "notes without a usable duration or time were dropped");
        }
        sort_by_start(&mut notes);
        notes
    }
}

pub fn parse(json: &str) -> Result<Vec<NoteEvent>, ImportError> {
    let document: MidiDocument = serde_json::from_str(json)?;
    Ok(document.into_notes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "filename": "scale.mid",
        "tempo": 120.0,
        "time_signature": "4/4",
        "duration": 2.0,
        "ticks_per_beat": 480,
        "tracks": [
            { "track_name": "Right", "notes": [
                { "note": 64, "time": 0.5, "duration": 0.5, "velocity": 127 },
                { "note": 60, "time": 0.0, "duration": 0.5, "velocity": 0 }
            ]},
            { "track_name": "Left", "notes": [
                { "note": 48, "time": 0.0, "duration": 0.0, "velocity": 90 },
                { "note": 43, "time": 1.0, "duration": 1.0 }
            ]}
        ]
    }"#;

    #[test]
    fn test_parse_backend_document() {
        let notes = parse(SAMPLE).unwrap();
        let summary: Vec<(&str, u8, usize)> = notes
            .iter()
            .map(|n| (n.id.as_str(), n.pitch, n.track_index))
            .collect();
        assert_eq!(summary, [("t0n1", 60, 0), ("t0n0", 64, 0), ("t1n1", 43, 1)]);
        assert_eq!(notes[0].velocity, 0.0);
        assert_eq!(notes[1].velocity, 1.0);
        assert_eq!(notes[2].velocity, DEFAULT_VELOCITY);
    }

    #[test]
    fn test_missing_tracks_is_an_error() {
        assert!(matches!(parse(r#"{ "filename": "x" }"#), Err(ImportError::Json(_))));
    }
}
