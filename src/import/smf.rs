//! Standard MIDI File → note events.
//!
//! Tempo changes from every track are merged into one tempo map (format 1
//! files keep them on track 0, but nothing forces that), and every tick is
//! converted through it, so a tempo change mid-note stretches the note
//! correctly. Note-on with velocity 0 is a note-off. Overlapping notes on the
//! same (track, channel, key) are closed first-in first-out.

use std::collections::{HashMap, VecDeque};

use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};

use super::{ImportError, velocity_from_midi};
use crate::timing::{NoteEvent, NoteId};

const DEFAULT_US_PER_QN: u32 = 500_000;

/// Piecewise-linear tick → seconds mapping.
struct TempoMap {
    /// (tick, seconds at tick, seconds per tick from here on)
    segments: Vec<(u64, f64, f64)>,
}

impl TempoMap {
    fn new(smf: &Smf<'_>) -> Self {
        match smf.header.timing {
            Timing::Metrical(tpq) => {
                let tpq = tpq.as_int().max(1) as f64;
                let mut changes: Vec<(u64, u32)> = Vec::new();
                for track in &smf.tracks {
                    let mut tick = 0u64;
                    for event in track {
                        tick += event.delta.as_int() as u64;
                        if let TrackEventKind::Meta(MetaMessage::Tempo(us)) = event.kind {
                            changes.push((tick, us.as_int()));
                        }
                    }
                }
                // stable: a later track's change at the same tick wins
                changes.sort_by_key(|(tick, _)| *tick);

                let spt = |us: u32| us as f64 / 1_000_000.0 / tpq;
                let mut segments = vec![(0, 0.0, spt(DEFAULT_US_PER_QN))];
                for (tick, us) in changes {
                    let (last_tick, last_secs, last_spt) = *segments.last().unwrap_or(&(0, 0.0, 0.0));
                    let secs = last_secs + (tick - last_tick) as f64 * last_spt;
                    if tick == last_tick {
                        segments.pop();
                    }
                    segments.push((tick, secs, spt(us)));
                }
                Self { segments }
            }
            Timing::Timecode(fps, subframe) => {
                let ticks_per_sec = fps.as_f32() as f64 * subframe.max(1) as f64;
                Self {
                    segments: vec![(0, 0.0, 1.0 / ticks_per_sec)],
                }
            }
        }
    }

    fn seconds(&self, tick: u64) -> f64 {
        let idx = self
            .segments
            .partition_point(|(start, _, _)| *start <= tick)
            .saturating_sub(1);
        let (start, secs, spt) = self.segments[idx];
        secs + (tick - start) as f64 * spt
    }
}

struct Held {
    tick: u64,
    velocity: u8,
}

/// Parses raw SMF bytes into note events ordered by start time.
pub fn parse(bytes: &[u8]) -> Result<Vec<NoteEvent>, ImportError> {
    let smf = Smf::parse(bytes)?;
    let tempo = TempoMap::new(&smf);
    let mut notes = Vec::new();

    for (track_index, track) in smf.tracks.iter().enumerate() {
        let mut tick = 0u64;
        let mut held: HashMap<(u8, u8), VecDeque<Held>> = HashMap::new();
        let mut spans: Vec<(u64, u64, u8, u8)> = Vec::new();

        for event in track {
            tick += event.delta.as_int() as u64;
            let TrackEventKind::Midi { channel, message } = event.kind else {
                continue;
            };
            let channel = channel.as_int();
            match message {
                MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                    held.entry((channel, key.as_int()))
                        .or_default()
                        .push_back(Held {
                            tick,
                            velocity: vel.as_int(),
                        });
                }
                MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                    if let Some(on) = held
                        .get_mut(&(channel, key.as_int()))
                        .and_then(VecDeque::pop_front)
                    {
                        spans.push((on.tick, tick, key.as_int(), on.velocity));
                    }
                }
                _ => {}
            }
        }

        let mut dangling = 0;
        for ((_, key), queue) in held {
            for on in queue {
                dangling += 1;
                spans.push((on.tick, tick, key, on.velocity));
            }
        }
        if dangling > 0 {
            tracing::debug!(track = track_index, dangling, "closed notes left open at end of track");
        }

        spans.sort_by_key(|(start, _, key, _)| (*start, *key));
        let mut index = 0;
        for (start, end, key, velocity) in spans {
            let start_time = tempo.seconds(start);
            let duration = tempo.seconds(end) - start_time;
            if duration <= 0.0 {
                continue;
            }
            notes.push(NoteEvent {
                id: NoteId::new(format!("t{track_index}n{index}")),
                pitch: key,
                start_time,
                duration,
                velocity: velocity_from_midi(velocity),
                track_index,
                visual_x: None,
                visual_width: None,
            });
            index += 1;
        }
    }

    crate::timing::sort_by_start(&mut notes);
    tracing::debug!(notes = notes.len(), tracks = smf.tracks.len(), "parsed midi file");
    Ok(notes)
}

#[cfg(test)]
mod tests {
    use midly::{
        Format, Header, MetaMessage, MidiMessage, Smf, TrackEvent, TrackEventKind,
        num::{u4, u7, u15, u24, u28},
    };

    use super::*;

    fn midi(delta: u32, message: MidiMessage) -> TrackEvent<'static> {
        TrackEvent {
            delta: u28::new(delta),
            kind: TrackEventKind::Midi {
                channel: u4::new(0),
                message,
            },
        }
    }

    fn on(delta: u32, key: u8, vel: u8) -> TrackEvent<'static> {
        midi(delta, MidiMessage::NoteOn { key: u7::new(key), vel: u7::new(vel) })
    }

    fn off(delta: u32, key: u8) -> TrackEvent<'static> {
        midi(delta, MidiMessage::NoteOff { key: u7::new(key), vel: u7::new(0) })
    }

    fn tempo(delta: u32, us: u32) -> TrackEvent<'static> {
        TrackEvent {
            delta: u28::new(delta),
            kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(us))),
        }
    }

    fn end() -> TrackEvent<'static> {
        TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        }
    }

    fn encode(tracks: Vec<Vec<TrackEvent<'static>>>) -> Vec<u8> {
        let format = if tracks.len() > 1 { Format::Parallel } else { Format::SingleTrack };
        let smf = Smf {
            header: Header::new(format, Timing::Metrical(u15::new(480))),
            tracks,
        };
        let mut bytes = Vec::new();
        smf.write_std(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn test_default_tempo_and_velocity() {
        let bytes = encode(vec![vec![on(0, 60, 127), off(480, 60), on(480, 64, 64), on(240, 64, 0), end()]]);
        let notes = parse(&bytes).unwrap();
        assert_eq!(notes.len(), 2);

        assert_eq!(notes[0].id.as_str(), "t0n0");
        assert_eq!(notes[0].pitch, 60);
        assert_eq!(notes[0].start_time, 0.0);
        assert!((notes[0].duration - 0.5).abs() < 1e-9);
        assert_eq!(notes[0].velocity, 1.0);

        assert!((notes[1].start_time - 1.0).abs() < 1e-9);
        assert!((notes[1].duration - 0.25).abs() < 1e-9);
        assert!((notes[1].velocity - 64.0 / 127.0).abs() < 1e-9);
    }

    #[test]
    fn test_tempo_change_on_conductor_track() {
        let conductor = vec![tempo(0, 500_000), tempo(960, 250_000), end()];
        let music = vec![on(0, 60, 100), off(960, 60), on(0, 62, 100), off(960, 62), end()];
        let notes = parse(&encode(vec![conductor, music])).unwrap();

        assert_eq!(notes.len(), 2);
        assert!((notes[0].duration - 1.0).abs() < 1e-9);
        assert!((notes[1].start_time - 1.0).abs() < 1e-9);
        assert!((notes[1].duration - 0.5).abs() < 1e-9);
        assert_eq!(notes[1].track_index, 1);
    }

    #[test]
    fn test_overlapping_same_key_and_dangling() {
        let bytes = encode(vec![vec![on(0, 60, 100), on(240, 60, 90), off(240, 60), off(240, 60), on(0, 72, 50), off(0, 72), on(0, 67, 80), end()]]);
        let notes = parse(&bytes).unwrap();
        // 72 has zero length, 67 is still held at the last tick: both dropped
        let pitches: Vec<u8> = notes.iter().map(|n| n.pitch).collect();
        assert_eq!(pitches, [60, 60]);
        assert!((notes[0].duration - 0.5).abs() < 1e-9);
        assert!((notes[1].start_time - 0.25).abs() < 1e-9);
        assert!((notes[1].duration - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(matches!(parse(b"not midi"), Err(ImportError::Midi(_))));
    }
}
