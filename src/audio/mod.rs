mod synth;
mod voice;

pub use synth::{AudioError, SynthCommand, SynthSettings, SynthSink, SynthStream, start_synth};
pub use voice::{ADSRConfig, EnvelopeState, Voice, advance_envelope, calculate_envelope};

use crate::events::{SinkError, VoiceId};

pub fn midi_to_freq(note: u8) -> f32 {
    440.0 * 2.0_f32.powf((note as f32 - 69.0) / 12.0)
}

pub fn db_to_gain(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

/// Receives note commands from the scheduler. Calling it redundantly must be
/// harmless.
pub trait AudioSink: Send + Sync {
    /// Start `pitch` at `velocity` (0..=1) for `duration` seconds, beginning
    /// `offset_from_now` seconds from now, as `voice`.
    fn attack(
        &self,
        voice: VoiceId,
        pitch: u8,
        velocity: f64,
        duration: f64,
        offset_from_now: f64,
    ) -> Result<(), SinkError>;

    /// Ends `voice` only. Unknown or finished voices are ignored.
    fn release(&self, voice: VoiceId) -> Result<(), SinkError>;

    fn release_all(&self) -> Result<(), SinkError>;
}

/// Sink for headless runs: every command becomes a log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl AudioSink for LogSink {
    fn attack(
        &self,
        voice: VoiceId,
        pitch: u8,
        velocity: f64,
        duration: f64,
        offset_from_now: f64,
    ) -> Result<(), SinkError> {
        tracing::info!(%voice, pitch, velocity, duration, offset_from_now, "attack");
        Ok(())
    }

    fn release(&self, voice: VoiceId) -> Result<(), SinkError> {
        tracing::debug!(%voice, "release");
        Ok(())
    }

    fn release_all(&self) -> Result<(), SinkError> {
        tracing::debug!("release all");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_midi_to_freq() {
        assert!((midi_to_freq(69) - 440.0).abs() < 0.01);
        assert!((midi_to_freq(60) - 261.63).abs() < 0.01);
    }

    #[test]
    fn test_db_to_gain() {
        assert_eq!(db_to_gain(0.0), 1.0);
        assert!((db_to_gain(-12.0) - 0.251).abs() < 0.001);
    }
}
