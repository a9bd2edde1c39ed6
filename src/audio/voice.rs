use serde::{Deserialize, Serialize};

use super::midi_to_freq;
use crate::events::VoiceId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ADSRConfig {
    /// Seconds
    pub attack: f32,
    /// Seconds
    pub decay: f32,
    /// 0.0 -> 1.0
    pub sustain: f32,
    /// Seconds
    pub release: f32,
}

impl Default for ADSRConfig {
    fn default() -> Self {
        Self {
            attack: 0.005,
            decay: 0.1,
            sustain: 0.3,
            release: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeState {
    Attack { time: f32 },
    Decay { time: f32 },
    Sustain,
    Release { time: f32, from: f32 },
    Done,
}

/// One sounding note of the synth.
#[derive(Debug, Clone)]
pub struct Voice {
    pub id: VoiceId,
    pub pitch: u8,
    pub velocity: f32,
    pub envelope_state: EnvelopeState,
    pub envelope_level: f32,
    freq: f32,
    phase: f32,
    /// Samples to wait before the attack starts.
    delay: u64,
    /// Samples until the voice releases on its own.
    remaining: Option<u64>,
}

impl Voice {
    pub fn new(id: VoiceId, pitch: u8, velocity: f32, delay: u64, remaining: Option<u64>) -> Self {
        Self {
            id,
            pitch,
            velocity: velocity.clamp(0.0, 1.0),
            envelope_state: EnvelopeState::Attack { time: 0.0 },
            envelope_level: 0.0,
            freq: midi_to_freq(pitch),
            phase: 0.0,
            delay,
            remaining,
        }
    }

    pub fn release(&mut self) {
        if !matches!(
            self.envelope_state,
            EnvelopeState::Release { .. } | EnvelopeState::Done
        ) {
            self.envelope_state = EnvelopeState::Release {
                time: 0.0,
                from: self.envelope_level,
            };
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.envelope_state, EnvelopeState::Done)
    }

    pub fn is_releasing(&self) -> bool {
        matches!(self.envelope_state, EnvelopeState::Release { .. })
    }

    /// Triangle oscillator scaled by envelope and velocity.
    pub fn render_sample(&mut self, adsr: &ADSRConfig, sample_rate: f32) -> f32 {
        if self.delay > 0 {
            self.delay -= 1;
            return 0.0;
        }
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                self.remaining = None;
                self.release();
            } else {
                *remaining -= 1;
            }
        }

        let triangle = 1.0 - 4.0 * (self.phase - 0.5).abs();
        let sample = triangle * self.envelope_level * self.velocity;

        self.phase += self.freq / sample_rate;
        if self.phase >= 1.0 {
            self.phase -= 1.0;
        }
        advance_envelope(self, adsr, 1.0 / sample_rate);
        sample
    }
}

pub fn calculate_envelope(state: &EnvelopeState, adsr: &ADSRConfig) -> f32 {
    match state {
        EnvelopeState::Attack { time } => {
            if adsr.attack == 0.0 {
                1.0
            } else {
                (time / adsr.attack).min(1.0)
            }
        }
        EnvelopeState::Decay { time } => {
            let decay_progress = if adsr.decay == 0.0 {
                1.0
            } else {
                (time / adsr.decay).min(1.0)
            };
            1.0 - (1.0 - adsr.sustain) * decay_progress
        }
        EnvelopeState::Sustain => adsr.sustain,
        EnvelopeState::Release { time, from } => {
            let release_progress = if adsr.release == 0.0 {
                1.0
            } else {
                (time / adsr.release).min(1.0)
            };
            from * (1.0 - release_progress)
        }
        EnvelopeState::Done => 0.0,
    }
}

pub fn advance_envelope(voice: &mut Voice, adsr: &ADSRConfig, dt: f32) {
    match &mut voice.envelope_state {
        EnvelopeState::Attack { time } => {
            *time += dt;
            if *time >= adsr.attack {
                voice.envelope_state = EnvelopeState::Decay { time: 0.0 };
                voice.envelope_level = 1.0;
                return;
            }
        }
        EnvelopeState::Decay { time } => {
            *time += dt;
            if *time >= adsr.decay {
                voice.envelope_state = EnvelopeState::Sustain;
                voice.envelope_level = adsr.sustain;
                return;
            }
        }
        EnvelopeState::Sustain => {}
        EnvelopeState::Release { time, .. } => {
            *time += dt;
            if *time >= adsr.release {
                voice.envelope_state = EnvelopeState::Done;
                voice.envelope_level = 0.0;
                return;
            }
        }
        EnvelopeState::Done => return,
    }
    voice.envelope_level = calculate_envelope(&voice.envelope_state, adsr);
}
