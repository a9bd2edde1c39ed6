//! Small polyphonic synth on the default cpal output.
//!
//! The scheduler side ([`SynthSink`]) only pushes commands into a ring buffer;
//! the cpal callback drains it at the start of every buffer. Settings are
//! hot-swapped through an `ArcSwap` so the callback never blocks.

use std::sync::Arc;

use arc_swap::ArcSwap;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use ringbuf::{
    HeapProd, HeapRb,
    traits::{Consumer, Producer, Split},
};
use serde::{Deserialize, Serialize};

use super::voice::{ADSRConfig, Voice};
use super::{AudioSink, db_to_gain};
use crate::events::{SinkError, VoiceId};

const COMMAND_QUEUE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthSettings {
    pub envelope: ADSRConfig,
    pub max_polyphony: usize,
    pub volume_db: f32,
}

impl Default for SynthSettings {
    fn default() -> Self {
        Self {
            envelope: ADSRConfig::default(),
            max_polyphony: 12,
            volume_db: -12.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SynthCommand {
    NoteOn {
        voice: VoiceId,
        pitch: u8,
        velocity: f32,
        /// Seconds
        duration: f32,
        /// Seconds
        delay: f32,
    },
    NoteOff {
        voice: VoiceId,
    },
    AllNotesOff,
}

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("no output device")]
    NoDevice,
    #[error(transparent)]
    Config(#[from] cpal::DefaultStreamConfigError),
    #[error(transparent)]
    Build(#[from] cpal::BuildStreamError),
    #[error(transparent)]
    Play(#[from] cpal::PlayStreamError),
}

/// Voice allocation and mixing, independent of the output device.
pub(crate) struct Mixer {
    voices: Vec<Voice>,
    settings: Arc<ArcSwap<SynthSettings>>,
    sample_rate: f32,
}

impl Mixer {
    pub(crate) fn new(settings: Arc<ArcSwap<SynthSettings>>, sample_rate: f32) -> Self {
        Self {
            voices: Vec::with_capacity(32),
            settings,
            sample_rate,
        }
    }

    pub(crate) fn apply(&mut self, command: SynthCommand) {
        match command {
            SynthCommand::NoteOn {
                voice,
                pitch,
                velocity,
                duration,
                delay,
            } => {
                let max = self.settings.load().max_polyphony.max(1);
                self.voices.retain(|v| !v.is_done());
                while self.voices.len() >= max {
                    // steal a releasing voice first, else the oldest
                    let idx = self
                        .voices
                        .iter()
                        .position(Voice::is_releasing)
                        .unwrap_or(0);
                    self.voices.remove(idx);
                }
                let delay = (delay.max(0.0) * self.sample_rate) as u64;
                let remaining = (duration > 0.0).then(|| (duration * self.sample_rate) as u64);
                self.voices
                    .push(Voice::new(voice, pitch, velocity, delay, remaining));
            }
            SynthCommand::NoteOff { voice } => {
                // a stolen or self-released voice is simply gone
                if let Some(v) = self.voices.iter_mut().find(|v| v.id == voice) {
                    v.release();
                }
            }
            SynthCommand::AllNotesOff => {
                for voice in &mut self.voices {
                    voice.release();
                }
            }
        }
    }

    /// Fills an interleaved buffer, same signal on every channel.
    pub(crate) fn render(&mut self, data: &mut [f32], channels: usize) {
        let settings = self.settings.load();
        let gain = db_to_gain(settings.volume_db);
        for frame in data.chunks_mut(channels.max(1)) {
            let mut sample = 0.0;
            for voice in &mut self.voices {
                sample += voice.render_sample(&settings.envelope, self.sample_rate);
            }
            frame.fill(sample * gain);
        }
        self.voices.retain(|v| !v.is_done());
    }

    pub(crate) fn active_voices(&self) -> usize {
        self.voices.len()
    }
}

/// Keeps the output stream alive. Lives on the thread that created it.
pub struct SynthStream {
    _stream: cpal::Stream,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Command side of the synth, safe to hand to the scheduler.
pub struct SynthSink {
    producer: Mutex<HeapProd<SynthCommand>>,
    settings: Arc<ArcSwap<SynthSettings>>,
}

impl SynthSink {
    /// Takes effect from the next audio buffer.
    pub fn set_settings(&self, settings: SynthSettings) {
        self.settings.store(Arc::new(settings));
    }

    fn push(&self, command: SynthCommand) -> Result<(), SinkError> {
        self.producer
            .lock()
            .try_push(command)
            .map_err(|_| SinkError::QueueFull)
    }
}

impl AudioSink for SynthSink {
    fn attack(
        &self,
        voice: VoiceId,
        pitch: u8,
        velocity: f64,
        duration: f64,
        offset_from_now: f64,
    ) -> Result<(), SinkError> {
        self.push(SynthCommand::NoteOn {
            voice,
            pitch,
            velocity: velocity as f32,
            duration: duration as f32,
            delay: offset_from_now as f32,
        })
    }

    fn release(&self, voice: VoiceId) -> Result<(), SinkError> {
        self.push(SynthCommand::NoteOff { voice })
    }

    fn release_all(&self) -> Result<(), SinkError> {
        self.push(SynthCommand::AllNotesOff)
    }
}

pub fn start_synth(settings: SynthSettings) -> Result<(SynthStream, SynthSink), AudioError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(AudioError::NoDevice)?;
    let config = device.default_output_config()?;
    let stream_config: cpal::StreamConfig = config.into();

    let sample_rate = stream_config.sample_rate;
    let channels = stream_config.channels;
    tracing::info!(sample_rate, channels, "audio output opened");

    let settings = Arc::new(ArcSwap::from_pointee(settings));
    let (producer, mut consumer) = HeapRb::<SynthCommand>::new(COMMAND_QUEUE).split();
    let mut mixer = Mixer::new(settings.clone(), sample_rate as f32);

    let stream = device.build_output_stream(
        &stream_config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            while let Some(command) = consumer.try_pop() {
                mixer.apply(command);
            }
            mixer.render(data, channels as usize);
        },
        |err| tracing::error!(error = %err, "audio stream error"),
        None,
    )?;
    stream.play()?;

    Ok((
        SynthStream {
            _stream: stream,
            sample_rate,
            channels,
        },
        SynthSink {
            producer: Mutex::new(producer),
            settings,
        },
    ))
}
