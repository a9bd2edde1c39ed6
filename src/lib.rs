//! Falling-notes playback core: schedules when each note appears, sounds,
//! stops and leaves the screen, against a cancellable clock.

pub mod audio;
pub mod config;
pub mod engine;
pub mod events;
pub mod import;
pub mod keyboard;
pub mod presentation;
pub mod timing;
pub mod watch;

pub use config::Settings;
pub use engine::{EngineCommand, EngineError, EngineHandle, EngineOptions, EngineUpdate, spawn_engine};
pub use timing::{NoteEvent, NoteId, PlaybackParams, Scheduler};
