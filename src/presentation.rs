//! Visual side of a session.
//!
//! The scheduler only tells a [`VisualPresentation`] that a note is now
//! falling. How it falls is up to the implementation; it reports the landing
//! back through [`crate::timing::Scheduler::note_arrived`], at most once per
//! spawn and no earlier than the fall duration.

use std::sync::Arc;

use crossbeam::channel::Sender;

use crate::events::{SinkError, SpawnRequest, SpawnTicket};
use crate::timing::PlaybackClock;

pub const DEFAULT_NOTE_WIDTH: f64 = 20.0;
/// Horizontal nudge per track so simultaneous notes on different tracks do
/// not sit exactly on top of each other. Purely cosmetic.
pub const TRACK_NUDGE: f64 = 2.0;

pub trait VisualPresentation: Send + Sync {
    fn spawn(&self, request: SpawnRequest) -> Result<(), SinkError>;
}

/// A spawn with every display attribute resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct FallingNote {
    pub ticket: SpawnTicket,
    pub pitch: u8,
    pub track_index: usize,
    pub x: f64,
    pub width: f64,
    pub fall_duration: f64,
}

impl FallingNote {
    pub fn from_request(request: SpawnRequest) -> Self {
        let display = request.display;
        let width = display.width.unwrap_or(DEFAULT_NOTE_WIDTH);
        let x = display.x.unwrap_or_else(|| {
            display.pitch as f64 * width + display.track_index as f64 * TRACK_NUDGE
        });
        Self {
            ticket: request.ticket,
            pitch: display.pitch,
            track_index: display.track_index,
            x,
            width,
            fall_duration: request.fall_duration,
        }
    }
}

pub type ArrivalFn = Arc<dyn Fn(SpawnTicket) + Send + Sync>;

/// Animates nothing: publishes each spawn to an observer channel and reports
/// the arrival once the fall duration has elapsed on `clock`.
pub struct TimedPresentation<C> {
    clock: C,
    observer: Option<Sender<FallingNote>>,
    on_arrived: ArrivalFn,
}

impl<C: PlaybackClock + Clone + 'static> TimedPresentation<C> {
    pub fn new(clock: C, on_arrived: ArrivalFn) -> Self {
        Self {
            clock,
            observer: None,
            on_arrived,
        }
    }

    pub fn with_observer(mut self, observer: Sender<FallingNote>) -> Self {
        self.observer = Some(observer);
        self
    }
}

impl<C: PlaybackClock + Clone + 'static> VisualPresentation for TimedPresentation<C> {
    fn spawn(&self, request: SpawnRequest) -> Result<(), SinkError> {
        let note = FallingNote::from_request(request);
        let ticket = note.ticket.clone();
        let fall_duration = note.fall_duration;

        if let Some(observer) = &self.observer {
            observer
                .send(note)
                .map_err(|_| SinkError::Unavailable("presentation observer closed".into()))?;
        }

        let on_arrived = Arc::clone(&self.on_arrived);
        self.clock
            .after(fall_duration, Box::new(move || on_arrived(ticket)));
        Ok(())
    }
}
