use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use crossterm::event::{KeyCode, KeyEvent, KeyEventKind};

use crate::events::SinkError;

pub const TARGET_KEYS: [char; 8] = ['a', 's', 'd', 'f', 'j', 'k', 'l', ';'];
const RECENT_FLASHES: usize = 8;

/// Lights a key when a note lands on it.
pub trait KeyboardDisplay: Send + Sync {
    fn flash(&self, pitch: u8) -> Result<(), SinkError>;
}

/// Pressed / released state of the tracked keys, plus the pitches most
/// recently flashed by arriving notes.
#[derive(Debug, Clone)]
pub struct KeyStates {
    pressed: BTreeMap<char, Option<Instant>>,
    recent: VecDeque<u8>,
}

impl Default for KeyStates {
    fn default() -> Self {
        Self::new(TARGET_KEYS)
    }
}

impl KeyStates {
    pub fn new(keys: impl IntoIterator<Item = char>) -> Self {
        Self {
            pressed: keys
                .into_iter()
                .map(|k| (k.to_ascii_lowercase(), None))
                .collect(),
            recent: VecDeque::with_capacity(RECENT_FLASHES),
        }
    }

    /// Returns `true` if the state of a tracked key changed.
    pub fn update(&mut self, key: char, is_pressed: bool) -> bool {
        let key = key.to_ascii_lowercase();
        let Some(state) = self.pressed.get_mut(&key) else {
            return false;
        };
        if state.is_some() == is_pressed {
            return false;
        }
        *state = is_pressed.then(Instant::now);
        true
    }

    /// Auto-repeat events are ignored.
    pub fn handle_key_event(&mut self, event: &KeyEvent) -> bool {
        let KeyCode::Char(c) = event.code else {
            return false;
        };
        match event.kind {
            KeyEventKind::Press => self.update(c, true),
            KeyEventKind::Release => self.update(c, false),
            KeyEventKind::Repeat => false,
        }
    }

    /// Releases keys held longer than `hold`. For terminals that never report
    /// key releases.
    pub fn release_stale(&mut self, now: Instant, hold: Duration) -> usize {
        let mut released = 0;
        for state in self.pressed.values_mut() {
            if let Some(at) = *state {
                if now.saturating_duration_since(at) >= hold {
                    *state = None;
                    released += 1;
                }
            }
        }
        released
    }

    pub fn is_pressed(&self, key: char) -> bool {
        matches!(self.pressed.get(&key.to_ascii_lowercase()), Some(Some(_)))
    }

    pub fn keys(&self) -> impl Iterator<Item = (char, bool)> + '_ {
        self.pressed.iter().map(|(k, v)| (*k, v.is_some()))
    }

    pub fn record_flash(&mut self, pitch: u8) {
        if self.recent.len() == RECENT_FLASHES {
            self.recent.pop_front();
        }
        self.recent.push_back(pitch);
    }

    pub fn recent_flashes(&self) -> impl Iterator<Item = u8> + '_ {
        self.recent.iter().copied()
    }
}
