use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::NoteId;

/// Lifecycle of a spawned note. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NoteState {
    Pending,
    Visible,
    Hit,
    Retired,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveNoteRecord {
    pub note_id: NoteId,
    pub pitch: u8,
    pub state: NoteState,
    pub spawned_at: Option<f64>,
    pub hit_at: Option<f64>,
}

/// Notes that have been spawned and not yet retired.
///
/// Retired ids are remembered until the next [`reset`](Self::reset) so a late
/// report for a note that already left cannot bring it back.
#[derive(Debug, Default)]
pub struct ActiveNoteRegistry {
    records: HashMap<NoteId, ActiveNoteRecord>,
    retired: HashSet<NoteId>,
}

impl ActiveNoteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `∅ -> Pending`.
    pub fn mark_pending(&mut self, id: &NoteId, pitch: u8, at: f64) -> bool {
        if self.retired.contains(id) {
            tracing::warn!(note = %id, "pending mark for a retired note ignored");
            return false;
        }
        if self.records.contains_key(id) {
            return false;
        }
        self.records.insert(
            id.clone(),
            ActiveNoteRecord {
                note_id: id.clone(),
                pitch,
                state: NoteState::Pending,
                spawned_at: Some(at),
                hit_at: None,
            },
        );
        tracing::trace!(note = %id, at, "note pending");
        true
    }

    /// `Pending -> Visible`, creating the record when absent.
    pub fn mark_visible(&mut self, id: &NoteId, pitch: u8, at: f64) -> bool {
        if self.retired.contains(id) {
            tracing::warn!(note = %id, "visible mark for a retired note ignored");
            return false;
        }
        match self.records.get_mut(id) {
            Some(record) if record.state == NoteState::Pending => {
                record.state = NoteState::Visible;
                record.spawned_at.get_or_insert(at);
            }
            Some(record) => {
                tracing::debug!(note = %id, state = ?record.state, "note already visible or hit");
                return false;
            }
            None => {
                self.records.insert(
                    id.clone(),
                    ActiveNoteRecord {
                        note_id: id.clone(),
                        pitch,
                        state: NoteState::Visible,
                        spawned_at: Some(at),
                        hit_at: None,
                    },
                );
            }
        }
        tracing::trace!(note = %id, at, "note visible");
        true
    }

    /// `Visible -> Hit`. Returns the pitch to light up, or `None` when the
    /// note is not currently visible.
    pub fn mark_hit(&mut self, id: &NoteId, at: f64) -> Option<u8> {
        let record = self.records.get_mut(id)?;
        if record.state != NoteState::Visible {
            tracing::debug!(note = %id, state = ?record.state, "hit ignored");
            return None;
        }
        record.state = NoteState::Hit;
        record.hit_at = Some(at);
        tracing::trace!(note = %id, at, "note hit");
        Some(record.pitch)
    }

    /// Removes the record. Safe to call for notes that are already gone.
    pub fn retire(&mut self, id: &NoteId) -> bool {
        let removed = self.records.remove(id).is_some();
        if removed {
            self.retired.insert(id.clone());
            tracing::trace!(note = %id, "note retired");
        }
        removed
    }

    pub fn reset(&mut self) {
        self.records.clear();
        self.retired.clear();
    }

    pub fn state(&self, id: &NoteId) -> Option<NoteState> {
        if let Some(record) = self.records.get(id) {
            return Some(record.state);
        }
        self.retired.contains(id).then_some(NoteState::Retired)
    }

    pub fn get(&self, id: &NoteId) -> Option<&ActiveNoteRecord> {
        self.records.get(id)
    }

    pub fn visible_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.state == NoteState::Visible)
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
