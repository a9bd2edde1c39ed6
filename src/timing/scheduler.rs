//! Turns a note set into spawn / attack / release timers on a [`PlaybackClock`].
//!
//! Every timer the scheduler registers has an entry in its pending table. A
//! timer only does anything if it can still remove its own entry, so once
//! [`Scheduler::cancel`] has emptied the table nothing from the old session can
//! act, whatever the clock does.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::clock::{CancelHandle, PlaybackClock};
use super::note::{NoteError, NoteEvent, NoteId, sort_by_start};
use super::registry::ActiveNoteRegistry;
use crate::audio::AudioSink;
use crate::events::{
    ActionKind, DisplayAttrs, ScheduledAction, SessionId, SpawnRequest, SpawnTicket, VoiceId,
};
use crate::keyboard::KeyboardDisplay;
use crate::presentation::VisualPresentation;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackParams {
    /// Divides every time. 2.0 plays twice as fast.
    pub speed_factor: f64,
    /// Seconds a visual appears before its note sounds.
    pub lead_time: f64,
}

impl Default for PlaybackParams {
    fn default() -> Self {
        Self {
            speed_factor: 1.0,
            lead_time: 0.5,
        }
    }
}

/// Derived times for one note under a set of [`PlaybackParams`], in seconds
/// from the session origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoteTiming {
    pub spawn_time: f64,
    pub audio_time: f64,
    pub adjusted_duration: f64,
}

impl NoteTiming {
    pub fn release_time(&self) -> f64 {
        self.audio_time + self.adjusted_duration
    }
}

impl PlaybackParams {
    pub fn new(speed_factor: f64, lead_time: f64) -> Self {
        Self {
            speed_factor,
            lead_time,
        }
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        if !self.speed_factor.is_finite() || self.speed_factor <= 0.0 {
            return Err(ScheduleError::InvalidSpeedFactor(self.speed_factor));
        }
        if !self.lead_time.is_finite() || self.lead_time < 0.0 {
            return Err(ScheduleError::InvalidLeadTime(self.lead_time));
        }
        Ok(())
    }

    pub fn timing(&self, note: &NoteEvent) -> NoteTiming {
        self.timing_from(note, 0.0)
    }

    /// Timing for a session that starts `position` piece-seconds into the
    /// song. Only meaningful for notes starting at or after `position`.
    pub fn timing_from(&self, note: &NoteEvent, position: f64) -> NoteTiming {
        let audio_time = (note.start_time - position) / self.speed_factor;
        NoteTiming {
            spawn_time: (audio_time - self.lead_time).max(0.0),
            audio_time,
            adjusted_duration: note.duration / self.speed_factor,
        }
    }
}

/// Cosmetic knobs handed to the presentation; they never move audio.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresentationParams {
    /// Fall duration is the adjusted note duration times this.
    pub visual_speed: f64,
    /// Seconds a hit note stays in the registry before it is retired.
    pub hit_linger: f64,
}

impl Default for PresentationParams {
    fn default() -> Self {
        Self {
            visual_speed: 2.0,
            hit_linger: 0.15,
        }
    }
}

impl PresentationParams {
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if !self.visual_speed.is_finite() || self.visual_speed <= 0.0 {
            return Err(ScheduleError::InvalidVisualSpeed(self.visual_speed));
        }
        if !self.hit_linger.is_finite() || self.hit_linger < 0.0 {
            return Err(ScheduleError::InvalidHitLinger(self.hit_linger));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScheduleError {
    #[error("speed factor must be finite and positive, got {0}")]
    InvalidSpeedFactor(f64),
    #[error("lead time must be finite and non-negative, got {0}")]
    InvalidLeadTime(f64),
    #[error("visual speed must be finite and positive, got {0}")]
    InvalidVisualSpeed(f64),
    #[error("hit linger must be finite and non-negative, got {0}")]
    InvalidHitLinger(f64),
    #[error("start position must be finite and non-negative, got {0}")]
    InvalidPosition(f64),
    #[error("note {id} is invalid: {source}")]
    InvalidNote {
        id: NoteId,
        #[source]
        source: NoteError,
    },
    #[error("note id {0} appears more than once")]
    DuplicateNoteId(NoteId),
}

/// The three parties the scheduler talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub audio: Arc<dyn AudioSink>,
    pub visual: Arc<dyn VisualPresentation>,
    pub keyboard: Arc<dyn KeyboardDisplay>,
}

enum Job {
    Spawn {
        note: Arc<NoteEvent>,
        ticket: SpawnTicket,
        fall_duration: f64,
    },
    Attack {
        note: Arc<NoteEvent>,
        voice: VoiceId,
        duration: f64,
    },
    Release {
        note: Arc<NoteEvent>,
        voice: VoiceId,
    },
    Retire {
        note_id: NoteId,
    },
}

impl Job {
    fn action(&self, fire_at: f64) -> Option<ScheduledAction> {
        let (kind, note_id) = match self {
            Job::Spawn { note, .. } => (ActionKind::SpawnVisual, &note.id),
            Job::Attack { note, .. } => (ActionKind::TriggerAudio, &note.id),
            Job::Release { note, .. } => (ActionKind::ReleaseAudio, &note.id),
            Job::Retire { .. } => return None,
        };
        Some(ScheduledAction {
            kind,
            fire_at,
            note_id: note_id.clone(),
        })
    }
}

struct PendingJob {
    handle: CancelHandle,
    fire_at: f64,
    job: Job,
}

#[derive(Default)]
struct PendingTable {
    next_key: u64,
    jobs: HashMap<u64, PendingJob>,
}

struct Shared<C> {
    clock: C,
    collaborators: Collaborators,
    registry: Arc<Mutex<ActiveNoteRegistry>>,
    pending: Mutex<PendingTable>,
}

impl<C: PlaybackClock + 'static> Shared<C> {
    fn schedule(self: &Arc<Self>, fire_at: f64, job: Job) {
        let key = {
            let mut pending = self.pending.lock();
            let key = pending.next_key;
            pending.next_key += 1;
            key
        };
        let shared = Arc::clone(self);
        let delay = fire_at - self.clock.now();
        let handle = self
            .clock
            .after(delay, Box::new(move || shared.fire(key)));
        self.pending.lock().jobs.insert(
            key,
            PendingJob {
                handle,
                fire_at,
                job,
            },
        );
    }

    fn fire(&self, key: u64) {
        let Some(PendingJob { fire_at, job, .. }) = self.pending.lock().jobs.remove(&key) else {
            tracing::debug!(key, "stale timer ignored");
            return;
        };
        let now = self.clock.now();

        match job {
            Job::Spawn {
                note,
                ticket,
                fall_duration,
            } => {
                if !self.registry.lock().mark_pending(&note.id, note.pitch, now) {
                    return;
                }
                let request = SpawnRequest {
                    ticket,
                    display: DisplayAttrs {
                        pitch: note.pitch,
                        velocity: note.velocity,
                        track_index: note.track_index,
                        x: note.visual_x,
                        width: note.visual_width,
                    },
                    fall_duration,
                };
                match self.collaborators.visual.spawn(request) {
                    Ok(()) => {
                        self.registry.lock().mark_visible(&note.id, note.pitch, now);
                    }
                    Err(err) => {
                        tracing::warn!(note = %note.id, error = %err, "visual spawn failed");
                        self.registry.lock().retire(&note.id);
                    }
                }
            }
            Job::Attack {
                note,
                voice,
                duration,
            } => {
                let offset = (fire_at - now).max(0.0);
                if let Err(err) =
                    self.collaborators
                        .audio
                        .attack(voice, note.pitch, note.velocity, duration, offset)
                {
                    tracing::warn!(note = %note.id, error = %err, "audio attack failed");
                }
            }
            Job::Release { note, voice } => {
                if let Err(err) = self.collaborators.audio.release(voice) {
                    tracing::warn!(note = %note.id, error = %err, "audio release failed");
                }
            }
            Job::Retire { note_id } => {
                self.registry.lock().retire(&note_id);
            }
        }
    }

    fn cancel_all(&self) -> usize {
        let jobs: Vec<PendingJob> = self
            .pending
            .lock()
            .jobs
            .drain()
            .map(|(_, job)| job)
            .collect();
        for job in &jobs {
            self.clock.cancel(job.handle);
        }
        jobs.len()
    }
}

/// Owns one playback session at a time.
pub struct Scheduler<C: PlaybackClock + 'static> {
    shared: Arc<Shared<C>>,
    params: PlaybackParams,
    presentation: PresentationParams,
    session: SessionId,
    notes: Vec<Arc<NoteEvent>>,
    /// Clock time at which the session started, and the piece position it
    /// started from.
    origin: f64,
    start_position: f64,
    /// Never reused, so a voice still ringing from an older session cannot
    /// be confused with a new one.
    next_voice: u64,
}

impl<C: PlaybackClock + 'static> Scheduler<C> {
    pub fn new(clock: C, collaborators: Collaborators) -> Self {
        Self {
            shared: Arc::new(Shared {
                clock,
                collaborators,
                registry: Arc::new(Mutex::new(ActiveNoteRegistry::new())),
                pending: Mutex::new(PendingTable::default()),
            }),
            params: PlaybackParams::default(),
            presentation: PresentationParams::default(),
            session: SessionId::default(),
            notes: Vec::new(),
            origin: 0.0,
            start_position: 0.0,
            next_voice: 0,
        }
    }

    /// Applies to visuals spawned by the next load.
    pub fn set_presentation(&mut self, presentation: PresentationParams) -> Result<(), ScheduleError> {
        presentation.validate()?;
        self.presentation = presentation;
        Ok(())
    }

    /// Replaces the current session. Validation happens first; on error
    /// nothing is cancelled, cleared or scheduled.
    pub fn load(
        &mut self,
        notes: Vec<NoteEvent>,
        params: PlaybackParams,
    ) -> Result<SessionId, ScheduleError> {
        self.load_from(notes, params, 0.0)
    }

    /// Like [`load`](Self::load), starting `position` piece-seconds into the
    /// song. Notes that start earlier are kept for later reloads but not
    /// scheduled.
    pub fn load_from(
        &mut self,
        mut notes: Vec<NoteEvent>,
        params: PlaybackParams,
        position: f64,
    ) -> Result<SessionId, ScheduleError> {
        params.validate()?;
        if !position.is_finite() || position < 0.0 {
            return Err(ScheduleError::InvalidPosition(position));
        }
        let mut seen = HashSet::with_capacity(notes.len());
        for note in &notes {
            note.validate().map_err(|source| ScheduleError::InvalidNote {
                id: note.id.clone(),
                source,
            })?;
            if !seen.insert(&note.id) {
                return Err(ScheduleError::DuplicateNoteId(note.id.clone()));
            }
        }

        // cancel-then-install
        let cancelled = self.shared.cancel_all();
        self.shared.registry.lock().reset();
        self.session = SessionId(self.session.0 + 1);
        self.params = params;

        sort_by_start(&mut notes);
        self.notes = notes.into_iter().map(Arc::new).collect();

        let origin = self.shared.clock.now();
        self.origin = origin;
        self.start_position = position;
        let mut scheduled = 0;
        for note in self.notes.iter().filter(|n| n.start_time >= position) {
            let timing = params.timing_from(note, position);
            let voice = VoiceId(self.next_voice);
            self.next_voice += 1;
            scheduled += 1;
            self.shared.schedule(
                origin + timing.spawn_time,
                Job::Spawn {
                    note: Arc::clone(note),
                    ticket: SpawnTicket {
                        session: self.session,
                        note_id: note.id.clone(),
                    },
                    fall_duration: timing.adjusted_duration * self.presentation.visual_speed,
                },
            );
            self.shared.schedule(
                origin + timing.audio_time,
                Job::Attack {
                    note: Arc::clone(note),
                    voice,
                    duration: timing.adjusted_duration,
                },
            );
            self.shared.schedule(
                origin + timing.release_time(),
                Job::Release {
                    note: Arc::clone(note),
                    voice,
                },
            );
        }

        tracing::info!(
            session = %self.session,
            notes = self.notes.len(),
            scheduled,
            position,
            cancelled,
            speed_factor = params.speed_factor,
            lead_time = params.lead_time,
            "session loaded"
        );
        Ok(self.session)
    }

    /// Reloads the current notes under new parameters, carrying on from the
    /// current position. Notes already started are not replayed.
    pub fn set_params(&mut self, params: PlaybackParams) -> Result<SessionId, ScheduleError> {
        let position = self.position();
        self.load_from(self.current_notes(), params, position)
    }

    /// Reloads the current notes from the start of the song.
    pub fn restart(&mut self) -> Result<SessionId, ScheduleError> {
        self.load(self.current_notes(), self.params)
    }

    fn current_notes(&self) -> Vec<NoteEvent> {
        self.notes.iter().map(|n| NoteEvent::clone(n)).collect()
    }

    /// Piece seconds reached by the current session.
    pub fn position(&self) -> f64 {
        let elapsed = (self.shared.clock.now() - self.origin).max(0.0);
        self.start_position + elapsed * self.params.speed_factor
    }

    /// Discards every pending timer without firing it. Returns how many were
    /// discarded.
    pub fn cancel(&mut self) -> usize {
        let cancelled = self.shared.cancel_all();
        if cancelled > 0 {
            tracing::debug!(session = %self.session, cancelled, "pending actions cancelled");
        }
        cancelled
    }

    /// Cancels everything, silences the sink and forgets the session.
    pub fn stop(&mut self) {
        self.cancel();
        if let Err(err) = self.shared.collaborators.audio.release_all() {
            tracing::warn!(error = %err, "release all failed");
        }
        self.shared.registry.lock().reset();
        self.notes.clear();
        self.session = SessionId(self.session.0 + 1);
        tracing::info!(session = %self.session, "playback stopped");
    }

    /// A visual reached the target line. Marks the note hit, flashes its key
    /// and retires it after the hit linger. Stale tickets are ignored.
    pub fn note_arrived(&mut self, ticket: &SpawnTicket) -> Option<u8> {
        if ticket.session != self.session {
            tracing::debug!(note = %ticket.note_id, session = %ticket.session, "stale arrival ignored");
            return None;
        }
        let now = self.shared.clock.now();
        let pitch = self.shared.registry.lock().mark_hit(&ticket.note_id, now)?;

        if let Err(err) = self.shared.collaborators.keyboard.flash(pitch) {
            tracing::warn!(note = %ticket.note_id, error = %err, "key flash failed");
        }

        if self.presentation.hit_linger > 0.0 {
            self.shared.schedule(
                now + self.presentation.hit_linger,
                Job::Retire {
                    note_id: ticket.note_id.clone(),
                },
            );
        } else {
            self.shared.registry.lock().retire(&ticket.note_id);
        }
        Some(pitch)
    }

    /// A visual left the screen without a hit.
    pub fn note_expired(&mut self, ticket: &SpawnTicket) -> bool {
        if ticket.session != self.session {
            tracing::debug!(note = %ticket.note_id, session = %ticket.session, "stale expiry ignored");
            return false;
        }
        self.shared.registry.lock().retire(&ticket.note_id)
    }

    /// Pending spawn / attack / release actions, earliest first.
    pub fn pending_actions(&self) -> Vec<ScheduledAction> {
        let pending = self.shared.pending.lock();
        let mut keyed: Vec<(u64, ScheduledAction)> = pending
            .jobs
            .iter()
            .filter_map(|(key, p)| p.job.action(p.fire_at).map(|a| (*key, a)))
            .collect();
        keyed.sort_by(|(ka, a), (kb, b)| a.fire_at.total_cmp(&b.fire_at).then(ka.cmp(kb)));
        keyed.into_iter().map(|(_, action)| action).collect()
    }

    /// True once nothing is left to fire.
    pub fn is_idle(&self) -> bool {
        self.shared.pending.lock().jobs.is_empty()
    }

    /// True once nothing is left to fire and no note is still falling or
    /// lingering after a hit.
    pub fn is_finished(&self) -> bool {
        self.is_idle() && self.shared.registry.lock().is_empty()
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn params(&self) -> PlaybackParams {
        self.params
    }

    pub fn presentation(&self) -> PresentationParams {
        self.presentation
    }

    pub fn notes(&self) -> &[Arc<NoteEvent>] {
        &self.notes
    }

    pub fn registry(&self) -> &Arc<Mutex<ActiveNoteRegistry>> {
        &self.shared.registry
    }
}

impl<C: PlaybackClock + 'static> Drop for Scheduler<C> {
    fn drop(&mut self) {
        self.shared.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SinkError;
    use crate::timing::{ManualClock, NoteState};

    #[derive(Default)]
    struct Log {
        calls: Mutex<Vec<String>>,
        tickets: Mutex<Vec<SpawnTicket>>,
    }

    impl AudioSink for Log {
        fn attack(
            &self,
            voice: VoiceId,
            pitch: u8,
            velocity: f64,
            duration: f64,
            _offset: f64,
        ) -> Result<(), SinkError> {
            self.calls
                .lock()
                .push(format!("attack {voice} {pitch} {velocity} {duration}"));
            Ok(())
        }

        fn release(&self, voice: VoiceId) -> Result<(), SinkError> {
            self.calls.lock().push(format!("release {voice}"));
            Ok(())
        }

        fn release_all(&self) -> Result<(), SinkError> {
            self.calls.lock().push("release-all".into());
            Ok(())
        }
    }

    impl VisualPresentation for Log {
        fn spawn(&self, request: SpawnRequest) -> Result<(), SinkError> {
            self.calls.lock().push(format!("spawn {}", request.ticket.note_id));
            self.tickets.lock().push(request.ticket);
            Ok(())
        }
    }

    impl KeyboardDisplay for Log {
        fn flash(&self, pitch: u8) -> Result<(), SinkError> {
            self.calls.lock().push(format!("flash {pitch}"));
            Ok(())
        }
    }

    fn scheduler() -> (Scheduler<ManualClock>, ManualClock, Arc<Log>) {
        let clock = ManualClock::new();
        let log = Arc::new(Log::default());
        let collaborators = Collaborators {
            audio: log.clone(),
            visual: log.clone(),
            keyboard: log.clone(),
        };
        (Scheduler::new(clock.clone(), collaborators), clock, log)
    }

    fn note(id: &str, pitch: u8, start: f64, duration: f64) -> NoteEvent {
        NoteEvent::new(id, pitch, start, duration, 0.8).unwrap()
    }

    #[test]
    fn test_timing_scales_inversely_with_speed() {
        let n = note("n", 60, 3.0, 1.5);
        let one = PlaybackParams::new(1.0, 0.0).timing(&n);
        let two = PlaybackParams::new(2.0, 0.0).timing(&n);
        assert_eq!(two.audio_time, one.audio_time / 2.0);
        assert_eq!(two.adjusted_duration, one.adjusted_duration / 2.0);
    }

    #[test]
    fn test_spawn_never_negative_or_after_audio() {
        let n = note("n", 60, 0.3, 1.0);
        for lead in [0.0, 0.1, 0.3, 2.0, 100.0] {
            let t = PlaybackParams::new(1.0, lead).timing(&n);
            assert!(t.spawn_time >= 0.0);
            assert!(t.spawn_time <= t.audio_time);
        }
    }

    #[test]
    fn test_invalid_params() {
        assert_eq!(
            PlaybackParams::new(0.0, 0.0).validate(),
            Err(ScheduleError::InvalidSpeedFactor(0.0))
        );
        assert_eq!(
            PlaybackParams::new(-1.0, 0.0).validate(),
            Err(ScheduleError::InvalidSpeedFactor(-1.0))
        );
        assert_eq!(
            PlaybackParams::new(1.0, -0.5).validate(),
            Err(ScheduleError::InvalidLeadTime(-0.5))
        );
        assert!(PresentationParams { visual_speed: 0.0, hit_linger: 0.0 }.validate().is_err());
    }

    #[test]
    fn test_pending_actions_listing() {
        let (mut s, _clock, _log) = scheduler();
        s.load(vec![note("n1", 60, 2.0, 1.0)], PlaybackParams::new(1.0, 0.5))
            .unwrap();
        let kinds: Vec<_> = s
            .pending_actions()
            .into_iter()
            .map(|a| (a.kind, a.fire_at))
            .collect();
        assert_eq!(
            kinds,
            [
                (ActionKind::SpawnVisual, 1.5),
                (ActionKind::TriggerAudio, 2.0),
                (ActionKind::ReleaseAudio, 3.0),
            ]
        );
    }

    #[test]
    fn test_fire_sequence_and_arrival() {
        let (mut s, clock, log) = scheduler();
        s.set_presentation(PresentationParams { visual_speed: 1.0, hit_linger: 0.0 })
            .unwrap();
        s.load(vec![note("n1", 60, 2.0, 1.0)], PlaybackParams::new(1.0, 0.5))
            .unwrap();

        clock.advance_to(1.5);
        assert_eq!(s.registry().lock().state(&"n1".into()), Some(NoteState::Visible));

        clock.advance_to(3.0);
        let ticket = log.tickets.lock()[0].clone();
        assert_eq!(s.note_arrived(&ticket), Some(60));
        assert_eq!(s.note_arrived(&ticket), None);
        assert_eq!(s.registry().lock().state(&"n1".into()), Some(NoteState::Retired));

        assert_eq!(
            *log.calls.lock(),
            ["spawn n1", "attack v0 60 0.8 1", "release v0", "flash 60"]
        );
        assert!(s.is_idle());
    }

    #[test]
    fn test_hit_linger_retires_later() {
        let (mut s, clock, log) = scheduler();
        s.load(vec![note("n1", 60, 0.0, 1.0)], PlaybackParams::new(1.0, 0.0))
            .unwrap();
        clock.advance_to(0.0);
        let ticket = log.tickets.lock()[0].clone();
        s.note_arrived(&ticket);
        assert_eq!(s.registry().lock().state(&"n1".into()), Some(NoteState::Hit));
        clock.advance_by(0.15);
        assert_eq!(s.registry().lock().state(&"n1".into()), Some(NoteState::Retired));
    }

    #[test]
    fn test_expired_visual_retires_directly() {
        let (mut s, clock, log) = scheduler();
        s.load(vec![note("n1", 60, 0.0, 1.0)], PlaybackParams::default())
            .unwrap();
        clock.advance_to(0.0);
        let ticket = log.tickets.lock()[0].clone();
        assert!(s.note_expired(&ticket));
        assert_eq!(s.note_arrived(&ticket), None);
    }

    #[test]
    fn test_stale_ticket_after_reload() {
        let (mut s, clock, log) = scheduler();
        s.load(vec![note("n1", 60, 0.0, 1.0)], PlaybackParams::default())
            .unwrap();
        clock.advance_to(0.0);
        let old = log.tickets.lock()[0].clone();

        s.load(vec![note("n1", 60, 0.0, 1.0)], PlaybackParams::default())
            .unwrap();
        clock.advance_to(0.0);
        assert_eq!(s.note_arrived(&old), None);
        assert!(!s.note_expired(&old));
        assert_eq!(s.registry().lock().state(&"n1".into()), Some(NoteState::Visible));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let (mut s, _clock, _log) = scheduler();
        let err = s
            .load(
                vec![note("dup", 60, 0.0, 1.0), note("dup", 62, 1.0, 1.0)],
                PlaybackParams::default(),
            )
            .unwrap_err();
        assert_eq!(err, ScheduleError::DuplicateNoteId("dup".into()));
        assert!(s.is_idle());
    }

    #[test]
    fn test_stop_silences_and_clears() {
        let (mut s, clock, log) = scheduler();
        s.load(vec![note("n1", 60, 1.0, 1.0)], PlaybackParams::new(1.0, 1.0))
            .unwrap();
        clock.advance_to(0.0);
        s.stop();
        assert!(s.is_idle());
        assert!(s.registry().lock().is_empty());
        clock.advance_to(10.0);
        assert_eq!(*log.calls.lock(), ["spawn n1", "release-all"]);
    }

    #[test]
    fn test_set_params_reschedules() {
        let (mut s, _clock, _log) = scheduler();
        s.load(vec![note("n1", 60, 2.0, 1.0)], PlaybackParams::new(1.0, 0.0))
            .unwrap();
        let session = s.set_params(PlaybackParams::new(2.0, 0.0)).unwrap();
        assert_eq!(session, SessionId(2));
        let attack = s
            .pending_actions()
            .into_iter()
            .find(|a| a.kind == ActionKind::TriggerAudio)
            .unwrap();
        assert_eq!(attack.fire_at, 1.0);
    }

    #[test]
    fn test_same_pitch_notes_release_their_own_voice() {
        let (mut s, clock, log) = scheduler();
        s.load(
            vec![note("a", 60, 0.1, 0.2), note("b", 60, 0.3, 0.5)],
            PlaybackParams::new(1.0, 0.0),
        )
        .unwrap();
        clock.advance_to(1.0);

        let audio: Vec<String> = log
            .calls
            .lock()
            .iter()
            .filter(|c| !c.starts_with("spawn"))
            .cloned()
            .collect();
        // a's release may land after b's attack; it still names a's voice
        assert!(audio.contains(&"release v0".to_string()));
        assert!(audio.contains(&"release v1".to_string()));
        assert_eq!(audio.iter().filter(|c| c.as_str() == "attack v1 60 0.8 0.5").count(), 1);
        let b_attack = audio.iter().position(|c| c.starts_with("attack v1")).unwrap();
        let b_release = audio.iter().position(|c| c == "release v1").unwrap();
        assert!(b_attack < b_release);
    }

    #[test]
    fn test_voice_ids_not_reused_across_sessions() {
        let (mut s, clock, log) = scheduler();
        s.load(vec![note("n1", 60, 0.0, 1.0)], PlaybackParams::new(1.0, 0.0))
            .unwrap();
        clock.advance_to(0.0);
        s.load(vec![note("n1", 60, 0.0, 1.0)], PlaybackParams::new(1.0, 0.0))
            .unwrap();
        clock.advance_to(2.0);
        let calls = log.calls.lock();
        assert!(calls.contains(&"attack v0 60 0.8 1".to_string()));
        assert!(calls.contains(&"attack v1 60 0.8 1".to_string()));
        assert!(calls.contains(&"release v1".to_string()));
        assert!(!calls.contains(&"release v0".to_string()));
    }

    #[test]
    fn test_finished_waits_for_falling_notes() {
        let (mut s, clock, log) = scheduler();
        s.load(vec![note("n1", 60, 0.0, 0.5)], PlaybackParams::new(1.0, 0.0))
            .unwrap();
        clock.advance_to(0.5);
        assert!(s.is_idle());
        assert!(!s.is_finished());

        let ticket = log.tickets.lock()[0].clone();
        s.note_arrived(&ticket);
        assert!(!s.is_finished());
        clock.advance_by(s.presentation().hit_linger);
        assert!(s.is_finished());
    }

    #[test]
    fn test_set_params_continues_from_position() {
        let (mut s, clock, _log) = scheduler();
        s.load(
            vec![note("a", 60, 1.0, 0.5), note("b", 62, 3.0, 1.0)],
            PlaybackParams::new(1.0, 0.0),
        )
        .unwrap();
        clock.advance_to(2.0);
        assert_eq!(s.position(), 2.0);

        s.set_params(PlaybackParams::new(2.0, 0.0)).unwrap();
        let planned: Vec<_> = s
            .pending_actions()
            .into_iter()
            .map(|a| (a.kind, a.fire_at, a.note_id.to_string()))
            .collect();
        assert_eq!(
            planned,
            [
                (ActionKind::SpawnVisual, 2.5, "b".to_string()),
                (ActionKind::TriggerAudio, 2.5, "b".to_string()),
                (ActionKind::ReleaseAudio, 3.0, "b".to_string()),
            ]
        );
        clock.advance_to(2.25);
        assert_eq!(s.position(), 2.5);

        s.restart().unwrap();
        let first = s.pending_actions().into_iter().next().unwrap();
        assert_eq!((first.note_id.as_str(), first.fire_at), ("a", 2.75));
        assert_eq!(s.notes().len(), 2);
    }

    #[test]
    fn test_negative_position_rejected() {
        let (mut s, _clock, _log) = scheduler();
        assert_eq!(
            s.load_from(vec![note("n1", 60, 0.0, 1.0)], PlaybackParams::default(), -1.0),
            Err(ScheduleError::InvalidPosition(-1.0))
        );
        assert!(s.is_idle());
    }
}
