use crate::audio::{self, AudioSink, LogSink, SynthSettings, SynthSink};
use crate::config::Settings;
use crate::events::{SessionId, SinkError, SpawnTicket};
use crate::keyboard::KeyboardDisplay;
use crate::presentation::{FallingNote, TimedPresentation};
use crate::import;
use crate::timing::{Collaborators, NoteEvent, PlaybackParams, Scheduler, SystemClock};
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const IDLE_WAIT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub enum EngineCommand {
    Load(PathBuf),
    LoadNotes { label: String, notes: Vec<NoteEvent> },
    /// Carries on from the current position under new parameters.
    SetParams(PlaybackParams),
    /// Plays the current song again from the start.
    Restart,
    /// Swapped into the running synth; ignored when muted.
    SetSynth(SynthSettings),
    Stop,
    NoteArrived(SpawnTicket),
    NoteExpired(SpawnTicket),
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum EngineUpdate {
    SessionLoaded {
        session: SessionId,
        label: String,
        notes: usize,
        /// Seconds of playback left at the current speed.
        duration: f64,
    },
    NoteSpawned(FallingNote),
    KeyFlash { pitch: u8 },
    Finished { session: SessionId },
    Stopped,
    Error { message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to start engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine is no longer running")]
    Disconnected,
}

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub settings: Settings,
    /// Log audio commands instead of opening an output device.
    pub mute: bool,
}

pub struct EngineHandle {
    pub command_tx: Sender<EngineCommand>,
    pub update_rx: Receiver<EngineUpdate>,
    thread: Option<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn send(&self, command: EngineCommand) -> Result<(), EngineError> {
        self.command_tx
            .send(command)
            .map_err(|_| EngineError::Disconnected)
    }

    pub fn shutdown(mut self) {
        self.stop_thread();
    }

    fn stop_thread(&mut self) {
        let _ = self.command_tx.send(EngineCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("engine thread panicked");
            }
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

pub fn spawn_engine(options: EngineOptions) -> Result<EngineHandle, EngineError> {
    let (command_tx, command_rx) = crossbeam::channel::unbounded();
    let (update_tx, update_rx) = crossbeam::channel::unbounded();

    let loopback = command_tx.clone();
    let thread = std::thread::Builder::new()
        .name("notefall-engine".into())
        .spawn(move || {
            engine_thread(options, command_rx, loopback, update_tx);
        })?;

    Ok(EngineHandle {
        command_tx,
        update_rx,
        thread: Some(thread),
    })
}

/// Forwards key flashes to whoever listens for engine updates.
struct UpdateKeyboard {
    update_tx: Sender<EngineUpdate>,
}

impl KeyboardDisplay for UpdateKeyboard {
    fn flash(&self, pitch: u8) -> Result<(), SinkError> {
        self.update_tx
            .send(EngineUpdate::KeyFlash { pitch })
            .map_err(|_| SinkError::Unavailable("update channel closed".into()))
    }
}

struct EngineState {
    scheduler: Scheduler<SystemClock>,
    params: PlaybackParams,
    spawned_rx: Receiver<FallingNote>,
    finished_reported: bool,
    synth: Option<Arc<SynthSink>>,
    // Keeps the output device open; cpal streams stay on their thread.
    _audio_stream: Option<audio::SynthStream>,
}

type OpenedAudio = (
    Option<audio::SynthStream>,
    Option<Arc<SynthSink>>,
    Arc<dyn AudioSink>,
);

fn open_audio(options: &EngineOptions) -> OpenedAudio {
    if options.mute {
        return (None, None, Arc::new(LogSink));
    }
    match audio::start_synth(options.settings.synth.clone()) {
        Ok((stream, sink)) => {
            let sink = Arc::new(sink);
            (Some(stream), Some(sink.clone()), sink)
        }
        Err(e) => {
            tracing::warn!(error = %e, "audio unavailable, falling back to logging sink");
            (None, None, Arc::new(LogSink))
        }
    }
}

fn engine_thread(
    options: EngineOptions,
    command_rx: Receiver<EngineCommand>,
    loopback: Sender<EngineCommand>,
    update_tx: Sender<EngineUpdate>,
) {
    let clock = SystemClock::new();
    let (audio_stream, synth, audio) = open_audio(&options);

    let (spawned_tx, spawned_rx) = crossbeam::channel::unbounded();
    let arrivals = loopback.clone();
    let visual = TimedPresentation::new(
        clock.clone(),
        Arc::new(move |ticket: SpawnTicket| {
            let _ = arrivals.send(EngineCommand::NoteArrived(ticket));
        }),
    )
    .with_observer(spawned_tx);

    let collaborators = Collaborators {
        audio,
        visual: Arc::new(visual),
        keyboard: Arc::new(UpdateKeyboard {
            update_tx: update_tx.clone(),
        }),
    };

    let mut scheduler = Scheduler::new(clock.clone(), collaborators);
    if let Err(e) = scheduler.set_presentation(options.settings.presentation) {
        let _ = update_tx.send(EngineUpdate::Error {
            message: format!("Invalid presentation settings: {}", e),
        });
    }

    let mut state = EngineState {
        scheduler,
        params: options.settings.playback,
        spawned_rx,
        finished_reported: true,
        synth,
        _audio_stream: audio_stream,
    };

    loop {
        clock.run_due();
        forward_spawns(&state, &update_tx);

        // timers alone are not enough: the last visuals may still be falling
        if !state.finished_reported && state.scheduler.is_finished() {
            state.finished_reported = true;
            let _ = update_tx.send(EngineUpdate::Finished {
                session: state.scheduler.session(),
            });
        }

        let wait = clock.time_until_next().unwrap_or(IDLE_WAIT).min(IDLE_WAIT);
        match command_rx.recv_timeout(wait) {
            Ok(EngineCommand::Shutdown) => break,
            Ok(command) => handle_command(&mut state, command, &update_tx),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    state.scheduler.stop();
    tracing::debug!("engine thread exiting");
}

fn forward_spawns(state: &EngineState, update_tx: &Sender<EngineUpdate>) {
    while let Ok(note) = state.spawned_rx.try_recv() {
        let _ = update_tx.send(EngineUpdate::NoteSpawned(note));
    }
}

fn handle_command(state: &mut EngineState, command: EngineCommand, update_tx: &Sender<EngineUpdate>) {
    match command {
        EngineCommand::Load(path) => match import::load_path(&path) {
            Ok(notes) => {
                let label = path.display().to_string();
                load_notes(state, label, notes, update_tx);
            }
            Err(e) => {
                let _ = update_tx.send(EngineUpdate::Error {
                    message: format!("Failed to load {}: {}", path.display(), e),
                });
            }
        },
        EngineCommand::LoadNotes { label, notes } => {
            load_notes(state, label, notes, update_tx);
        }
        EngineCommand::SetParams(params) => {
            if let Err(e) = params.validate() {
                let _ = update_tx.send(EngineUpdate::Error {
                    message: format!("Invalid playback parameters: {}", e),
                });
                return;
            }
            state.params = params;
            if state.scheduler.notes().is_empty() {
                return;
            }
            let result = state.scheduler.set_params(params);
            rescheduled(state, result, "speed change", update_tx);
        }
        EngineCommand::Restart => {
            if state.scheduler.notes().is_empty() {
                return;
            }
            let result = state.scheduler.restart();
            rescheduled(state, result, "restart", update_tx);
        }
        EngineCommand::SetSynth(settings) => match &state.synth {
            Some(synth) => synth.set_settings(settings),
            None => tracing::debug!("no synth running, settings ignored"),
        },
        EngineCommand::Stop => {
            state.scheduler.stop();
            state.finished_reported = true;
            let _ = update_tx.send(EngineUpdate::Stopped);
        }
        EngineCommand::NoteArrived(ticket) => {
            state.scheduler.note_arrived(&ticket);
        }
        EngineCommand::NoteExpired(ticket) => {
            state.scheduler.note_expired(&ticket);
        }
        EngineCommand::Shutdown => {}
    }
}

fn load_notes(
    state: &mut EngineState,
    label: String,
    notes: Vec<NoteEvent>,
    update_tx: &Sender<EngineUpdate>,
) {
    match state.scheduler.load(notes, state.params) {
        Ok(session) => {
            state.finished_reported = false;
            let _ = update_tx.send(session_loaded(state, session, label));
        }
        Err(e) => {
            let _ = update_tx.send(EngineUpdate::Error {
                message: format!("Failed to schedule {}: {}", label, e),
            });
        }
    }
}

fn rescheduled(
    state: &mut EngineState,
    result: Result<SessionId, crate::timing::ScheduleError>,
    label: &str,
    update_tx: &Sender<EngineUpdate>,
) {
    match result {
        Ok(session) => {
            state.finished_reported = false;
            let _ = update_tx.send(session_loaded(state, session, label.into()));
        }
        Err(e) => {
            let _ = update_tx.send(EngineUpdate::Error {
                message: format!("Failed to reschedule: {}", e),
            });
        }
    }
}

fn session_loaded(state: &EngineState, session: SessionId, label: String) -> EngineUpdate {
    let notes = state.scheduler.notes();
    let end = notes.iter().map(|n| n.end_time()).fold(0.0, f64::max);
    let remaining = (end - state.scheduler.position()).max(0.0);
    EngineUpdate::SessionLoaded {
        session,
        label,
        notes: notes.len(),
        duration: remaining / state.params.speed_factor,
    }
}
