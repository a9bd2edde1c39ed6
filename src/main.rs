use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tracing_subscriber::EnvFilter;

use notefall::audio::AudioSink;
use notefall::events::{SinkError, SpawnRequest, VoiceId};
use notefall::keyboard::{KeyStates, KeyboardDisplay};
use notefall::presentation::VisualPresentation;
use notefall::timing::{Collaborators, ManualClock, Scheduler, piece_duration};
use notefall::{EngineCommand, EngineOptions, EngineUpdate, Settings, import, spawn_engine, watch};

const DEFAULT_CONFIG: &str = "notefall.ron";
const KEY_HOLD: Duration = Duration::from_millis(150);
const SPEED_STEP: f64 = 1.25;
const VOLUME_STEP_DB: f32 = 3.0;

#[derive(Parser, Debug)]
#[command(name = "notefall", version, about = "Falling-notes MIDI player")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Play a song; notes fall and light keys as they land
    Play {
        /// .mid, .midi or backend .json file
        file: PathBuf,
        #[command(flatten)]
        playback: PlaybackArgs,
        /// Log audio commands instead of using the sound card
        #[arg(long)]
        mute: bool,
        /// Reload whenever a song is written to this directory
        #[arg(long)]
        watch: Option<PathBuf>,
    },
    /// Print the schedule computed for a song
    Inspect {
        file: PathBuf,
        #[command(flatten)]
        playback: PlaybackArgs,
    },
    /// Write the default settings file
    InitConfig {
        #[arg(default_value = DEFAULT_CONFIG)]
        path: PathBuf,
    },
}

#[derive(Args, Debug)]
struct PlaybackArgs {
    /// Playback speed multiplier
    #[arg(long)]
    speed: Option<f64>,
    /// Seconds a note is visible before it sounds
    #[arg(long)]
    lead: Option<f64>,
    /// Settings file (RON)
    #[arg(long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
}

impl PlaybackArgs {
    fn settings(&self) -> Result<Settings> {
        let mut settings = Settings::load_or_default(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;
        if let Some(speed) = self.speed {
            settings.playback.speed_factor = speed;
        }
        if let Some(lead) = self.lead {
            settings.playback.lead_time = lead;
        }
        settings.validate()?;
        Ok(settings)
    }
}

/// Writes tracing output with CRLF line ends so it stays readable in raw mode.
struct CrlfWriter;

impl Write for CrlfWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut err = io::stderr().lock();
        for chunk in buf.split_inclusive(|b| *b == b'\n') {
            match chunk.strip_suffix(b"\n") {
                Some(line) => {
                    err.write_all(line)?;
                    err.write_all(b"\r\n")?;
                }
                None => err.write_all(chunk)?,
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

struct RawGuard;

impl RawGuard {
    fn enter() -> Result<Self> {
        enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

fn say(line: impl AsRef<str>) {
    print!("{}\r\n", line.as_ref());
    let _ = io::stdout().flush();
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("notefall=info")),
        )
        .with_writer(|| CrlfWriter)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Play {
            file,
            playback,
            mute,
            watch,
        } => play(file, &playback, mute, watch.as_deref()),
        Command::Inspect { file, playback } => inspect(&file, &playback),
        Command::InitConfig { path } => {
            Settings::default().save(&path)?;
            println!("wrote {}", path.display());
            Ok(())
        }
    }
}

fn play(file: PathBuf, args: &PlaybackArgs, mute: bool, watch_dir: Option<&Path>) -> Result<()> {
    let settings = args.settings()?;
    let mut params = settings.playback;
    let mut synth = settings.synth.clone();
    let mut keys = KeyStates::new(settings.keys.iter().copied());

    let engine = spawn_engine(EngineOptions {
        settings,
        mute,
    })?;
    engine.send(EngineCommand::Load(file))?;
    let _watcher = watch_dir
        .map(|dir| watch::watch_directory(dir, engine.command_tx.clone()))
        .transpose()
        .context("starting directory watcher")?;

    let _raw = RawGuard::enter()?;
    say("q: quit  +/-: speed  [/]: volume  r: restart  space: stop");

    'run: loop {
        if event::poll(Duration::from_millis(16))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Esc | KeyCode::Char('q') => break 'run,
                        KeyCode::Char('+') | KeyCode::Char('=') => {
                            params.speed_factor *= SPEED_STEP;
                            engine.send(EngineCommand::SetParams(params))?;
                        }
                        KeyCode::Char('-') => {
                            params.speed_factor /= SPEED_STEP;
                            engine.send(EngineCommand::SetParams(params))?;
                        }
                        KeyCode::Char('[') | KeyCode::Char(']') => {
                            let step = if key.code == KeyCode::Char(']') { VOLUME_STEP_DB } else { -VOLUME_STEP_DB };
                            synth.volume_db = (synth.volume_db + step).min(0.0);
                            say(format!("volume {:.0} dB", synth.volume_db));
                            engine.send(EngineCommand::SetSynth(synth.clone()))?;
                        }
                        KeyCode::Char('r') => engine.send(EngineCommand::Restart)?,
                        KeyCode::Char(' ') => engine.send(EngineCommand::Stop)?,
                        _ => {}
                    }
                }
                if keys.handle_key_event(&key) {
                    say(key_line(&keys));
                }
            }
        }
        if keys.release_stale(Instant::now(), KEY_HOLD) > 0 {
            say(key_line(&keys));
        }

        while let Ok(update) = engine.update_rx.try_recv() {
            match update {
                EngineUpdate::SessionLoaded {
                    session,
                    label,
                    notes,
                    duration,
                } => say(format!(
                    "session {session}: {label} ({notes} notes, {duration:.1}s left at x{:.2})",
                    params.speed_factor
                )),
                EngineUpdate::NoteSpawned(note) => {
                    tracing::debug!(note = %note.ticket.note_id, pitch = note.pitch, x = note.x, "falling");
                }
                EngineUpdate::KeyFlash { pitch } => {
                    keys.record_flash(pitch);
                    let recent: Vec<String> = keys.recent_flashes().map(|p| p.to_string()).collect();
                    say(format!("hit {pitch:>3}  | {}", recent.join(" ")));
                }
                EngineUpdate::Finished { session } => {
                    say(format!("session {session} finished"));
                    if watch_dir.is_none() {
                        break 'run;
                    }
                }
                EngineUpdate::Stopped => say("stopped"),
                EngineUpdate::Error { message } => say(format!("error: {message}")),
            }
        }
    }

    engine.shutdown();
    Ok(())
}

fn key_line(keys: &KeyStates) -> String {
    keys.keys()
        .map(|(k, pressed)| if pressed { k.to_ascii_uppercase() } else { '.' })
        .collect()
}

/// Collaborators for a dry run: nothing is ever fired.
struct Silent;

impl AudioSink for Silent {
    fn attack(&self, _: VoiceId, _: u8, _: f64, _: f64, _: f64) -> Result<(), SinkError> {
        Ok(())
    }

    fn release(&self, _: VoiceId) -> Result<(), SinkError> {
        Ok(())
    }

    fn release_all(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl VisualPresentation for Silent {
    fn spawn(&self, _: SpawnRequest) -> Result<(), SinkError> {
        Ok(())
    }
}

impl KeyboardDisplay for Silent {
    fn flash(&self, _: u8) -> Result<(), SinkError> {
        Ok(())
    }
}

fn inspect(file: &Path, args: &PlaybackArgs) -> Result<()> {
    let settings = args.settings()?;
    let notes = import::load_path(file).with_context(|| format!("reading {}", file.display()))?;
    let length = piece_duration(&notes);

    let silent = Arc::new(Silent);
    let mut scheduler = Scheduler::new(
        ManualClock::new(),
        Collaborators {
            audio: silent.clone(),
            visual: silent.clone(),
            keyboard: silent,
        },
    );
    scheduler.load(notes, settings.playback)?;

    println!(
        "{} notes, {:.2}s ({:.2}s at x{})",
        scheduler.notes().len(),
        length,
        length / settings.playback.speed_factor,
        settings.playback.speed_factor
    );
    println!("{:>9}  {:<12}  note", "time", "action");
    for action in scheduler.pending_actions() {
        println!(
            "{:>9.3}  {:<12}  {}",
            action.fire_at,
            format!("{:?}", action.kind),
            action.note_id
        );
    }
    Ok(())
}
