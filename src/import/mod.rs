//! Sources of note events. Optional fields are defaulted here so the core
//! never sees a partial note.

pub mod backend;
pub mod smf;

use std::fs;
use std::path::Path;

use crate::timing::NoteEvent;

/// Used when a source carries no velocity at all.
pub const DEFAULT_VELOCITY: f64 = 0.7;

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid midi file: {0}")]
    Midi(#[from] midly::Error),
    #[error("invalid note document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported file type: {0}")]
    UnsupportedFormat(String),
}

pub fn velocity_from_midi(velocity: u8) -> f64 {
    velocity.min(127) as f64 / 127.0
}

/// Loads `.mid` / `.midi` through the SMF parser and `.json` as a backend
/// document.
pub fn load_path(path: &Path) -> Result<Vec<NoteEvent>, ImportError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let io_err = |source| ImportError::Io {
        path: path.display().to_string(),
        source,
    };

    match extension.as_str() {
        "mid" | "midi" => smf::parse(&fs::read(path).map_err(io_err)?),
        "json" => backend::parse(&fs::read_to_string(path).map_err(io_err)?),
        other => Err(ImportError::UnsupportedFormat(other.to_string())),
    }
}

pub fn is_supported(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref(),
        Some("mid" | "midi" | "json")
    )
}
