use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::audio::SynthSettings;
use crate::keyboard::TARGET_KEYS;
use crate::timing::{PlaybackParams, PresentationParams, ScheduleError};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings file: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] ron::Error),
    #[error(transparent)]
    Invalid(#[from] ScheduleError),
}

/// Everything a player can tune, stored as RON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub playback: PlaybackParams,
    pub presentation: PresentationParams,
    pub synth: SynthSettings,
    pub keys: Vec<char>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            playback: PlaybackParams::default(),
            presentation: PresentationParams::default(),
            synth: SynthSettings::default(),
            keys: TARGET_KEYS.to_vec(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.playback.validate()?;
        self.presentation.validate()?;
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
        }
        let ron_string = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        fs::write(path, ron_string).map_err(|source| io_error(path, source))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let ron_string = fs::read_to_string(path).map_err(|source| io_error(path, source))?;
        let settings: Settings = ron::from_str(&ron_string)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults when the file does not exist; any other failure is an error.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("notefall.ron");
        let mut settings = Settings::default();
        settings.playback = PlaybackParams::new(1.5, 0.75);
        settings.synth.max_polyphony = 6;

        settings.save(&path).unwrap();
        assert_eq!(Settings::load(&path).unwrap(), settings);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.ron");
        fs::write(&path, "(playback: (speed_factor: 2.0))").unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.playback.speed_factor, 2.0);
        assert_eq!(settings.playback.lead_time, PlaybackParams::default().lead_time);
        assert_eq!(settings.keys, TARGET_KEYS.to_vec());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.ron");
        fs::write(&path, "(playback: (speed_factor: 0.0))").unwrap();
        assert!(matches!(
            Settings::load(&path),
            Err(ConfigError::Invalid(ScheduleError::InvalidSpeedFactor(_)))
        ));
    }

    #[test]
    fn test_missing_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_or_default(&dir.path().join("absent.ron")).unwrap();
        assert_eq!(settings, Settings::default());
    }
}
