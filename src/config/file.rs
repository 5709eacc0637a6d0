//! TOML configuration file loading
//!
//! Supports `~/.config/omni/mentor/config.toml` as a persistent config source.
//! All fields are optional — the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct MentorConfigFile {
    /// Live model connection
    #[serde(default)]
    pub live: LiveFileConfig,

    /// Audio device configuration
    #[serde(default)]
    pub audio: AudioFileConfig,
}

/// Live model configuration
#[derive(Debug, Default, Deserialize)]
pub struct LiveFileConfig {
    /// WebSocket endpoint of the live model
    pub endpoint: Option<String>,

    /// API key for the generative AI service
    pub api_key: Option<String>,

    /// Model identifier (e.g. "gemini-2.5-flash-native-audio-preview-12-2025")
    pub model: Option<String>,

    /// Prebuilt voice name (e.g. "Puck")
    pub voice: Option<String>,

    /// Persona system instruction
    pub system_instruction: Option<String>,
}

/// Audio configuration
///
/// Sample rates are fixed by the live endpoint and are not configurable.
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Samples per captured frame
    pub frame_size: Option<usize>,
}

/// Load the TOML config file from the standard path
///
/// Returns `MentorConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> MentorConfigFile {
    config_file_path().map_or_else(MentorConfigFile::default, |path| load_config_from(&path))
}

/// Load a TOML config file from `path`, falling back to defaults
pub fn load_config_from(path: &Path) -> MentorConfigFile {
    if !path.exists() {
        return MentorConfigFile::default();
    }

    match read_config(path) {
        Ok(config) => {
            tracing::info!(path = %path.display(), "loaded config file");
            config
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            MentorConfigFile::default()
        }
    }
}

/// Read and parse a TOML config file
///
/// # Errors
///
/// Returns [`crate::Error::Io`] if the file cannot be read or
/// [`crate::Error::Toml`] if it is not valid TOML
pub fn read_config(path: &Path) -> Result<MentorConfigFile> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Return the config file path: `~/.config/omni/mentor/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("mentor")
            .join("config.toml")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_partial_file() {
        let fc: MentorConfigFile = toml::from_str(
            r#"
            [live]
            voice = "Kore"

            [audio]
            frame_size = 2048
            "#,
        )
        .unwrap();

        assert_eq!(fc.live.voice.as_deref(), Some("Kore"));
        assert!(fc.live.model.is_none());
        assert_eq!(fc.audio.frame_size, Some(2048));
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let fc = load_config_from(&dir.path().join("config.toml"));
        assert!(fc.live.endpoint.is_none());
    }

    #[test]
    fn test_invalid_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "live = [not toml").unwrap();

        let fc = load_config_from(&path);
        assert!(fc.live.voice.is_none());
        assert!(matches!(read_config(&path), Err(Error::Toml(_))));
    }

    #[test]
    fn test_unreadable_path_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(read_config(dir.path()), Err(Error::Io(_))));
    }
}
