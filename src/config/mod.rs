//! Configuration management for the live mentor

pub mod file;

use secrecy::SecretString;

use crate::live::SessionConfig;
use crate::{Error, Result};

use self::file::MentorConfigFile;

/// Default live model WebSocket endpoint
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Default native-audio model
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-12-2025";

/// Default prebuilt voice
pub const DEFAULT_VOICE: &str = "Puck";

/// Default mentor persona
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a helpful hands-on mentor for the MORE skills program. Help the student with technical, trades, or creative projects. Speak concisely.";

/// Microphone capture rate (16kHz mono)
pub const INPUT_SAMPLE_RATE: u32 = 16000;

/// Model speech playback rate (24kHz mono)
pub const OUTPUT_SAMPLE_RATE: u32 = 24000;

/// Samples per captured frame
pub const FRAME_SIZE: usize = 4096;

/// Live mentor configuration
#[derive(Debug)]
pub struct Config {
    /// Live model connection
    pub live: LiveConfig,

    /// Audio device configuration
    pub audio: AudioConfig,
}

/// Live model configuration
#[derive(Debug)]
pub struct LiveConfig {
    /// WebSocket endpoint
    pub endpoint: String,

    /// API key (from `GEMINI_API_KEY` or `API_KEY`)
    pub api_key: Option<SecretString>,

    /// Model identifier
    pub model: String,

    /// Prebuilt voice name
    pub voice: String,

    /// Persona system instruction
    pub system_instruction: String,
}

/// Audio configuration
///
/// The rates are the ones the live endpoint speaks; devices running at other
/// rates are resampled by the voice layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConfig {
    /// Microphone capture rate in Hz, also tagged on every outbound frame
    pub input_sample_rate: u32,

    /// Playback rate in Hz
    pub output_sample_rate: u32,

    /// Channels in server audio payloads
    pub output_channels: usize,

    /// Samples per captured frame
    pub frame_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: INPUT_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            output_channels: 1,
            frame_size: FRAME_SIZE,
        }
    }
}

impl Config {
    /// Load configuration (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if a configured value is invalid
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if the frame size is zero
    pub fn from_sources(
        fc: MentorConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let api_key = env("GEMINI_API_KEY")
            .or_else(|| env("API_KEY"))
            .or(fc.live.api_key)
            .filter(|k| !k.trim().is_empty())
            .map(SecretString::from);

        let live = LiveConfig {
            endpoint: env("MENTOR_LIVE_URL")
                .or(fc.live.endpoint)
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            api_key,
            model: env("MENTOR_MODEL")
                .or(fc.live.model)
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            voice: env("MENTOR_VOICE")
                .or(fc.live.voice)
                .unwrap_or_else(|| DEFAULT_VOICE.to_string()),
            system_instruction: fc
                .live
                .system_instruction
                .unwrap_or_else(|| DEFAULT_SYSTEM_INSTRUCTION.to_string()),
        };

        let defaults = AudioConfig::default();
        let audio = AudioConfig {
            frame_size: fc.audio.frame_size.unwrap_or(defaults.frame_size),
            ..defaults
        };

        if audio.frame_size == 0 {
            return Err(Error::Config("frame size must be non-zero".to_string()));
        }

        Ok(Self { live, audio })
    }

    /// The API key, required to reach the live endpoint
    ///
    /// # Errors
    ///
    /// Returns error if no key is configured
    pub fn api_key(&self) -> Result<&SecretString> {
        self.live.api_key.as_ref().ok_or_else(|| {
            Error::Config("no API key configured (set GEMINI_API_KEY)".to_string())
        })
    }

    /// Session parameters derived from this configuration
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            model: self.live.model.clone(),
            voice: self.live.voice.clone(),
            system_instruction: self.live.system_instruction.clone(),
            audio: self.audio,
        }
    }
}
