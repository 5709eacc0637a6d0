//! Wire messages for the bidirectional live model endpoint
//!
//! Outbound messages are serialized as externally tagged JSON objects
//! (`{"setup": {..}}`, `{"realtimeInput": {..}}`). Inbound messages are
//! loosely shaped, so they are parsed into raw optional structs and then
//! validated into [`ServerEvent`]s before they reach the session.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Playback rate assumed when the server omits one
pub const DEFAULT_OUTPUT_RATE: u32 = 24000;

/// Message sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    /// Session configuration, sent once after the handshake
    Setup(Setup),
    /// Streamed microphone audio
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    /// Wrap one encoded capture frame recorded at `sample_rate`
    #[must_use]
    pub fn audio(data: String, sample_rate: u32) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: pcm_mime_type(sample_rate),
                data,
            }],
        })
    }
}

/// Persona, voice and modality for the conversation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

impl Setup {
    /// Audio-only setup with a prebuilt voice
    #[must_use]
    pub fn audio(model: &str, voice: &str, instruction: &str) -> Self {
        let model = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{model}")
        };

        Self {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec![Modality::Audio],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: voice.to_string(),
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: instruction.to_string(),
                }],
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<Modality>,
    pub speech_config: SpeechConfig,
}

/// Response modality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Audio,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

/// Base64 payload tagged with its encoding
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

/// Validated event from the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Setup accepted, the session is open
    SetupComplete,
    /// Base64 PCM16 chunk of model speech
    Audio { data: String, sample_rate: u32 },
    /// Model started a new utterance; drop queued audio
    Interrupted,
    /// Model finished its turn
    TurnComplete,
    /// Server will drop the connection soon
    GoAway { time_left: Option<String> },
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerMessage {
    #[serde(default)]
    setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    server_content: Option<RawServerContent>,
    #[serde(default)]
    go_away: Option<RawGoAway>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerContent {
    #[serde(default)]
    model_turn: Option<RawContent>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RawContent {
    #[serde(default)]
    parts: Vec<RawPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPart {
    #[serde(default)]
    inline_data: Option<RawBlob>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBlob {
    #[serde(default)]
    mime_type: Option<String>,
    data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawGoAway {
    #[serde(default)]
    time_left: Option<String>,
}

/// Parse one server message into events
///
/// Audio parts come first, then interruption, then turn completion.
///
/// # Errors
///
/// Returns [`Error::Decode`] if the message is not valid JSON of the
/// expected shape
pub fn parse_server_message(text: &str) -> Result<Vec<ServerEvent>> {
    let raw: RawServerMessage = serde_json::from_str(text)
        .map_err(|e| Error::Decode(format!("malformed server message: {e}")))?;

    let mut events = Vec::new();

    if raw.setup_complete.is_some() {
        events.push(ServerEvent::SetupComplete);
    }

    if let Some(content) = raw.server_content {
        let parts = content.model_turn.map(|t| t.parts).unwrap_or_default();
        for blob in parts.into_iter().filter_map(|p| p.inline_data) {
            match blob.mime_type.as_deref().map_or(Some(DEFAULT_OUTPUT_RATE), pcm_rate) {
                Some(sample_rate) => events.push(ServerEvent::Audio {
                    data: blob.data,
                    sample_rate,
                }),
                None => {
                    tracing::debug!(mime_type = ?blob.mime_type, "skipping non-audio inline data");
                }
            }
        }
        if content.interrupted {
            events.push(ServerEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(ServerEvent::TurnComplete);
        }
    }

    if let Some(go_away) = raw.go_away {
        events.push(ServerEvent::GoAway {
            time_left: go_away.time_left,
        });
    }

    Ok(events)
}

/// MIME type tag for raw PCM16 at `sample_rate`
#[must_use]
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={sample_rate}")
}

/// Sample rate of an `audio/pcm` MIME type, `None` for anything else
fn pcm_rate(mime_type: &str) -> Option<u32> {
    let mut params = mime_type.split(';').map(str::trim);
    if !params.next()?.eq_ignore_ascii_case("audio/pcm") {
        return None;
    }
    let rate = params
        .filter_map(|p| p.strip_prefix("rate="))
        .find_map(|r| r.parse().ok());
    Some(rate.unwrap_or(DEFAULT_OUTPUT_RATE))
}
