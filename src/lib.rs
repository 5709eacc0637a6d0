//! Live Mentor - realtime voice conversations with a streaming AI mentor
//!
//! This library provides the realtime audio session behind the voice mentor:
//! - Microphone capture in fixed 16kHz PCM16 frames
//! - Base64 frame codec for the text-based transport
//! - Gapless scheduled playback of 24kHz model speech
//! - Server interruption and clean teardown
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  frames   ┌──────────────────┐  realtimeInput  ┌─────────────┐
//! │  Microphone  │──────────▶│                  │────────────────▶│             │
//! └──────────────┘           │     Session      │                 │ Live model  │
//! ┌──────────────┐  schedule │  cursor, tracked │  audio, interr. │  endpoint   │
//! │   Speaker    │◀──────────│     buffers      │◀────────────────│             │
//! └──────────────┘           └──────────────────┘                 └─────────────┘
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod live;
pub mod voice;

pub use codec::AudioBuffer;
pub use config::Config;
pub use error::{Error, Result};
pub use live::{Session, SessionConfig, SessionController, SessionState, SessionStatus};
