//! PCM16 frame codec
//!
//! Frames travel as little-endian signed 16-bit PCM packed into bytes and
//! wrapped in standard base64, since the transport only carries text.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::{Error, Result};

/// Scale between normalized float samples and i16 PCM
const PCM16_SCALE: f32 = 32768.0;

/// A decoded, playable block of planar audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    /// Build a buffer from planar channel data
    ///
    /// # Errors
    ///
    /// Returns error if there are no channels, the rate is zero, or the
    /// channels differ in length
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Result<Self> {
        if sample_rate == 0 {
            return Err(Error::Decode("sample rate must be non-zero".to_string()));
        }
        let Some(first) = channels.first() else {
            return Err(Error::Decode("buffer needs at least one channel".to_string()));
        };
        let frames = first.len();
        if channels.iter().any(|c| c.len() != frames) {
            return Err(Error::Decode("channel lengths differ".to_string()));
        }
        Ok(Self {
            sample_rate,
            channels,
        })
    }

    /// Single-channel buffer
    ///
    /// # Errors
    ///
    /// Returns error if the sample rate is zero
    pub fn mono(sample_rate: u32, samples: Vec<f32>) -> Result<Self> {
        Self::new(sample_rate, vec![samples])
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Samples per channel
    #[must_use]
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Samples of one channel
    #[must_use]
    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    /// Playback length in seconds
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / f64::from(self.sample_rate)
    }

    /// Sample for output frame `frame` on output channel `out_channel`
    ///
    /// Mono buffers are duplicated onto every output channel; extra output
    /// channels beyond the buffer's count reuse its last channel.
    #[must_use]
    pub fn sample_for(&self, frame: usize, out_channel: usize) -> f32 {
        let index = out_channel.min(self.channels.len().saturating_sub(1));
        self.channels
            .get(index)
            .and_then(|c| c.get(frame))
            .copied()
            .unwrap_or(0.0)
    }
}

/// Convert one normalized float sample to i16 PCM
///
/// Values outside [-1, 1) saturate at the i16 bounds.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn f32_to_i16(sample: f32) -> i16 {
    // `as` saturates and maps NaN to zero
    (sample * PCM16_SCALE) as i16
}

/// Convert one i16 PCM sample to a normalized float
#[must_use]
pub fn i16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / PCM16_SCALE
}

/// Encode normalized float samples as base64 PCM16
#[must_use]
pub fn encode_pcm16(samples: &[f32]) -> String {
    let bytes: Vec<u8> = samples
        .iter()
        .flat_map(|&s| f32_to_i16(s).to_le_bytes())
        .collect();
    STANDARD.encode(bytes)
}

/// Encode integer samples as base64 PCM16
#[must_use]
pub fn encode_i16(samples: &[i16]) -> String {
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    STANDARD.encode(bytes)
}

/// Decode a base64 PCM16 payload into raw integer samples
///
/// # Errors
///
/// Returns [`Error::Decode`] for invalid base64 or an odd byte count
pub fn decode_i16(payload: &str) -> Result<Vec<i16>> {
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| Error::Decode(format!("invalid base64: {e}")))?;

    if bytes.len() % 2 != 0 {
        return Err(Error::Decode(format!(
            "odd PCM16 byte count: {}",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Decode a base64 PCM16 payload into a playable buffer
///
/// Interleaved input is split per channel: sample `i` of channel `c` is read
/// from flat index `i * num_channels + c`.
///
/// # Errors
///
/// Returns [`Error::Decode`] if the payload is malformed, `num_channels` is
/// zero, or the sample count is not a multiple of `num_channels`
pub fn decode_pcm16(payload: &str, sample_rate: u32, num_channels: usize) -> Result<AudioBuffer> {
    if num_channels == 0 {
        return Err(Error::Decode("channel count must be non-zero".to_string()));
    }

    let samples = decode_i16(payload)?;
    if samples.len() % num_channels != 0 {
        return Err(Error::Decode(format!(
            "{} samples do not divide into {num_channels} channels",
            samples.len()
        )));
    }

    let frame_count = samples.len() / num_channels;
    let channels = (0..num_channels)
        .map(|channel| {
            (0..frame_count)
                .map(|i| i16_to_f32(samples[i * num_channels + channel]))
                .collect()
        })
        .collect();

    AudioBuffer::new(sample_rate, channels)
}
