//! Sample rate conversion between device and endpoint rates
//!
//! Devices that cannot run at the endpoint's 16kHz/24kHz are opened at their
//! native rate and converted here with rubato.

use rubato::{FftFixedIn, ResampleError, Resampler as _};

use crate::codec::AudioBuffer;
use crate::{Error, Result};

/// Input frames per resampler call
const CHUNK_SIZE: usize = 1024;

/// FFT sub-chunks per input chunk
const SUB_CHUNKS: usize = 2;

#[allow(clippy::cast_possible_truncation)]
fn new_resampler(from_rate: u32, to_rate: u32) -> Result<FftFixedIn<f32>> {
    FftFixedIn::<f32>::new(
        from_rate as usize,
        to_rate as usize,
        CHUNK_SIZE,
        SUB_CHUNKS,
        1,
    )
    .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))
}

fn resample_failed(e: ResampleError) -> Error {
    Error::Audio(format!("resample failed: {e}"))
}

/// Length of `frames` samples at `from_rate` once converted to `to_rate`
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn output_frames(frames: usize, from_rate: u32, to_rate: u32) -> usize {
    let from = u64::from(from_rate.max(1));
    let scaled = frames as u64 * u64::from(to_rate);
    ((scaled + from / 2) / from) as usize
}

/// Convert a mono signal from `from_rate` to `to_rate`
///
/// The result has exactly [`output_frames`] samples with the resampler delay
/// removed, so buffers converted one by one keep their place on a timeline.
///
/// # Errors
///
/// Returns [`Error::Audio`] if the resampler rejects the rates
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler = new_resampler(from_rate, to_rate)?;
    let expected = output_frames(samples.len(), from_rate, to_rate);
    let delay = resampler.output_delay();
    let mut output = Vec::with_capacity(expected + delay);

    let mut rest = samples;
    while rest.len() >= resampler.input_frames_next() {
        let (chunk, tail) = rest.split_at(resampler.input_frames_next());
        let wave = [chunk];
        let result = resampler
            .process(&wave[..], None)
            .map_err(resample_failed)?;
        output.extend_from_slice(&result[0]);
        rest = tail;
    }

    if !rest.is_empty() {
        let wave = [rest];
        let result = resampler
            .process_partial(Some(&wave[..]), None)
            .map_err(resample_failed)?;
        output.extend_from_slice(&result[0]);
    }

    // Flush what is still in the filter
    while output.len() < delay + expected {
        let result = resampler
            .process_partial(None::<&[&[f32]]>, None)
            .map_err(resample_failed)?;
        if result[0].is_empty() {
            break;
        }
        output.extend_from_slice(&result[0]);
    }

    output.drain(..delay.min(output.len()));
    output.resize(expected, 0.0);
    Ok(output)
}

/// Convert every channel of `buffer` to `to_rate`
///
/// # Errors
///
/// Returns [`Error::Audio`] if conversion fails
pub fn resample_buffer(buffer: AudioBuffer, to_rate: u32) -> Result<AudioBuffer> {
    if buffer.sample_rate() == to_rate {
        return Ok(buffer);
    }

    let channels = (0..buffer.num_channels())
        .filter_map(|c| buffer.channel(c))
        .map(|samples| resample(samples, buffer.sample_rate(), to_rate))
        .collect::<Result<Vec<_>>>()?;

    AudioBuffer::new(to_rate, channels)
}

/// Incremental converter for a continuous mono stream
///
/// Input is held back until a whole resampler chunk is available, so output
/// lags input by up to one chunk.
pub struct StreamResampler {
    inner: Option<FftFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    /// Converter from `from_rate` to `to_rate`; a pass-through if they match
    ///
    /// # Errors
    ///
    /// Returns [`Error::Audio`] if the resampler rejects the rates
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        let inner = if from_rate == to_rate {
            None
        } else {
            Some(new_resampler(from_rate, to_rate)?)
        };

        Ok(Self {
            inner,
            pending: Vec::new(),
        })
    }

    /// Feed samples and return whatever output is ready
    ///
    /// # Errors
    ///
    /// Returns [`Error::Audio`] if conversion fails
    pub fn process(&mut self, data: &[f32]) -> Result<Vec<f32>> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(data.to_vec());
        };

        self.pending.extend_from_slice(data);

        let mut output = Vec::new();
        while self.pending.len() >= resampler.input_frames_next() {
            let chunk: Vec<f32> = self
                .pending
                .drain(..resampler.input_frames_next())
                .collect();
            let result = resampler.process(&[chunk], None).map_err(resample_failed)?;
            output.extend_from_slice(&result[0]);
        }

        Ok(output)
    }

    /// Drop input waiting for a full chunk
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(clippy::cast_precision_loss)]
    fn tone(sample_rate: u32, count: usize) -> Vec<f32> {
        (0..count)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                0.5 * (2.0 * std::f32::consts::PI * 440.0 * t).sin()
            })
            .collect()
    }

    #[allow(clippy::cast_precision_loss)]
    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
    }

    #[test]
    fn test_same_rate_is_passthrough() {
        let samples = tone(24000, 100);
        assert_eq!(resample(&samples, 24000, 24000).unwrap(), samples);
    }

    #[test]
    fn test_output_length_is_exact() {
        assert_eq!(resample(&[0.0; 2400], 24000, 48000).unwrap().len(), 4800);
        assert_eq!(resample(&[0.0; 2400], 24000, 44100).unwrap().len(), 4410);
        assert_eq!(resample(&[0.0; 1000], 24000, 16000).unwrap().len(), 667);
        assert_eq!(output_frames(4096, 16000, 16000), 4096);
    }

    #[test]
    fn test_tone_level_preserved() {
        let input = tone(24000, 4800);
        let output = resample(&input, 24000, 48000).unwrap();

        // Skip the edges where the filter ramps
        let middle = &output[2400..7200];
        assert!((rms(middle) - rms(&input)).abs() < 0.02);
    }

    #[test]
    fn test_buffer_channels_resampled() {
        let buffer = AudioBuffer::new(24000, vec![vec![0.0; 240], vec![0.0; 240]]).unwrap();
        let converted = resample_buffer(buffer, 48000).unwrap();

        assert_eq!(converted.sample_rate(), 48000);
        assert_eq!(converted.num_channels(), 2);
        assert_eq!(converted.frames(), 480);
        assert!((converted.duration() - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_stream_resampler_rate() {
        let mut resampler = StreamResampler::new(48000, 16000).unwrap();
        let input = tone(48000, 48000);

        let mut total = 0;
        for block in input.chunks(480) {
            total += resampler.process(block).unwrap().len();
        }

        // One chunk may still be held back
        assert!(total <= 16000);
        assert!(total >= 16000 - CHUNK_SIZE);
    }

    #[test]
    fn test_stream_resampler_passthrough() {
        let mut resampler = StreamResampler::new(16000, 16000).unwrap();
        assert_eq!(resampler.process(&[0.25, 0.5]).unwrap(), vec![0.25, 0.5]);
    }
}
