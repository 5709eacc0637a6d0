//! Audio playback to speakers
//!
//! Buffers are scheduled on a [`Mixer`] whose clock is the number of frames
//! the device has rendered, so start times are sample-accurate and
//! back-to-back buffers play without gaps.

use std::sync::{Arc, Mutex, PoisonError};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream};
use tokio::sync::mpsc;

use super::device::{AudioOutput, BufferId, OutputDevice};
use super::resample::resample_buffer;
use crate::codec::AudioBuffer;
use crate::{Error, Result};

/// Sample rate for playback (matches live model speech output)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

#[derive(Debug)]
struct Voice {
    id: BufferId,
    buffer: AudioBuffer,
    start_frame: u64,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.buffer.frames() as u64
    }
}

/// Sums scheduled buffers into device output
#[derive(Debug)]
pub struct Mixer {
    sample_rate: u32,
    rendered: u64,
    next_id: BufferId,
    voices: Vec<Voice>,
    completions: mpsc::UnboundedSender<BufferId>,
}

impl Mixer {
    #[must_use]
    pub const fn new(sample_rate: u32, completions: mpsc::UnboundedSender<BufferId>) -> Self {
        Self {
            sample_rate,
            rendered: 0,
            next_id: 1,
            voices: Vec::new(),
            completions,
        }
    }

    /// Clock in seconds
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn now(&self) -> f64 {
        self.rendered as f64 / f64::from(self.sample_rate)
    }

    /// Buffers not yet finished
    #[must_use]
    pub fn active(&self) -> usize {
        self.voices.len()
    }

    /// Schedule `buffer` at `start_at` seconds; past times start immediately
    ///
    /// # Errors
    ///
    /// Returns error if the buffer's rate differs from the mixer's
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn schedule(&mut self, buffer: AudioBuffer, start_at: f64) -> Result<BufferId> {
        if buffer.sample_rate() != self.sample_rate {
            return Err(Error::Audio(format!(
                "buffer rate {} Hz does not match device rate {} Hz",
                buffer.sample_rate(),
                self.sample_rate
            )));
        }

        let requested = (start_at.max(0.0) * f64::from(self.sample_rate)).round() as u64;
        let id = self.next_id;
        self.next_id += 1;

        self.voices.push(Voice {
            id,
            buffer,
            start_frame: requested.max(self.rendered),
        });
        Ok(id)
    }

    /// Remove a buffer without reporting completion
    pub fn stop(&mut self, id: BufferId) {
        self.voices.retain(|v| v.id != id);
    }

    /// Remove every buffer without reporting completion
    pub fn clear(&mut self) {
        self.voices.clear();
    }

    /// Fill an interleaved output slice and advance the clock
    pub fn render(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);

        for (offset, frame) in out.chunks_mut(channels).enumerate() {
            let t = self.rendered + offset as u64;
            for (channel, sample) in frame.iter_mut().enumerate() {
                *sample = self
                    .voices
                    .iter()
                    .filter(|v| v.start_frame <= t && t < v.end_frame())
                    .map(|v| {
                        #[allow(clippy::cast_possible_truncation)]
                        let index = (t - v.start_frame) as usize;
                        v.buffer.sample_for(index, channel)
                    })
                    .sum::<f32>()
                    .clamp(-1.0, 1.0);
            }
        }

        self.rendered += out.len().div_ceil(channels) as u64;

        let rendered = self.rendered;
        let completions = &self.completions;
        self.voices.retain(|v| {
            if v.end_frame() <= rendered {
                let _ = completions.send(v.id);
                false
            } else {
                true
            }
        });
    }
}

/// Default-host speaker
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalOutput;

impl AudioOutput for CpalOutput {
    fn open(
        &self,
        sample_rate: u32,
        completions: mpsc::UnboundedSender<BufferId>,
    ) -> Result<Box<dyn OutputDevice>> {
        Ok(Box::new(AudioPlayback::open(sample_rate, completions)?))
    }
}

/// Plays scheduled buffers on the default output device
pub struct AudioPlayback {
    mixer: Arc<Mutex<Mixer>>,
    stream: Option<Stream>,
    sample_rate: u32,
    channels: u16,
}

impl AudioPlayback {
    /// Open the default output device and start its mixer
    ///
    /// Prefers a mono or stereo config at `sample_rate`; otherwise the device
    /// runs at its default config and buffers are resampled on scheduling.
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn open(sample_rate: u32, completions: mpsc::UnboundedSender<BufferId>) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let supports = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
            c.channels() == channels
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        };

        let native = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| supports(c, 1))
            .or_else(|| {
                // Fallback: try stereo
                device
                    .supported_output_configs()
                    .ok()?
                    .find(|c| supports(c, 2))
            })
            .map(|c| c.with_sample_rate(SampleRate(sample_rate)).config());

        let config = match native {
            Some(config) => config,
            None => device
                .default_output_config()
                .map_err(|e| Error::Audio(e.to_string()))?
                .config(),
        };
        let channels = config.channels;
        let device_rate = config.sample_rate.0;

        let mixer = Arc::new(Mutex::new(Mixer::new(device_rate, completions)));
        let cb_mixer = Arc::clone(&mixer);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if let Ok(mut mixer) = cb_mixer.lock() {
                        mixer.render(data, usize::from(channels));
                    } else {
                        data.fill(0.0);
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            device_rate,
            sample_rate,
            channels,
            "audio playback initialized"
        );

        Ok(Self {
            mixer,
            stream: Some(stream),
            sample_rate: device_rate,
            channels,
        })
    }

    /// Output channel count
    #[must_use]
    pub const fn channels(&self) -> u16 {
        self.channels
    }

    /// Rate the device renders at
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl OutputDevice for AudioPlayback {
    fn now(&self) -> f64 {
        self.mixer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .now()
    }

    fn schedule(&mut self, buffer: AudioBuffer, start_at: f64) -> Result<BufferId> {
        if self.stream.is_none() {
            return Err(Error::Audio("output device closed".to_string()));
        }
        // Convert outside the lock the render callback takes
        let buffer = resample_buffer(buffer, self.sample_rate)?;
        self.mixer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .schedule(buffer, start_at)
    }

    fn stop(&mut self, id: BufferId) {
        self.mixer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stop(id);
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.mixer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            drop(stream);
            tracing::debug!("audio playback closed");
        }
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono(samples: &[f32]) -> AudioBuffer {
        AudioBuffer::mono(4, samples.to_vec()).unwrap()
    }

    #[test]
    fn test_back_to_back_without_gap() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(4, tx);

        mixer.schedule(mono(&[0.1, 0.2]), 0.0).unwrap();
        mixer.schedule(mono(&[0.3, 0.4]), 0.5).unwrap();

        let mut out = [0.0f32; 4];
        mixer.render(&mut out, 1);
        assert_eq!(out, [0.1, 0.2, 0.3, 0.4]);
        assert!((mixer.now() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_completion_reported_once_finished() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(4, tx);
        let id = mixer.schedule(mono(&[0.5, 0.5, 0.5]), 0.0).unwrap();

        let mut out = [0.0f32; 2];
        mixer.render(&mut out, 1);
        assert!(rx.try_recv().is_err());

        mixer.render(&mut out, 1);
        assert_eq!(rx.try_recv().unwrap(), id);
        assert_eq!(mixer.active(), 0);
    }

    #[test]
    fn test_stop_is_silent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(4, tx);
        let id = mixer.schedule(mono(&[0.5; 4]), 0.0).unwrap();
        mixer.stop(id);

        let mut out = [1.0f32; 4];
        mixer.render(&mut out, 1);
        assert_eq!(out, [0.0; 4]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_mono_buffer_on_stereo_device() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(4, tx);
        mixer.schedule(mono(&[0.25]), 0.0).unwrap();

        let mut out = [0.0f32; 2];
        mixer.render(&mut out, 2);
        assert_eq!(out, [0.25, 0.25]);
    }

    #[test]
    fn test_past_start_plays_now() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(4, tx);
        let mut out = [0.0f32; 4];
        mixer.render(&mut out, 1);

        mixer.schedule(mono(&[0.75]), 0.0).unwrap();
        let mut out = [0.0f32; 1];
        mixer.render(&mut out, 1);
        assert_eq!(out, [0.75]);
    }

    #[test]
    fn test_rate_mismatch_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(24000, tx);
        let buffer = AudioBuffer::mono(16000, vec![0.0]).unwrap();
        assert!(matches!(mixer.schedule(buffer, 0.0), Err(Error::Audio(_))));
    }
}
