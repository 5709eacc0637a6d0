//! Audio capture from microphone

use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::device::{AudioInput, InputStream};
use super::resample::StreamResampler;
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Rechunks arbitrary callback sizes into fixed windows
#[derive(Debug)]
pub struct FrameAccumulator {
    frame_size: usize,
    pending: Vec<f32>,
}

impl FrameAccumulator {
    #[must_use]
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size: frame_size.max(1),
            pending: Vec::with_capacity(frame_size),
        }
    }

    /// Append samples and return every window completed by them
    pub fn push(&mut self, data: &[f32]) -> Vec<Vec<f32>> {
        let mut frames = Vec::new();
        let mut rest = data;

        while !rest.is_empty() {
            let take = (self.frame_size - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.pending.len() == self.frame_size {
                frames.push(std::mem::replace(
                    &mut self.pending,
                    Vec::with_capacity(self.frame_size),
                ));
            }
        }

        frames
    }

    /// Samples waiting for a full window
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drop any partial window
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Turns interleaved device callbacks into mono windows at the session rate
pub struct CapturePipeline {
    channels: usize,
    resampler: StreamResampler,
    accumulator: FrameAccumulator,
}

impl CapturePipeline {
    /// Pipeline from a `device_rate`/`channels` stream to `frame_size`
    /// windows at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Audio`] if the rates cannot be converted
    pub fn new(
        device_rate: u32,
        channels: u16,
        sample_rate: u32,
        frame_size: usize,
    ) -> Result<Self> {
        Ok(Self {
            channels: usize::from(channels.max(1)),
            resampler: StreamResampler::new(device_rate, sample_rate)?,
            accumulator: FrameAccumulator::new(frame_size),
        })
    }

    /// Append one callback's samples and return every completed window
    ///
    /// # Errors
    ///
    /// Returns [`Error::Audio`] if resampling fails
    pub fn push(&mut self, data: &[f32]) -> Result<Vec<Vec<f32>>> {
        let samples = if self.channels == 1 {
            self.resampler.process(data)?
        } else {
            self.resampler.process(&downmix(data, self.channels))?
        };
        Ok(self.accumulator.push(&samples))
    }

    /// Drop partial windows and held-back input
    pub fn clear(&mut self) {
        self.resampler.clear();
        self.accumulator.clear();
    }
}

/// Average interleaved channels into one
#[allow(clippy::cast_precision_loss)]
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Where completed frames go; `None` until capture starts
type FrameSink = Arc<Mutex<Option<mpsc::UnboundedSender<Vec<f32>>>>>;

/// Default-host microphone
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalInput;

impl AudioInput for CpalInput {
    fn open(&self, sample_rate: u32, frame_size: usize) -> Result<Box<dyn InputStream>> {
        Ok(Box::new(AudioCapture::open(sample_rate, frame_size)?))
    }
}

/// Captures fixed-size frames from the default input device
pub struct AudioCapture {
    sample_rate: u32,
    sink: FrameSink,
    pipeline: Arc<Mutex<CapturePipeline>>,
    stream: Option<Stream>,
}

impl AudioCapture {
    /// Open the default input device
    ///
    /// Uses a mono config at `sample_rate` when the device has one, otherwise
    /// the device's default config converted to mono `sample_rate`. The
    /// stream is built paused; windows produced before [`InputStream::start`]
    /// are discarded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Permission`] if no device is available or the host
    /// refuses to open it
    pub fn open(sample_rate: u32, frame_size: usize) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Permission("no input device available".to_string()))?;

        let native = device
            .supported_input_configs()
            .map_err(|e| Error::Permission(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
            })
            .map(|c| c.with_sample_rate(SampleRate(sample_rate)).config());

        let config: StreamConfig = match native {
            Some(config) => config,
            None => device
                .default_input_config()
                .map_err(|e| Error::Permission(e.to_string()))?
                .config(),
        };

        let pipeline = CapturePipeline::new(
            config.sample_rate.0,
            config.channels,
            sample_rate,
            frame_size,
        )?;

        let sink: FrameSink = Arc::new(Mutex::new(None));
        let pipeline = Arc::new(Mutex::new(pipeline));

        let cb_sink = Arc::clone(&sink);
        let cb_pipeline = Arc::clone(&pipeline);

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let Ok(sink) = cb_sink.lock() else {
                        return;
                    };
                    let Some(tx) = sink.as_ref() else {
                        return;
                    };
                    let Ok(mut pipeline) = cb_pipeline.lock() else {
                        return;
                    };
                    match pipeline.push(data) {
                        Ok(frames) => {
                            for frame in frames {
                                let _ = tx.send(frame);
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "dropping capture block"),
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(|e| Error::Permission(e.to_string()))?;

        if let Err(e) = stream.pause() {
            tracing::debug!(error = %e, "input stream could not be paused");
        }

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            device_rate = config.sample_rate.0,
            sample_rate,
            frame_size,
            channels = config.channels,
            "audio capture initialized"
        );

        Ok(Self {
            sample_rate,
            sink,
            pipeline,
            stream: Some(stream),
        })
    }

    /// Rate of the delivered frames
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl InputStream for AudioCapture {
    fn start(&mut self, frames: mpsc::UnboundedSender<Vec<f32>>) -> Result<()> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| Error::Audio("capture stream already released".to_string()))?;

        if let Ok(mut sink) = self.sink.lock() {
            *sink = Some(frames);
        }

        stream
            .play()
            .map_err(|e| Error::Permission(e.to_string()))?;

        tracing::debug!("audio capture started");
        Ok(())
    }

    fn stop(&mut self) {
        if let Ok(mut sink) = self.sink.lock() {
            sink.take();
        }
        if let Ok(mut pipeline) = self.pipeline.lock() {
            pipeline.clear();
        }
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Convert f32 samples to WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            writer
                .write_sample(crate::codec::f32_to_i16(sample))
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Root-mean-square energy of a window
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
