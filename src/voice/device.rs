//! Audio device seams used by the live session
//!
//! The session only talks to these traits; `cpal` implementations live in
//! `capture.rs` and `playback.rs`.

use tokio::sync::mpsc;

use crate::Result;
use crate::codec::AudioBuffer;

/// Handle of a buffer scheduled on an output device
pub type BufferId = u64;

/// Opens the microphone
pub trait AudioInput {
    /// Request microphone access and prepare a capture stream
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Permission`] if access is denied or no
    /// device is available
    fn open(&self, sample_rate: u32, frame_size: usize) -> Result<Box<dyn InputStream>>;
}

/// A prepared microphone stream
pub trait InputStream {
    /// Begin delivering fixed-size mono frames to `frames`
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be started
    fn start(&mut self, frames: mpsc::UnboundedSender<Vec<f32>>) -> Result<()>;

    /// Stop capturing and release the device; safe to call repeatedly
    fn stop(&mut self);
}

/// Opens the speaker
pub trait AudioOutput {
    /// Open an output device playing at `sample_rate`
    ///
    /// Buffers that finish playing naturally are reported on `completions`
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Audio`] if no device can be opened
    fn open(
        &self,
        sample_rate: u32,
        completions: mpsc::UnboundedSender<BufferId>,
    ) -> Result<Box<dyn OutputDevice>>;
}

/// An open output device with a monotonic clock
pub trait OutputDevice {
    /// Device clock in seconds
    fn now(&self) -> f64;

    /// Schedule `buffer` to start at `start_at` seconds on the device clock
    ///
    /// # Errors
    ///
    /// Returns error if the device is closed or cannot play the buffer
    fn schedule(&mut self, buffer: AudioBuffer, start_at: f64) -> Result<BufferId>;

    /// Stop a scheduled buffer immediately; no completion is reported
    fn stop(&mut self, id: BufferId);

    /// Release the device; safe to call repeatedly
    fn close(&mut self);
}
