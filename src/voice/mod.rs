//! Voice I/O module
//!
//! Microphone capture and scheduled speaker playback behind the device
//! traits the live session consumes. Devices that cannot run at the
//! endpoint rates are resampled.

mod capture;
mod device;
mod playback;
pub mod resample;

pub use capture::{
    AudioCapture, CapturePipeline, CpalInput, FrameAccumulator, SAMPLE_RATE, calculate_rms,
    samples_to_wav,
};
pub use device::{AudioInput, AudioOutput, BufferId, InputStream, OutputDevice};
pub use playback::{AudioPlayback, CpalOutput, Mixer, PLAYBACK_SAMPLE_RATE};
