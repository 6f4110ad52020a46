//! Agent audio playback
//!
//! Encoded chunks (base64 MP3/WAV from the call server) are decoded with
//! symphonia into [`AudioBuffer`]s and handed to an [`AudioOutput`] as they
//! arrive, which renders them back to back. The [`PlaybackQueue`] owns
//! ordering and the "queue drained" signal; outputs only render what they
//! are given and report each buffer as it finishes.

mod decoder;
mod output;
mod queue;

pub use decoder::{AudioDecoder, SymphoniaDecoder};
pub use output::{AudioOutput, CpalOutput, DeferredOutput, FinishedSink};
pub use queue::PlaybackQueue;

/// Decoded PCM, interleaved f32 in [-1.0, 1.0].
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioBuffer {
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.frames() as u64 * 1000) / self.sample_rate as u64
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlaybackError {
    #[error("Audio chunk is not valid base64: {0}")]
    InvalidEncoding(String),
    #[error("Failed to decode audio chunk: {0}")]
    Decode(String),
    #[error("No audio output device found")]
    NoOutputDevice,
    #[error("Audio output failed: {0}")]
    Output(String),
}
