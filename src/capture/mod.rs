//! Speech capture for the user's turn
//!
//! [`SpeechCapture`] wraps a [`SpeechRecognizer`] in single-utterance mode.
//! Recognizers report asynchronously through a [`RecognizerSink`]; the
//! adapter filters those reports by capture id so a superseded capture can
//! never deliver a transcript.
//!
//! The default recognizer records the microphone with CPAL, ends the
//! utterance with a WebRTC VAD endpointer and transcribes it with Whisper.

mod endpoint;
mod microphone;
mod paths;
mod recognizer;
mod whisper;

use std::sync::Arc;

pub use endpoint::{Endpoint, EndpointConfig, Endpointer, SpeechClassifier};
pub use microphone::{MicCapture, MicRecording};
pub use paths::{cleanup_old_utterances, create_temp_audio_dir, generate_wav_path};
pub use recognizer::{WhisperOptions, WhisperRecognizer};
pub use whisper::{is_api_key_configured, transcribe_wav, TranscriptionError, TranscriptionResult};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CaptureError {
    #[error("No audio input device found")]
    NoInputDevice,
    #[error("Microphone permission denied")]
    PermissionDenied,
    #[error("Microphone failed: {0}")]
    Device(String),
    #[error("No audio was captured")]
    NoAudio,
    #[error("Transcription failed: {0}")]
    Transcription(String),
}

/// Raw report from a recognizer, tagged with the capture it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognizerEvent {
    Final { capture_id: u64, text: String },
    /// The capture ended. After a `Final` this carries no information.
    Ended { capture_id: u64 },
    Error { capture_id: u64, error: CaptureError },
}

impl RecognizerEvent {
    pub fn capture_id(&self) -> u64 {
        match self {
            RecognizerEvent::Final { capture_id, .. }
            | RecognizerEvent::Ended { capture_id }
            | RecognizerEvent::Error { capture_id, .. } => *capture_id,
        }
    }
}

pub type RecognizerSink = Arc<dyn Fn(RecognizerEvent) + Send + Sync>;

/// A local speech-to-text capability.
pub trait SpeechRecognizer: Send {
    fn is_supported(&self) -> bool;
    /// Begin capturing one utterance.
    fn start(&mut self, capture_id: u64) -> Result<(), CaptureError>;
    /// Abandon the capture. Nothing further is reported for it.
    fn stop(&mut self, capture_id: u64);
    /// End the utterance now and report what was heard.
    fn finish(&mut self, capture_id: u64);
}

/// What a completed capture produced.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    Transcript(String),
    NoSpeech,
    Failed(CaptureError),
}

pub struct SpeechCapture {
    recognizer: Box<dyn SpeechRecognizer>,
    active: Option<u64>,
    next_id: u64,
    error: Option<CaptureError>,
}

impl SpeechCapture {
    pub fn new(recognizer: Box<dyn SpeechRecognizer>) -> Self {
        Self {
            recognizer,
            active: None,
            next_id: 1,
            error: None,
        }
    }

    pub fn is_supported(&self) -> bool {
        self.recognizer.is_supported()
    }

    pub fn is_listening(&self) -> bool {
        self.active.is_some()
    }

    pub fn error(&self) -> Option<&CaptureError> {
        self.error.as_ref()
    }

    /// Open the microphone for one utterance.
    ///
    /// An unsupported host is a silent no-op. A capture already in flight
    /// is stopped first, so at most one capture is ever live.
    pub fn start_listening(&mut self) -> Result<(), CaptureError> {
        if !self.recognizer.is_supported() {
            log::warn!("Speech capture unsupported, not listening");
            return Ok(());
        }

        self.stop_listening();
        self.error = None;

        let id = self.next_id;
        self.next_id += 1;

        match self.recognizer.start(id) {
            Ok(()) => {
                log::info!("Listening (capture {})", id);
                self.active = Some(id);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to start capture {}: {}", id, e);
                self.error = Some(e.clone());
                Err(e)
            }
        }
    }

    pub fn stop_listening(&mut self) {
        if let Some(id) = self.active.take() {
            log::info!("Stopped listening (capture {})", id);
            self.recognizer.stop(id);
        }
    }

    pub fn finish_utterance(&mut self) {
        if let Some(id) = self.active {
            log::debug!("Finishing utterance (capture {})", id);
            self.recognizer.finish(id);
        }
    }

    /// Fold a recognizer report into the adapter.
    ///
    /// Returns an outcome at most once per capture; reports for any capture
    /// other than the live one are dropped.
    pub fn on_recognizer_event(&mut self, event: RecognizerEvent) -> Option<CaptureOutcome> {
        if self.active != Some(event.capture_id()) {
            log::debug!("Dropping report from stale capture {}", event.capture_id());
            return None;
        }

        match event {
            RecognizerEvent::Final { text, .. } => {
                let text = text.trim().to_string();
                if text.is_empty() {
                    // Wait for Ended, which reports no speech
                    return None;
                }
                self.active = None;
                Some(CaptureOutcome::Transcript(text))
            }
            RecognizerEvent::Ended { .. } => {
                self.active = None;
                Some(CaptureOutcome::NoSpeech)
            }
            RecognizerEvent::Error { error, .. } => {
                self.active = None;
                self.error = Some(error.clone());
                Some(CaptureOutcome::Failed(error))
            }
        }
    }
}
