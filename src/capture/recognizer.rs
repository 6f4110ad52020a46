//! Default recognizer: microphone + endpointer + Whisper
//!
//! Opening the device, endpointing and stopping the recording all block, so
//! each runs on tokio's blocking pool and never on the call loop.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use super::endpoint::{Endpoint, EndpointConfig, Endpointer, SpeechClassifier};
use super::microphone::MicCapture;
use super::paths::cleanup_old_utterances;
use super::whisper::{is_api_key_configured, transcribe_wav};
use super::{CaptureError, RecognizerEvent, RecognizerSink, SpeechRecognizer};

/// Mono frames buffered between the audio callback and the endpointer
const FRAME_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct WhisperOptions {
    pub model: String,
    pub language: Option<String>,
    pub endpoint: EndpointConfig,
}

struct ActiveCapture {
    id: u64,
    cancel: CancellationToken,
    finish: Arc<Notify>,
}

pub struct WhisperRecognizer {
    sink: RecognizerSink,
    options: WhisperOptions,
    active: Option<ActiveCapture>,
}

impl WhisperRecognizer {
    pub fn new(options: WhisperOptions, sink: RecognizerSink) -> Self {
        Self {
            sink,
            options,
            active: None,
        }
    }

    fn cancel_active(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            log::debug!("Cancelled capture {}", active.id);
        }
    }
}

impl SpeechRecognizer for WhisperRecognizer {
    fn is_supported(&self) -> bool {
        is_api_key_configured() && MicCapture::is_available()
    }

    /// Returns at once; the microphone opens on a blocking thread and any
    /// failure to open it is reported through the sink.
    fn start(&mut self, capture_id: u64) -> Result<(), CaptureError> {
        self.cancel_active();

        let cancel = CancellationToken::new();
        let finish = Arc::new(Notify::new());
        tokio::spawn(run_capture(
            capture_id,
            cancel.clone(),
            finish.clone(),
            self.options.clone(),
            self.sink.clone(),
        ));

        self.active = Some(ActiveCapture {
            id: capture_id,
            cancel,
            finish,
        });
        Ok(())
    }

    fn stop(&mut self, capture_id: u64) {
        if self.active.as_ref().is_some_and(|a| a.id == capture_id) {
            self.cancel_active();
        }
    }

    fn finish(&mut self, capture_id: u64) {
        if let Some(active) = self.active.as_ref().filter(|a| a.id == capture_id) {
            active.finish.notify_one();
        }
    }
}

impl Drop for WhisperRecognizer {
    fn drop(&mut self) {
        // The capture task still finalizes its WAV before exiting
        self.cancel_active();
    }
}

/// How the listening phase ended.
#[derive(Debug, PartialEq)]
enum Heard {
    Cancelled,
    Nothing,
    Utterance,
    DeviceSilent,
    Failed(CaptureError),
}

/// Listener progress visible to the async side.
#[derive(Default)]
struct Progress {
    frames_seen: AtomicUsize,
    heard_speech: AtomicBool,
}

impl Progress {
    fn verdict(&self) -> Heard {
        if self.frames_seen.load(Ordering::Relaxed) == 0 {
            Heard::DeviceSilent
        } else if self.heard_speech.load(Ordering::Relaxed) {
            Heard::Utterance
        } else {
            Heard::Nothing
        }
    }
}

/// Feed microphone frames to the endpointer until it decides or the
/// recording closes the channel. Runs on a blocking thread.
fn listen<C: SpeechClassifier>(
    mut endpointer: Endpointer<C>,
    frames: &mut mpsc::Receiver<Vec<f32>>,
    progress: &Progress,
) -> Heard {
    while let Some(frame) = frames.blocking_recv() {
        progress.frames_seen.fetch_add(1, Ordering::Relaxed);
        let endpoint = endpointer.push(&frame);
        if endpointer.heard_speech() {
            progress.heard_speech.store(true, Ordering::Relaxed);
        }
        match endpoint {
            Endpoint::Continue => {}
            Endpoint::Complete => return Heard::Utterance,
            Endpoint::NoSpeech => return Heard::Nothing,
        }
    }
    progress.verdict()
}

async fn run_capture(
    id: u64,
    cancel: CancellationToken,
    finish: Arc<Notify>,
    options: WhisperOptions,
    sink: RecognizerSink,
) {
    let (frames_tx, mut frames_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    let opened = tokio::task::spawn_blocking(move || MicCapture::start(id, frames_tx)).await;
    let recording = match opened {
        Ok(Ok(recording)) => recording,
        Ok(Err(e)) => {
            log::error!("Failed to open microphone for capture {}: {}", id, e);
            if !cancel.is_cancelled() {
                sink(RecognizerEvent::Error {
                    capture_id: id,
                    error: e,
                });
            }
            return;
        }
        Err(e) => {
            if !cancel.is_cancelled() {
                sink(RecognizerEvent::Error {
                    capture_id: id,
                    error: CaptureError::Device(e.to_string()),
                });
            }
            return;
        }
    };

    if cancel.is_cancelled() {
        log::debug!("Capture {} cancelled while the microphone opened", id);
        let _ = tokio::task::spawn_blocking(move || recording.stop()).await;
        return;
    }

    let rate = recording.sample_rate();
    let config = options.endpoint;
    let progress = Arc::new(Progress::default());
    let listener_progress = progress.clone();
    let mut listener = tokio::task::spawn_blocking(move || {
        // Vad is not Send, so it is built on the thread that uses it
        match Endpointer::new(config, rate) {
            Ok(endpointer) => listen(endpointer, &mut frames_rx, &listener_progress),
            Err(e) => Heard::Failed(e),
        }
    });

    // Wall-clock guard in case the device stops delivering frames
    let deadline = tokio::time::sleep(Duration::from_millis(
        config.max_utterance_ms.max(config.no_speech_timeout_ms) + 1000,
    ));
    tokio::pin!(deadline);

    let heard = tokio::select! {
        _ = cancel.cancelled() => Heard::Cancelled,
        _ = finish.notified() => Heard::Utterance,
        _ = &mut deadline => {
            log::warn!("Capture {} hit the wall-clock limit", id);
            progress.verdict()
        }
        joined = &mut listener => match joined {
            Ok(heard) => heard,
            Err(e) => Heard::Failed(CaptureError::Device(e.to_string())),
        },
    };

    let stopped = tokio::task::spawn_blocking(move || recording.stop()).await;
    if let Err(e) = tokio::task::spawn_blocking(cleanup_old_utterances).await {
        log::debug!("Utterance cleanup task failed: {}", e);
    }

    let wav_path: PathBuf = match stopped {
        Ok(Ok(path)) => path,
        Ok(Err(e)) => {
            if !cancel.is_cancelled() {
                sink(RecognizerEvent::Error {
                    capture_id: id,
                    error: e,
                });
            }
            return;
        }
        Err(e) => {
            if !cancel.is_cancelled() {
                sink(RecognizerEvent::Error {
                    capture_id: id,
                    error: CaptureError::Device(e.to_string()),
                });
            }
            return;
        }
    };

    match heard {
        Heard::Cancelled => {
            log::debug!("Capture {} abandoned, {:?} kept for cleanup", id, wav_path);
            return;
        }
        Heard::Nothing => {
            log::info!("Capture {} ended without speech", id);
            sink(RecognizerEvent::Ended { capture_id: id });
            return;
        }
        Heard::DeviceSilent => {
            log::warn!("Capture {} received no audio from the microphone", id);
            sink(RecognizerEvent::Error {
                capture_id: id,
                error: CaptureError::NoAudio,
            });
            return;
        }
        Heard::Failed(error) => {
            log::error!("Endpointing failed for capture {}: {}", id, error);
            sink(RecognizerEvent::Error {
                capture_id: id,
                error,
            });
            return;
        }
        Heard::Utterance => {}
    }

    let result = transcribe_wav(&wav_path, &options.model, options.language.as_deref()).await;
    if cancel.is_cancelled() {
        return;
    }

    match result {
        Ok(result) if result.is_no_speech() => {
            log::info!(
                "Treating transcription as no-speech (no_speech_prob={:?}, text_len={})",
                result.no_speech_prob,
                result.text.trim().len()
            );
            sink(RecognizerEvent::Ended { capture_id: id });
        }
        Ok(result) => {
            sink(RecognizerEvent::Final {
                capture_id: id,
                text: result.text,
            });
            sink(RecognizerEvent::Ended { capture_id: id });
        }
        Err(e) => {
            log::error!("Transcription failed for capture {}: {}", id, e);
            sink(RecognizerEvent::Error {
                capture_id: id,
                error: CaptureError::Transcription(e.to_string()),
            });
        }
    }
}
