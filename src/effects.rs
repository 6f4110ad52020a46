//! Effect runner for the call loop
//!
//! This module applies effects produced by the state machine. It owns the
//! per-call devices: the transport client, the playback queue with its
//! output device, and the speech capture adapter with its recognizer. They
//! are built when a call opens and dropped when it closes.
//!
//! Device notifications come back into the loop as raw events and are
//! absorbed here first, so stale buffer and capture ids never reach the
//! reducer.
//!
//! Nothing here blocks the loop: the output device opens on tokio's blocking
//! pool and a failure to open it comes back as `DeviceFault`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backend::{BackendClient, Role};
use crate::capture::{
    is_api_key_configured, CaptureOutcome, MicCapture, RecognizerSink, SpeechCapture,
    SpeechRecognizer, WhisperOptions, WhisperRecognizer,
};
use crate::playback::{
    AudioDecoder, AudioOutput, CpalOutput, DeferredOutput, FinishedSink, PlaybackError,
    PlaybackQueue, SymphoniaDecoder,
};
use crate::settings::AppSettings;
use crate::state_machine::{Effect, Event, Observed};
use crate::transport::{MessageKind, TransportClient};

/// Applies effects in order on the call loop.
///
/// Completion of any async work is reported back through `tx`.
pub trait EffectRunner: Send + 'static {
    /// Read the device state the reducer depends on.
    fn observe(&self) -> Observed;
    /// Fold raw device notifications into orchestrator events.
    /// Returns `None` when the event was consumed.
    fn absorb(&mut self, event: Event) -> Option<Event>;
    fn apply(&mut self, effect: Effect, tx: &mpsc::UnboundedSender<Event>);
}

/// Factory for the audio devices a call needs.
pub trait CallDevices: Send + Sync + 'static {
    fn capture_supported(&self) -> bool;
    /// May block; it is only called from the blocking pool.
    fn open_output(&self, on_finished: FinishedSink) -> Result<Box<dyn AudioOutput>, PlaybackError>;
    fn open_recognizer(&self, sink: RecognizerSink) -> Box<dyn SpeechRecognizer>;
    fn decoder(&self) -> Box<dyn AudioDecoder> {
        Box::new(SymphoniaDecoder)
    }
}

/// Speakers and microphone of this machine, with Whisper for recognition.
pub struct SystemDevices {
    whisper: WhisperOptions,
}

impl SystemDevices {
    pub fn new(whisper: WhisperOptions) -> Self {
        Self { whisper }
    }
}

impl CallDevices for SystemDevices {
    fn capture_supported(&self) -> bool {
        if !is_api_key_configured() {
            log::warn!("OPENAI_API_KEY not set, speech recognition unavailable");
            return false;
        }
        MicCapture::is_available()
    }

    fn open_output(&self, on_finished: FinishedSink) -> Result<Box<dyn AudioOutput>, PlaybackError> {
        Ok(Box::new(CpalOutput::open(on_finished)?))
    }

    fn open_recognizer(&self, sink: RecognizerSink) -> Box<dyn SpeechRecognizer> {
        Box::new(WhisperRecognizer::new(self.whisper.clone(), sink))
    }
}

/// What the runtime needs from the settings.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub server_url: String,
    pub connect_attempts: u32,
    pub agent_timeout: Option<Duration>,
    /// `None` disables transcript logging and scoring
    pub backend: Option<BackendClient>,
}

impl RuntimeConfig {
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            server_url: settings.server_url.clone(),
            connect_attempts: settings.connect_attempts,
            agent_timeout: settings.agent_response_timeout(),
            backend: settings
                .transcript_logging
                .then(|| BackendClient::new(&settings.api_url, settings.scoring_timeout())),
        }
    }
}

/// Devices that exist only for the duration of one call.
struct ActiveCall {
    id: Uuid,
    transport: Arc<TransportClient>,
    playback: PlaybackQueue,
    capture: SpeechCapture,
    connect_task: JoinHandle<()>,
}

enum LogCommand {
    Record {
        role: Role,
        content: String,
        turn_number: u32,
    },
    Close {
        score: bool,
    },
}

pub struct CallRuntime<D: CallDevices> {
    config: RuntimeConfig,
    devices: Arc<D>,
    capture_supported: bool,
    call: Option<ActiveCall>,
    watchdog: Option<JoinHandle<()>>,
    transcript_log: Option<mpsc::UnboundedSender<LogCommand>>,
}

impl<D: CallDevices> CallRuntime<D> {
    pub fn new(config: RuntimeConfig, devices: D) -> Self {
        let capture_supported = devices.capture_supported();
        Self {
            config,
            devices: Arc::new(devices),
            capture_supported,
            call: None,
            watchdog: None,
            transcript_log: None,
        }
    }

    fn active(&mut self, call_id: Uuid) -> Option<&mut ActiveCall> {
        self.call.as_mut().filter(|c| c.id == call_id)
    }

    fn open_call(&mut self, call_id: Uuid, tx: &mpsc::UnboundedSender<Event>) {
        self.close_call();

        let finished_tx = tx.clone();
        let on_finished: FinishedSink = Arc::new(move |buffer_id| {
            let _ = finished_tx.send(Event::BufferFinished { call_id, buffer_id });
        });
        let devices = self.devices.clone();
        let fault_tx = tx.clone();
        let output = DeferredOutput::spawn(
            move || devices.open_output(on_finished),
            move |e| {
                let _ = fault_tx.send(Event::DeviceFault {
                    call_id,
                    error: e.to_string(),
                });
            },
        );

        let recognizer_tx = tx.clone();
        let sink: RecognizerSink = Arc::new(move |event| {
            let _ = recognizer_tx.send(Event::Recognizer { call_id, event });
        });
        let capture = SpeechCapture::new(self.devices.open_recognizer(sink));
        let playback = PlaybackQueue::new(self.devices.decoder(), Box::new(output));

        // Every handler is in place before the socket opens
        let transport = Arc::new(TransportClient::new().with_attempts(self.config.connect_attempts));
        for kind in MessageKind::ALL {
            let inbound_tx = tx.clone();
            transport.on(kind, move |message| {
                let _ = inbound_tx.send(Event::Inbound {
                    call_id,
                    message: message.clone(),
                });
            });
        }
        let lost_tx = tx.clone();
        transport.on_close(move |reason| {
            let _ = lost_tx.send(Event::TransportLost { call_id, reason });
        });

        let connect_transport = transport.clone();
        let connect_tx = tx.clone();
        let url = self.config.server_url.clone();
        let connect_task = tokio::spawn(async move {
            let event = match connect_transport.connect(&url).await {
                Ok(()) => Event::TransportOpened { call_id },
                Err(e) => Event::TransportFailed {
                    call_id,
                    message: e.to_string(),
                },
            };
            let _ = connect_tx.send(event);
        });

        self.call = Some(ActiveCall {
            id: call_id,
            transport,
            playback,
            capture,
            connect_task,
        });
    }

    fn close_call(&mut self) {
        if let Some(mut call) = self.call.take() {
            call.playback.stop();
            call.capture.stop_listening();
            call.transport.disconnect();
            call.connect_task.abort();
            log::debug!("Released devices for call {}", call.id);
        }
    }

    fn arm_watchdog(&mut self, id: Uuid, tx: &mpsc::UnboundedSender<Event>) {
        self.disarm_watchdog();
        let Some(timeout) = self.config.agent_timeout else {
            return;
        };
        let tx = tx.clone();
        self.watchdog = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(Event::AgentTimeout { watchdog_id: id });
        }));
    }

    fn disarm_watchdog(&mut self) {
        if let Some(timer) = self.watchdog.take() {
            timer.abort();
        }
    }

    fn open_transcript_log(
        &mut self,
        call_id: Uuid,
        persona_id: String,
        user_id: String,
        tx: &mpsc::UnboundedSender<Event>,
    ) {
        let Some(backend) = self.config.backend.clone() else {
            log::debug!("Transcript logging disabled");
            return;
        };
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_transcript_log(
            backend,
            call_id,
            persona_id,
            user_id,
            log_rx,
            tx.clone(),
        ));
        self.transcript_log = Some(log_tx);
    }

    fn log_command(&mut self, command: LogCommand) {
        let closing = matches!(command, LogCommand::Close { .. });
        let sender = if closing {
            self.transcript_log.take()
        } else {
            self.transcript_log.clone()
        };
        if let Some(sender) = sender {
            if sender.send(command).is_err() {
                log::debug!("Transcript log already closed");
            }
        }
    }
}

impl<D: CallDevices> EffectRunner for CallRuntime<D> {
    fn observe(&self) -> Observed {
        Observed {
            playing: self.call.as_ref().is_some_and(|c| c.playback.is_playing()),
            capture_supported: self.capture_supported,
        }
    }

    fn absorb(&mut self, event: Event) -> Option<Event> {
        match event {
            Event::BufferFinished { call_id, buffer_id } => {
                let call = self.active(call_id)?;
                call.playback
                    .on_buffer_finished(buffer_id)
                    .then_some(Event::PlaybackDrained { call_id })
            }
            Event::Recognizer { call_id, event } => {
                let call = self.active(call_id)?;
                Some(match call.capture.on_recognizer_event(event)? {
                    CaptureOutcome::Transcript(text) => Event::FinalTranscript { call_id, text },
                    CaptureOutcome::NoSpeech => Event::NoSpeech { call_id },
                    CaptureOutcome::Failed(error) => Event::CaptureFailed { call_id, error },
                })
            }
            other => Some(other),
        }
    }

    fn apply(&mut self, effect: Effect, tx: &mpsc::UnboundedSender<Event>) {
        match effect {
            Effect::OpenTransport { call_id } => self.open_call(call_id, tx),
            Effect::Send(message) => {
                if let Some(call) = self.call.as_ref() {
                    if let Err(e) = call.transport.send(&message) {
                        log::warn!("{}", e);
                    }
                }
            }
            Effect::CloseTransport => {
                self.close_call();
                // A microphone may have appeared or gone away during the call
                self.capture_supported = self.devices.capture_supported();
            }
            Effect::EnqueueAudio { audio } => {
                if let Some(call) = self.call.as_mut() {
                    if let Err(e) = call.playback.enqueue_chunk(&audio) {
                        log::warn!("Dropping audio chunk: {}", e);
                    }
                }
            }
            Effect::StopPlayback => {
                if let Some(call) = self.call.as_mut() {
                    call.playback.stop();
                }
            }
            Effect::StartListening => {
                if let Some(call) = self.call.as_mut() {
                    if let Err(error) = call.capture.start_listening() {
                        let _ = tx.send(Event::CaptureFailed {
                            call_id: call.id,
                            error,
                        });
                    }
                }
            }
            Effect::StopListening => {
                if let Some(call) = self.call.as_mut() {
                    call.capture.stop_listening();
                }
            }
            Effect::FinishUtterance => {
                if let Some(call) = self.call.as_mut() {
                    call.capture.finish_utterance();
                }
            }
            Effect::ArmWatchdog { id } => self.arm_watchdog(id, tx),
            Effect::DisarmWatchdog => self.disarm_watchdog(),
            Effect::OpenTranscriptLog {
                call_id,
                persona_id,
                user_id,
            } => self.open_transcript_log(call_id, persona_id, user_id, tx),
            Effect::RecordTurn {
                role,
                content,
                turn_number,
            } => self.log_command(LogCommand::Record {
                role,
                content,
                turn_number,
            }),
            Effect::CloseTranscriptLog { score } => self.log_command(LogCommand::Close { score }),
            Effect::EmitStatus => {}
        }
    }
}

impl<D: CallDevices> Drop for CallRuntime<D> {
    fn drop(&mut self) {
        self.disarm_watchdog();
        self.close_call();
    }
}

/// Per-call transcript logger.
///
/// Creates the backend session, then writes turns strictly in order. Turns
/// recorded before the session exists wait in the channel. A failed session
/// create leaves the call unlogged.
async fn run_transcript_log(
    backend: BackendClient,
    call_id: Uuid,
    persona_id: String,
    user_id: String,
    mut commands: mpsc::UnboundedReceiver<LogCommand>,
    tx: mpsc::UnboundedSender<Event>,
) {
    let session_id = match backend.create_session(&user_id, &persona_id).await {
        Ok(session) => {
            let _ = tx.send(Event::TranscriptLogOpened {
                call_id,
                session_id: session.id.clone(),
            });
            Some(session.id)
        }
        Err(e) => {
            log::warn!("Failed to create backend session, transcript will not be saved: {}", e);
            None
        }
    };

    while let Some(command) = commands.recv().await {
        match command {
            LogCommand::Record {
                role,
                content,
                turn_number,
            } => {
                let Some(session_id) = session_id.as_deref() else {
                    continue;
                };
                if let Err(e) = backend
                    .add_message(session_id, role, &content, turn_number)
                    .await
                {
                    log::warn!("Failed to log {} turn {}: {}", role.as_str(), turn_number, e);
                }
            }
            LogCommand::Close { score } => {
                if let (true, Some(session_id)) = (score, session_id) {
                    log::info!("Scoring session {}", session_id);
                    let result = backend.end_session(&session_id).await.map(|r| r.scorecard);
                    let _ = tx.send(Event::ScoringFinished { session_id, result });
                }
                break;
            }
        }
    }
}
