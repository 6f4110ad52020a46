//! Turn-taking state machine for a practice call
//!
//! This module implements the call orchestrator using a single-writer pattern.
//! All transitions go through the `reduce()` function, which returns the next
//! call snapshot and a list of effects for the runner to apply.
//!
//! The reducer never touches devices. What it needs to know about them
//! (is audio playing, is capture available) arrives as an [`Observed`]
//! reading taken just before the event is reduced.

use serde::Serialize;
use uuid::Uuid;

use crate::backend::{BackendError, Role, Scorecard};
use crate::capture::{CaptureError, RecognizerEvent};
use crate::transport::{ConnectionStatus, InboundMessage, OutboundMessage, PersonaInfo};

/// Whose floor it is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// No one holds the floor: before the agent's first turn, or while the
    /// agent works on its reply to the user.
    #[default]
    Idle,
    AgentSpeaking,
    WaitingForUser,
    UserSpeaking,
}

/// User-visible failures. The last one is kept on the call for display.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Speech recognition is not available on this device")]
    UnsupportedCapability,
    #[error("Speech capture failed: {0}")]
    Capture(CaptureError),
    #[error("The prospect stopped responding")]
    AgentUnresponsive,
    #[error("Server error: {0}")]
    Server(String),
    #[error("Request timed out - scorecard generation took too long")]
    UpstreamTimeout,
    #[error("Audio device error: {0}")]
    Device(String),
    #[error("Scoring failed: {0}")]
    Scoring(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum ReviewStatus {
    Scoring,
    Scored(Scorecard),
    Failed(String),
}

/// End-of-call scoring of the logged transcript.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Review {
    pub session_id: String,
    pub status: ReviewStatus,
}

/// Authoritative call snapshot. Only `reduce()` produces new ones.
///
/// `call_id == None` is the pre-Idle reset: nothing connected, nothing
/// playing, nothing listening.
#[derive(Debug, Clone, Default)]
pub struct Call {
    pub call_id: Option<Uuid>,
    pub connection: ConnectionStatus,
    pub state: CallState,
    /// Backend persona id sent with `start_session`
    pub persona_id: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub persona: Option<PersonaInfo>,
    pub turn: u32,
    /// Between `persona_thinking` (or a sent utterance) and `audio_complete`
    pub agent_turn_open: bool,
    pub last_agent_transcript: Option<String>,
    pub last_agent_turn: Option<u32>,
    pub watchdog: Option<Uuid>,
    /// Session on the REST API that turns are logged under
    pub backend_session: Option<String>,
    pub last_error: Option<CallError>,
    pub end_reason: Option<String>,
    pub review: Option<Review>,
}

impl Call {
    pub fn is_active(&self) -> bool {
        self.call_id.is_some()
    }
}

/// Point-in-time reading of the devices the runner owns.
#[derive(Debug, Clone, Copy, Default)]
pub struct Observed {
    pub playing: bool,
    pub capture_supported: bool,
}

/// Everything that can move the call forward.
#[derive(Debug, Clone)]
pub enum Event {
    // User actions
    StartCall {
        persona_id: String,
        user_id: String,
    },
    /// User asks for the floor
    SpeakRequested,
    /// User is done talking; transcribe what was heard
    FinishSpeaking,
    EndCall,
    /// Application exit requested
    Exit,

    // Transport events
    TransportOpened {
        call_id: Uuid,
    },
    TransportFailed {
        call_id: Uuid,
        message: String,
    },
    TransportLost {
        call_id: Uuid,
        reason: String,
    },
    Inbound {
        call_id: Uuid,
        message: InboundMessage,
    },

    // Playback events
    /// Raw device notification, absorbed by the playback queue
    BufferFinished {
        call_id: Uuid,
        buffer_id: u64,
    },
    PlaybackDrained {
        call_id: Uuid,
    },

    // Capture events
    /// Raw recognizer report, absorbed by the capture adapter
    Recognizer {
        call_id: Uuid,
        event: RecognizerEvent,
    },
    FinalTranscript {
        call_id: Uuid,
        text: String,
    },
    NoSpeech {
        call_id: Uuid,
    },
    CaptureFailed {
        call_id: Uuid,
        error: CaptureError,
    },

    /// Agent-response watchdog fired (id guards against stale timers)
    AgentTimeout {
        watchdog_id: Uuid,
    },

    // Transcript log events
    TranscriptLogOpened {
        call_id: Uuid,
        session_id: String,
    },
    ScoringFinished {
        session_id: String,
        result: Result<Scorecard, BackendError>,
    },

    DeviceFault {
        call_id: Uuid,
        error: String,
    },
}

impl Event {
    /// The call this event belongs to, for events scoped to one call.
    pub fn call_id(&self) -> Option<Uuid> {
        use Event::*;
        match self {
            TransportOpened { call_id }
            | TransportFailed { call_id, .. }
            | TransportLost { call_id, .. }
            | Inbound { call_id, .. }
            | BufferFinished { call_id, .. }
            | PlaybackDrained { call_id }
            | Recognizer { call_id, .. }
            | FinalTranscript { call_id, .. }
            | NoSpeech { call_id }
            | CaptureFailed { call_id, .. }
            | TranscriptLogOpened { call_id, .. }
            | DeviceFault { call_id, .. } => Some(*call_id),
            _ => None,
        }
    }
}

/// Effects to be applied after a transition, in order.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Build the per-call devices and connect
    OpenTransport {
        call_id: Uuid,
    },
    Send(OutboundMessage),
    /// Disconnect and drop the per-call devices
    CloseTransport,
    EnqueueAudio {
        audio: String,
    },
    StopPlayback,
    StartListening,
    StopListening,
    FinishUtterance,
    ArmWatchdog {
        id: Uuid,
    },
    DisarmWatchdog,
    OpenTranscriptLog {
        call_id: Uuid,
        persona_id: String,
        user_id: String,
    },
    RecordTurn {
        role: Role,
        content: String,
        turn_number: u32,
    },
    /// Close the log; with `score` the session is ended and scored
    CloseTranscriptLog {
        score: bool,
    },
    /// Publish the call view
    EmitStatus,
}

/// Reducer: (call, event, observed) -> (next call, effects)
///
/// Key rules:
/// - Never mutate the input snapshot
/// - Ignore call-scoped events whose call id is not the live call
/// - The microphone is stopped on every entry into `AgentSpeaking`
pub fn reduce(call: &Call, event: Event, observed: &Observed) -> (Call, Vec<Effect>) {
    use Effect::*;
    use Event::*;

    if let Some(id) = event.call_id() {
        if call.call_id != Some(id) {
            log::debug!("Ignoring event from stale call {}: {:?}", id, event);
            return (call.clone(), vec![]);
        }
    }

    let mut next = call.clone();

    match event {
        // -----------------
        // Call lifecycle
        // -----------------
        StartCall {
            persona_id,
            user_id,
        } => {
            if call.is_active() {
                log::debug!("Call already active, ignoring start");
                return (next, vec![]);
            }
            if !observed.capture_supported {
                log::warn!("Speech capture unavailable, not starting call");
                next.last_error = Some(CallError::UnsupportedCapability);
                return (next, vec![EmitStatus]);
            }

            let id = Uuid::new_v4();
            log::info!("Starting call {} as {} with {}", id, user_id, persona_id);
            let next = Call {
                call_id: Some(id),
                connection: ConnectionStatus::Connecting,
                persona_id: Some(persona_id.clone()),
                user_id: Some(user_id.clone()),
                ..Call::default()
            };
            (
                next,
                vec![
                    OpenTranscriptLog {
                        call_id: id,
                        persona_id,
                        user_id,
                    },
                    OpenTransport { call_id: id },
                    EmitStatus,
                ],
            )
        }
        TransportOpened { .. } => {
            next.connection = ConnectionStatus::Connected;
            let start = OutboundMessage::StartSession {
                persona_id: call.persona_id.clone().unwrap_or_default(),
                user_id: call.user_id.clone().unwrap_or_default(),
            };
            (next, vec![Send(start), EmitStatus])
        }
        TransportFailed { message, .. } | TransportLost {
            reason: message, ..
        } => {
            next.last_error = Some(CallError::Connection(message));
            teardown(next, vec![])
        }
        DeviceFault { error, .. } => {
            next.last_error = Some(CallError::Device(error));
            teardown(next, vec![])
        }
        EndCall | Exit => {
            if !call.is_active() {
                return (next, vec![]);
            }
            let mut effects = vec![];
            if call.connection == ConnectionStatus::Connected {
                effects.push(Send(OutboundMessage::EndSession {}));
            }
            next.end_reason = Some("ended_by_user".to_string());
            teardown(next, effects)
        }

        // -----------------
        // Server messages
        // -----------------
        Inbound { message, .. } => on_inbound(next, message, observed),

        // -----------------
        // Playback
        // -----------------
        PlaybackDrained { .. } => {
            if call.state != CallState::AgentSpeaking {
                return (next, vec![]);
            }
            if call.agent_turn_open {
                // Underrun: more audio or audio_complete is still coming
                log::debug!("Playback drained mid-turn, still waiting on the agent");
                return (next, vec![]);
            }
            next.state = CallState::WaitingForUser;
            (next, vec![EmitStatus])
        }

        // -----------------
        // Floor control
        // -----------------
        SpeakRequested => {
            let ready = call.state == CallState::WaitingForUser
                && !observed.playing
                && call.session_id.is_some()
                && call.connection == ConnectionStatus::Connected;
            if !ready {
                log::debug!(
                    "Ignoring speak request in {:?} (playing={}, session={:?})",
                    call.state,
                    observed.playing,
                    call.session_id
                );
                return (next, vec![]);
            }
            next.state = CallState::UserSpeaking;
            (next, vec![StartListening, EmitStatus])
        }
        FinishSpeaking => {
            if call.state == CallState::UserSpeaking {
                (next, vec![FinishUtterance])
            } else {
                (next, vec![])
            }
        }

        // -----------------
        // Capture results
        // -----------------
        FinalTranscript { text, .. } => {
            if call.state != CallState::UserSpeaking {
                log::debug!("Dropping transcript outside the user's turn");
                return (next, vec![]);
            }
            let text = text.trim().to_string();
            if text.is_empty() {
                next.state = CallState::WaitingForUser;
                return (next, vec![StopListening, EmitStatus]);
            }
            if call.session_id.is_none() || call.connection != ConnectionStatus::Connected {
                log::warn!("No live session, discarding utterance");
                next.state = CallState::WaitingForUser;
                return (next, vec![StopListening, EmitStatus]);
            }

            next.turn = call.turn + 1;
            next.state = CallState::Idle;
            next.agent_turn_open = true;
            let watchdog = Uuid::new_v4();
            next.watchdog = Some(watchdog);
            log::info!("User turn {}: {} chars", next.turn, text.len());
            (
                next.clone(),
                vec![
                    StopListening,
                    Send(OutboundMessage::UserSpeech {
                        transcript: text.clone(),
                        turn_number: next.turn,
                    }),
                    RecordTurn {
                        role: Role::Advisor,
                        content: text,
                        turn_number: next.turn,
                    },
                    ArmWatchdog { id: watchdog },
                    EmitStatus,
                ],
            )
        }
        NoSpeech { .. } => {
            if call.state != CallState::UserSpeaking {
                return (next, vec![]);
            }
            log::info!("No speech heard, floor returns to the user");
            next.state = CallState::WaitingForUser;
            (next, vec![EmitStatus])
        }
        CaptureFailed { error, .. } => {
            next.last_error = Some(CallError::Capture(error));
            if call.state == CallState::UserSpeaking {
                next.state = CallState::WaitingForUser;
            }
            (next, vec![EmitStatus])
        }

        // -----------------
        // Watchdog
        // -----------------
        AgentTimeout { watchdog_id } => {
            if call.watchdog != Some(watchdog_id) {
                return (next, vec![]);
            }
            log::warn!("Agent did not respond in time");
            next.watchdog = None;
            next.agent_turn_open = false;
            next.last_error = Some(CallError::AgentUnresponsive);
            let waiting_on_agent = matches!(call.state, CallState::Idle | CallState::AgentSpeaking);
            if waiting_on_agent && call.session_id.is_some() && !observed.playing {
                next.state = CallState::WaitingForUser;
            }
            (next, vec![EmitStatus])
        }

        // -----------------
        // Transcript log and scoring
        // -----------------
        TranscriptLogOpened { session_id, .. } => {
            next.backend_session = Some(session_id);
            (next, vec![])
        }
        ScoringFinished { session_id, result } => {
            if !call.review.as_ref().is_some_and(|r| r.session_id == session_id) {
                return (next, vec![]);
            }
            let status = match result {
                Ok(scorecard) => ReviewStatus::Scored(scorecard),
                Err(e) => {
                    let message = e.to_string();
                    next.last_error = Some(match e {
                        BackendError::Timeout | BackendError::ScoringTimeout => {
                            CallError::UpstreamTimeout
                        }
                        _ => CallError::Scoring(message.clone()),
                    });
                    ReviewStatus::Failed(message)
                }
            };
            if let Some(review) = next.review.as_mut() {
                review.status = status;
            }
            (next, vec![EmitStatus])
        }

        // Device notifications are absorbed by the runner before reduction
        BufferFinished { .. } | Recognizer { .. } => (next, vec![]),
    }
}

fn on_inbound(mut next: Call, message: InboundMessage, observed: &Observed) -> (Call, Vec<Effect>) {
    use Effect::*;

    match message {
        InboundMessage::SessionStarted {
            session_id,
            persona,
        } => {
            log::info!("Session started: {}", session_id);
            next.session_id = Some(session_id);
            next.persona = persona;
            next.turn = 0;
            next.last_agent_turn = None;
            next.state = CallState::Idle;
            (next, vec![EmitStatus])
        }
        InboundMessage::PersonaThinking => {
            let mut effects = agent_takes_floor(&mut next);
            effects.push(EmitStatus);
            (next, effects)
        }
        InboundMessage::AudioChunk { audio, .. } => {
            let was = next.state;
            let mut effects = agent_takes_floor(&mut next);
            effects.push(EnqueueAudio { audio });
            if was != next.state {
                effects.push(EmitStatus);
            }
            (next, effects)
        }
        InboundMessage::AudioComplete {
            transcript,
            turn_number,
        } => {
            if next.last_agent_turn.is_some_and(|last| turn_number <= last) {
                log::debug!("Ignoring duplicate audio_complete for turn {}", turn_number);
                return (next, vec![]);
            }
            next.last_agent_transcript = Some(transcript.clone());
            next.last_agent_turn = Some(turn_number);
            next.turn = next.turn.max(turn_number);
            next.agent_turn_open = false;
            next.watchdog = None;
            if matches!(next.state, CallState::AgentSpeaking | CallState::Idle) && !observed.playing {
                next.state = CallState::WaitingForUser;
            }
            (
                next,
                vec![
                    DisarmWatchdog,
                    RecordTurn {
                        role: Role::Prospect,
                        content: transcript,
                        turn_number,
                    },
                    EmitStatus,
                ],
            )
        }
        InboundMessage::SessionEnded { reason, .. } => {
            log::info!("Session ended by server: {}", reason);
            next.end_reason = Some(reason);
            teardown(next, vec![])
        }
        InboundMessage::Error {
            message,
            recoverable,
        } => {
            log::error!("Server error (recoverable={}): {}", recoverable, message);
            next.last_error = Some(CallError::Server(message));
            if recoverable {
                (next, vec![EmitStatus])
            } else {
                teardown(next, vec![])
            }
        }
    }
}

/// Give the floor to the agent. Re-arms the watchdog on every call.
fn agent_takes_floor(next: &mut Call) -> Vec<Effect> {
    let mut effects = vec![];
    if next.state != CallState::AgentSpeaking {
        effects.push(Effect::StopListening);
        next.state = CallState::AgentSpeaking;
    }
    next.agent_turn_open = true;
    let id = Uuid::new_v4();
    next.watchdog = Some(id);
    effects.push(Effect::ArmWatchdog { id });
    effects
}

/// Stop everything and return to the pre-Idle reset.
fn teardown(call: Call, mut effects: Vec<Effect>) -> (Call, Vec<Effect>) {
    use Effect::*;

    let score = call.turn > 0 && call.backend_session.is_some();
    let review = match (&call.backend_session, score) {
        (Some(session_id), true) => Some(Review {
            session_id: session_id.clone(),
            status: ReviewStatus::Scoring,
        }),
        _ => call.review.clone(),
    };

    log::info!(
        "Tearing down call {:?} after {} turn(s)",
        call.call_id,
        call.turn
    );
    effects.extend([
        StopPlayback,
        StopListening,
        CloseTransport,
        DisarmWatchdog,
        CloseTranscriptLog { score },
        EmitStatus,
    ]);

    let reset = Call {
        persona: call.persona,
        last_error: call.last_error,
        end_reason: call.end_reason,
        review,
        ..Call::default()
    };
    (reset, effects)
}
