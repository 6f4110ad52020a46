//! Call protocol message types
//!
//! Every frame on the call socket is a JSON envelope:
//!
//! ```text
//! { "type": "<message type>", "payload": { ... } }
//! ```
//!
//! Inbound frames are validated here and turned into [`InboundMessage`].
//! Nothing past this module ever sees an untyped payload.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ProtocolError;

/// Closed set of inbound message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    SessionStarted,
    PersonaThinking,
    AudioChunk,
    AudioComplete,
    SessionEnded,
    Error,
}

impl MessageKind {
    pub const ALL: [MessageKind; 6] = [
        MessageKind::SessionStarted,
        MessageKind::PersonaThinking,
        MessageKind::AudioChunk,
        MessageKind::AudioComplete,
        MessageKind::SessionEnded,
        MessageKind::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::SessionStarted => "session_started",
            MessageKind::PersonaThinking => "persona_thinking",
            MessageKind::AudioChunk => "audio_chunk",
            MessageKind::AudioComplete => "audio_complete",
            MessageKind::SessionEnded => "session_ended",
            MessageKind::Error => "error",
        }
    }

    pub fn from_wire(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }
}

/// Persona details announced with `session_started`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaInfo {
    pub name: String,
    #[serde(default)]
    pub voice_id: Option<String>,
}

// ============================================================================
// Server Messages (received FROM the call server)
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    SessionStarted {
        session_id: String,
        persona: Option<PersonaInfo>,
    },
    PersonaThinking,
    AudioChunk {
        /// Base64-encoded audio bytes (MP3 or WAV)
        audio: String,
        turn_number: Option<u32>,
    },
    AudioComplete {
        transcript: String,
        turn_number: u32,
    },
    SessionEnded {
        reason: String,
        total_turns: Option<u32>,
        session_id: Option<String>,
    },
    Error {
        message: String,
        recoverable: bool,
    },
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct SessionStartedPayload {
    session_id: String,
    #[serde(default)]
    persona: Option<PersonaInfo>,
}

#[derive(Deserialize)]
struct AudioChunkPayload {
    audio: String,
    #[serde(default)]
    turn_number: Option<u32>,
}

#[derive(Deserialize)]
struct AudioCompletePayload {
    #[serde(default)]
    transcript: String,
    turn_number: u32,
}

#[derive(Deserialize)]
struct SessionEndedPayload {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    total_turns: Option<u32>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct ErrorPayload {
    message: String,
    #[serde(default)]
    recoverable: bool,
}

fn payload<T: DeserializeOwned>(kind: MessageKind, value: Value) -> Result<T, ProtocolError> {
    // A missing or null payload is treated as an empty object
    let value = if value.is_null() {
        Value::Object(Default::default())
    } else {
        value
    };
    serde_json::from_value(value).map_err(|e| ProtocolError::MalformedPayload {
        kind: kind.as_str(),
        reason: e.to_string(),
    })
}

impl InboundMessage {
    /// Parse one text frame into a typed message.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: RawEnvelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::NotJson(e.to_string()))?;

        let kind = MessageKind::from_wire(&envelope.kind)
            .ok_or_else(|| ProtocolError::UnknownType(envelope.kind.clone()))?;
        let value = envelope.payload;

        let message = match kind {
            MessageKind::SessionStarted => {
                let p: SessionStartedPayload = payload(kind, value)?;
                InboundMessage::SessionStarted {
                    session_id: p.session_id,
                    persona: p.persona,
                }
            }
            MessageKind::PersonaThinking => InboundMessage::PersonaThinking,
            MessageKind::AudioChunk => {
                let p: AudioChunkPayload = payload(kind, value)?;
                InboundMessage::AudioChunk {
                    audio: p.audio,
                    turn_number: p.turn_number,
                }
            }
            MessageKind::AudioComplete => {
                let p: AudioCompletePayload = payload(kind, value)?;
                InboundMessage::AudioComplete {
                    transcript: p.transcript,
                    turn_number: p.turn_number,
                }
            }
            MessageKind::SessionEnded => {
                let p: SessionEndedPayload = payload(kind, value)?;
                InboundMessage::SessionEnded {
                    reason: p.reason,
                    total_turns: p.total_turns,
                    session_id: p.session_id,
                }
            }
            MessageKind::Error => {
                let p: ErrorPayload = payload(kind, value)?;
                InboundMessage::Error {
                    message: p.message,
                    recoverable: p.recoverable,
                }
            }
        };

        Ok(message)
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            InboundMessage::SessionStarted { .. } => MessageKind::SessionStarted,
            InboundMessage::PersonaThinking => MessageKind::PersonaThinking,
            InboundMessage::AudioChunk { .. } => MessageKind::AudioChunk,
            InboundMessage::AudioComplete { .. } => MessageKind::AudioComplete,
            InboundMessage::SessionEnded { .. } => MessageKind::SessionEnded,
            InboundMessage::Error { .. } => MessageKind::Error,
        }
    }
}

// ============================================================================
// Client Messages (sent TO the call server)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboundMessage {
    StartSession { persona_id: String, user_id: String },
    UserSpeech { transcript: String, turn_number: u32 },
    EndSession {},
}

impl OutboundMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::NotJson(e.to_string()))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundMessage::StartSession { .. } => "start_session",
            OutboundMessage::UserSpeech { .. } => "user_speech",
            OutboundMessage::EndSession {} => "end_session",
        }
    }
}
