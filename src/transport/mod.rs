//! Call transport: the persistent WebSocket to the call server
//!
//! # Architecture
//!
//! ```text
//!                 ┌────────────── reader task ──────────────┐
//! call server ──▶ │ text frame ─▶ InboundMessage::decode ─▶ │ ─▶ handlers (by kind)
//!                 └─────────────────────────────────────────┘
//!                 ┌────────────── writer task ──────────────┐
//! call server ◀── │ close / text frame  ◀── mpsc ◀──────────│ ◀── send()
//!                 └─────────────────────────────────────────┘
//! ```
//!
//! Initial connection retries with exponential backoff. A connection that
//! drops mid-call is never reconnected; the call is torn down instead.

mod client;
mod protocol;

pub use client::{ConnectionStatus, TransportClient, BACKLOG_LIMIT};
pub use protocol::{InboundMessage, MessageKind, OutboundMessage, PersonaInfo};

/// Errors surfaced by the transport client.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    /// The socket failed before becoming ready
    #[error("Failed to connect to call server: {0}")]
    Connection(String),
    /// `send` was called while the socket was not open
    #[error("Cannot send {0}: call server is not connected")]
    NotConnected(&'static str),
    /// Outbound message could not be encoded
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// An inbound frame that could not be turned into a typed message.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Frame is not valid JSON: {0}")]
    NotJson(String),
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Malformed {kind} payload: {reason}")]
    MalformedPayload { kind: &'static str, reason: String },
}
