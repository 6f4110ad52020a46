//! Session API integration: transcript logging and end-of-call scoring.
//!
//! This module provides:
//! - A client for the session REST endpoints
//! - Data structures for sessions, logged turns and scorecards

mod client;
mod types;

pub use client::BackendClient;
pub use types::{
    CreateSessionRequest, EndSessionResponse, Message, MessageRequest, Role, Scorecard, Session,
    SessionDetail,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Request timed out")]
    Timeout,
    #[error("Request timed out - scorecard generation took too long")]
    ScoringTimeout,
    #[error("Session not found")]
    NotFound,
    #[error("{detail} (HTTP {status})")]
    Api { status: u16, detail: String },
    #[error("Failed to parse API response: {0}")]
    Parse(String),
}
