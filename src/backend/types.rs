//! Session API data structures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who spoke a logged turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The user practising the call
    Advisor,
    /// The synthetic persona
    Prospect,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Advisor => "advisor",
            Role::Prospect => "prospect",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub persona_id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(with = "timestamp")]
    pub started_at: DateTime<Utc>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub turn_number: u32,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scorecard {
    pub overall_score: u32,
    pub opener_score: u32,
    pub opener_feedback: String,
    pub objection_handling_score: u32,
    pub objection_handling_feedback: String,
    pub tone_confidence_score: u32,
    pub tone_confidence_feedback: String,
    pub close_attempt_score: u32,
    pub close_attempt_feedback: String,
    pub best_moment: String,
    pub biggest_mistake: String,
    pub what_to_say_instead: String,
    pub meeting_booked: bool,
}

impl Scorecard {
    /// Letter grade for a 1-10 score.
    pub fn grade(&self) -> char {
        match self.overall_score {
            9.. => 'A',
            7..=8 => 'B',
            5..=6 => 'C',
            3..=4 => 'D',
            _ => 'F',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDetail {
    pub session: Session,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub scorecard: Option<Scorecard>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateSessionRequest {
    pub user_id: String,
    pub persona_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageRequest {
    pub role: Role,
    pub content: String,
    pub turn_number: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndSessionResponse {
    pub session_id: String,
    pub status: String,
    #[serde(with = "timestamp")]
    pub ended_at: DateTime<Utc>,
    pub scorecard: Scorecard,
}

/// Error body returned by the API
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    pub detail: serde_json::Value,
}

/// The API emits RFC 3339 timestamps, or naive ones that are implicitly UTC.
mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw)))
    }

    pub(super) fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }
}
