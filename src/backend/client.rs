//! Session REST API client.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;

use super::types::{
    CreateSessionRequest, EndSessionResponse, ErrorBody, MessageRequest, Role, Session,
    SessionDetail,
};
use super::BackendError;

/// Deadline for everything except scoring
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct BackendClient {
    http: Client,
    base_url: String,
    scoring_timeout: Duration,
}

impl BackendClient {
    pub fn new(api_url: &str, scoring_timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            });
        Self {
            http,
            base_url: api_url.trim_end_matches('/').to_string(),
            scoring_timeout,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Create the session a call's transcript is logged under.
    pub async fn create_session(
        &self,
        user_id: &str,
        persona_id: &str,
    ) -> Result<Session, BackendError> {
        let body = CreateSessionRequest {
            user_id: user_id.to_string(),
            persona_id: persona_id.to_string(),
            conversation_id: None,
        };
        let request = self.http.post(self.url("/sessions")).json(&body);
        let session: Session = read_json(send(request, "create session").await?).await?;
        log::info!("Backend session created: {}", session.id);
        Ok(session)
    }

    pub async fn add_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        turn_number: u32,
    ) -> Result<(), BackendError> {
        let body = MessageRequest {
            role,
            content: content.to_string(),
            turn_number,
        };
        let request = self
            .http
            .post(self.url(&format!("/sessions/{}/messages", session_id)))
            .json(&body);
        send(request, "add message").await?;
        log::debug!(
            "Logged {} turn {} to session {}",
            role.as_str(),
            turn_number,
            session_id
        );
        Ok(())
    }

    /// End the session and generate its scorecard.
    ///
    /// Scoring calls a language model and can take several seconds, so this
    /// uses the longer scoring deadline and reports a miss as `ScoringTimeout`.
    pub async fn end_session(&self, session_id: &str) -> Result<EndSessionResponse, BackendError> {
        let request = self
            .http
            .post(self.url(&format!("/sessions/{}/end", session_id)))
            .timeout(self.scoring_timeout);
        let response = send(request, "end session").await.map_err(scoring_deadline)?;
        let ended: EndSessionResponse = read_json(response).await.map_err(scoring_deadline)?;
        log::info!(
            "Session {} scored: {}/10",
            ended.session_id,
            ended.scorecard.overall_score
        );
        Ok(ended)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<SessionDetail, BackendError> {
        let request = self.http.get(self.url(&format!("/sessions/{}", session_id)));
        read_json(send(request, "fetch session").await?).await
    }

    /// List sessions, newest first as returned by the API.
    pub async fn list_sessions(&self, user_id: Option<&str>) -> Result<Vec<Session>, BackendError> {
        let mut request = self.http.get(self.url("/sessions"));
        if let Some(user_id) = user_id {
            request = request.query(&[("user_id", user_id)]);
        }
        read_json(send(request, "fetch sessions").await?).await
    }
}

async fn send(request: RequestBuilder, action: &str) -> Result<Response, BackendError> {
    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            log::warn!("Backend {} timed out", action);
            BackendError::Timeout
        } else {
            BackendError::Network(e.to_string())
        }
    })?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status.as_u16() == 404 {
        return Err(BackendError::NotFound);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = error_detail(&body).unwrap_or_else(|| format!("Failed to {}", action));
    log::error!("Backend {} failed ({}): {}", action, status.as_u16(), detail);
    Err(BackendError::Api {
        status: status.as_u16(),
        detail,
    })
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, BackendError> {
    response.json().await.map_err(|e| {
        if e.is_timeout() {
            BackendError::Timeout
        } else {
            BackendError::Parse(e.to_string())
        }
    })
}

fn scoring_deadline(err: BackendError) -> BackendError {
    match err {
        BackendError::Timeout => BackendError::ScoringTimeout,
        other => other,
    }
}

/// Pull the message out of a `{"detail": ...}` body.
fn error_detail(body: &str) -> Option<String> {
    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    match parsed.detail {
        serde_json::Value::String(s) if !s.is_empty() => Some(s),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}
