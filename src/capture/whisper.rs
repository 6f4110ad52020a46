//! OpenAI Whisper API client for the user's utterances

use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

const TRANSCRIPTIONS_URL: &str = "https://api.openai.com/v1/audio/transcriptions";

/// Whisper's own no-speech estimate above which short results are discarded
const NO_SPEECH_PROB_THRESHOLD: f32 = 0.8;
const NO_SPEECH_MAX_TEXT_LEN: usize = 12;

/// Global HTTP client for reuse across requests (avoids TLS handshake overhead)
static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn get_http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            })
    })
}

#[derive(Debug, thiserror::Error)]
pub enum TranscriptionError {
    #[error("OpenAI API key not configured. Set OPENAI_API_KEY environment variable.")]
    MissingApiKey,
    #[error("Failed to read audio file: {0}")]
    FileRead(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("OpenAI API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("Failed to parse API response: {0}")]
    Parse(String),
}

#[derive(Debug, Deserialize)]
struct WhisperVerboseResponse {
    text: String,
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    #[serde(default)]
    no_speech_prob: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

fn get_api_key() -> Option<String> {
    std::env::var("OPENAI_API_KEY")
        .ok()
        .filter(|k| !k.is_empty())
}

pub fn is_api_key_configured() -> bool {
    get_api_key().is_some()
}

#[derive(Debug, Clone)]
pub struct TranscriptionResult {
    pub text: String,
    pub no_speech_prob: Option<f32>,
}

impl TranscriptionResult {
    /// Empty text, or a short result Whisper itself thinks was silence.
    pub fn is_no_speech(&self) -> bool {
        let trimmed = self.text.trim();
        trimmed.is_empty()
            || self.no_speech_prob.is_some_and(|p| {
                p >= NO_SPEECH_PROB_THRESHOLD && trimmed.len() <= NO_SPEECH_MAX_TEXT_LEN
            })
    }
}

fn max_no_speech_prob(segments: &[WhisperSegment]) -> Option<f32> {
    segments
        .iter()
        .filter_map(|s| s.no_speech_prob)
        .max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
}

/// Transcribe a WAV file with the Whisper API.
pub async fn transcribe_wav(
    wav_path: &Path,
    model: &str,
    language: Option<&str>,
) -> Result<TranscriptionResult, TranscriptionError> {
    let api_key = get_api_key().ok_or(TranscriptionError::MissingApiKey)?;

    let file_bytes = tokio::fs::read(wav_path)
        .await
        .map_err(|e| TranscriptionError::FileRead(e.to_string()))?;

    let filename = wav_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("utterance.wav")
        .to_string();

    log::info!(
        "Transcribing utterance: {} ({} bytes)",
        filename,
        file_bytes.len()
    );

    let file_part = Part::bytes(file_bytes)
        .file_name(filename)
        .mime_str("audio/wav")
        .map_err(|e| TranscriptionError::Parse(e.to_string()))?;

    let mut form = Form::new()
        .part("file", file_part)
        .text("model", model.to_string())
        .text("response_format", "verbose_json")
        .text("temperature", "0");
    if let Some(language) = language.filter(|l| !l.is_empty()) {
        form = form.text("language", language.to_string());
    }

    let response = get_http_client()
        .post(TRANSCRIPTIONS_URL)
        .header("Authorization", format!("Bearer {}", api_key))
        .multipart(form)
        .send()
        .await
        .map_err(|e| TranscriptionError::Network(e.to_string()))?;

    let status = response.status();

    if status.is_success() {
        let whisper_response: WhisperVerboseResponse = response
            .json()
            .await
            .map_err(|e| TranscriptionError::Parse(e.to_string()))?;

        let no_speech_prob = max_no_speech_prob(&whisper_response.segments);
        log::info!(
            "Transcription successful: {} chars (no_speech_prob={:?})",
            whisper_response.text.len(),
            no_speech_prob
        );

        Ok(TranscriptionResult {
            text: whisper_response.text,
            no_speech_prob,
        })
    } else {
        let error_text = response.text().await.unwrap_or_default();

        let message = match serde_json::from_str::<ApiErrorResponse>(&error_text) {
            Ok(error_response) => error_response.error.message,
            Err(_) => error_text,
        };

        log::error!("OpenAI API error ({}): {}", status.as_u16(), message);

        Err(TranscriptionError::Api {
            status: status.as_u16(),
            message,
        })
    }
}
