use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::{EndpointConfig, WhisperOptions};

const SETTINGS_FILE_NAME: &str = "settings.json";
const APP_DIR_NAME: &str = "pitchiq-call";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Could not determine config directory")]
    NoConfigDir,
    #[error("Failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Conversation WebSocket endpoint.
    pub server_url: String,

    /// Base URL of the session REST API used for transcript logging and scoring.
    pub api_url: String,

    pub user_id: String,

    /// Default difficulty id: `easy`, `medium` or `aggressive`.
    pub persona: String,

    /// How long to wait for the agent to respond after the user's turn.
    /// Zero disables the watchdog.
    pub agent_response_timeout_secs: u64,

    /// Scorecard generation deadline when the call ends.
    pub scoring_timeout_secs: u64,

    pub connect_attempts: u32,

    /// Log every turn to the backend session and request a scorecard.
    pub transcript_logging: bool,

    /// WebRTC VAD aggressiveness, 0 (quality) to 3 (very aggressive).
    pub vad_mode: u8,
    pub end_silence_ms: u64,
    pub no_speech_timeout_ms: u64,
    pub max_utterance_ms: u64,

    pub whisper_model: String,

    /// Language hint for Whisper. Empty lets Whisper detect it.
    pub language: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        let endpoint = EndpointConfig::default();
        Self {
            server_url: "ws://localhost:8000/ws".to_string(),
            api_url: "http://localhost:8000".to_string(),
            user_id: "temp-user-001".to_string(),
            persona: "easy".to_string(),
            agent_response_timeout_secs: 30,
            scoring_timeout_secs: 30,
            connect_attempts: 3,
            transcript_logging: true,
            vad_mode: endpoint.vad_mode,
            end_silence_ms: endpoint.end_silence_ms,
            no_speech_timeout_ms: endpoint.no_speech_timeout_ms,
            max_utterance_ms: endpoint.max_utterance_ms,
            whisper_model: "whisper-1".to_string(),
            language: "en".to_string(),
        }
    }
}

impl AppSettings {
    /// `None` when the watchdog is disabled.
    pub fn agent_response_timeout(&self) -> Option<Duration> {
        (self.agent_response_timeout_secs > 0)
            .then(|| Duration::from_secs(self.agent_response_timeout_secs))
    }

    pub fn scoring_timeout(&self) -> Duration {
        Duration::from_secs(self.scoring_timeout_secs.max(1))
    }

    pub fn endpoint_config(&self) -> EndpointConfig {
        EndpointConfig {
            vad_mode: self.vad_mode.min(3),
            end_silence_ms: self.end_silence_ms,
            no_speech_timeout_ms: self.no_speech_timeout_ms,
            max_utterance_ms: self.max_utterance_ms,
        }
    }

    pub fn whisper_options(&self) -> WhisperOptions {
        WhisperOptions {
            model: self.whisper_model.clone(),
            language: Some(self.language.clone()).filter(|l| !l.is_empty()),
            endpoint: self.endpoint_config(),
        }
    }

    /// Apply `PITCHIQ_*` environment variables on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let fields: [(&str, &mut String); 4] = [
            ("PITCHIQ_SERVER_URL", &mut self.server_url),
            ("PITCHIQ_API_URL", &mut self.api_url),
            ("PITCHIQ_USER_ID", &mut self.user_id),
            ("PITCHIQ_PERSONA", &mut self.persona),
        ];
        for (key, field) in fields {
            if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
                log::debug!("Settings: {} overridden from environment", key);
                *field = value.trim().to_string();
            }
        }
    }
}

pub fn settings_path() -> Result<PathBuf, SettingsError> {
    let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load settings, falling back to defaults when the file is missing or broken.
pub fn load_settings() -> AppSettings {
    let path = match settings_path() {
        Ok(p) => p,
        Err(e) => {
            log::warn!("Settings: {}", e);
            return AppSettings::default();
        }
    };

    match load_from(&path) {
        Ok(Some(settings)) => settings,
        Ok(None) => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: {}", e);
            AppSettings::default()
        }
    }
}

/// `Ok(None)` when the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<AppSettings>, SettingsError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str::<AppSettings>(&contents)
            .map(Some)
            .map_err(|source| SettingsError::Parse {
                path: path.to_path_buf(),
                source,
            }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(SettingsError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

pub fn save_settings(settings: &AppSettings) -> Result<PathBuf, SettingsError> {
    let path = settings_path()?;
    save_to(&path, settings)?;
    Ok(path)
}

pub fn save_to(path: &Path, settings: &AppSettings) -> Result<(), SettingsError> {
    let write_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| SettingsError::Write { path, source }
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(write_err(parent))?;
    }

    let contents = serde_json::to_string_pretty(settings)?;

    // Write to a sibling temp file, then rename over the original
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents).map_err(write_err(&tmp_path))?;

    // Windows rename fails if the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(write_err(path)(e));
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(write_err(path))?;
    Ok(())
}
