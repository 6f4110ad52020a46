//! XDG path helpers for utterance WAV files
//!
//! Utterances are stored in: ~/.local/share/pitchiq-call/temp/utterances/

use std::fs;
use std::path::{Path, PathBuf};

const MAX_UTTERANCES: usize = 5;

/// Returns: ~/.local/share/pitchiq-call/temp/utterances/
fn temp_audio_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pitchiq-call")
        .join("temp")
        .join("utterances")
}

pub fn create_temp_audio_dir() -> std::io::Result<PathBuf> {
    let dir = temp_audio_dir();
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Format: <YYYYmmdd_HHMMSS>_capture<id>_<pid>.wav
pub fn generate_wav_path(capture_id: u64) -> std::io::Result<PathBuf> {
    let dir = create_temp_audio_dir()?;
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let filename = format!(
        "{}_capture{}_{}.wav",
        timestamp,
        capture_id,
        std::process::id()
    );
    Ok(dir.join(filename))
}

/// Keep only the most recent utterances.
pub fn cleanup_old_utterances() -> std::io::Result<usize> {
    cleanup_dir(&temp_audio_dir(), MAX_UTTERANCES)
}

fn cleanup_dir(dir: &Path, keep: usize) -> std::io::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut entries: Vec<_> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "wav"))
        .collect();

    if entries.len() <= keep {
        return Ok(0);
    }

    // Oldest first
    entries.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());

    let to_delete = entries.len() - keep;
    let mut deleted = 0;

    for entry in entries.into_iter().take(to_delete) {
        if fs::remove_file(entry.path()).is_ok() {
            log::debug!("Cleaned up old utterance: {:?}", entry.path());
            deleted += 1;
        }
    }

    Ok(deleted)
}
