//! End-to-end call flow tests
//!
//! Drives the full call loop (state machine + effect runner + transport)
//! against a scripted call server, with fake speakers and a scripted
//! speech recognizer standing in for the audio hardware.
//!
//! ```bash
//! cargo test --test call_flow
//! ```

mod common;

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::Engine;
use serde_json::json;
use tokio::sync::watch;

use common::{dead_url, end_session_json, session_json, FakeApi, FakeCallServer, WAIT};
use pitchiq_call::backend::BackendClient;
use pitchiq_call::capture::{CaptureError, RecognizerEvent, RecognizerSink, SpeechRecognizer};
use pitchiq_call::effects::{CallDevices, CallRuntime, RuntimeConfig};
use pitchiq_call::playback::{AudioBuffer, AudioOutput, FinishedSink, PlaybackError};
use pitchiq_call::state_machine::{CallState, ReviewStatus};
use pitchiq_call::transport::ConnectionStatus;
use pitchiq_call::{spawn_with_runner, CallHandle, CallView};

// ============================================================================
// Fake devices
// ============================================================================

/// Speakers that "play" each pushed buffer for 20ms, back to back.
struct FakeOutput {
    on_finished: FinishedSink,
    played: Arc<Mutex<Vec<usize>>>,
    generation: Arc<Mutex<u64>>,
    busy_until: Instant,
}

impl AudioOutput for FakeOutput {
    fn push(&mut self, buffer_id: u64, buffer: AudioBuffer) -> Result<(), PlaybackError> {
        self.played.lock().unwrap().push(buffer.frames());
        let finish_at = self.busy_until.max(Instant::now()) + Duration::from_millis(20);
        self.busy_until = finish_at;

        let generation = self.generation.clone();
        let pushed = *generation.lock().unwrap();
        let on_finished = self.on_finished.clone();
        std::thread::spawn(move || {
            std::thread::sleep(finish_at.saturating_duration_since(Instant::now()));
            if *generation.lock().unwrap() == pushed {
                on_finished(buffer_id);
            }
        });
        Ok(())
    }

    fn halt(&mut self) {
        *self.generation.lock().unwrap() += 1;
        self.busy_until = Instant::now();
    }
}

/// Recognizer that hears the next scripted utterance when the user finishes.
struct ScriptedRecognizer {
    sink: RecognizerSink,
    utterances: Arc<Mutex<VecDeque<String>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl SpeechRecognizer for ScriptedRecognizer {
    fn is_supported(&self) -> bool {
        true
    }

    fn start(&mut self, capture_id: u64) -> Result<(), CaptureError> {
        self.calls.lock().unwrap().push(format!("start {}", capture_id));
        Ok(())
    }

    fn stop(&mut self, capture_id: u64) {
        self.calls.lock().unwrap().push(format!("stop {}", capture_id));
    }

    fn finish(&mut self, capture_id: u64) {
        self.calls.lock().unwrap().push(format!("finish {}", capture_id));
        match self.utterances.lock().unwrap().pop_front() {
            Some(text) => (self.sink)(RecognizerEvent::Final { capture_id, text }),
            None => (self.sink)(RecognizerEvent::Ended { capture_id }),
        }
    }
}

#[derive(Clone)]
struct FakeDevices {
    capture_supported: bool,
    /// How long opening the speakers takes
    output_delay: Duration,
    output_fails: bool,
    played: Arc<Mutex<Vec<usize>>>,
    utterances: Arc<Mutex<VecDeque<String>>>,
    recognizer_calls: Arc<Mutex<Vec<String>>>,
}

impl FakeDevices {
    fn new(utterances: &[&str]) -> Self {
        Self {
            capture_supported: true,
            output_delay: Duration::ZERO,
            output_fails: false,
            played: Arc::default(),
            utterances: Arc::new(Mutex::new(
                utterances.iter().map(|s| s.to_string()).collect(),
            )),
            recognizer_calls: Arc::default(),
        }
    }

    fn played(&self) -> Vec<usize> {
        self.played.lock().unwrap().clone()
    }

    fn recognizer_calls(&self) -> Vec<String> {
        self.recognizer_calls.lock().unwrap().clone()
    }
}

impl CallDevices for FakeDevices {
    fn capture_supported(&self) -> bool {
        self.capture_supported
    }

    fn open_output(&self, on_finished: FinishedSink) -> Result<Box<dyn AudioOutput>, PlaybackError> {
        std::thread::sleep(self.output_delay);
        if self.output_fails {
            return Err(PlaybackError::NoOutputDevice);
        }
        Ok(Box::new(FakeOutput {
            on_finished,
            played: self.played.clone(),
            generation: Arc::default(),
            busy_until: Instant::now(),
        }))
    }

    fn open_recognizer(&self, sink: RecognizerSink) -> Box<dyn SpeechRecognizer> {
        Box::new(ScriptedRecognizer {
            sink,
            utterances: self.utterances.clone(),
            calls: self.recognizer_calls.clone(),
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn config(server_url: &str) -> RuntimeConfig {
    RuntimeConfig {
        server_url: server_url.to_string(),
        connect_attempts: 1,
        agent_timeout: None,
        backend: None,
    }
}

fn spawn(config: RuntimeConfig, devices: &FakeDevices) -> CallHandle {
    spawn_with_runner(CallRuntime::new(config, devices.clone()))
}

/// Base64 WAV chunk with `frames` mono samples.
fn wav_chunk(frames: usize) -> String {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for i in 0..frames {
            writer.write_sample((i % 64) as i16 * 200).unwrap();
        }
        writer.finalize().unwrap();
    }
    base64::engine::general_purpose::STANDARD.encode(cursor.into_inner())
}

async fn wait_for<F>(status: &mut watch::Receiver<CallView>, what: &str, pred: F) -> CallView
where
    F: FnMut(&CallView) -> bool,
{
    let result = tokio::time::timeout(WAIT, status.wait_for(pred))
        .await
        .map(|r| r.map(|view| view.clone()));
    match result {
        Ok(Ok(view)) => view,
        Ok(Err(_)) => panic!("call loop ended while waiting for {}", what),
        Err(_) => panic!("timed out waiting for {}: {:?}", what, status.borrow()),
    }
}

/// Start a call and answer `start_session` with session `s1`.
async fn connected_call(
    devices: &FakeDevices,
    server: &mut FakeCallServer,
) -> (CallHandle, watch::Receiver<CallView>) {
    let handle = spawn(config(&server.url), devices);
    let mut status = handle.subscribe();
    handle.start_call("easy", "temp-user-001");

    let start = server.recv().await;
    assert_eq!(start["type"], "start_session");
    server.send(
        "session_started",
        json!({ "session_id": "s1", "persona": { "name": "Marcus Johnson" } }),
    );
    wait_for(&mut status, "session", |v| v.session_id.as_deref() == Some("s1")).await;
    (handle, status)
}

/// Play an agent greeting and wait for the floor to pass to the user.
async fn agent_greets(server: &FakeCallServer, status: &mut watch::Receiver<CallView>) {
    server.send("persona_thinking", json!({}));
    server.send(
        "audio_complete",
        json!({ "transcript": "Marcus here.", "turn_number": 1 }),
    );
    wait_for(status, "user's turn", |v| v.state == CallState::WaitingForUser).await;
}

// ============================================================================
// Full turn cycle
// ============================================================================

#[tokio::test]
async fn full_call_turn_cycle() {
    let devices = FakeDevices::new(&["I'm interested"]);
    let mut server = FakeCallServer::start().await;

    let handle = spawn(config(&server.url), &devices);
    let mut status = handle.subscribe();
    handle.start_call("easy", "temp-user-001");

    // The difficulty id is sent as the backend persona id
    let start = server.recv().await;
    assert_eq!(
        start,
        json!({
            "type": "start_session",
            "payload": { "persona_id": "marcus", "user_id": "temp-user-001" }
        })
    );

    server.send(
        "session_started",
        json!({ "session_id": "s1", "persona": { "name": "Marcus Johnson" } }),
    );
    let view = wait_for(&mut status, "session", |v| v.session_id.is_some()).await;
    assert!(view.active);
    assert_eq!(view.connection, ConnectionStatus::Connected);
    assert_eq!(view.persona.as_deref(), Some("Marcus Johnson"));

    // Agent turn: two chunks then the transcript
    server.send("persona_thinking", json!({}));
    server.send("audio_chunk", json!({ "audio": wav_chunk(800), "turn_number": 1 }));
    server.send("audio_chunk", json!({ "audio": wav_chunk(1600), "turn_number": 1 }));
    server.send(
        "audio_complete",
        json!({ "transcript": "Hello", "turn_number": 1 }),
    );

    let view = wait_for(&mut status, "user's turn", |v| {
        v.state == CallState::WaitingForUser
    })
    .await;
    assert_eq!(view.last_agent_transcript.as_deref(), Some("Hello"));
    assert_eq!(view.last_agent_turn, Some(1));
    assert!(!view.playing);
    assert_eq!(devices.played(), vec![800, 1600]);

    // User turn
    handle.speak();
    wait_for(&mut status, "listening", |v| v.state == CallState::UserSpeaking).await;
    handle.finish_speaking();

    let speech = server.recv().await;
    assert_eq!(
        speech,
        json!({
            "type": "user_speech",
            "payload": { "transcript": "I'm interested", "turn_number": 2 }
        })
    );
    let view = wait_for(&mut status, "turn 2", |v| v.turn == 2).await;
    assert_eq!(view.state, CallState::Idle);

    // Server ends the session
    server.send("session_ended", json!({ "reason": "completed", "total_turns": 2 }));
    let view = wait_for(&mut status, "call end", |v| !v.active).await;
    assert_eq!(view.end_reason.as_deref(), Some("completed"));
    assert_eq!(view.state, CallState::Idle);
    assert_eq!(view.connection, ConnectionStatus::Disconnected);
    assert_eq!(view.session_id, None);
    assert!(view.error.is_none());

    server.closed().await;
    handle.shutdown().await;
}

// ============================================================================
// Floor control
// ============================================================================

#[tokio::test]
async fn persona_thinking_stops_active_capture() {
    let devices = FakeDevices::new(&[]);
    let mut server = FakeCallServer::start().await;
    let (handle, mut status) = connected_call(&devices, &mut server).await;
    agent_greets(&server, &mut status).await;

    handle.speak();
    wait_for(&mut status, "listening", |v| v.state == CallState::UserSpeaking).await;

    server.send("persona_thinking", json!({}));
    wait_for(&mut status, "agent floor", |v| v.state == CallState::AgentSpeaking).await;
    assert_eq!(devices.recognizer_calls(), vec!["start 1", "stop 1"]);

    handle.shutdown().await;
}

#[tokio::test]
async fn speak_during_agent_turn_is_ignored() {
    let devices = FakeDevices::new(&["too early"]);
    let mut server = FakeCallServer::start().await;
    let (handle, mut status) = connected_call(&devices, &mut server).await;

    server.send("persona_thinking", json!({}));
    wait_for(&mut status, "agent floor", |v| v.state == CallState::AgentSpeaking).await;

    handle.speak();
    handle.finish_speaking();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(status.borrow().state, CallState::AgentSpeaking);
    assert!(devices.recognizer_calls().is_empty());

    handle.shutdown().await;
}

#[tokio::test]
async fn silence_returns_floor_to_user() {
    let devices = FakeDevices::new(&[]);
    let mut server = FakeCallServer::start().await;
    let (handle, mut status) = connected_call(&devices, &mut server).await;
    agent_greets(&server, &mut status).await;

    handle.speak();
    wait_for(&mut status, "listening", |v| v.state == CallState::UserSpeaking).await;
    handle.finish_speaking();

    let view = wait_for(&mut status, "floor back", |v| {
        v.state == CallState::WaitingForUser
    })
    .await;
    assert_eq!(view.turn, 1);
    assert!(view.active);

    handle.end_call();
    // Nothing but end_session reaches the server
    let frames = server.closed().await;
    assert_eq!(frames, vec![json!({ "type": "end_session", "payload": {} })]);

    handle.shutdown().await;
}

// ============================================================================
// Call end and failures
// ============================================================================

#[tokio::test]
async fn end_call_sends_end_session_then_closes() {
    let devices = FakeDevices::new(&[]);
    let mut server = FakeCallServer::start().await;
    let (handle, mut status) = connected_call(&devices, &mut server).await;

    handle.end_call();
    let view = wait_for(&mut status, "call end", |v| !v.active).await;
    assert_eq!(view.end_reason.as_deref(), Some("ended_by_user"));

    let frames = server.closed().await;
    assert_eq!(frames, vec![json!({ "type": "end_session", "payload": {} })]);

    // Ending again is a no-op
    handle.end_call();
    handle.shutdown().await;
}

#[tokio::test]
async fn server_drop_tears_down_with_connection_error() {
    let devices = FakeDevices::new(&[]);
    let mut server = FakeCallServer::start().await;
    let (handle, mut status) = connected_call(&devices, &mut server).await;

    server.close();

    let view = wait_for(&mut status, "call end", |v| !v.active).await;
    let error = view.error.expect("connection error");
    assert!(error.starts_with("Connection error"), "{}", error);
    assert_eq!(view.connection, ConnectionStatus::Disconnected);

    handle.shutdown().await;
}

#[tokio::test]
async fn unreachable_server_fails_the_call() {
    let devices = FakeDevices::new(&[]);
    let handle = spawn(config(&dead_url().await), &devices);
    let mut status = handle.subscribe();

    handle.start_call("medium", "temp-user-001");

    let view = wait_for(&mut status, "failure", |v| v.error.is_some()).await;
    assert!(!view.active);
    assert!(view.error.unwrap().starts_with("Connection error"));

    handle.shutdown().await;
}

#[tokio::test]
async fn unsupported_capture_never_connects() {
    let mut devices = FakeDevices::new(&[]);
    devices.capture_supported = false;
    let handle = spawn(config(&dead_url().await), &devices);
    let mut status = handle.subscribe();

    handle.start_call("easy", "temp-user-001");

    let view = wait_for(&mut status, "error", |v| v.error.is_some()).await;
    assert!(!view.active);
    assert_eq!(view.connection, ConnectionStatus::Disconnected);
    assert!(view.error.unwrap().contains("not available"));

    handle.shutdown().await;
}

#[tokio::test]
async fn unresponsive_agent_returns_floor() {
    let devices = FakeDevices::new(&["Are you there?"]);
    let mut server = FakeCallServer::start().await;

    let handle = spawn(
        RuntimeConfig {
            agent_timeout: Some(Duration::from_millis(200)),
            ..config(&server.url)
        },
        &devices,
    );
    let mut status = handle.subscribe();
    handle.start_call("aggressive", "temp-user-001");
    assert_eq!(server.recv().await["payload"]["persona_id"], "robert");
    server.send("session_started", json!({ "session_id": "s1" }));
    wait_for(&mut status, "session", |v| v.session_id.is_some()).await;
    agent_greets(&server, &mut status).await;

    handle.speak();
    wait_for(&mut status, "listening", |v| v.state == CallState::UserSpeaking).await;
    handle.finish_speaking();
    assert_eq!(server.recv().await["type"], "user_speech");

    // The server never answers
    let view = wait_for(&mut status, "watchdog", |v| v.error.is_some()).await;
    assert_eq!(view.state, CallState::WaitingForUser);
    assert!(view.active);
    assert_eq!(view.error.as_deref(), Some("The prospect stopped responding"));

    handle.shutdown().await;
}

#[tokio::test]
async fn recoverable_server_error_keeps_call() {
    let devices = FakeDevices::new(&[]);
    let mut server = FakeCallServer::start().await;
    let (handle, mut status) = connected_call(&devices, &mut server).await;

    server.send(
        "error",
        json!({ "message": "TTS hiccup", "recoverable": true }),
    );
    let view = wait_for(&mut status, "error", |v| v.error.is_some()).await;
    assert!(view.active);
    assert!(view.error.unwrap().contains("TTS hiccup"));

    server.send(
        "error",
        json!({ "message": "LLM down", "recoverable": false }),
    );
    let view = wait_for(&mut status, "call end", |v| !v.active).await;
    assert!(view.error.unwrap().contains("LLM down"));

    handle.shutdown().await;
}

// ============================================================================
// Transcript logging and scoring
// ============================================================================

#[tokio::test]
async fn turns_are_logged_and_call_is_scored() {
    let api = FakeApi::start(|method, path| match (method, path) {
        ("POST", "/sessions") => Some((200, session_json("b1", "temp-user-001", "marcus"))),
        ("POST", "/sessions/b1/messages") => Some((200, json!({ "id": "m" }))),
        ("POST", "/sessions/b1/end") => Some((200, end_session_json("b1", 7))),
        _ => Some((404, json!({ "detail": "Not Found" }))),
    })
    .await;

    let devices = FakeDevices::new(&["I'm interested"]);
    let mut server = FakeCallServer::start().await;
    let handle = spawn(
        RuntimeConfig {
            backend: Some(BackendClient::new(&api.url, Duration::from_secs(5))),
            ..config(&server.url)
        },
        &devices,
    );
    let mut status = handle.subscribe();
    handle.start_call("easy", "temp-user-001");
    server.recv().await;
    server.send("session_started", json!({ "session_id": "s1" }));
    wait_for(&mut status, "session", |v| v.session_id.is_some()).await;
    agent_greets(&server, &mut status).await;

    handle.speak();
    wait_for(&mut status, "listening", |v| v.state == CallState::UserSpeaking).await;
    handle.finish_speaking();
    server.recv().await;

    // Wait until the backend session exists before hanging up
    api.wait_for_requests(3).await;
    handle.end_call();

    let view = wait_for(&mut status, "scorecard", |v| {
        v.review
            .as_ref()
            .is_some_and(|r| matches!(r.status, ReviewStatus::Scored(_)))
    })
    .await;
    let review = view.review.unwrap();
    assert_eq!(review.session_id, "b1");
    match review.status {
        ReviewStatus::Scored(card) => {
            assert_eq!(card.overall_score, 7);
            assert_eq!(card.grade(), 'B');
        }
        other => panic!("Expected Scored, got {:?}", other),
    }

    let requests = api.requests();
    let paths: Vec<_> = requests
        .iter()
        .map(|r| format!("{} {}", r.method, r.path))
        .collect();
    assert_eq!(
        paths,
        vec![
            "POST /sessions",
            "POST /sessions/b1/messages",
            "POST /sessions/b1/messages",
            "POST /sessions/b1/end",
        ]
    );
    assert_eq!(
        requests[0].body,
        json!({ "user_id": "temp-user-001", "persona_id": "marcus" })
    );
    assert_eq!(
        requests[1].body,
        json!({ "role": "prospect", "content": "Marcus here.", "turn_number": 1 })
    );
    assert_eq!(
        requests[2].body,
        json!({ "role": "advisor", "content": "I'm interested", "turn_number": 2 })
    );

    handle.shutdown().await;
}

#[tokio::test]
async fn scoring_failure_is_surfaced() {
    let api = FakeApi::start(|method, path| match (method, path) {
        ("POST", "/sessions") => Some((200, session_json("b2", "temp-user-001", "sarah"))),
        ("POST", "/sessions/b2/messages") => Some((200, json!({}))),
        ("POST", "/sessions/b2/end") => Some((500, json!({ "detail": "Scoring model unavailable" }))),
        _ => Some((404, json!({}))),
    })
    .await;

    let devices = FakeDevices::new(&[]);
    let mut server = FakeCallServer::start().await;
    let handle = spawn(
        RuntimeConfig {
            backend: Some(BackendClient::new(&api.url, Duration::from_secs(5))),
            ..config(&server.url)
        },
        &devices,
    );
    let mut status = handle.subscribe();
    handle.start_call("medium", "temp-user-001");
    server.recv().await;
    server.send("session_started", json!({ "session_id": "s2" }));
    wait_for(&mut status, "session", |v| v.session_id.is_some()).await;
    agent_greets(&server, &mut status).await;
    api.wait_for_requests(2).await;

    handle.end_call();

    let view = wait_for(&mut status, "review failure", |v| {
        v.review
            .as_ref()
            .is_some_and(|r| matches!(r.status, ReviewStatus::Failed(_)))
    })
    .await;
    assert!(view.error.unwrap().contains("Scoring model unavailable"));

    handle.shutdown().await;
}

// ============================================================================
// Playback resilience
// ============================================================================

#[tokio::test]
async fn corrupt_chunk_mid_turn_is_skipped() {
    let devices = FakeDevices::new(&[]);
    let mut server = FakeCallServer::start().await;
    let (handle, mut status) = connected_call(&devices, &mut server).await;

    server.send("persona_thinking", json!({}));
    server.send("audio_chunk", json!({ "audio": wav_chunk(800), "turn_number": 1 }));
    server.send("audio_chunk", json!({ "audio": "!!not base64!!", "turn_number": 1 }));
    server.send(
        "audio_chunk",
        json!({
            "audio": base64::engine::general_purpose::STANDARD.encode(b"not audio at all"),
            "turn_number": 1
        }),
    );
    server.send("audio_chunk", json!({ "audio": wav_chunk(1600), "turn_number": 1 }));
    server.send(
        "audio_complete",
        json!({ "transcript": "Hello", "turn_number": 1 }),
    );

    let view = wait_for(&mut status, "user's turn", |v| {
        v.state == CallState::WaitingForUser
    })
    .await;
    assert!(view.active);
    assert!(!view.playing);
    assert!(view.error.is_none());
    assert_eq!(view.last_agent_turn, Some(1));
    assert_eq!(devices.played(), vec![800, 1600]);

    handle.shutdown().await;
}

#[tokio::test]
async fn slow_output_open_does_not_stall_the_call() {
    let mut devices = FakeDevices::new(&[]);
    devices.output_delay = Duration::from_secs(1);
    let mut server = FakeCallServer::start().await;

    let started = Instant::now();
    let (handle, mut status) = connected_call(&devices, &mut server).await;
    // The socket opened while the speakers were still opening
    assert!(started.elapsed() < Duration::from_millis(700));

    server.send("persona_thinking", json!({}));
    server.send("audio_chunk", json!({ "audio": wav_chunk(800), "turn_number": 1 }));
    server.send("audio_chunk", json!({ "audio": wav_chunk(1600), "turn_number": 1 }));
    server.send(
        "audio_complete",
        json!({ "transcript": "Hello", "turn_number": 1 }),
    );

    let view = wait_for(&mut status, "user's turn", |v| {
        v.state == CallState::WaitingForUser
    })
    .await;
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(view.active);
    assert_eq!(devices.played(), vec![800, 1600]);

    handle.shutdown().await;
}

#[tokio::test]
async fn output_failure_ends_the_call() {
    let mut devices = FakeDevices::new(&[]);
    devices.output_fails = true;
    let server = FakeCallServer::start().await;
    let handle = spawn(config(&server.url), &devices);
    let mut status = handle.subscribe();

    handle.start_call("easy", "temp-user-001");

    let view = wait_for(&mut status, "device fault", |v| v.error.is_some()).await;
    assert!(!view.active);
    assert_eq!(
        view.error.as_deref(),
        Some("Audio device error: No audio output device found")
    );

    handle.shutdown().await;
}
