pub mod backend;
pub mod capture;
pub mod effects;
pub mod personas;
pub mod playback;
pub mod settings;
pub mod state_machine;
pub mod transport;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use effects::{CallDevices, CallRuntime, EffectRunner, RuntimeConfig};
use settings::AppSettings;
use state_machine::{reduce, Call, CallState, Effect, Event, Observed, Review};
use transport::ConnectionStatus;

/// Call status published to front ends.
/// Serializes as `{ "active": true, "state": "waiting_for_user", ... }`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallView {
    pub active: bool,
    pub connection: ConnectionStatus,
    pub state: CallState,
    pub session_id: Option<String>,
    pub turn: u32,
    /// Name the prospect announced at session start
    pub persona: Option<String>,
    pub last_agent_transcript: Option<String>,
    pub last_agent_turn: Option<u32>,
    pub playing: bool,
    pub error: Option<String>,
    pub end_reason: Option<String>,
    pub review: Option<Review>,
}

/// Convert the internal call snapshot to the published view
fn call_view(call: &Call, observed: &Observed) -> CallView {
    CallView {
        active: call.is_active(),
        connection: call.connection,
        state: call.state,
        session_id: call.session_id.clone(),
        turn: call.turn,
        persona: call.persona.as_ref().map(|p| p.name.clone()),
        last_agent_transcript: call.last_agent_transcript.clone(),
        last_agent_turn: call.last_agent_turn,
        playing: observed.playing,
        error: call.last_error.as_ref().map(|e| e.to_string()),
        end_reason: call.end_reason.clone(),
        review: call.review.clone(),
    }
}

fn publish(status: &watch::Sender<CallView>, call: &Call, observed: &Observed) {
    let view = call_view(call, observed);
    log::debug!("Publishing call view: {:?}", serde_json::to_string(&view));
    status.send_replace(view);
}

/// Run the call loop
///
/// Single writer: this task owns the call snapshot and the runner, and
/// processes one event at a time.
pub async fn run_call_loop<R: EffectRunner>(
    mut runner: R,
    tx: mpsc::UnboundedSender<Event>,
    mut rx: mpsc::UnboundedReceiver<Event>,
    status: watch::Sender<CallView>,
) {
    let mut call = Call::default();

    publish(&status, &call, &runner.observe());
    log::info!("Call loop started");

    while let Some(event) = rx.recv().await {
        log::debug!("Received event: {:?}", event);

        // Handle Exit at the edge: tear down any live call, then stop
        let exiting = matches!(event, Event::Exit);

        let Some(event) = runner.absorb(event) else {
            continue;
        };

        let observed = runner.observe();
        let (next, effects) = reduce(&call, event, &observed);

        // Log state transitions
        if call.state != next.state || call.is_active() != next.is_active() {
            log::info!(
                "Call transition: {:?} -> {:?} (active: {} -> {})",
                call.state,
                next.state,
                call.is_active(),
                next.is_active()
            );
        }

        call = next;

        for effect in effects {
            match effect {
                Effect::EmitStatus => publish(&status, &call, &runner.observe()),
                other => runner.apply(other, &tx),
            }
        }

        if exiting {
            log::info!("Exit requested, shutting down call loop");
            break;
        }
    }

    log::info!("Call loop ended");
}

/// Front-end handle to a running call loop.
///
/// Dropping the handle asks the loop to exit, which ends any live call.
pub struct CallHandle {
    tx: mpsc::UnboundedSender<Event>,
    status: watch::Receiver<CallView>,
    task: Option<JoinHandle<()>>,
}

impl CallHandle {
    fn send(&self, event: Event) {
        if self.tx.send(event).is_err() {
            log::warn!("Call loop is not running");
        }
    }

    /// Start a call. `persona` is a difficulty id such as `easy`.
    pub fn start_call(&self, persona: &str, user_id: &str) {
        self.send(Event::StartCall {
            persona_id: personas::backend_persona_id(persona).to_string(),
            user_id: user_id.to_string(),
        });
    }

    /// Ask for the floor.
    pub fn speak(&self) {
        self.send(Event::SpeakRequested);
    }

    /// End the current utterance now.
    pub fn finish_speaking(&self) {
        self.send(Event::FinishSpeaking);
    }

    pub fn end_call(&self) {
        self.send(Event::EndCall);
    }

    /// Current call view.
    pub fn status(&self) -> CallView {
        self.status.borrow().clone()
    }

    /// Subscribe to call view updates.
    pub fn subscribe(&self) -> watch::Receiver<CallView> {
        self.status.clone()
    }

    /// Raw event sender, for wiring custom front ends.
    pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
        self.tx.clone()
    }

    /// Exit the loop and wait for teardown to finish.
    pub async fn shutdown(mut self) {
        self.send(Event::Exit);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("Call loop task failed: {}", e);
            }
        }
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.tx.send(Event::Exit);
        }
    }
}

/// Spawn a call loop driven by `runner`.
pub fn spawn_with_runner<R: EffectRunner>(runner: R) -> CallHandle {
    let (tx, rx) = mpsc::unbounded_channel::<Event>();
    let (status_tx, status_rx) = watch::channel(CallView::default());

    let loop_tx = tx.clone();
    let task = tokio::spawn(async move {
        run_call_loop(runner, loop_tx, rx, status_tx).await;
    });

    CallHandle {
        tx,
        status: status_rx,
        task: Some(task),
    }
}

/// Spawn a call loop using `devices` and the connection settings.
pub fn spawn_call<D: CallDevices>(settings: &AppSettings, devices: D) -> CallHandle {
    let runtime = CallRuntime::new(RuntimeConfig::from_settings(settings), devices);
    spawn_with_runner(runtime)
}
