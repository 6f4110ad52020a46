use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use pitchiq_call::backend::{BackendClient, Scorecard, SessionDetail};
use pitchiq_call::effects::SystemDevices;
use pitchiq_call::personas::{self, PERSONAS};
use pitchiq_call::settings::{load_settings, save_settings, AppSettings};
use pitchiq_call::state_machine::{CallState, ReviewStatus};
use pitchiq_call::{spawn_call, CallView};

#[derive(Parser)]
#[command(name = "pitchiq-call", version, about = "Cold-call practice against an AI prospect")]
struct Cli {
    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Session API base URL
    #[arg(long, global = true)]
    api: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a practice call
    Call {
        /// easy, medium or aggressive
        #[arg(long)]
        persona: Option<String>,
        #[arg(long)]
        user: Option<String>,
        /// Call server WebSocket URL
        #[arg(long)]
        server: Option<String>,
    },
    /// List the practice personas
    Personas,
    /// List past sessions
    Sessions {
        #[arg(long)]
        user: Option<String>,
    },
    /// Show one session's transcript and scorecard
    Show { session_id: String },
    /// Print the effective settings
    Config {
        /// Write them to the settings file
        #[arg(long)]
        save: bool,
    },
}

fn main() -> Result<()> {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // Process-wide crypto provider for the wss:// handshake
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("rustls crypto provider already installed");
    }

    let cli = Cli::parse();

    let mut settings = load_settings();
    settings.apply_env_overrides();
    if let Some(api) = &cli.api {
        settings.api_url = api.clone();
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async move {
        match cli.command {
            Command::Call {
                persona,
                user,
                server,
            } => {
                if let Some(persona) = persona {
                    settings.persona = persona;
                }
                if let Some(user) = user {
                    settings.user_id = user;
                }
                if let Some(server) = server {
                    settings.server_url = server;
                }
                run_call(settings, cli.json).await
            }
            Command::Personas => {
                list_personas(cli.json)?;
                Ok(())
            }
            Command::Sessions { user } => {
                let user = user.or_else(|| Some(settings.user_id.clone()));
                list_sessions(&settings, user.as_deref(), cli.json).await
            }
            Command::Show { session_id } => show_session(&settings, &session_id, cli.json).await,
            Command::Config { save } => show_config(&settings, save),
        }
    })
}

async fn run_call(settings: AppSettings, json: bool) -> Result<()> {
    let persona = personas::find(&settings.persona)
        .with_context(|| format!("Unknown persona '{}'", settings.persona))?;

    let devices = SystemDevices::new(settings.whisper_options());
    let handle = spawn_call(&settings, devices);
    let mut status = handle.subscribe();

    if !json {
        println!("Practice with {}: {}", persona.name, persona.description);
        println!("Press Enter to talk, Enter again when done. Type q and Enter to hang up.");
    }
    handle.start_call(persona.id, &settings.user_id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut was_active = false;
    let mut last = CallView::default();

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = status.borrow_and_update().clone();
                render(&last, &view, json)?;
                was_active |= view.active;

                let scoring = view
                    .review
                    .as_ref()
                    .is_some_and(|r| r.status == ReviewStatus::Scoring);
                let finished = !view.active && (was_active || view.error.is_some());
                last = view;
                if finished && !scoring {
                    break;
                }
            }
            line = lines.next_line(), if stdin_open => {
                match line.context("Failed to read stdin")? {
                    Some(line) if line.trim().eq_ignore_ascii_case("q") => handle.end_call(),
                    Some(_) if last.state == CallState::UserSpeaking => handle.finish_speaking(),
                    Some(_) => handle.speak(),
                    None => {
                        stdin_open = false;
                        handle.end_call();
                    }
                }
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}

fn render(last: &CallView, view: &CallView, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(view)?);
        return Ok(());
    }

    if view.connection != last.connection {
        println!("[{:?}]", view.connection);
    }
    if view.persona != last.persona {
        if let Some(name) = &view.persona {
            println!("You are speaking with {}", name);
        }
    }
    if view.last_agent_turn != last.last_agent_turn {
        if let Some(text) = &view.last_agent_transcript {
            println!("Prospect: {}", text);
        }
    }
    if view.state != last.state && view.active {
        match view.state {
            CallState::WaitingForUser => println!("(your turn - press Enter to speak)"),
            CallState::UserSpeaking => println!("(listening - press Enter when done)"),
            CallState::AgentSpeaking => println!("(prospect is speaking)"),
            CallState::Idle => {}
        }
    }
    if view.error != last.error {
        if let Some(error) = &view.error {
            println!("! {}", error);
        }
    }
    if view.end_reason != last.end_reason {
        if let Some(reason) = &view.end_reason {
            println!("Call ended ({})", reason);
        }
    }
    if view.review != last.review {
        if let Some(review) = &view.review {
            match &review.status {
                ReviewStatus::Scoring => println!("Scoring your call..."),
                ReviewStatus::Scored(card) => print_scorecard(card),
                ReviewStatus::Failed(e) => {
                    println!("Scorecard unavailable: {}", e);
                    println!("Transcript saved: pitchiq-call show {}", review.session_id);
                }
            }
        }
    }
    Ok(())
}

fn print_scorecard(card: &Scorecard) {
    println!();
    println!("Overall score: {}/10 ({})", card.overall_score, card.grade());
    println!("  Opener:             {}/10  {}", card.opener_score, card.opener_feedback);
    println!(
        "  Objection handling: {}/10  {}",
        card.objection_handling_score, card.objection_handling_feedback
    );
    println!(
        "  Tone & confidence:  {}/10  {}",
        card.tone_confidence_score, card.tone_confidence_feedback
    );
    println!(
        "  Close attempt:      {}/10  {}",
        card.close_attempt_score, card.close_attempt_feedback
    );
    println!("Best moment:      {}", card.best_moment);
    println!("Biggest mistake:  {}", card.biggest_mistake);
    println!("Say instead:      {}", card.what_to_say_instead);
    println!(
        "Meeting booked:   {}",
        if card.meeting_booked { "yes" } else { "no" }
    );
}

fn list_personas(json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&PERSONAS)?);
        return Ok(());
    }
    for p in PERSONAS.iter() {
        println!("{:<11} {:<19} {}", p.id, p.name, p.description);
    }
    Ok(())
}

/// Settings after file, environment and flag overrides.
fn show_config(settings: &AppSettings, save: bool) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(settings)?);
    if save {
        let path = save_settings(settings).context("Failed to save settings")?;
        eprintln!("Saved to {}", path.display());
    }
    Ok(())
}

fn backend(settings: &AppSettings) -> BackendClient {
    BackendClient::new(&settings.api_url, settings.scoring_timeout())
}

async fn list_sessions(settings: &AppSettings, user: Option<&str>, json: bool) -> Result<()> {
    let sessions = backend(settings)
        .list_sessions(user)
        .await
        .context("Failed to fetch sessions")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }
    if sessions.is_empty() {
        println!("No sessions yet");
    }
    for s in &sessions {
        println!(
            "{}  {}  {:<28} {}",
            s.id,
            s.started_at.format("%Y-%m-%d %H:%M"),
            personas::display_name(&s.persona_id),
            s.status
        );
    }
    Ok(())
}

async fn show_session(settings: &AppSettings, session_id: &str, json: bool) -> Result<()> {
    let detail: SessionDetail = backend(settings)
        .get_session(session_id)
        .await
        .with_context(|| format!("Failed to fetch session {}", session_id))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&detail)?);
        return Ok(());
    }

    println!(
        "Session {} with {} ({})",
        detail.session.id,
        personas::display_name(&detail.session.persona_id),
        detail.session.status
    );
    for m in &detail.messages {
        let speaker = match m.role {
            pitchiq_call::backend::Role::Advisor => "You",
            pitchiq_call::backend::Role::Prospect => "Prospect",
        };
        println!("[{}] {}: {}", m.turn_number, speaker, m.content);
    }
    match &detail.scorecard {
        Some(card) => print_scorecard(card),
        None => println!("No scorecard"),
    }
    Ok(())
}
