//! Nexus terminal host.
//!
//! Three views share one console: Chat (streaming text with search
//! grounding), Live (duplex voice session through `nexus-core`), and Image
//! (single-shot generation). Logs go to stderr; the views write to stdout.

mod commands;
mod services;
mod settings;
mod state;

use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use nexus_core::{CpalBackend, LiveEngine, SessionStatusEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, warn};

use commands::{execute, parse, Flow};
use services::{
    chat::{ChatSession, WELCOME_MESSAGE},
    image::ImageService,
    GeminiClient,
};
use settings::{api_key_from_env, default_settings_path, load_settings};
use state::{AppState, View};

#[tokio::main]
async fn main() -> Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("nexus=info,nexus_core=info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Nexus starting");

    let settings_path = default_settings_path();
    let mut settings = load_settings(&settings_path);
    settings.apply_env_overrides();
    info!(
        path = %settings_path.display(),
        chat_model = %settings.chat_model,
        live_model = %settings.live_model,
        voice = %settings.voice_name,
        "settings loaded"
    );

    let api_key = api_key_from_env();
    if api_key.is_none() {
        error!("API_KEY is missing from environment variables.");
    }

    // ── Live engine ───────────────────────────────────────────────────────
    let engine = LiveEngine::spawn(
        settings.engine_config(),
        Arc::new(CpalBackend::new()),
        Arc::new(settings.live_connector(api_key.clone())),
    );
    spawn_status_printer(engine.subscribe_status());

    // ── Chat / image clients ──────────────────────────────────────────────
    let client = GeminiClient::new(api_key)?;
    let chat = ChatSession::new(
        client.clone(),
        settings.chat_model.clone(),
        settings.system_instruction.clone(),
        settings.search_grounding,
    );
    let images = ImageService::new(client, settings.image_model.clone());

    let mut state = AppState {
        engine,
        aspect_ratio: settings.default_aspect_ratio,
        settings,
        settings_path,
        chat,
        images,
        view: View::Chat,
    };

    let mut out = std::io::stdout();
    writeln!(out, "Gemini Nexus. Type /help for commands.")?;
    writeln!(out, "── {} ──", state.view)?;
    writeln!(out, "{WELCOME_MESSAGE}")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        write!(out, "{}", state.view.prompt())?;
        out.flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                writeln!(out)?;
                None
            }
        };
        let Some(line) = line else {
            state.shutdown().await;
            break;
        };

        // Ctrl-C while a chat reply streams or an image renders abandons that
        // request and returns to the prompt; at the prompt it quits.
        let command = parse(&line, state.view);
        let outcome = tokio::select! {
            outcome = execute(&mut state, command, &mut out) => Some(outcome),
            _ = tokio::signal::ctrl_c() => None,
        };
        match outcome {
            Some(Ok(Flow::Continue)) => {}
            Some(Ok(Flow::Quit)) => break,
            Some(Err(e)) => {
                error!("command failed: {e:#}");
                writeln!(out, "error: {e}")?;
            }
            None => {
                info!("command interrupted");
                writeln!(out, "\nInterrupted.")?;
            }
        }
    }

    let diag = state.engine.diagnostics_snapshot();
    info!(
        frames_sent = diag.frames_sent,
        frames_dropped = diag.frames_dropped,
        inbound_frames = diag.inbound_frames,
        "Nexus exiting"
    );
    Ok(())
}

/// Print every session status change as it happens.
fn spawn_status_printer(mut status_rx: broadcast::Receiver<SessionStatusEvent>) {
    tokio::spawn(async move {
        loop {
            match status_rx.recv().await {
                Ok(event) => match &event.detail {
                    Some(detail) => println!("\n[live] {} ({detail})", event.status),
                    None => println!("\n[live] {}", event.status),
                },
                Err(RecvError::Lagged(n)) => warn!("status receiver lagged by {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}
