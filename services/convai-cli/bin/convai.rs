//! Text-only terminal client for a conversational agent.
//!
//! Lines typed on stdin are sent as user messages. Commands:
//! `/like`, `/dislike`, `/context <text>`, `/quit`.

use anyhow::Context;
use clap::Parser;
use convai_cli::{
    config::{Config, parse_level},
    ws_transport::WsTransport,
};
use convai_client::{
    Callbacks, ConversationSession, NoAudio, ToolResult,
    types::{ConversationMode, SessionState},
};
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(version, about = "Chat with a conversational agent from the terminal")]
struct Cli {
    /// Agent to talk to; overrides CONVAI_AGENT_ID.
    #[arg(long)]
    agent_id: Option<String>,
    /// Log level; overrides RUST_LOG.
    #[arg(long)]
    log_level: Option<String>,
}

enum Input {
    Message(String),
    Context(String),
    Feedback(bool),
    Quit,
}

fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    match line {
        "" => None,
        "/quit" | "/exit" => Some(Input::Quit),
        "/like" => Some(Input::Feedback(true)),
        "/dislike" => Some(Input::Feedback(false)),
        _ => match line.strip_prefix("/context ") {
            Some(text) => Some(Input::Context(text.trim().to_string())),
            None => Some(Input::Message(line.to_string())),
        },
    }
}

fn callbacks() -> Callbacks {
    Callbacks::default()
        .on_connect(|id| println!("[connected: {id}]"))
        .on_agent_response(|text| println!("agent> {text}"))
        .on_user_transcript(|text| println!("you> {text}"))
        .on_agent_response_correction(|c| println!("agent (corrected)> {}", c.corrected))
        .on_mode_change(|mode| {
            if mode == ConversationMode::Speaking {
                info!("Agent is responding");
            }
        })
        .on_can_send_feedback_change(|can_send| {
            if can_send {
                println!("[rate this answer with /like or /dislike]");
            }
        })
        .on_error(|e| {
            eprintln!(
                "[server error {}: {}]",
                e.code,
                e.message.as_deref().unwrap_or("unknown")
            )
        })
        .on_disconnect(|reason| println!("[disconnected: {reason:?}]"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --- 1. Load Configuration ---
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(agent_id) = cli.agent_id {
        config.agent_id = Some(agent_id);
        config.conversation_token = None;
    }
    if let Some(level) = cli.log_level.as_deref() {
        config.log_level = parse_level(level).context("Invalid --log-level")?;
    }

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    // --- 3. Build the Session ---
    let conversation = config
        .conversation_config()
        .context("Incomplete agent configuration")?;
    conversation.client_tools.register_fn("get_client_info", |_| async {
        Ok(Some(ToolResult::success(
            json!({
                "client": "convai-cli",
                "version": env!("CARGO_PKG_VERSION"),
                "os": std::env::consts::OS,
                "arch": std::env::consts::ARCH,
            })
            .to_string(),
        )))
    });

    let session = ConversationSession::new(
        conversation,
        Arc::new(WsTransport::new()),
        Arc::new(NoAudio),
        callbacks(),
    )
    .context("Invalid session configuration")?;
    info!(session = %session.id(), "Starting conversation...");
    session.start().await.context("Failed to start the conversation")?;

    // --- 4. Chat Loop ---
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut status = session.watch_status();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                let sent = match parse_input(&line) {
                    None => Ok(()),
                    Some(Input::Quit) => break,
                    Some(Input::Feedback(positive)) => session.send_feedback(positive),
                    Some(Input::Context(text)) => session.send_contextual_update(text),
                    Some(Input::Message(text)) => session.send_user_message(text),
                };
                if let Err(e) = sent {
                    warn!(error = %e, "Message not sent");
                }
            }
            changed = status.changed() => {
                if changed.is_err() || matches!(*status.borrow(), SessionState::Disconnected | SessionState::Error) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C. Ending conversation...");
                break;
            }
        }
    }

    session.end().await.context("Failed to end the conversation cleanly")?;
    info!("Conversation finished.");
    Ok(())
}
