//! Flowchat - Command-line Chat Client
//!
//! Sends one turn to the workflow generator and streams the reply to the
//! terminal, or prints the stored history of a conversation.
//!
//! # Usage
//!
//! ```bash
//! # Start a new (orphan) conversation
//! flowchat send "Build a workflow that emails me new invoices"
//!
//! # Continue a conversation, attaching a workflow
//! flowchat send --conversation c-42 --workflow wf-7 "Add a Slack step"
//!
//! # Print the server's copy of a conversation
//! flowchat history --conversation c-42
//!
//! # Verbose logging
//! RUST_LOG=debug flowchat send "hello"
//! ```
//!
//! # Environment Variables
//!
//! - `FLOWCHAT_CONFIG`: configuration file path
//! - `FLOWCHAT_USER`: user id sent with every turn
//! - `FLOWCHAT_API_URL`, `FLOWCHAT_API_TOKEN`, `FLOWCHAT_MODEL`: see the core config
//! - `RUST_LOG`: log filter (overrides `--log-level`)
//!
//! # Exit Status
//!
//! Non-zero when the turn fails or is interrupted.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use flowchat_core::config::{default_config_path, load_config_from_path};
use flowchat_core::{
    ChatEngine, ConfigOverrides, Conversation, ConversationKey, MessageRole, MessageType,
    SessionOutcome, StreamingState,
};

/// Flowchat - streaming client for the workflow generator
#[derive(Parser, Debug)]
#[command(name = "flowchat")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "FLOWCHAT_CONFIG", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// User id
    #[arg(short = 'u', long, env = "FLOWCHAT_USER", default_value = "local", global = true)]
    user: String,

    /// Backend base URL
    #[arg(long, value_name = "URL", global = true)]
    base_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "FLOWCHAT_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a message and stream the reply
    Send {
        /// Message text
        message: String,

        /// Conversation to continue (omit to start a new one)
        #[arg(long, value_name = "ID")]
        conversation: Option<String>,

        /// Workflow the message refers to
        #[arg(long, value_name = "ID")]
        workflow: Option<String>,

        /// Model override
        #[arg(short = 'm', long)]
        model: Option<String>,

        /// Sampling temperature override
        #[arg(short = 't', long)]
        temperature: Option<f32>,

        /// Seconds without data before giving up (0 waits forever)
        #[arg(long, value_name = "SECS")]
        idle_timeout: Option<u64>,

        /// Show reasoning text as it streams
        #[arg(long)]
        thinking: bool,

        /// Print the produced workflow as JSON
        #[arg(long)]
        print_workflow: bool,
    },

    /// Print the stored messages of a conversation
    History {
        /// Conversation id
        #[arg(long, value_name = "ID")]
        conversation: String,
    },
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("flowchat={level},flowchat_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn role_label(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "you",
        MessageRole::Assistant => "assistant",
        MessageRole::System => "system",
    }
}

fn print_transcript(conversation: &Conversation) {
    for message in &conversation.messages {
        let marker = if message.message_type == MessageType::Error {
            " (error)"
        } else {
            ""
        };
        println!("{}{marker}: {}", role_label(message.role), message.content);
    }
}

/// Renders streaming state as it grows
#[derive(Default)]
struct Renderer {
    show_thinking: bool,
    thinking_printed: usize,
    message_printed: usize,
    tools_printed: usize,
    last_progress: Option<String>,
}

impl Renderer {
    fn render(&mut self, state: &StreamingState) -> std::io::Result<()> {
        let mut err = std::io::stderr().lock();
        if state.progress_label.is_some() && state.progress_label != self.last_progress {
            if let Some(label) = &state.progress_label {
                writeln!(err, "… {label}")?;
            }
        }
        self.last_progress.clone_from(&state.progress_label);

        for tool in state.tools_started.iter().skip(self.tools_printed) {
            writeln!(err, "» {tool}")?;
        }
        self.tools_printed = state.tools_started.len();

        if self.show_thinking && state.thinking_text.len() > self.thinking_printed {
            write!(err, "{}", &state.thinking_text[self.thinking_printed..])?;
            self.thinking_printed = state.thinking_text.len();
        }

        // Streamed text only ever grows, so the old length is a char boundary
        let mut out = std::io::stdout().lock();
        if state.message_text.len() > self.message_printed {
            write!(out, "{}", &state.message_text[self.message_printed..])?;
            self.message_printed = state.message_text.len();
        }
        out.flush()
    }
}

async fn send(
    engine: &ChatEngine,
    message: String,
    conversation: Option<String>,
    workflow: Option<String>,
    show_thinking: bool,
    print_workflow: bool,
) -> Result<ExitCode> {
    let mut builder = engine.request(message);
    if let Some(id) = conversation {
        builder = builder.conversation(id);
    }
    if let Some(id) = workflow {
        builder = builder.workflow(id);
    }
    let request = builder.build();
    let key = request.key();

    let mut streaming = engine.streaming_state(&key);
    let artifact = engine.artifact(&key);
    let request_id = engine.start_turn(request)?;
    info!(conversation = %key, request_id = %request_id, "Turn started");

    let mut renderer = Renderer {
        show_thinking,
        ..Renderer::default()
    };

    loop {
        tokio::select! {
            changed = streaming.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = streaming.borrow_and_update().clone();
                renderer.render(&state).context("Failed to write output")?;
                if !state.is_streaming {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                engine.stop_turn(&key);
                eprintln!();
                warn!("Interrupted");
                return Ok(ExitCode::from(130));
            }
        }
    }
    println!();

    let outcome = engine.wait_turn(&key).await;
    if let Some(conversation) = engine.conversation_snapshot(&key) {
        println!("--- {key}");
        print_transcript(&conversation);
    }
    if print_workflow {
        if let Some(workflow) = artifact.borrow().as_ref() {
            println!("{}", serde_json::to_string_pretty(workflow)?);
        }
    }

    match outcome {
        Some(SessionOutcome::Completed) | None => Ok(ExitCode::SUCCESS),
        Some(SessionOutcome::Failed(detail)) => {
            warn!(error = %detail, "Turn failed");
            Ok(ExitCode::FAILURE)
        }
        Some(SessionOutcome::Cancelled) => Ok(ExitCode::FAILURE),
    }
}

async fn history(engine: &ChatEngine, conversation: String) -> Result<ExitCode> {
    let key = ConversationKey::conversation(conversation);
    let count = engine
        .refresh(&key)
        .await
        .with_context(|| format!("Failed to fetch {key}"))?;
    info!(conversation = %key, messages = count, "History fetched");

    if let Some(conversation) = engine.conversation_snapshot(&key) {
        print_transcript(&conversation);
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(config_path).context("Failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(url) = args.base_url.clone() {
        overrides = overrides.with_base_url(url);
    }
    if let Command::Send {
        model,
        temperature,
        idle_timeout,
        ..
    } = &args.command
    {
        if let Some(model) = model.clone() {
            overrides = overrides.with_model(model);
        }
        if let Some(temperature) = *temperature {
            overrides = overrides.with_temperature(temperature);
        }
        if let Some(secs) = *idle_timeout {
            overrides = overrides.with_idle_timeout_secs(secs);
        }
    }
    overrides.apply(&mut config);
    info!(source = ?config.source(), base_url = %config.base_url, "Configuration loaded");

    let engine = ChatEngine::from_config(args.user, &config).context("Failed to start engine")?;

    match args.command {
        Command::Send {
            message,
            conversation,
            workflow,
            thinking,
            print_workflow,
            ..
        } => send(&engine, message, conversation, workflow, thinking, print_workflow).await,
        Command::History { conversation } => history(&engine, conversation).await,
    }
}
