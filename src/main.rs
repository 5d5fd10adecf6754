//! Turnstile CLI binary entry point.

use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use turnstile::cli::{render_update, Cli, ReplCommand, HELP};
use turnstile::config::TurnstileConfig;
use turnstile::model::{ScriptedModel, ScriptedStep};
use turnstile::run::{DriverEnv, InterruptMode, QueuedMessage, RunUpdate};
use turnstile::session::RunCoordinator;
use turnstile::tools::{builtin, ToolRegistry};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &cli.config {
        Some(path) => {
            let mut config = TurnstileConfig::from_file(path)?;
            config.apply_env()?;
            config
        }
        None => TurnstileConfig::load()?,
    };

    let model = match &cli.script {
        Some(path) => ScriptedModel::from_file(path)?,
        None => ScriptedModel::new([
            ScriptedStep::tool("shell", serde_json::json!({ "command": "ls" }))
                .with_reasoning("Looking around first"),
            ScriptedStep::say("That's the current directory."),
        ]),
    };

    let sink = Arc::new(|update: RunUpdate| {
        if let Some(line) = render_update(&update) {
            println!("{line}");
        }
    });
    let mut env = DriverEnv::new(Arc::new(model))
        .with_tools(ToolRegistry::new(builtin::all_tools(&config)))
        .with_config(config)
        .with_sink(sink);
    if let Some(system) = cli.system {
        env = env.with_system_prompt(system);
    }
    let coordinator = RunCoordinator::new(env);
    let conversation = cli.conversation.as_str();

    eprintln!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut counter = 0usize;
    while let Some(line) = lines.next_line().await? {
        counter += 1;
        let message_id = format!("msg-{counter}");
        let outcome = match ReplCommand::parse(&line) {
            ReplCommand::Empty => continue,
            ReplCommand::Say(text) => coordinator.submit(conversation, message_id, text).await,
            ReplCommand::Soft(text) => {
                coordinator
                    .interrupt(
                        conversation,
                        InterruptMode::Soft,
                        Some(QueuedMessage::new(message_id, text)),
                    )
                    .await
            }
            ReplCommand::Stop => {
                coordinator
                    .interrupt(conversation, InterruptMode::Hard, None)
                    .await
            }
            ReplCommand::Approve { id, note } => {
                let resolved = coordinator
                    .resolve_confirmation(conversation, id, true, note)
                    .await?;
                if !resolved {
                    eprintln!("no such pending confirmation");
                }
                continue;
            }
            ReplCommand::Deny { id, reason } => {
                let resolved = coordinator
                    .resolve_confirmation(conversation, id, false, reason)
                    .await?;
                if !resolved {
                    eprintln!("no such pending confirmation");
                }
                continue;
            }
            ReplCommand::Reset => coordinator.reset(conversation).await,
            ReplCommand::Status => {
                match coordinator.snapshot(conversation).await {
                    Some(snapshot) => eprintln!(
                        "{} (step {}, {} backlog, {} messages)",
                        snapshot.state.label(),
                        snapshot.step,
                        snapshot.backlog.len(),
                        snapshot.transcript_len
                    ),
                    None => eprintln!("idle"),
                }
                continue;
            }
            ReplCommand::Help => {
                eprintln!("{HELP}");
                continue;
            }
            ReplCommand::Unknown(input) => {
                eprintln!("unknown command: {input} (try /help)");
                continue;
            }
            ReplCommand::Quit => break,
        };
        let dispatch = outcome?;
        tracing::debug!(?dispatch, "command dispatched");
    }

    coordinator.shutdown_all().await;
    Ok(())
}
