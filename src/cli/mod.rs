//! Interactive terminal front end for a single conversation.

use std::path::PathBuf;

use clap::Parser;

use crate::run::events::{RunUpdate, RunUpdatePayload};

/// Turnstile: drive a scripted agent conversation from the terminal.
#[derive(Parser, Debug)]
#[command(name = "turnstile", version, about = "Turnstile: interruptible agent runs")]
pub struct Cli {
    /// TOML script of `[[step]]` decisions for the scripted model
    #[arg(short, long)]
    pub script: Option<PathBuf>,

    /// Config file (overrides $TURNSTILE_CONFIG and the default location)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// System prompt prepended to the transcript
    #[arg(long)]
    pub system: Option<String>,

    /// Conversation id
    #[arg(long, default_value = "cli")]
    pub conversation: String,
}

/// One line of REPL input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    /// Plain text: start a run or queue behind the active one.
    Say(String),
    /// `/soft <message>`
    Soft(String),
    /// `/stop`
    Stop,
    /// `/yes <id> [note]`
    Approve { id: String, note: Option<String> },
    /// `/no <id> [reason]`
    Deny { id: String, reason: Option<String> },
    /// `/reset`
    Reset,
    /// `/status`
    Status,
    /// `/quit`
    Quit,
    Help,
    Empty,
    Unknown(String),
}

impl ReplCommand {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Self::Say(line.to_string());
        };

        let (command, args) = match rest.split_once(char::is_whitespace) {
            Some((command, args)) => (command, args.trim()),
            None => (rest, ""),
        };
        match command {
            "stop" => Self::Stop,
            "soft" if !args.is_empty() => Self::Soft(args.to_string()),
            "yes" | "no" if !args.is_empty() => {
                let (id, text) = match args.split_once(char::is_whitespace) {
                    Some((id, text)) => (id.to_string(), Some(text.trim().to_string())),
                    None => (args.to_string(), None),
                };
                if command == "yes" {
                    Self::Approve { id, note: text }
                } else {
                    Self::Deny { id, reason: text }
                }
            }
            "reset" => Self::Reset,
            "status" => Self::Status,
            "quit" | "exit" => Self::Quit,
            "help" => Self::Help,
            _ => Self::Unknown(line.to_string()),
        }
    }
}

pub const HELP: &str = "\
commands:
  <text>               start a run, or queue behind the active one
  /soft <text>         queue <text> and stop after the current step
  /stop                hard stop the active run
  /yes <id> [note]     approve a pending confirmation
  /no <id> [reason]    deny a pending confirmation
  /reset               cancel everything and return to idle
  /status              show the run state
  /quit                exit";

/// Terminal rendering of an update, or `None` to stay quiet.
pub fn render_update(update: &RunUpdate) -> Option<String> {
    let line = match &update.payload {
        RunUpdatePayload::RunStarted { client_message_id } => {
            format!("▶ run started ({client_message_id})")
        }
        RunUpdatePayload::StepStarted { .. } => return None,
        RunUpdatePayload::AssistantText { text } => text.clone(),
        RunUpdatePayload::Reasoning { text } => format!("  … {text}"),
        RunUpdatePayload::ToolStarted { tool_name, args, .. } => {
            format!("⚡ {tool_name} {args}")
        }
        RunUpdatePayload::ToolFinished {
            output, is_error, ..
        } => {
            let output = crate::util::truncate_utf8(output, 200);
            if *is_error {
                format!("  ❌ {output}")
            } else {
                format!("  ✅ {output}")
            }
        }
        RunUpdatePayload::ConfirmationRequested { request } => format!(
            "? {} wants to {} {}\n  /yes {} or /no {}",
            request.tool_name, request.action, request.target, request.id, request.id
        ),
        RunUpdatePayload::ConfirmationResolved { approved, .. } => {
            format!("  confirmation {}", if *approved { "approved" } else { "denied" })
        }
        RunUpdatePayload::StopRequested { mode } => format!("■ {mode} stop requested"),
        RunUpdatePayload::RunStopped { reason, queued } => {
            format!("■ run stopped: {reason} ({queued} queued)")
        }
        RunUpdatePayload::RunCompleted => "✓ run completed".to_string(),
        RunUpdatePayload::RunError { error } => format!("❌ {error}"),
        RunUpdatePayload::QueueDiscarded { count } => format!("  discarded {count} queued"),
        RunUpdatePayload::Reset => "↺ reset".to_string(),
    };
    Some(line)
}
