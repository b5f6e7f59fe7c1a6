//! CLI surface.
//!
//! `clawdbot` with no subcommand starts the gateway. The rest are small
//! operator conveniences. Exit codes: success 0, validation error 1,
//! timeout 124.

use clap::{Parser, Subcommand};
use std::time::Duration;

use crate::config;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_VALIDATION: i32 = 1;
pub const EXIT_TIMEOUT: i32 = 124;

#[derive(Debug, Parser)]
#[command(name = "clawdbot", version, about = "Multi-channel chatbot gateway")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the gateway (default).
    Start,
    /// Check whether a gateway is reachable.
    Status {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long)]
        port: Option<u16>,
        /// Connect timeout in milliseconds.
        #[arg(long, default_value_t = 3_000)]
        timeout_ms: u64,
    },
    /// Configuration helpers.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the parsed config.
    Show,
    /// Print one config value by dotted key.
    Get { key: String },
    /// Print the config file path.
    Path,
}

pub fn handle_config_show() -> Result<(), String> {
    let cfg = config::load_config().map_err(|e| e.to_string())?;
    println!(
        "{}",
        serde_json::to_string_pretty(&cfg).map_err(|e| e.to_string())?
    );
    Ok(())
}

pub fn handle_config_get(key: &str) -> Result<(), String> {
    let cfg = config::load_config().map_err(|e| e.to_string())?;
    match config::get_path(&cfg, key) {
        Some(value) => {
            println!("{value}");
            Ok(())
        }
        None => Err(format!("config key not found: {key}")),
    }
}

pub fn handle_config_path() {
    println!("{}", config::config_path().display());
}

pub fn handle_version() {
    println!("clawdbot {}", env!("CARGO_PKG_VERSION"));
}

/// Probe the gateway port. Exit code 124 when the connect times out.
pub async fn handle_status(host: &str, port: u16, timeout_ms: u64) -> i32 {
    let addr = format!("{host}:{port}");
    match tokio::time::timeout(
        Duration::from_millis(timeout_ms),
        tokio::net::TcpStream::connect(&addr),
    )
    .await
    {
        Ok(Ok(_)) => {
            println!("gateway reachable at {addr}");
            EXIT_SUCCESS
        }
        Ok(Err(err)) => {
            eprintln!("gateway unreachable at {addr}: {err}");
            EXIT_VALIDATION
        }
        Err(_) => {
            eprintln!("connect to {addr} timed out after {timeout_ms} ms");
            EXIT_TIMEOUT
        }
    }
}

// ---------------------------------------------------------------------------
// Chat input handling
// ---------------------------------------------------------------------------

/// Where one line of chat input goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitAction {
    /// Empty or whitespace-only input; nothing happens.
    Noop,
    /// A `/command` for the local command handler.
    Command(String),
    /// A message for the gateway.
    Message(String),
}

/// Input line handling for the interactive chat prompt.
#[derive(Debug, Default)]
pub struct ChatInput {
    history: Vec<String>,
}

impl ChatInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit one line: trim it, record non-empty input in history, and
    /// route `/`-prefixed lines to the command handler.
    pub fn submit(&mut self, input: &str) -> SubmitAction {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return SubmitAction::Noop;
        }
        self.history.push(trimmed.to_string());
        if trimmed.starts_with('/') {
            SubmitAction::Command(trimmed.to_string())
        } else {
            SubmitAction::Message(trimmed.to_string())
        }
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_trims_and_records_history() {
        let mut input = ChatInput::new();
        let action = input.submit("   hi   ");
        assert_eq!(action, SubmitAction::Message("hi".to_string()));
        assert_eq!(input.history(), &["hi".to_string()]);
    }

    #[test]
    fn test_submit_whitespace_is_noop() {
        let mut input = ChatInput::new();
        assert_eq!(input.submit(""), SubmitAction::Noop);
        assert_eq!(input.submit("    "), SubmitAction::Noop);
        assert_eq!(input.submit("\t\n"), SubmitAction::Noop);
        assert!(input.history().is_empty());
    }

    #[test]
    fn test_submit_routes_slash_to_command_handler() {
        let mut input = ChatInput::new();
        assert_eq!(
            input.submit("/new"),
            SubmitAction::Command("/new".to_string())
        );
        assert_eq!(
            input.submit("  /help  "),
            SubmitAction::Command("/help".to_string())
        );
        assert_eq!(
            input.submit("hello world"),
            SubmitAction::Message("hello world".to_string())
        );
        assert_eq!(input.history().len(), 3);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(EXIT_SUCCESS, 0);
        assert_eq!(EXIT_VALIDATION, 1);
        assert_eq!(EXIT_TIMEOUT, 124);
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["clawdbot", "status", "--port", "4242"]).unwrap();
        match cli.command {
            Some(Command::Status { port, .. }) => assert_eq!(port, Some(4242)),
            other => panic!("unexpected command: {other:?}"),
        }

        let cli = Cli::try_parse_from(["clawdbot"]).unwrap();
        assert!(cli.command.is_none());
    }
}
