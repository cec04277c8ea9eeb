//! Command-line interface definition for chatlink
//!
//! This module defines the CLI structure using clap's derive API.

use clap::{Parser, Subcommand};

/// chatlink - resilient live channel client
///
/// Connects to a backend over a persistent channel, keeps a session in
/// sync and streams execution progress.
#[derive(Parser, Debug, Clone)]
#[command(name = "chatlink")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/chatlink.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a prompt and print the paced execution stream
    Run {
        /// Prompt to execute
        #[arg(short, long)]
        prompt: String,

        /// Session to resume instead of the stored one
        #[arg(long, env = "CHATLINK_SESSION_ID")]
        session: Option<String>,
    },

    /// Connect and report the request round-trip time
    Ping,

    /// Inspect or reset the local session
    Session {
        /// Session subcommand
        #[command(subcommand)]
        command: SessionCommand,
    },
}

/// Session subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum SessionCommand {
    /// Show the stored session and its pending changes
    Show,

    /// Forget the stored session
    Reset {
        /// Discard changes that were never synced
        #[arg(long)]
        discard: bool,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_run() {
        let cli = Cli::try_parse_from(["chatlink", "run", "--prompt", "hello"]).unwrap();
        match cli.command {
            Commands::Run { prompt, .. } => assert_eq!(prompt, "hello"),
            other => panic!("Expected Run, got {other:?}"),
        }
        assert_eq!(cli.config.as_deref(), Some("config/chatlink.yaml"));
    }

    #[test]
    fn test_cli_parse_run_requires_prompt() {
        assert!(Cli::try_parse_from(["chatlink", "run"]).is_err());
    }

    #[test]
    fn test_cli_parse_ping_with_globals() {
        let cli = Cli::try_parse_from(["chatlink", "-v", "--config", "x.yaml", "ping"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config.as_deref(), Some("x.yaml"));
        assert!(matches!(cli.command, Commands::Ping));
    }

    #[test]
    fn test_cli_parse_session_reset() {
        let cli = Cli::try_parse_from(["chatlink", "session", "reset", "--discard"]).unwrap();
        match cli.command {
            Commands::Session {
                command: SessionCommand::Reset { discard },
            } => assert!(discard),
            other => panic!("Expected session reset, got {other:?}"),
        }

        let cli = Cli::try_parse_from(["chatlink", "session", "show"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Session {
                command: SessionCommand::Show
            }
        ));
    }
}
