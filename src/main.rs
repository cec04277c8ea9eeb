//! chatlink - resilient live channel client
//!
#![doc = "Main entry point for the chatlink command-line client."]

use anyhow::Result;

use chatlink::cli::{Cli, Commands, SessionCommand};
use chatlink::commands;
use chatlink::config::Config;
use chatlink::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    let config_path = cli.config.as_deref().unwrap_or("config/chatlink.yaml");
    let mut config = Config::load(config_path)?;
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    config.validate()?;

    init_logging(&config.logging)?;

    match cli.command {
        Commands::Run { prompt, session } => {
            tracing::info!("Running prompt");
            commands::run::run_prompt(config, prompt, session).await
        }
        Commands::Ping => commands::ping::ping(config).await,
        Commands::Session { command } => match command {
            SessionCommand::Show => commands::session::show(&config),
            SessionCommand::Reset { discard } => commands::session::reset(&config, discard),
        },
    }
}
