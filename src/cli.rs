//! Command-line interface

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::error;

use crate::config::Config;

#[derive(Parser)]
#[command(name = "voxline", version, about = "Multi-tenant telephony voice runtime")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Validate configuration and serve (the default)
    Serve,
    /// Validate configuration, print the resolved settings, and exit
    Check,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let config = load_config_or_exit();
            crate::server::start(Arc::new(config)).await
        }
        Command::Check => {
            let config = load_config_or_exit();
            println!("{}", config.describe());
            Ok(())
        }
    }
}

/// Load and validate; invalid configuration exits non-zero after logging
/// every failing key.
fn load_config_or_exit() -> Config {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            std::process::exit(2);
        }
    };
    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            error!("config: {problem}");
        }
        std::process::exit(2);
    }
    config
}
