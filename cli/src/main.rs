// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # aghub
//!
//! Runs the hiring orchestrator on this node.
//!
//! ## Commands
//!
//! - `aghub daemon run|start|stop|status` - Run the engine or manage the background process
//! - `aghub config show|validate|generate` - Configuration management

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use aghub_orchestrator::commands::{self, ConfigCommand, DaemonCommand};
use aghub_orchestrator::logging::{init_logging, LogFormat};
use aghub_orchestrator_core::domain::node_config::OrchestratorConfigManifest;

/// aghub - hire agents, run them in containers, meter what they use
#[derive(Parser)]
#[command(name = "aghub")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "AGHUB_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to the config's
    #[arg(long, global = true, env = "AGHUB_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log output format; defaults to the config's
    #[arg(long, global = true, env = "AGHUB_LOG_FORMAT", value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run or manage the orchestrator daemon
    #[command(name = "daemon")]
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // Subscriber is not installed yet, so discovery runs silently here.
    let observability = OrchestratorConfigManifest::load_or_default(cli.config.clone())
        .map(|manifest| manifest.spec.observability)
        .unwrap_or_default();
    let level = cli.log_level.unwrap_or(observability.log_level);
    let format = cli
        .log_format
        .unwrap_or_else(|| LogFormat::parse(&observability.log_format));
    init_logging(&level, format)?;

    match cli.command {
        Some(Commands::Daemon { command }) => {
            commands::daemon::handle_command(command, cli.config).await
        }
        Some(Commands::Config { command }) => {
            commands::config::handle_command(command, cli.config).await
        }
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}
