//! hazkey-settings - command-line access to hazkey-server's configuration.
//!
//! Each subcommand performs one transaction against the running server
//! (starting it if needed) and reports the outcome through the exit status.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hazkey_settings::ipc::{ConnectorConfig, NoopLauncher, ServerConnector};
use hazkey_settings::models::CurrentConfig;

#[derive(Debug, Parser)]
#[command(name = "hazkey-settings", version, about = "Inspect and edit hazkey-server settings")]
struct Cli {
    /// Socket path (defaults to $XDG_RUNTIME_DIR/hazkey-server.<uid>.sock)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Do not start hazkey-server when it is not running
    #[arg(long, global = true)]
    no_spawn: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the current configuration as JSON
    GetConfig,
    /// Send the profiles from a configuration JSON file
    SetConfig {
        /// Path to a configuration file as printed by `get-config`
        file: PathBuf,
    },
    /// Delete learned conversion history of a profile
    ClearHistory {
        profile_id: String,
    },
    /// Reload the Zenzai model and print the refreshed configuration
    ReloadModel,
}

fn build_connector(cli: &Cli) -> ServerConnector {
    let config = ConnectorConfig {
        socket_path: cli.socket.clone(),
        ..ConnectorConfig::default()
    };
    if cli.no_spawn {
        ServerConnector::with_launcher(config, NoopLauncher)
    } else {
        ServerConnector::new(config)
    }
}

fn run(cli: Cli) -> Result<()> {
    let server = build_connector(&cli);
    tracing::debug!("Using socket {}", server.socket_path().display());

    match &cli.command {
        Command::GetConfig => {
            let config = server
                .get_config()
                .context("Failed to load configuration from server")?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::SetConfig { file } => {
            let text = std::fs::read_to_string(file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let config: CurrentConfig = serde_json::from_str(&text)
                .with_context(|| format!("Invalid configuration in {}", file.display()))?;
            if !server.set_current_config(&config) {
                bail!("Server rejected the configuration");
            }
            tracing::info!("Sent {} profiles", config.profiles.len());
        }
        Command::ClearHistory { profile_id } => {
            if !server.clear_all_history(profile_id) {
                bail!("Failed to clear history for profile {}", profile_id);
            }
            tracing::info!("Cleared history for profile {}", profile_id);
        }
        Command::ReloadModel => {
            if !server.begin_session() {
                bail!("Failed to connect to server");
            }
            let reloaded = server.reload_zenzai_model_in_session();
            let config = server.get_config_in_session();
            server.end_session();

            if !reloaded {
                bail!("Server failed to reload the Zenzai model");
            }
            if let Some(config) = config {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "hazkey_settings=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
