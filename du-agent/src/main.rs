//! Operator CLI for the device update agent.
//!
//! Inspects the agent configuration and the snapshot persisted across a reboot.
//! It never connects to the cloud.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use du_agent::exit_codes;
use du_agent::io::config::{AgentConfig, load_config};
use du_agent::io::persistence::{FileSnapshotStore, SnapshotStore};
use du_agent::logging;
use tracing::debug;

const DEFAULT_CONFIG_PATH: &str = "/etc/du-agent/du-agent.toml";

#[derive(Parser)]
#[command(name = "du-agent", version, about = "Device update agent tools")]
struct Cli {
    /// Agent configuration file (TOML). Missing file means defaults.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the effective, validated configuration.
    Config,
    /// Print the persisted reboot/restart snapshot, if any.
    Snapshot {
        /// Remove the snapshot after printing it.
        #[arg(long)]
        clear: bool,
    },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;
    debug!(config = %cli.config.display(), "configuration loaded");
    match cli.command {
        Command::Config => cmd_config(&cfg),
        Command::Snapshot { clear } => cmd_snapshot(&cfg, clear),
    }
}

fn cmd_config(cfg: &AgentConfig) -> Result<i32> {
    let rendered = toml::to_string_pretty(cfg).context("serialize config toml")?;
    print!("{rendered}");
    Ok(exit_codes::OK)
}

fn cmd_snapshot(cfg: &AgentConfig, clear: bool) -> Result<i32> {
    let store = FileSnapshotStore::new(&cfg.snapshot_path);
    let Some(snapshot) = store.load()? else {
        eprintln!("no snapshot at {}", store.path().display());
        return Ok(exit_codes::NO_SNAPSHOT);
    };
    let rendered = serde_json::to_string_pretty(&snapshot).context("serialize snapshot")?;
    println!("{rendered}");
    if clear {
        store.clear()?;
        eprintln!("removed {}", store.path().display());
    }
    Ok(exit_codes::OK)
}
