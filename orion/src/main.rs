//! Multi-agent autonomous supervision loop.
//!
//! `orion run` drives the configured instances and the guardian supervisor
//! until interrupted. `status` and `commands` read the persisted state
//! directory without starting anything.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use orion::control::{Adapters, Runtime};
use orion::core::types::Command as QueuedCommand;
use orion::exit_codes;
use orion::hub::InstanceSnapshot;
use orion::io::config::{CONFIG_FILE, OrionConfig, load_config, write_config};
use orion::io::sink::TracingSink;
use orion::io::store::{JsonFileStore, StateStore};
use orion::logging;

#[derive(Parser)]
#[command(name = "orion", version, about = "Multi-agent autonomous supervision loop")]
struct Cli {
    /// Path to the config file. `state_dir` resolves relative to its directory.
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default `orion.toml` and create the state directory.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Load and validate the config.
    Validate,
    /// Run instance loops and the supervisor until ctrl-c.
    Run,
    /// Print persisted instance state and pending decisions as JSON.
    Status,
    /// Print the most recent commands from the audit log, one JSON object per line.
    Commands {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

/// An error paired with the exit code it maps to.
struct Failure {
    code: i32,
    err: anyhow::Error,
}

impl Failure {
    fn invalid(err: anyhow::Error) -> Self {
        Self {
            code: exit_codes::INVALID,
            err,
        }
    }
}

impl From<anyhow::Error> for Failure {
    fn from(err: anyhow::Error) -> Self {
        Self {
            code: exit_codes::FAILURE,
            err,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => exit_codes::OK,
        Err(failure) => {
            eprintln!("{:#}", failure.err);
            failure.code
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), Failure> {
    match cli.command {
        Command::Run => logging::init_with_default("orion=info"),
        _ => logging::init(),
    }
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force).map_err(Failure::invalid),
        Command::Validate => {
            load_config(&cli.config).map_err(Failure::invalid)?;
            println!("ok");
            Ok(())
        }
        Command::Run => {
            let config = load_config(&cli.config).map_err(Failure::invalid)?;
            cmd_run(&cli.config, &config).await?;
            Ok(())
        }
        Command::Status => {
            let config = load_config(&cli.config).map_err(Failure::invalid)?;
            cmd_status(&open_store(&cli.config, &config))?;
            Ok(())
        }
        Command::Commands { limit } => {
            let config = load_config(&cli.config).map_err(Failure::invalid)?;
            cmd_commands(&open_store(&cli.config, &config), limit)?;
            Ok(())
        }
    }
}

fn config_root(config_path: &Path) -> &Path {
    config_path.parent().unwrap_or(Path::new("."))
}

fn open_store(config_path: &Path, config: &OrionConfig) -> JsonFileStore {
    JsonFileStore::new(config.state_dir_in(config_root(config_path)))
}

fn cmd_init(config_path: &Path, force: bool) -> Result<()> {
    let config = if force || !config_path.exists() {
        let config = OrionConfig::default();
        write_config(config_path, &config)?;
        config
    } else {
        load_config(config_path)?
    };
    let state_dir = config.state_dir_in(config_root(config_path));
    fs::create_dir_all(&state_dir)
        .with_context(|| format!("create state directory {}", state_dir.display()))?;
    println!("{}", config_path.display());
    Ok(())
}

async fn cmd_run(config_path: &Path, config: &OrionConfig) -> Result<()> {
    let store = Arc::new(open_store(config_path, config));
    let adapters = Adapters::from_config(config, Arc::new(TracingSink))?;
    let runtime = Runtime::build(config, store, adapters)?;
    runtime.start()?;
    let signal = tokio::signal::ctrl_c().await.context("listen for ctrl-c");
    runtime.shutdown().await;
    signal
}

#[derive(Serialize)]
struct StatusReport {
    instances: Vec<InstanceSnapshot>,
    pending_decisions: Vec<QueuedCommand>,
}

fn cmd_status(store: &dyn StateStore) -> Result<()> {
    let instances = store.load_instances().context("load instances")?;
    let pending_decisions = store
        .load_commands()
        .context("load command audit log")?
        .into_iter()
        .filter(QueuedCommand::is_pending_decision)
        .collect();
    let report = StatusReport {
        instances,
        pending_decisions,
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serialize status")?
    );
    Ok(())
}

fn cmd_commands(store: &dyn StateStore, limit: usize) -> Result<()> {
    let commands = store.load_commands().context("load command audit log")?;
    let skip = commands.len().saturating_sub(limit);
    for command in &commands[skip..] {
        println!(
            "{}",
            serde_json::to_string(command).context("serialize command")?
        );
    }
    Ok(())
}
