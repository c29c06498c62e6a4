//! qvisor - runs QEMU virtual machines under out-of-process executors
//!
//! The agent side (`run`, `attach`, `kill`, `agent`, ...) keeps a handle
//! store so VMs survive agent restarts. The hidden `executor` subcommand is
//! the process that actually owns a VM.

mod app;
mod commands;
mod config;
mod executor;
mod logging;
mod task_file;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::app::App;
use crate::config::{AgentArgs, AgentConfig};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "qvisor")]
#[command(about = "Supervise QEMU virtual machines that outlive their agent", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    agent: AgentArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a VM from a TOML task file and follow it
    Run {
        /// Task file
        task: PathBuf,

        /// Task directory (default: <state-dir>/<task name>)
        #[arg(long)]
        task_dir: Option<PathBuf>,

        /// Return once the VM is running
        #[arg(short, long)]
        detach: bool,
    },

    /// Reattach to a running VM and follow it until it exits
    Attach {
        /// Task name
        name: String,
    },

    /// Stop a running VM, escalating to a forced kill after the timeout
    Kill {
        /// Task name
        name: String,

        /// Override the task's kill timeout
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Show recorded tasks
    List,

    /// Drop the record of a finished task
    Forget {
        /// Task name
        name: String,
    },

    /// Reattach to every running VM and supervise them
    Agent,

    /// Detect the local QEMU installation
    Fingerprint,

    /// Executor process (started by the agent)
    #[command(hide = true)]
    Executor {
        #[arg(long)]
        log_file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout belongs to the handshake; the executor sets up its own file log
    if let Commands::Executor { log_file } = &cli.command {
        return executor::run(log_file).await;
    }

    logging::init(cli.agent.log_format)?;
    info!("qvisor v{}", VERSION);

    if let Commands::Fingerprint = cli.command {
        return commands::fingerprint().await;
    }

    let app = App::init(AgentConfig::from_args(&cli.agent)).await?;

    match cli.command {
        Commands::Run {
            task,
            task_dir,
            detach,
        } => commands::run(&app, &task, task_dir, detach).await,
        Commands::Attach { name } => commands::attach(&app, &name).await,
        Commands::Kill { name, timeout_ms } => commands::kill(&app, &name, timeout_ms).await,
        Commands::List => commands::list(&app).await,
        Commands::Forget { name } => commands::forget(&app, &name).await,
        Commands::Agent => commands::agent(&app).await,
        Commands::Fingerprint | Commands::Executor { .. } => Ok(()),
    }
}
