use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use enclave::config::EnclaveConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "enclave")]
#[command(version, about = "Review-gated sandboxed execution of submitted code")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Path to enclave.toml (defaults to .enclave/enclave.toml)
    #[arg(short, long, global = true, env = "ENCLAVE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the controller: reviewer API plus worker callbacks
    Controller {
        /// Address to listen on, e.g. 0.0.0.0:8000
        #[arg(long)]
        bind: Option<String>,
        /// SQLite database path
        #[arg(long)]
        db: Option<PathBuf>,
        /// Base URL of the worker
        #[arg(long)]
        worker_url: Option<String>,
    },
    /// Run the worker: accept jobs, execute them in containers, report back
    Worker {
        #[arg(long)]
        bind: Option<String>,
        /// Base URL of the controller's callback endpoints
        #[arg(long)]
        controller_url: Option<String>,
        /// Jobs executed at the same time
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Create the job database and exit
    InitDb {
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration, secret redacted
    Show,
    /// Validate configuration and show errors and warnings
    Validate,
    /// Write a default enclave.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    enclave::logging::init(cli.verbose, cli.log_json);

    let config_path = cmd::config_path(cli.config.as_deref());

    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&config_path, command.clone());
    }

    let mut config = EnclaveConfig::resolve(Some(&config_path))?;

    match cli.command {
        Commands::Controller {
            bind,
            db,
            worker_url,
        } => {
            if let Some(bind) = bind {
                config.controller.bind = bind;
            }
            if let Some(db) = db {
                config.controller.db_path = db;
            }
            if let Some(url) = worker_url {
                config.controller.worker_url = url;
            }
            cmd::cmd_controller(config).await?;
        }
        Commands::Worker {
            bind,
            controller_url,
            concurrency,
        } => {
            if let Some(bind) = bind {
                config.worker.bind = bind;
            }
            if let Some(url) = controller_url {
                config.worker.controller_url = url;
            }
            if let Some(n) = concurrency {
                config.worker.concurrency = n;
            }
            cmd::cmd_worker(config).await?;
        }
        Commands::InitDb { db } => {
            let path = db.unwrap_or(config.controller.db_path);
            cmd::cmd_init_db(&path)?;
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}
