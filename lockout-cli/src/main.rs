use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;
use lockout_service::config::Config;
use lockout_service::observability::init_tracing;

mod commands;

/// lockout - login lockout service
#[derive(Parser)]
#[command(name = "lockout")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file (defaults to /etc/lockout-service/config.toml and ./config.toml)
    #[arg(long, short, global = true, env = "LOCKOUT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve login and status requests over HTTP
    Serve,
    /// Apply lockout events from the event channel to the account store
    Reconcile,
    /// Create the database schema and event streams
    Migrate,
    /// Print the durable and cached lockout state of an identity
    Status {
        /// Identity to inspect
        identity: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = run(cli).await;

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);

            for cause in e.chain().skip(1) {
                eprintln!("\n{} {}", "Caused by:".yellow(), cause);
            }

            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    init_tracing(&config)?;

    match cli.command {
        Commands::Serve => commands::serve::execute(config).await,
        Commands::Reconcile => commands::reconcile::execute(config).await,
        Commands::Migrate => commands::migrate::execute(config).await,
        Commands::Status { identity } => commands::status::execute(config, &identity).await,
    }
}
