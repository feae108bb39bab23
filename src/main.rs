//! # access-csv CLI
//!
//! ## Usage
//!
//! ```bash
//! access-csv --config ./config/access-csv.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `access-csv init` | Create the registry database and schema |
//! | `access-csv run` | Tail the log, write CSV, serve downloads (one process) |
//! | `access-csv watch` | Tail the log and relay new lines to collectors |
//! | `access-csv collect` | Receive relayed lines, write CSV, serve downloads |
//! | `access-csv files [date]` | List registered day files |
//! | `access-csv parse "<line>"` | Show the CSV row a log line produces |

use access_csv::{config, inspect, logging, migrate, runner};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

/// Turns an Apache access log into day-partitioned CSV files.
///
/// All commands except `parse` read a TOML configuration file given by
/// `--config`. See `config/access-csv.example.toml`.
#[derive(Parser)]
#[command(
    name = "access-csv",
    about = "Turns an Apache access log into day-partitioned CSV files and serves them over HTTP",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/access-csv.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the registry database.
    ///
    /// Idempotent: running it again keeps existing entries.
    Init,

    /// Tail the access log and write CSV in this process.
    ///
    /// Also serves the download API on `[server].bind`.
    Run,

    /// Tail the access log and relay new lines to collectors.
    ///
    /// Collectors subscribe over WebSocket at `[relay].bind`.
    Watch,

    /// Subscribe to a watcher and write CSV for every relayed line.
    ///
    /// Connects to `[relay].url` and serves the download API on `[server].bind`.
    Collect,

    /// List registered day files.
    Files {
        /// Show only this day (`yyyy-MM-dd`).
        date: Option<String>,
    },

    /// Print the CSV row a raw log line would produce.
    Parse {
        /// One access-log line.
        line: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            if let Some(startup) = err.downcast_ref::<runner::StartupError>() {
                error!("{}", startup);
                return ExitCode::from(u8::try_from(startup.exit_code()).unwrap_or(1));
            }
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    // Commands that don't require config
    if let Commands::Parse { line } = &cli.command {
        let matched = inspect::run_parse(line);
        return Ok(if matched {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Registry initialized at {}", cfg.db.path.display());
        }
        Commands::Run => runner::run_monolithic(&cfg).await?,
        Commands::Watch => runner::run_watcher(&cfg).await?,
        Commands::Collect => runner::run_collector(&cfg).await?,
        Commands::Files { date } => {
            if !inspect::run_files(&cfg, date.as_deref()).await? {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Parse { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(ExitCode::SUCCESS)
}
