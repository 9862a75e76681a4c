//! OWR CLI: run class-incremental experiments from the terminal.
//!
//! Trains LwF, iCaRL (nearest-mean or SVM head) or a snapshot ensemble on the
//! configured data source, writes the per-group logs to disk and reports on
//! them afterwards.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// OWR: class-incremental learning without forgetting
#[derive(Parser, Debug)]
#[command(name = "owr", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path (takes precedence over every other source)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Train a group-sequential learner
    Train {
        /// Learner to run
        #[arg(value_enum, default_value_t = Strategy::Icarl)]
        strategy: Strategy,

        /// Select exemplars at random, overriding the configured strategy
        #[arg(long)]
        random: bool,

        /// Test with the network's own outputs instead of the configured head
        #[arg(long)]
        no_classify: bool,

        /// Epochs per group
        #[arg(short, long)]
        epochs: Option<usize>,
    },
    /// Train a snapshot ensemble over every group
    Snapshot {
        /// Epochs per group (a multiple of the ensemble size)
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Number of snapshots per group
        #[arg(short, long)]
        n_estimators: Option<usize>,
    },
    /// Show the last run's logs and its best (or a chosen) checkpoint
    Report {
        /// Checkpoint id to show instead of the best one
        #[arg(long)]
        checkpoint: Option<String>,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Strategy {
    /// Learning without Forgetting (no exemplars)
    Lwf,
    /// iCaRL with the configured head
    Icarl,
    /// iCaRL tested with a grid-searched SVM
    Svm,
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create default configuration file
    Init,
    /// Show the resolved configuration
    Show,
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "owr", "owr")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "owr.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace, cli.config.as_deref())
}
