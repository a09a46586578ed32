//! Trainforge CLI: train, evaluate and inspect models from the terminal.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Trainforge: training, evaluation and checkpoint selection for tabular models
#[derive(Parser, Debug)]
#[command(name = "trainforge", version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML, or JSON when it ends in .json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured output directory
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Train a model, checkpointing every epoch or only on improvement
    Train {
        /// Training dataset (JSON)
        #[arg(long)]
        train: PathBuf,
        /// Validation dataset (JSON)
        #[arg(long)]
        val: Option<PathBuf>,
        /// Checkpoint to resume or fine-tune from
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },
    /// Score a checkpoint with the configured test metrics
    Eval {
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },
    /// Write per-sample predictions as JSON
    Predict {
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        /// Destination file; printed to stdout when omitted
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Find a per-target decision threshold for classification models
    FindThreshold {
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },
    /// Run a learning-rate range search
    FindLr {
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },
    /// Evaluate every checkpoint in the output directory
    Sweep {
        #[arg(long)]
        data: PathBuf,
    },
    /// Pick the checkpoint that wins most per-target comparisons
    SelectBest {
        #[arg(long)]
        data: PathBuf,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default configuration file
    Init {
        #[arg(default_value = "trainforge.toml")]
        path: PathBuf,
    },
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

    // Human-readable layer for stderr; RUST_LOG takes precedence over -v
    let stderr_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(stderr_filter);

    // JSON file layer next to the run's checkpoints
    let log_dir = commands::log_dir(cli.config.as_deref(), cli.output.as_deref());
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "trainforge.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    tracing::debug!(command = ?cli.command, "Starting trainforge");
    commands::handle_command(cli.command, cli.config.as_deref(), cli.output, cli.quiet)
}
