mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "batchflow",
    version,
    about = "Record pipeline engine: validate and run step-graph pipelines"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline definition
    Run {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Preview mode: skip side-effecting loaders, print samples
        #[arg(long)]
        dry_run: bool,
        /// Per-step record cap for --dry-run
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Validate a pipeline definition without executing it
    Validate {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Treat stray route-branch references as errors
        #[arg(long)]
        strict: bool,
    },
    /// List registered adapters
    Adapters,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Run {
            pipeline,
            dry_run,
            limit,
        } => commands::run::execute(&pipeline, dry_run, limit).await,
        Commands::Validate { pipeline, strict } => commands::validate::execute(&pipeline, strict),
        Commands::Adapters => commands::adapters::execute(),
    }
}
