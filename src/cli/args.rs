//! CLI argument types - Cli, Command, and per-command argument structs

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Podar: batch orchestrator for compression experiments
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "podar")]
#[command(author = "PAIML")]
#[command(version)]
#[command(about = "Run batches of train/prune/finetune/quantize/attack experiments from YAML")]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// Available commands
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run every experiment in a YAML batch configuration
    Run(RunArgs),

    /// Validate a batch configuration without running it
    Validate(ValidateArgs),

    /// Display the experiments a configuration expands to
    Info(InfoArgs),
}

/// Arguments for the run command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct RunArgs {
    /// Path to YAML batch configuration file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Override the checkpoint root directory
    #[arg(short, long)]
    pub root: Option<PathBuf>,

    /// Data batch size
    #[arg(short, long)]
    pub batch_size: Option<usize>,

    /// Base seed for the model/data backend
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Validate and expand the configuration but don't run
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for the validate command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct ValidateArgs {
    /// Path to YAML batch configuration file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Show each expanded experiment
    #[arg(short, long)]
    pub detailed: bool,
}

/// Arguments for the info command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct InfoArgs {
    /// Path to YAML batch configuration file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Output format
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,
}

/// Output format for the info command
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
    Yaml,
}

/// Parse CLI arguments from a string slice (for testing)
pub fn parse_args<I, T>(args: I) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::try_parse_from(args)
}
