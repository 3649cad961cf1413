//! Podar CLI
//!
//! Batch experiment orchestration entry point for the podar library.
//!
//! # Usage
//!
//! ```bash
//! # Run a batch of experiments
//! podar run experiments.yaml
//!
//! # Run with a different checkpoint root
//! podar run experiments.yaml --root /data/experiments
//!
//! # Validate a batch config
//! podar validate experiments.yaml --detailed
//!
//! # Show the experiments a config expands to
//! podar info experiments.yaml --format json
//! ```

use clap::Parser;
use podar::cli::{run_command, Cli};
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run_command(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
