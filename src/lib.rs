//! Podar — batch orchestrator for neural-network compression experiments
//!
//! Podar consumes a declarative YAML experiment list and drives each entry
//! through a multi-stage pipeline on a single device:
//!
//! 1. **Train** (or load a pretrained model)
//! 2. **Prune** to a target compression ratio
//! 3. **Fine-tune** to recover accuracy
//! 4. **Quantize** (optional)
//! 5. **Attack** with a bounded adversarial perturbation
//!
//! State is checkpointed between stages so a restarted orchestrator resumes
//! from the last completed stage instead of repeating prior work. One failing
//! experiment never halts the batch; resource exhaustion does.
//!
//! # Example
//!
//! ```no_run
//! use podar::backend::Collaborators;
//! use podar::config::Config;
//! use podar::notify::Notifier;
//! use podar::runner::{Runner, RunnerOptions};
//!
//! let config = Config::from_path("experiments.yaml").unwrap();
//! let descriptors = config.descriptors().unwrap();
//!
//! let options = RunnerOptions::new("experiments");
//! let notifier = Notifier::from_email_config(&config.email);
//! let mut runner = Runner::new(options, Collaborators::reference(42), notifier);
//!
//! let results = runner.run(&descriptors).unwrap();
//! for result in &results {
//!     println!("{}: {:?}", result.descriptor, result.status);
//! }
//! ```

pub mod backend;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod experiment;
pub mod notify;
pub mod runner;
pub mod stage;

use thiserror::Error;

pub use config::Config;
pub use experiment::{Dataset, ExperimentDescriptor, ModelType, PruneMethod};
pub use runner::{RunResult, RunStatus, Runner, RunnerOptions};

/// Top-level error for orchestrator operations.
///
/// Stage-level failures are *not* represented here: they are isolated to a
/// single descriptor and reported through [`runner::RunStatus::Failed`].
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration, raised before any execution begins.
    #[error("configuration: {0}")]
    Config(#[from] config::ConfigError),

    /// Checkpoint persistence failure.
    #[error("checkpoint: {0}")]
    Checkpoint(#[from] checkpoint::CheckpointError),

    /// Device memory or disk exhaustion, escalated to the batch level.
    #[error("resource exhaustion: {0}")]
    Resource(#[from] runner::ResourceError),

    /// The batch halted partway; the results produced so far are preserved.
    #[error("batch aborted after {} result(s): {cause}", results.len())]
    Aborted {
        /// Per-descriptor records produced before the abort.
        results: Vec<runner::RunResult>,
        /// The resource failure that halted the batch.
        cause: runner::ResourceError,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, Error>;
