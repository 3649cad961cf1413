//! Immutable experiment descriptors

use super::{AttackKwargs, AttackMethod, BestMetric, Dataset, ModelType, PruneMethod};
use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Immutable description of one compression experiment.
///
/// Constructed by [`crate::config::Config::descriptors`], which merges the
/// config's `common_args` defaults with each per-experiment override map
/// (override wins on key collision) and validates the result. Construction is
/// pure: merging the same inputs twice yields value-equal descriptors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentDescriptor {
    /// Run-batch number; namespaces this run's on-disk state.
    pub experiment_number: u32,
    /// Architecture to train or load.
    pub model_type: ModelType,
    /// Dataset tag; must be compatible with `model_type`.
    pub dataset: Dataset,
    /// Pruning method, or `None` to skip pruning.
    pub prune_method: Option<PruneMethod>,
    /// Target ratio of original to pruned active parameter count (>= 1).
    pub prune_compression: f64,
    /// Fine-tuning epochs after pruning.
    pub finetune_epochs: u32,
    /// Quantization modulus, or `None` to skip quantization.
    pub quantization: Option<u32>,
    /// Path to a pretrained model; when set, training is skipped.
    pub model_path: Option<PathBuf>,
    /// Debug batch cap. When set, every training/fine-tuning stage runs
    /// exactly 1 epoch with at most this many batches.
    pub debug: Option<u32>,
    /// Keep the best epoch snapshot by this metric instead of the last one.
    pub best_model_metric: Option<BestMetric>,
    /// Adversarial attack to run against the final model.
    pub attack_method: Option<AttackMethod>,
    /// Scalars forwarded to the attack collaborator.
    pub attack_kwargs: AttackKwargs,
    /// Emit a notification event on every stage transition.
    pub email_verbose: bool,
    /// Keep only the most recent checkpoint for this experiment.
    pub save_one_checkpoint: bool,
    /// Seed for random pruning, data synthesis, and initialization.
    pub seed: u64,
}

impl ExperimentDescriptor {
    /// Validate cross-field invariants.
    ///
    /// Violations are configuration errors: they are raised before any
    /// execution begins and never at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.model_type.compatible_with(self.dataset) {
            return Err(ConfigError::IncompatibleModel {
                model: self.model_type,
                dataset: self.dataset,
            });
        }
        if self.prune_compression < 1.0 {
            return Err(ConfigError::InvalidCompression(self.prune_compression));
        }
        if self.prune_method.is_some() && self.finetune_epochs == 0 {
            return Err(ConfigError::FinetuneRequired {
                model: self.model_type,
            });
        }
        if self.debug == Some(0) {
            return Err(ConfigError::InvalidDebug);
        }
        Ok(())
    }

    /// Whether this experiment trains from scratch (no pretrained path).
    pub fn train_from_scratch(&self) -> bool {
        self.model_path.is_none()
    }

    /// Epoch count for a training/fine-tuning stage after the debug override.
    pub fn effective_epochs(&self, configured: u32) -> u32 {
        if self.debug.is_some() {
            1
        } else {
            configured
        }
    }

    /// Per-epoch batch cap, if debug mode is on.
    pub fn batch_cap(&self) -> Option<u32> {
        self.debug
    }

    /// Unique folder name for this experiment's variation.
    ///
    /// Encodes the architecture plus whichever of pruning, quantization, and
    /// fine-tuning apply, so different variations of one architecture never
    /// collide on disk.
    pub fn name(&self) -> String {
        let mut name = self.model_type.name().to_string();
        if let Some(q) = self.quantization {
            name.push_str(&format!("_{q}_quantization"));
        } else if let Some(method) = self.prune_method {
            name.push_str(&format!(
                "_{}_{}_compression",
                method,
                format_ratio(self.prune_compression)
            ));
        }
        if self.finetune_epochs > 0 && self.quantization.is_none() {
            name.push_str(&format!("_{}_finetune_iterations", self.finetune_epochs));
        }
        name
    }
}

/// Format a compression ratio without a trailing `.0` for whole numbers.
fn format_ratio(ratio: f64) -> String {
    if ratio.fract() == 0.0 {
        format!("{}", ratio as u64)
    } else {
        format!("{ratio}")
    }
}
