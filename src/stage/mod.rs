//! Pipeline stage executors
//!
//! One executor per pipeline stage: Train (or load), Prune, Finetune,
//! Quantize, Attack. Each wraps the model-processing collaborators and
//! reports its status to the runner. Executors never decide batch-level
//! policy: failure isolation, checkpointing, and notification all live in
//! [`crate::runner`].

mod attack;
mod prune;
mod quantize;
mod train;

pub use attack::AttackStage;
pub use prune::{apply_masks, PruneStage};
pub use quantize::QuantizeStage;
pub use train::{FinetuneStage, TrainStage};

use crate::backend::{BackendError, Batch, Collaborators, Model, OptimizerState, Split};
use crate::experiment::ExperimentDescriptor;
use crate::runner::RunState;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pipeline stage identifier, in canonical pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Train,
    Prune,
    Finetune,
    Quantize,
    Attack,
}

impl StageKind {
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Train => "train",
            StageKind::Prune => "prune",
            StageKind::Finetune => "finetune",
            StageKind::Quantize => "quantize",
            StageKind::Attack => "attack",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Non-failure stage outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    /// The stage ran and its effects are in the model/run state.
    Ok,
    /// The stage's preconditions were inapplicable; nothing changed.
    Skipped,
}

/// A stage collaborator reported failure.
///
/// `Failed` is isolated to the current experiment; `Resource` halts the
/// whole batch.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("stage {stage} failed: {reason}")]
    Failed { stage: StageKind, reason: String },

    #[error("resource exhaustion in stage {stage}: {reason}")]
    Resource { stage: StageKind, reason: String },
}

impl StageError {
    /// Lift a collaborator error into a stage error, preserving the
    /// resource/failure distinction.
    pub fn from_backend(stage: StageKind, err: BackendError) -> Self {
        match err {
            BackendError::OutOfMemory(reason) => StageError::Resource { stage, reason },
            BackendError::Failed(reason) => StageError::Failed { stage, reason },
        }
    }

    pub fn stage(&self) -> StageKind {
        match self {
            StageError::Failed { stage, .. } | StageError::Resource { stage, .. } => *stage,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            StageError::Failed { reason, .. } | StageError::Resource { reason, .. } => reason,
        }
    }
}

/// Read-only context a stage executes against.
pub struct StageContext<'a> {
    pub descriptor: &'a ExperimentDescriptor,
    pub collaborators: &'a Collaborators,
    /// Batch size handed to the data provider.
    pub batch_size: usize,
}

impl StageContext<'_> {
    /// Labeled batches for the given split.
    pub fn data(&self, split: Split) -> Result<Vec<Batch>, BackendError> {
        self.collaborators.data.batches(
            self.descriptor.dataset,
            split,
            self.batch_size,
            self.descriptor.seed,
        )
    }
}

/// One pipeline stage executor.
pub trait Stage {
    fn kind(&self) -> StageKind;

    /// Run the stage against the model, recording metrics and progress in
    /// the run state.
    fn execute(
        &self,
        model: &mut Model,
        optimizer: &mut OptimizerState,
        state: &mut RunState,
        ctx: &StageContext<'_>,
    ) -> Result<StageStatus, StageError>;
}
