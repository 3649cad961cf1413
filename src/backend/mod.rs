//! Collaborator contracts for model processing
//!
//! The orchestrator never implements ML numerics itself: model construction,
//! training, importance scoring, and adversarial perturbation are pluggable
//! collaborators behind the traits in this module. The orchestrator assumes
//! exclusive device ownership per collaborator set; any internal device
//! parallelism (prefetch, batched tensor ops) is opaque to it.
//!
//! [`reference`] provides an in-crate ndarray implementation of every
//! contract, so the full pipeline is exercisable without external services.

pub mod reference;

use crate::experiment::{AttackKwargs, Dataset, ModelType, PruneCriterion};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Collaborator failure.
///
/// `OutOfMemory` is escalated to the batch level by the runner; `Failed` is
/// isolated to the current experiment.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The collaborator could not complete the operation.
    #[error("{0}")]
    Failed(String),
    /// Device memory exhaustion; not safe to continue the batch.
    #[error("out of device memory: {0}")]
    OutOfMemory(String),
}

/// Dataset split selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Split {
    Train,
    Test,
}

/// One labeled batch of inputs.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Row-major inputs, one example per row.
    pub inputs: Array2<f32>,
    /// One class label per row.
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// One prunable weight matrix with its binary mask.
///
/// A mask entry of 0 marks a pruned weight; the effective weight is the
/// elementwise product of `weights` and `mask`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    pub weights: Array2<f32>,
    pub mask: Array2<f32>,
}

impl Layer {
    /// Create an unpruned layer (mask of all ones).
    pub fn new(name: impl Into<String>, weights: Array2<f32>) -> Self {
        let mask = Array2::ones(weights.dim());
        Self { name: name.into(), weights, mask }
    }

    /// Masked weights actually used in the forward pass.
    pub fn effective(&self) -> Array2<f32> {
        &self.weights * &self.mask
    }

    /// Total weight count.
    pub fn total_params(&self) -> usize {
        self.weights.len()
    }

    /// Unpruned weight count.
    pub fn active_params(&self) -> usize {
        self.mask.iter().filter(|&&m| m != 0.0).count()
    }
}

/// A trainable model: an architecture tag plus its prunable layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub model_type: ModelType,
    pub dataset: Dataset,
    pub layers: Vec<Layer>,
}

impl Model {
    pub fn total_params(&self) -> usize {
        self.layers.iter().map(Layer::total_params).sum()
    }

    pub fn active_params(&self) -> usize {
        self.layers.iter().map(Layer::active_params).sum()
    }

    /// Achieved compression: total over active parameter count.
    pub fn compression(&self) -> f64 {
        let active = self.active_params();
        if active == 0 {
            f64::INFINITY
        } else {
            self.total_params() as f64 / active as f64
        }
    }
}

/// SGD-with-momentum optimizer state, persisted inside checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub lr: f32,
    pub momentum: f32,
    /// Global update step counter.
    pub step: u64,
    /// Per-layer velocity buffers; empty until the first update.
    pub velocity: Vec<Array2<f32>>,
}

impl OptimizerState {
    pub fn new(lr: f32) -> Self {
        Self { lr, momentum: 0.9, step: 0, velocity: Vec::new() }
    }
}

/// Epoch/batch plan for a training or fine-tuning stage, after the debug
/// override has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainPlan {
    pub epochs: u32,
    /// Per-epoch batch cap (debug mode), or `None` for all batches.
    pub batch_cap: Option<u32>,
}

/// Result of a training run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainReport {
    pub final_loss: f32,
    pub accuracy: f32,
    pub epochs_run: u32,
    /// Batches actually consumed in the last epoch.
    pub batches_per_epoch: u32,
}

/// Result of an evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub loss: f32,
    pub accuracy: f32,
}

/// Maps `model_type` to a trainable architecture instance, or loads one from
/// a pretrained snapshot.
pub trait ModelRepository: Send + Sync {
    fn build(&self, model_type: ModelType, dataset: Dataset, seed: u64)
        -> Result<Model, BackendError>;
    fn load(&self, path: &Path) -> Result<Model, BackendError>;
}

/// Yields a finite, restartable sequence of labeled batches.
pub trait DataProvider: Send + Sync {
    fn batches(
        &self,
        dataset: Dataset,
        split: Split,
        batch_size: usize,
        seed: u64,
    ) -> Result<Vec<Batch>, BackendError>;
}

/// Trains and evaluates models. Assumes exclusive device ownership for the
/// duration of each call.
pub trait ModelTrainer: Send + Sync {
    fn train(
        &self,
        model: &mut Model,
        optimizer: &mut OptimizerState,
        batches: &[Batch],
        plan: &TrainPlan,
    ) -> Result<TrainReport, BackendError>;

    fn evaluate(&self, model: &Model, batches: &[Batch]) -> Result<EvalReport, BackendError>;
}

/// Pruning-criterion library: per-parameter importance scores, one score
/// matrix per layer, parallel to `model.layers`.
pub trait ImportanceScorer: Send + Sync {
    fn score(
        &self,
        model: &Model,
        criterion: PruneCriterion,
        batches: &[Batch],
        seed: u64,
    ) -> Result<Vec<Array2<f32>>, BackendError>;
}

/// Adversarial-attack library: bounded perturbation of one batch. Must not
/// mutate the model.
pub trait Attacker: Send + Sync {
    fn perturb(
        &self,
        model: &Model,
        batch: &Batch,
        kwargs: &AttackKwargs,
    ) -> Result<Batch, BackendError>;
}

/// The full collaborator set a runner is wired with.
#[derive(Clone)]
pub struct Collaborators {
    pub models: Arc<dyn ModelRepository>,
    pub data: Arc<dyn DataProvider>,
    pub trainer: Arc<dyn ModelTrainer>,
    pub scorer: Arc<dyn ImportanceScorer>,
    pub attacker: Arc<dyn Attacker>,
}

impl Collaborators {
    /// Wire every contract to the in-crate reference backend.
    pub fn reference(base_seed: u64) -> Self {
        let backend = Arc::new(reference::ReferenceBackend::new(base_seed));
        Self {
            models: backend.clone(),
            data: backend.clone(),
            trainer: backend.clone(),
            scorer: backend.clone(),
            attacker: backend,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_active_params_respects_mask() {
        let mut layer = Layer::new("fc1", Array2::from_elem((2, 3), 1.0));
        assert_eq!(layer.total_params(), 6);
        assert_eq!(layer.active_params(), 6);

        layer.mask[[0, 0]] = 0.0;
        layer.mask[[1, 2]] = 0.0;
        assert_eq!(layer.active_params(), 4);
        assert_eq!(layer.effective()[[0, 0]], 0.0);
        assert_eq!(layer.effective()[[0, 1]], 1.0);
    }

    #[test]
    fn test_model_compression() {
        let mut model = Model {
            model_type: ModelType::Resnet20,
            dataset: Dataset::Cifar10,
            layers: vec![Layer::new("fc1", Array2::from_elem((2, 4), 1.0))],
        };
        assert!((model.compression() - 1.0).abs() < 1e-9);

        for i in 0..2 {
            for j in 0..2 {
                model.layers[0].mask[[i, j]] = 0.0;
            }
        }
        assert!((model.compression() - 2.0).abs() < 1e-9);
    }
}
