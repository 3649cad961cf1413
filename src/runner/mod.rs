//! Experiment runner: sequencing, failure isolation, resume
//!
//! The runner iterates descriptors in declaration order and drives each one
//! through the fixed pipeline Train → Prune → Finetune → Quantize → Attack,
//! checkpointing after every completed stage. Experiments are strictly
//! sequential: every stage collaborator assumes exclusive device ownership.
//!
//! Failure policy:
//! - A stage failure aborts only the current descriptor; the batch continues
//!   and the descriptor's result records the failing stage and reason.
//! - Resource exhaustion (device memory, checkpoint storage) halts the
//!   batch: remaining descriptors are marked skipped and the aggregate
//!   failure carries every result produced so far.
//! - Failed stages are never retried; training failures are rarely safe to
//!   blindly repeat.
//!
//! A cooperative stop signal is checked between stages: the current stage
//! finishes and checkpoints, then the runner exits before further work.

use crate::backend::{Collaborators, OptimizerState};
use crate::checkpoint::{CheckpointError, CheckpointManager, CheckpointTag};
use crate::experiment::ExperimentDescriptor;
use crate::notify::Notifier;
use crate::stage::{
    AttackStage, FinetuneStage, PruneStage, QuantizeStage, Stage, StageContext, StageError,
    StageKind, StageStatus, TrainStage,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error as ThisError;

/// Batch-halting failure: continuing would lose or corrupt work.
#[derive(Debug, ThisError)]
pub enum ResourceError {
    #[error("device memory: {0}")]
    Memory(String),

    #[error("checkpoint storage: {0}")]
    Disk(String),
}

/// Metrics accumulated across one descriptor's stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub train_loss: Option<f32>,
    pub train_accuracy: Option<f32>,
    pub accuracy_before_prune: Option<f32>,
    pub accuracy_after_prune: Option<f32>,
    pub achieved_compression: Option<f64>,
    pub finetune_loss: Option<f32>,
    pub accuracy_after_finetune: Option<f32>,
    pub accuracy_after_quantize: Option<f32>,
    pub clean_accuracy: Option<f32>,
    pub adversarial_accuracy: Option<f32>,
    pub attack_success_rate: Option<f32>,
}

/// Mutable execution state for one descriptor, owned by the runner and
/// persisted inside checkpoints for resume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// Most recently completed stage.
    pub stage: Option<StageKind>,
    /// Stages completed so far, in order.
    pub completed: Vec<StageKind>,
    /// Epochs run by the last training/fine-tuning stage.
    pub epochs_run: u32,
    /// Batches consumed per epoch by that stage.
    pub batches_per_epoch: u32,
    /// Tag of the last persisted checkpoint.
    pub last_checkpoint: Option<String>,
    pub metrics: RunMetrics,
}

impl RunState {
    /// Record epoch/batch progress from a training report.
    pub fn record_progress(&mut self, epochs: u32, batches_per_epoch: u32) {
        self.epochs_run = epochs;
        self.batches_per_epoch = batches_per_epoch;
    }
}

/// Terminal status of one descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// Every applicable stage completed.
    Completed,
    /// A stage collaborator failed; the rest of the descriptor was
    /// abandoned.
    Failed { stage: StageKind, reason: String },
    /// The cooperative stop signal fired before the descriptor finished.
    /// Completed stages are checkpointed and resumable.
    Stopped,
    /// Never started (stop signal or an earlier batch abort).
    Skipped { reason: String },
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Completed)
    }
}

/// Per-descriptor result record. `Runner::run` yields exactly one of these
/// per descriptor, whatever happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// Descriptor folder name.
    pub descriptor: String,
    pub status: RunStatus,
    pub metrics: RunMetrics,
    /// Stages skipped because a prior run already completed them.
    pub resumed: Vec<StageKind>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    fn skipped(descriptor: &ExperimentDescriptor, reason: &str) -> Self {
        let now = Utc::now();
        Self {
            descriptor: descriptor.name(),
            status: RunStatus::Skipped { reason: reason.to_string() },
            metrics: RunMetrics::default(),
            resumed: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    /// One-line human-readable summary for notifications and logs.
    pub fn summary(&self) -> String {
        match &self.status {
            RunStatus::Completed => {
                let mut parts = vec!["completed".to_string()];
                if let Some(acc) = self.metrics.accuracy_after_finetune {
                    parts.push(format!("finetune_acc={acc:.3}"));
                } else if let Some(acc) = self.metrics.train_accuracy {
                    parts.push(format!("train_acc={acc:.3}"));
                }
                if let Some(c) = self.metrics.achieved_compression {
                    parts.push(format!("compression={c:.2}"));
                }
                if let Some(r) = self.metrics.attack_success_rate {
                    parts.push(format!("attack_success={r:.3}"));
                }
                parts.join(" ")
            }
            RunStatus::Failed { stage, reason } => format!("failed at {stage}: {reason}"),
            RunStatus::Stopped => "stopped by external signal".to_string(),
            RunStatus::Skipped { reason } => format!("skipped: {reason}"),
        }
    }
}

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Root directory of the checkpoint namespace. Must be disjoint between
    /// concurrent runner instances (it is keyed by experiment_number below
    /// this root).
    pub root: PathBuf,
    /// Batch size handed to the data provider.
    pub batch_size: usize,
}

impl RunnerOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), batch_size: 32 }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Drives a list of experiment descriptors through the stage pipeline.
pub struct Runner {
    options: RunnerOptions,
    collaborators: Collaborators,
    notifier: Notifier,
    stop: Arc<AtomicBool>,
}

impl Runner {
    pub fn new(options: RunnerOptions, collaborators: Collaborators, notifier: Notifier) -> Self {
        Self { options, collaborators, notifier, stop: Arc::new(AtomicBool::new(false)) }
    }

    /// Share the cooperative stop flag. Setting it finishes the current
    /// stage, checkpoints, and skips all further work.
    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Replace the stop flag, e.g. with one wired to a signal handler.
    pub fn with_stop_signal(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Run every descriptor in declaration order.
    ///
    /// Returns exactly one result per descriptor. Configuration errors are
    /// raised before any execution; resource exhaustion halts the batch via
    /// [`Error::Aborted`], which still carries all results.
    pub fn run(&mut self, descriptors: &[ExperimentDescriptor]) -> Result<Vec<RunResult>> {
        for descriptor in descriptors {
            descriptor.validate()?;
        }

        self.notifier.batch_started(descriptors.len());
        let mut results = Vec::with_capacity(descriptors.len());
        let mut halt: Option<ResourceError> = None;

        for descriptor in descriptors {
            if halt.is_some() {
                results.push(RunResult::skipped(descriptor, "batch aborted"));
                continue;
            }
            if self.stop_requested() {
                results.push(RunResult::skipped(descriptor, "stop requested"));
                continue;
            }
            match self.run_descriptor(descriptor) {
                Ok(result) => {
                    self.notifier.experiment_ended(
                        &result.descriptor,
                        &result.summary(),
                        descriptor.email_verbose,
                    );
                    results.push(result);
                }
                Err((result, cause)) => {
                    self.notifier.experiment_ended(
                        &result.descriptor,
                        &result.summary(),
                        descriptor.email_verbose,
                    );
                    results.push(result);
                    halt = Some(cause);
                }
            }
        }

        let succeeded = results.iter().filter(|r| r.status.is_success()).count();
        self.notifier
            .batch_ended(&format!("{succeeded}/{} experiment(s) completed", results.len()));

        match halt {
            Some(cause) => Err(Error::Aborted { results, cause }),
            None => Ok(results),
        }
    }

    /// Run one descriptor. Stage failures are absorbed into the result;
    /// resource exhaustion is returned alongside the (failed) result so the
    /// caller can halt the batch without losing the record.
    fn run_descriptor(
        &mut self,
        descriptor: &ExperimentDescriptor,
    ) -> std::result::Result<RunResult, (RunResult, ResourceError)> {
        let name = descriptor.name();
        let started_at = Utc::now();
        self.notifier.experiment_started(&name, descriptor.email_verbose);

        let fail = |stage: StageKind, reason: String, resumed: Vec<StageKind>, state: &RunState| {
            RunResult {
                descriptor: name.clone(),
                status: RunStatus::Failed { stage, reason },
                metrics: state.metrics,
                resumed,
                started_at,
                finished_at: Utc::now(),
            }
        };

        let mut state = RunState::default();
        let manager = match CheckpointManager::for_descriptor(&self.options.root, descriptor) {
            Ok(manager) => manager,
            Err(e) => {
                let reason = e.to_string();
                let result = fail(StageKind::Train, reason.clone(), Vec::new(), &state);
                return Err((result, disk_error(e)));
            }
        };
        if let Err(e) = self.write_params(&manager, descriptor) {
            let reason = e.to_string();
            let result = fail(StageKind::Train, reason, Vec::new(), &state);
            return Err((result, e));
        }

        let mut model = match self.collaborators.models.build(
            descriptor.model_type,
            descriptor.dataset,
            descriptor.seed,
        ) {
            Ok(model) => model,
            Err(e) => {
                let err = StageError::from_backend(StageKind::Train, e);
                return self.absorb_stage_error(err, fail(
                    StageKind::Train,
                    String::new(),
                    Vec::new(),
                    &state,
                ));
            }
        };
        let mut optimizer = OptimizerState::new(descriptor.model_type.default_lr());

        // Resume from the last completed stage, if a prior run left one.
        let mut resumed: Vec<StageKind> = Vec::new();
        let previously_completed = match manager.manifest() {
            Ok(manifest) => manifest.completed,
            Err(e) => {
                let reason = e.to_string();
                let result = fail(StageKind::Train, reason, Vec::new(), &state);
                return Err((result, disk_error(e)));
            }
        };
        if !previously_completed.is_empty() {
            match manager.latest() {
                Ok(Some((_, checkpoint))) => {
                    model = checkpoint.model;
                    optimizer = checkpoint.optimizer;
                    state = checkpoint.run_state;
                }
                Ok(None) => {}
                Err(e) => {
                    let reason = e.to_string();
                    let result = fail(StageKind::Train, reason, Vec::new(), &state);
                    return Err((result, disk_error(e)));
                }
            }
        }

        let ctx = StageContext {
            descriptor,
            collaborators: &self.collaborators,
            batch_size: self.options.batch_size,
        };

        let mut status = RunStatus::Completed;
        for stage in pipeline() {
            let kind = stage.kind();
            if previously_completed.contains(&kind) {
                resumed.push(kind);
                continue;
            }
            if self.stop_requested() {
                status = RunStatus::Stopped;
                break;
            }
            match stage.execute(&mut model, &mut optimizer, &mut state, &ctx) {
                Ok(StageStatus::Ok) => {
                    state.stage = Some(kind);
                    state.completed.push(kind);
                    let tag = CheckpointTag::new(descriptor, kind);
                    match manager.save(&tag, &model, &optimizer, &state) {
                        Ok(_) => state.last_checkpoint = Some(tag.to_string()),
                        Err(e) => {
                            let reason = e.to_string();
                            let result = fail(kind, reason, resumed, &state);
                            return Err((result, disk_error(e)));
                        }
                    }
                    self.notifier
                        .stage_event(&name, kind.name(), "completed", descriptor.email_verbose);
                }
                Ok(StageStatus::Skipped) => {}
                Err(err) => {
                    let result = fail(err.stage(), err.reason().to_string(), resumed, &state);
                    return self.absorb_stage_error_with(err, result, descriptor, &name);
                }
            }
        }

        Ok(RunResult {
            descriptor: name,
            status,
            metrics: state.metrics,
            resumed,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Persist the descriptor's parameters next to its checkpoints, so the
    /// on-disk folder is self-describing.
    fn write_params(
        &self,
        manager: &CheckpointManager,
        descriptor: &ExperimentDescriptor,
    ) -> std::result::Result<(), ResourceError> {
        let json = serde_json::to_string_pretty(descriptor)
            .map_err(|e| ResourceError::Disk(e.to_string()))?;
        std::fs::write(manager.dir().join("experiment_params.json"), json)
            .map_err(|e| ResourceError::Disk(e.to_string()))
    }

    fn absorb_stage_error(
        &mut self,
        err: StageError,
        mut template: RunResult,
    ) -> std::result::Result<RunResult, (RunResult, ResourceError)> {
        template.status = RunStatus::Failed {
            stage: err.stage(),
            reason: err.reason().to_string(),
        };
        template.finished_at = Utc::now();
        match err {
            StageError::Failed { .. } => Ok(template),
            StageError::Resource { reason, .. } => Err((template, ResourceError::Memory(reason))),
        }
    }

    fn absorb_stage_error_with(
        &mut self,
        err: StageError,
        result: RunResult,
        descriptor: &ExperimentDescriptor,
        name: &str,
    ) -> std::result::Result<RunResult, (RunResult, ResourceError)> {
        self.notifier.stage_event(
            name,
            err.stage().name(),
            &format!("failed: {}", err.reason()),
            descriptor.email_verbose,
        );
        match err {
            StageError::Failed { .. } => Ok(result),
            StageError::Resource { reason, .. } => Err((result, ResourceError::Memory(reason))),
        }
    }
}

/// The fixed pipeline, in execution order. Inapplicable stages skip
/// themselves.
fn pipeline() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(TrainStage),
        Box::new(PruneStage),
        Box::new(FinetuneStage),
        Box::new(QuantizeStage),
        Box::new(AttackStage),
    ]
}

fn disk_error(e: CheckpointError) -> ResourceError {
    ResourceError::Disk(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_order() {
        let kinds: Vec<StageKind> = pipeline().iter().map(|s| s.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                StageKind::Train,
                StageKind::Prune,
                StageKind::Finetune,
                StageKind::Quantize,
                StageKind::Attack,
            ]
        );
    }

    #[test]
    fn test_run_status_success() {
        assert!(RunStatus::Completed.is_success());
        assert!(!RunStatus::Stopped.is_success());
        assert!(!RunStatus::Failed { stage: StageKind::Prune, reason: "x".into() }.is_success());
    }

    #[test]
    fn test_summary_includes_failure_reason() {
        let now = Utc::now();
        let result = RunResult {
            descriptor: "resnet20".into(),
            status: RunStatus::Failed { stage: StageKind::Prune, reason: "diverged".into() },
            metrics: RunMetrics::default(),
            resumed: Vec::new(),
            started_at: now,
            finished_at: now,
        };
        assert_eq!(result.summary(), "failed at prune: diverged");
    }

    #[test]
    fn test_run_status_serde() {
        let status = RunStatus::Failed { stage: StageKind::Attack, reason: "nan".into() };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"status\":\"failed\""));
        let back: RunStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
    }

    #[test]
    fn test_runner_options_builder() {
        let options = RunnerOptions::new("/tmp/exp").with_batch_size(8);
        assert_eq!(options.root, PathBuf::from("/tmp/exp"));
        assert_eq!(options.batch_size, 8);
    }
}
