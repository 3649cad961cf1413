//! Train and fine-tune stage executors

use super::{Stage, StageContext, StageError, StageKind, StageStatus};
use crate::backend::{
    BackendError, Batch, EvalReport, Model, ModelTrainer, OptimizerState, Split, TrainPlan,
    TrainReport,
};
use crate::experiment::BestMetric;
use crate::runner::RunState;

/// Higher-is-better score for an evaluation under the given metric.
fn metric_score(metric: BestMetric, eval: &EvalReport) -> f32 {
    match metric {
        BestMetric::Accuracy => eval.accuracy,
        BestMetric::Loss => -eval.loss,
    }
}

/// Train one epoch at a time, evaluating on `held_out` after each epoch, and
/// leave the model and optimizer at the best-scoring epoch's snapshot.
///
/// The returned report aggregates all epochs actually run; the returned
/// evaluation belongs to the snapshot that was kept. Ties keep the earlier
/// epoch.
fn train_selecting_best(
    trainer: &dyn ModelTrainer,
    model: &mut Model,
    optimizer: &mut OptimizerState,
    batches: &[Batch],
    held_out: &[Batch],
    plan: &TrainPlan,
    metric: BestMetric,
) -> Result<(TrainReport, EvalReport), BackendError> {
    let epoch_plan = TrainPlan { epochs: 1, batch_cap: plan.batch_cap };
    let mut totals = TrainReport {
        final_loss: 0.0,
        accuracy: 0.0,
        epochs_run: 0,
        batches_per_epoch: 0,
    };
    let mut best: Option<(f32, Model, OptimizerState, EvalReport)> = None;
    for _ in 0..plan.epochs {
        let report = trainer.train(model, optimizer, batches, &epoch_plan)?;
        totals.final_loss = report.final_loss;
        totals.accuracy = report.accuracy;
        totals.epochs_run += report.epochs_run;
        totals.batches_per_epoch = report.batches_per_epoch;

        let eval = trainer.evaluate(model, held_out)?;
        let score = metric_score(metric, &eval);
        if best.as_ref().map_or(true, |(s, ..)| score > *s) {
            best = Some((score, model.clone(), optimizer.clone(), eval));
        }
    }
    match best {
        Some((_, best_model, best_optimizer, eval)) => {
            *model = best_model;
            *optimizer = best_optimizer;
            Ok((totals, eval))
        }
        None => {
            let eval = trainer.evaluate(model, held_out)?;
            Ok((totals, eval))
        }
    }
}

/// Trains a model from scratch, or loads a pretrained one when the
/// descriptor carries a `model_path`.
pub struct TrainStage;

impl Stage for TrainStage {
    fn kind(&self) -> StageKind {
        StageKind::Train
    }

    fn execute(
        &self,
        model: &mut Model,
        optimizer: &mut OptimizerState,
        state: &mut RunState,
        ctx: &StageContext<'_>,
    ) -> Result<StageStatus, StageError> {
        let desc = ctx.descriptor;
        let lift = |e| StageError::from_backend(StageKind::Train, e);

        if let Some(path) = &desc.model_path {
            *model = ctx.collaborators.models.load(path).map_err(lift)?;
            let test = ctx.data(Split::Test).map_err(lift)?;
            let eval = ctx.collaborators.trainer.evaluate(model, &test).map_err(lift)?;
            state.metrics.train_loss = Some(eval.loss);
            state.metrics.train_accuracy = Some(eval.accuracy);
            return Ok(StageStatus::Ok);
        }

        let batches = ctx.data(Split::Train).map_err(lift)?;
        let plan = TrainPlan {
            epochs: desc.effective_epochs(desc.model_type.default_train_epochs()),
            batch_cap: desc.batch_cap(),
        };
        let trainer = ctx.collaborators.trainer.as_ref();
        let (report, accuracy) = match desc.best_model_metric {
            Some(metric) => {
                let test = ctx.data(Split::Test).map_err(lift)?;
                let (report, best_eval) =
                    train_selecting_best(trainer, model, optimizer, &batches, &test, &plan, metric)
                        .map_err(lift)?;
                (report, best_eval.accuracy)
            }
            None => {
                let report = trainer.train(model, optimizer, &batches, &plan).map_err(lift)?;
                (report, report.accuracy)
            }
        };

        state.record_progress(report.epochs_run, report.batches_per_epoch);
        state.metrics.train_loss = Some(report.final_loss);
        state.metrics.train_accuracy = Some(accuracy);
        Ok(StageStatus::Ok)
    }
}

/// Post-pruning retraining to recover accuracy. Skipped when the experiment
/// does not prune.
pub struct FinetuneStage;

impl Stage for FinetuneStage {
    fn kind(&self) -> StageKind {
        StageKind::Finetune
    }

    fn execute(
        &self,
        model: &mut Model,
        optimizer: &mut OptimizerState,
        state: &mut RunState,
        ctx: &StageContext<'_>,
    ) -> Result<StageStatus, StageError> {
        let desc = ctx.descriptor;
        if desc.prune_method.is_none() || desc.finetune_epochs == 0 {
            return Ok(StageStatus::Skipped);
        }
        let lift = |e| StageError::from_backend(StageKind::Finetune, e);

        let batches = ctx.data(Split::Train).map_err(lift)?;
        let test = ctx.data(Split::Test).map_err(lift)?;
        let plan = TrainPlan {
            epochs: desc.effective_epochs(desc.finetune_epochs),
            batch_cap: desc.batch_cap(),
        };
        let trainer = ctx.collaborators.trainer.as_ref();
        let (report, accuracy) = match desc.best_model_metric {
            Some(metric) => {
                let (report, best_eval) =
                    train_selecting_best(trainer, model, optimizer, &batches, &test, &plan, metric)
                        .map_err(lift)?;
                (report, best_eval.accuracy)
            }
            None => {
                let report = trainer.train(model, optimizer, &batches, &plan).map_err(lift)?;
                let eval = trainer.evaluate(model, &test).map_err(lift)?;
                (report, eval.accuracy)
            }
        };

        state.record_progress(report.epochs_run, report.batches_per_epoch);
        state.metrics.finetune_loss = Some(report.final_loss);
        state.metrics.accuracy_after_finetune = Some(accuracy);
        Ok(StageStatus::Ok)
    }
}
