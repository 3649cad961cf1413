//! Pruning stage executor
//!
//! Reduces the model's active parameter count by the configured compression
//! factor. Candidates are scored by the pruning-criterion collaborator and
//! selected either globally across all layers or independently per layer.
//! Pruning is monotone: a weight that is already masked is never resurrected.

use super::{Stage, StageContext, StageError, StageKind, StageStatus};
use crate::backend::{Model, OptimizerState, Split};
use crate::experiment::PruneScope;
use crate::runner::RunState;
use ndarray::Array2;

/// Prunes the model to the descriptor's target compression.
pub struct PruneStage;

impl Stage for PruneStage {
    fn kind(&self) -> StageKind {
        StageKind::Prune
    }

    fn execute(
        &self,
        model: &mut Model,
        _optimizer: &mut OptimizerState,
        state: &mut RunState,
        ctx: &StageContext<'_>,
    ) -> Result<StageStatus, StageError> {
        let desc = ctx.descriptor;
        let Some(method) = desc.prune_method else {
            return Ok(StageStatus::Skipped);
        };
        let lift = |e| StageError::from_backend(StageKind::Prune, e);

        let train = ctx.data(Split::Train).map_err(lift)?;
        let test = ctx.data(Split::Test).map_err(lift)?;
        let trainer = &ctx.collaborators.trainer;

        let before = trainer.evaluate(model, &test).map_err(lift)?;
        state.metrics.accuracy_before_prune = Some(before.accuracy);

        let scores = ctx
            .collaborators
            .scorer
            .score(model, method.criterion, &train, desc.seed)
            .map_err(lift)?;
        if scores.len() != model.layers.len() {
            return Err(StageError::Failed {
                stage: StageKind::Prune,
                reason: format!(
                    "scorer returned {} score sets for {} layers",
                    scores.len(),
                    model.layers.len()
                ),
            });
        }

        apply_masks(model, &scores, method.scope, desc.prune_compression);

        let after = trainer.evaluate(model, &test).map_err(lift)?;
        state.metrics.accuracy_after_prune = Some(after.accuracy);
        state.metrics.achieved_compression = Some(model.compression());
        Ok(StageStatus::Ok)
    }
}

/// Rebuild the model's masks so that roughly `total / compression` weights
/// stay active, keeping the highest-scored candidates.
///
/// Already-masked weights are excluded from the candidate set, so repeated
/// pruning only ever tightens the mask.
pub fn apply_masks(
    model: &mut Model,
    scores: &[Array2<f32>],
    scope: PruneScope,
    compression: f64,
) {
    match scope {
        PruneScope::Global => {
            let total: usize = model.layers.iter().map(|l| l.total_params()).sum();
            let keep = keep_count(total, compression);
            let mut candidates: Vec<(usize, (usize, usize), f32)> = Vec::with_capacity(total);
            for (li, layer) in model.layers.iter().enumerate() {
                for ((r, c), &m) in layer.mask.indexed_iter() {
                    if m != 0.0 {
                        candidates.push((li, (r, c), scores[li][[r, c]]));
                    }
                }
            }
            retain_top(&mut candidates, keep);
            for layer in &mut model.layers {
                layer.mask.fill(0.0);
            }
            for (li, (r, c), _) in candidates {
                model.layers[li].mask[[r, c]] = 1.0;
            }
        }
        PruneScope::Layer => {
            for (li, layer) in model.layers.iter_mut().enumerate() {
                let keep = keep_count(layer.total_params(), compression);
                let mut candidates: Vec<(usize, (usize, usize), f32)> = layer
                    .mask
                    .indexed_iter()
                    .filter(|&(_, &m)| m != 0.0)
                    .map(|((r, c), _)| (li, (r, c), scores[li][[r, c]]))
                    .collect();
                retain_top(&mut candidates, keep);
                layer.mask.fill(0.0);
                for (_, (r, c), _) in candidates {
                    layer.mask[[r, c]] = 1.0;
                }
            }
        }
    }
}

/// Target active-weight count for a compression factor; at least one weight
/// survives whenever there is one.
fn keep_count(total: usize, compression: f64) -> usize {
    if total == 0 {
        return 0;
    }
    ((total as f64 / compression).round() as usize).clamp(1, total)
}

fn retain_top(candidates: &mut Vec<(usize, (usize, usize), f32)>, keep: usize) {
    candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
    candidates.truncate(keep);
}
