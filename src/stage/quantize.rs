//! Quantization stage executor
//!
//! Optional stage: runs only when the descriptor sets a quantization
//! modulus, otherwise it is a skipped passthrough. Surviving weights are
//! snapped to the nearest multiple of `1/modulus`.

use super::{Stage, StageContext, StageError, StageKind, StageStatus};
use crate::backend::{Model, OptimizerState, Split};
use crate::runner::RunState;

pub struct QuantizeStage;

impl Stage for QuantizeStage {
    fn kind(&self) -> StageKind {
        StageKind::Quantize
    }

    fn execute(
        &self,
        model: &mut Model,
        _optimizer: &mut OptimizerState,
        state: &mut RunState,
        ctx: &StageContext<'_>,
    ) -> Result<StageStatus, StageError> {
        let Some(modulus) = ctx.descriptor.quantization else {
            return Ok(StageStatus::Skipped);
        };
        if modulus == 0 {
            return Err(StageError::Failed {
                stage: StageKind::Quantize,
                reason: "quantization modulus must be positive".into(),
            });
        }
        let lift = |e| StageError::from_backend(StageKind::Quantize, e);

        let scale = modulus as f32;
        for layer in &mut model.layers {
            layer.weights.mapv_inplace(|w| (w * scale).round() / scale);
        }

        let test = ctx.data(Split::Test).map_err(lift)?;
        let eval = ctx.collaborators.trainer.evaluate(model, &test).map_err(lift)?;
        state.metrics.accuracy_after_quantize = Some(eval.accuracy);
        Ok(StageStatus::Ok)
    }
}
