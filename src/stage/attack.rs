//! Adversarial attack stage executor
//!
//! Measures the final model's robustness with a bounded perturbation from the
//! attack collaborator. Evaluates on the split selected by the descriptor's
//! `train` flag and never mutates the model.

use super::{Stage, StageContext, StageError, StageKind, StageStatus};
use crate::backend::{Batch, Model, OptimizerState, Split};
use crate::runner::RunState;

pub struct AttackStage;

impl Stage for AttackStage {
    fn kind(&self) -> StageKind {
        StageKind::Attack
    }

    fn execute(
        &self,
        model: &mut Model,
        _optimizer: &mut OptimizerState,
        state: &mut RunState,
        ctx: &StageContext<'_>,
    ) -> Result<StageStatus, StageError> {
        let desc = ctx.descriptor;
        if desc.attack_method.is_none() {
            return Ok(StageStatus::Skipped);
        }
        let lift = |e| StageError::from_backend(StageKind::Attack, e);

        let split = if desc.attack_kwargs.train { Split::Train } else { Split::Test };
        let mut batches = ctx.data(split).map_err(lift)?;
        if let Some(cap) = desc.batch_cap() {
            batches.truncate(cap as usize);
        }

        let trainer = &ctx.collaborators.trainer;
        let clean = trainer.evaluate(model, &batches).map_err(lift)?;

        let adversarial: Vec<Batch> = batches
            .iter()
            .map(|b| ctx.collaborators.attacker.perturb(model, b, &desc.attack_kwargs))
            .collect::<Result<_, _>>()
            .map_err(lift)?;
        let robust = trainer.evaluate(model, &adversarial).map_err(lift)?;

        let success_rate = if clean.accuracy > 0.0 {
            (1.0 - robust.accuracy / clean.accuracy).clamp(0.0, 1.0)
        } else {
            0.0
        };

        state.metrics.clean_accuracy = Some(clean.accuracy);
        state.metrics.adversarial_accuracy = Some(robust.accuracy);
        state.metrics.attack_success_rate = Some(success_rate);
        Ok(StageStatus::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Collaborators, TrainPlan};
    use crate::experiment::{
        AttackKwargs, AttackMethod, Dataset, ExperimentDescriptor, ModelType,
    };

    fn descriptor() -> ExperimentDescriptor {
        ExperimentDescriptor {
            experiment_number: 1,
            model_type: ModelType::Resnet20,
            dataset: Dataset::Cifar10,
            prune_method: None,
            prune_compression: 1.0,
            finetune_epochs: 0,
            quantization: None,
            model_path: None,
            debug: None,
            best_model_metric: None,
            attack_method: Some(AttackMethod::Pgd),
            attack_kwargs: AttackKwargs { eps: 0.3, eps_iter: 0.1, nb_iter: 5, train: false },
            email_verbose: false,
            save_one_checkpoint: false,
            seed: 42,
        }
    }

    #[test]
    fn test_attack_reports_metrics_without_mutating_model() {
        let desc = descriptor();
        let collaborators = Collaborators::reference(7);
        let mut model = collaborators
            .models
            .build(desc.model_type, desc.dataset, desc.seed)
            .unwrap();
        let mut opt = OptimizerState::new(0.1);

        // Train a little so there is accuracy to degrade.
        let train = collaborators
            .data
            .batches(desc.dataset, Split::Train, 16, desc.seed)
            .unwrap();
        collaborators
            .trainer
            .train(&mut model, &mut opt, &train, &TrainPlan { epochs: 15, batch_cap: None })
            .unwrap();

        let snapshot = model.clone();
        let mut state = RunState::default();
        let ctx = StageContext { descriptor: &desc, collaborators: &collaborators, batch_size: 16 };
        let status = AttackStage.execute(&mut model, &mut opt, &mut state, &ctx).unwrap();

        assert_eq!(status, StageStatus::Ok);
        assert_eq!(model, snapshot);
        let clean = state.metrics.clean_accuracy.unwrap();
        let adv = state.metrics.adversarial_accuracy.unwrap();
        let success = state.metrics.attack_success_rate.unwrap();
        assert!(adv <= clean);
        assert!((0.0..=1.0).contains(&success));
    }

    #[test]
    fn test_skipped_without_attack_method() {
        let mut desc = descriptor();
        desc.attack_method = None;
        let collaborators = Collaborators::reference(7);
        let mut model = collaborators
            .models
            .build(desc.model_type, desc.dataset, desc.seed)
            .unwrap();
        let mut opt = OptimizerState::new(0.1);
        let mut state = RunState::default();
        let ctx = StageContext { descriptor: &desc, collaborators: &collaborators, batch_size: 8 };
        let status = AttackStage.execute(&mut model, &mut opt, &mut state, &ctx).unwrap();
        assert_eq!(status, StageStatus::Skipped);
        assert!(state.metrics.attack_success_rate.is_none());
    }

    #[test]
    fn test_train_flag_selects_split() {
        // Just exercises the train-split path end to end.
        let mut desc = descriptor();
        desc.attack_kwargs.train = true;
        desc.debug = Some(2);
        let collaborators = Collaborators::reference(7);
        let mut model = collaborators
            .models
            .build(desc.model_type, desc.dataset, desc.seed)
            .unwrap();
        let mut opt = OptimizerState::new(0.1);
        let mut state = RunState::default();
        let ctx = StageContext { descriptor: &desc, collaborators: &collaborators, batch_size: 8 };
        let status = AttackStage.execute(&mut model, &mut opt, &mut state, &ctx).unwrap();
        assert_eq!(status, StageStatus::Ok);
        assert!(state.metrics.clean_accuracy.is_some());
    }
}
