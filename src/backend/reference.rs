//! Reference ndarray backend
//!
//! Implements every collaborator contract with a small two-layer network on
//! deterministic synthetic data: class-conditional Gaussian clusters stand in
//! for CIFAR tensors. Everything is seeded, so builds, batches, and random
//! pruning are reproducible across processes — which is what makes checkpoint
//! round-trip and resume behavior testable.

use super::{
    Attacker, Batch, BackendError, DataProvider, EvalReport, ImportanceScorer, Layer, Model,
    ModelRepository, ModelTrainer, OptimizerState, Split, TrainPlan, TrainReport,
};
use crate::experiment::{AttackKwargs, Dataset, ModelType, PruneCriterion};
use ndarray::{Array1, Array2, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;

/// Input feature dimensionality of the synthetic dataset.
const FEATURE_DIM: usize = 32;
/// Batches per split.
const TRAIN_BATCHES: usize = 8;
const TEST_BATCHES: usize = 4;
/// Batches consumed when estimating gradient/activation importance.
const SCORING_BATCHES: usize = 2;

/// In-crate implementation of all model-processing contracts.
#[derive(Debug, Clone)]
pub struct ReferenceBackend {
    base_seed: u64,
}

impl ReferenceBackend {
    pub fn new(base_seed: u64) -> Self {
        Self { base_seed }
    }

    fn seed_for(&self, seed: u64, tag: u64) -> u64 {
        (self.base_seed ^ seed)
            .wrapping_mul(0x9e37_79b9_7f4a_7c15)
            .rotate_left(17)
            ^ tag
    }
}

/// Hidden width per architecture tag. The relative ordering mirrors the real
/// architectures' capacities; the absolute sizes keep tests fast.
fn hidden_dim(model_type: ModelType) -> usize {
    match model_type {
        ModelType::MobileNetV2 => 12,
        ModelType::Resnet20 => 16,
        ModelType::Resnet56 => 24,
        ModelType::VggBnDrop | ModelType::VggBnDrop100 => 32,
        ModelType::GoogLeNet => 48,
    }
}

fn name_tag(name: &str) -> u64 {
    name.bytes().fold(0xcbf2_9ce4_8422_2325u64, |acc, b| {
        (acc ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

fn init_weights(rng: &mut StdRng, rows: usize, cols: usize) -> Array2<f32> {
    let scale = (1.0 / rows as f32).sqrt();
    Array2::from_shape_fn((rows, cols), |_| (rng.gen::<f32>() - 0.5) * 2.0 * scale)
}

/// Forward pass: relu(x W1) W2, with masks applied.
fn forward(model: &Model, inputs: &Array2<f32>) -> Result<(Array2<f32>, Array2<f32>), BackendError> {
    if model.layers.len() != 2 {
        return Err(BackendError::Failed(format!(
            "reference backend expects 2 layers, model has {}",
            model.layers.len()
        )));
    }
    let w1 = model.layers[0].effective();
    let w2 = model.layers[1].effective();
    if inputs.ncols() != w1.nrows() {
        return Err(BackendError::Failed(format!(
            "input width {} does not match model input {}",
            inputs.ncols(),
            w1.nrows()
        )));
    }
    let hidden = inputs.dot(&w1).mapv(|v| v.max(0.0));
    let logits = hidden.dot(&w2);
    Ok((hidden, logits))
}

fn softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut probs = logits.clone();
    for mut row in probs.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    probs
}

fn cross_entropy(probs: &Array2<f32>, labels: &[usize]) -> f32 {
    let total: f32 = labels
        .iter()
        .enumerate()
        .map(|(i, &y)| -probs[[i, y]].max(1e-12).ln())
        .sum();
    total / labels.len().max(1) as f32
}

fn accuracy(probs: &Array2<f32>, labels: &[usize]) -> f32 {
    let correct = labels
        .iter()
        .enumerate()
        .filter(|&(i, &y)| {
            let row = probs.row(i);
            let (argmax, _) = row
                .iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |(bi, bv), (j, &v)| {
                    if v > bv {
                        (j, v)
                    } else {
                        (bi, bv)
                    }
                });
            argmax == y
        })
        .count();
    correct as f32 / labels.len().max(1) as f32
}

/// Backprop through the two-layer network. Returns (dW1, dW2, dX).
fn gradients(
    model: &Model,
    inputs: &Array2<f32>,
    hidden: &Array2<f32>,
    probs: &Array2<f32>,
    labels: &[usize],
) -> (Array2<f32>, Array2<f32>, Array2<f32>) {
    let n = inputs.nrows().max(1) as f32;
    let mut dlogits = probs.clone();
    for (i, &y) in labels.iter().enumerate() {
        dlogits[[i, y]] -= 1.0;
    }
    dlogits.mapv_inplace(|v| v / n);

    let dw2 = hidden.t().dot(&dlogits);

    let w2 = model.layers[1].effective();
    let mut dhidden = dlogits.dot(&w2.t());
    Zip::from(&mut dhidden).and(hidden).for_each(|d, &h| {
        if h <= 0.0 {
            *d = 0.0;
        }
    });

    let dw1 = inputs.t().dot(&dhidden);

    let w1 = model.layers[0].effective();
    let dx = dhidden.dot(&w1.t());

    (dw1, dw2, dx)
}

/// SGD-with-momentum step. Gradients are masked so pruned weights never move.
fn sgd_update(model: &mut Model, optimizer: &mut OptimizerState, grads: &[Array2<f32>]) {
    if optimizer.velocity.len() != model.layers.len() {
        optimizer.velocity = model
            .layers
            .iter()
            .map(|l| Array2::zeros(l.weights.dim()))
            .collect();
    }
    optimizer.step += 1;
    let lr = optimizer.lr;
    let momentum = optimizer.momentum;
    for (i, layer) in model.layers.iter_mut().enumerate() {
        let masked = &grads[i] * &layer.mask;
        let velocity = &mut optimizer.velocity[i];
        velocity.zip_mut_with(&masked, |v, &g| *v = momentum * *v - lr * g);
        layer.weights.zip_mut_with(velocity, |w, &v| *w += v);
    }
}

impl ModelRepository for ReferenceBackend {
    fn build(
        &self,
        model_type: ModelType,
        dataset: Dataset,
        seed: u64,
    ) -> Result<Model, BackendError> {
        let hidden = hidden_dim(model_type);
        let classes = dataset.num_classes();
        let mut rng = StdRng::seed_from_u64(self.seed_for(seed, name_tag(model_type.name())));
        let layers = vec![
            Layer::new("fc1", init_weights(&mut rng, FEATURE_DIM, hidden)),
            Layer::new("fc2", init_weights(&mut rng, hidden, classes)),
        ];
        Ok(Model { model_type, dataset, layers })
    }

    fn load(&self, path: &Path) -> Result<Model, BackendError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BackendError::Failed(format!("cannot read model {}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| BackendError::Failed(format!("cannot parse model {}: {e}", path.display())))
    }
}

impl DataProvider for ReferenceBackend {
    fn batches(
        &self,
        dataset: Dataset,
        split: Split,
        batch_size: usize,
        seed: u64,
    ) -> Result<Vec<Batch>, BackendError> {
        if batch_size == 0 {
            return Err(BackendError::Failed("batch_size must be positive".into()));
        }
        let classes = dataset.num_classes();

        // Class means are shared across splits so train and test are drawn
        // from the same distribution.
        let mut mean_rng = StdRng::seed_from_u64(self.seed_for(seed, name_tag(dataset.name())));
        let means: Vec<Array1<f32>> = (0..classes)
            .map(|_| Array1::from_shape_fn(FEATURE_DIM, |_| mean_rng.gen_range(-1.0..1.0)))
            .collect();

        let (count, split_tag) = match split {
            Split::Train => (TRAIN_BATCHES, 1),
            Split::Test => (TEST_BATCHES, 2),
        };
        let mut rng = StdRng::seed_from_u64(self.seed_for(seed, split_tag));

        let batches = (0..count)
            .map(|b| {
                let labels: Vec<usize> = (0..batch_size)
                    .map(|i| (b * batch_size + i) % classes)
                    .collect();
                let inputs = Array2::from_shape_fn((batch_size, FEATURE_DIM), |(i, j)| {
                    means[labels[i]][j] * 1.5 + rng.gen_range(-0.2..0.2)
                });
                Batch { inputs, labels }
            })
            .collect();
        Ok(batches)
    }
}

impl ModelTrainer for ReferenceBackend {
    fn train(
        &self,
        model: &mut Model,
        optimizer: &mut OptimizerState,
        batches: &[Batch],
        plan: &TrainPlan,
    ) -> Result<TrainReport, BackendError> {
        if batches.is_empty() {
            return Err(BackendError::Failed("no training batches".into()));
        }
        let cap = plan
            .batch_cap
            .map(|c| c as usize)
            .unwrap_or(batches.len())
            .min(batches.len());

        let mut final_loss = f32::NAN;
        let mut consumed = 0u32;
        for _ in 0..plan.epochs {
            consumed = 0;
            for batch in batches.iter().take(cap) {
                let (hidden, logits) = forward(model, &batch.inputs)?;
                let probs = softmax(&logits);
                final_loss = cross_entropy(&probs, &batch.labels);
                let (dw1, dw2, _) = gradients(model, &batch.inputs, &hidden, &probs, &batch.labels);
                sgd_update(model, optimizer, &[dw1, dw2]);
                consumed += 1;
            }
        }

        let eval = self.evaluate(model, batches)?;
        if plan.epochs == 0 {
            final_loss = eval.loss;
        }
        Ok(TrainReport {
            final_loss,
            accuracy: eval.accuracy,
            epochs_run: plan.epochs,
            batches_per_epoch: consumed,
        })
    }

    fn evaluate(&self, model: &Model, batches: &[Batch]) -> Result<EvalReport, BackendError> {
        if batches.is_empty() {
            return Err(BackendError::Failed("no evaluation batches".into()));
        }
        let mut loss = 0.0;
        let mut acc = 0.0;
        for batch in batches {
            let (_, logits) = forward(model, &batch.inputs)?;
            let probs = softmax(&logits);
            loss += cross_entropy(&probs, &batch.labels);
            acc += accuracy(&probs, &batch.labels);
        }
        let n = batches.len() as f32;
        Ok(EvalReport { loss: loss / n, accuracy: acc / n })
    }
}

impl ImportanceScorer for ReferenceBackend {
    fn score(
        &self,
        model: &Model,
        criterion: PruneCriterion,
        batches: &[Batch],
        seed: u64,
    ) -> Result<Vec<Array2<f32>>, BackendError> {
        match criterion {
            PruneCriterion::Random => {
                let mut rng = StdRng::seed_from_u64(self.seed_for(seed, name_tag("random-prune")));
                Ok(model
                    .layers
                    .iter()
                    .map(|l| Array2::from_shape_fn(l.weights.dim(), |_| rng.gen::<f32>()))
                    .collect())
            }
            PruneCriterion::Weight => Ok(model
                .layers
                .iter()
                .map(|l| l.effective().mapv(f32::abs))
                .collect()),
            PruneCriterion::Gradient => {
                let sample = scoring_sample(batches)?;
                let mut acc: Vec<Array2<f32>> = model
                    .layers
                    .iter()
                    .map(|l| Array2::zeros(l.weights.dim()))
                    .collect();
                for batch in sample {
                    let (hidden, logits) = forward(model, &batch.inputs)?;
                    let probs = softmax(&logits);
                    let (dw1, dw2, _) =
                        gradients(model, &batch.inputs, &hidden, &probs, &batch.labels);
                    acc[0].zip_mut_with(&dw1, |a, &g| *a += g.abs());
                    acc[1].zip_mut_with(&dw2, |a, &g| *a += g.abs());
                }
                Ok(acc)
            }
            PruneCriterion::Activation => {
                // Wanda-style: |weight| scaled by the mean magnitude of the
                // activation feeding it.
                let sample = scoring_sample(batches)?;
                let mut input_act = Array1::<f32>::zeros(model.layers[0].weights.nrows());
                let mut hidden_act = Array1::<f32>::zeros(model.layers[1].weights.nrows());
                let mut rows = 0.0f32;
                for batch in sample {
                    let (hidden, _) = forward(model, &batch.inputs)?;
                    input_act += &batch.inputs.mapv(f32::abs).sum_axis(ndarray::Axis(0));
                    hidden_act += &hidden.mapv(f32::abs).sum_axis(ndarray::Axis(0));
                    rows += batch.inputs.nrows() as f32;
                }
                input_act.mapv_inplace(|v| v / rows.max(1.0));
                hidden_act.mapv_inplace(|v| v / rows.max(1.0));

                let w1 = model.layers[0].effective();
                let w2 = model.layers[1].effective();
                let score1 =
                    Array2::from_shape_fn(w1.dim(), |(j, k)| w1[[j, k]].abs() * input_act[j]);
                let score2 =
                    Array2::from_shape_fn(w2.dim(), |(j, k)| w2[[j, k]].abs() * hidden_act[j]);
                Ok(vec![score1, score2])
            }
        }
    }
}

fn scoring_sample(batches: &[Batch]) -> Result<&[Batch], BackendError> {
    if batches.is_empty() {
        return Err(BackendError::Failed("importance scoring needs data batches".into()));
    }
    Ok(&batches[..batches.len().min(SCORING_BATCHES)])
}

impl Attacker for ReferenceBackend {
    fn perturb(
        &self,
        model: &Model,
        batch: &Batch,
        kwargs: &AttackKwargs,
    ) -> Result<Batch, BackendError> {
        let eps = kwargs.eps as f32;
        let step = kwargs.eps_iter as f32;
        let origin = &batch.inputs;
        let mut adv = origin.clone();

        for _ in 0..kwargs.nb_iter {
            let (hidden, logits) = forward(model, &adv)?;
            let probs = softmax(&logits);
            let (_, _, dx) = gradients(model, &adv, &hidden, &probs, &batch.labels);
            Zip::from(&mut adv).and(&dx).and(origin).for_each(|a, &g, &o| {
                *a = (*a + step * g.signum()).clamp(o - eps, o + eps);
            });
        }
        Ok(Batch { inputs: adv, labels: batch.labels.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn backend() -> ReferenceBackend {
        ReferenceBackend::new(7)
    }

    fn model() -> Model {
        backend().build(ModelType::Resnet20, Dataset::Cifar10, 42).unwrap()
    }

    fn train_batches() -> Vec<Batch> {
        backend().batches(Dataset::Cifar10, Split::Train, 16, 42).unwrap()
    }

    #[test]
    fn test_build_is_deterministic() {
        let a = model();
        let b = model();
        assert_eq!(a, b);
        assert_ne!(
            a,
            backend().build(ModelType::Resnet20, Dataset::Cifar10, 43).unwrap()
        );
    }

    #[test]
    fn test_batches_are_restartable() {
        let a = train_batches();
        let b = train_batches();
        assert_eq!(a.len(), TRAIN_BATCHES);
        assert_eq!(a[0].labels, b[0].labels);
        assert_abs_diff_eq!(a[0].inputs[[0, 0]], b[0].inputs[[0, 0]]);
    }

    #[test]
    fn test_training_improves_accuracy() {
        let mut m = model();
        let batches = train_batches();
        let mut opt = OptimizerState::new(0.1);

        let before = backend().evaluate(&m, &batches).unwrap();
        let report = backend()
            .train(&mut m, &mut opt, &batches, &TrainPlan { epochs: 20, batch_cap: None })
            .unwrap();
        assert!(report.accuracy > before.accuracy);
        // Clearly better than the 10% chance level.
        assert!(report.accuracy > 0.3, "accuracy {}", report.accuracy);
    }

    #[test]
    fn test_batch_cap_limits_consumption() {
        let mut m = model();
        let batches = train_batches();
        let mut opt = OptimizerState::new(0.1);
        let report = backend()
            .train(&mut m, &mut opt, &batches, &TrainPlan { epochs: 1, batch_cap: Some(1) })
            .unwrap();
        assert_eq!(report.batches_per_epoch, 1);
        assert_eq!(opt.step, 1);
    }

    #[test]
    fn test_masked_weights_do_not_move() {
        let mut m = model();
        m.layers[0].mask[[0, 0]] = 0.0;
        let frozen = m.layers[0].weights[[0, 0]];

        let batches = train_batches();
        let mut opt = OptimizerState::new(0.1);
        backend()
            .train(&mut m, &mut opt, &batches, &TrainPlan { epochs: 2, batch_cap: None })
            .unwrap();
        assert_abs_diff_eq!(m.layers[0].weights[[0, 0]], frozen);
    }

    #[test]
    fn test_score_shapes_match_layers() {
        let m = model();
        let batches = train_batches();
        for criterion in [
            PruneCriterion::Random,
            PruneCriterion::Weight,
            PruneCriterion::Gradient,
            PruneCriterion::Activation,
        ] {
            let scores = backend().score(&m, criterion, &batches, 42).unwrap();
            assert_eq!(scores.len(), m.layers.len());
            for (score, layer) in scores.iter().zip(&m.layers) {
                assert_eq!(score.dim(), layer.weights.dim());
            }
        }
    }

    #[test]
    fn test_perturbation_is_bounded_and_pure() {
        let m = model();
        let snapshot = m.clone();
        let batch = &train_batches()[0];
        let kwargs = AttackKwargs { eps: 0.05, eps_iter: 0.02, nb_iter: 10, train: false };
        let adv = backend().perturb(&m, batch, &kwargs).unwrap();

        for (a, o) in adv.inputs.iter().zip(batch.inputs.iter()) {
            assert!((a - o).abs() <= 0.05 + 1e-6);
        }
        assert_eq!(adv.labels, batch.labels);
        assert_eq!(m, snapshot);
    }

    #[test]
    fn test_attack_degrades_accuracy() {
        let mut m = model();
        let batches = train_batches();
        let mut opt = OptimizerState::new(0.1);
        backend()
            .train(&mut m, &mut opt, &batches, &TrainPlan { epochs: 20, batch_cap: None })
            .unwrap();

        let clean = backend().evaluate(&m, &batches).unwrap();
        let kwargs = AttackKwargs { eps: 0.5, eps_iter: 0.1, nb_iter: 10, train: false };
        let adv_batches: Vec<Batch> = batches
            .iter()
            .map(|b| backend().perturb(&m, b, &kwargs).unwrap())
            .collect();
        let adv = backend().evaluate(&m, &adv_batches).unwrap();
        assert!(adv.accuracy < clean.accuracy);
    }
}
