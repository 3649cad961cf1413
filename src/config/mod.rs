//! Declarative experiment configuration
//!
//! The config surface is a YAML document with three sections:
//!
//! ```yaml
//! email:
//!   sender: lab@example.com
//!   pw: secrets/email_pw          # path to a secret file, never inline
//!   reciever: oncall@example.com
//!   send: true
//!   once_per_experiment: true
//! common_args:
//!   experiment_number: 1
//!   dataset: CIFAR10
//!   attack_method: pgd
//!   attack_kwargs: { eps: 0.00784, eps_iter: 0.001, train: false }
//!   email_verbose: true
//!   save_one_checkpoint: true
//! experiments:
//!   - { model_type: resnet20, prune_method: RandomPruning,
//!       prune_compression: 2, finetune_epochs: 40 }
//! grid:
//!   model_type: [resnet20, resnet56]
//!   prune_compression: [2, 4]
//!   prune_method: RandomPruning
//!   finetune_epochs: 40
//! ```
//!
//! Each entry of `experiments` is an override map merged onto `common_args`
//! (override wins on key collision) to produce one
//! [`ExperimentDescriptor`](crate::experiment::ExperimentDescriptor). The
//! optional `grid` section sweeps several axes at once: every combination of
//! its list-valued keys becomes one more experiment entry. Parsing
//! and validation are all-or-nothing: any error aborts before execution
//! begins, so a partially-applied config is never observable.

use crate::experiment::{
    AttackKwargs, AttackMethod, BestMetric, Dataset, ExperimentDescriptor, ModelType, PruneMethod,
};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors. Fatal: raised before any execution begins.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("experiment {index}: missing required field `{field}`")]
    MissingField { index: usize, field: &'static str },

    #[error("experiment {index}: entry must be a mapping of overrides")]
    NotAMapping { index: usize },

    #[error("model {model} is not compatible with dataset {dataset}")]
    IncompatibleModel { model: ModelType, dataset: Dataset },

    #[error("prune_compression must be >= 1, got {0}")]
    InvalidCompression(f64),

    #[error("finetune_epochs must be > 0 when pruning {model}")]
    FinetuneRequired { model: ModelType },

    #[error("debug must be a positive batch count when set")]
    InvalidDebug,

    #[error("config declares no experiments")]
    NoExperiments,
}

fn default_true() -> bool {
    true
}

/// Email notification settings.
///
/// `pw` is a path to a secret file, read once at startup; it is never an
/// inline credential. If any of sender, reciever, or pw is missing, sending
/// is disabled with a logged warning rather than an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmailConfig {
    pub sender: Option<String>,
    pub pw: Option<PathBuf>,
    pub reciever: Option<String>,
    /// Master switch; when false no email is ever sent.
    pub send: bool,
    /// Coalesce all of one experiment's events into a single message.
    pub once_per_experiment: bool,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            sender: None,
            pw: None,
            reciever: None,
            send: true,
            once_per_experiment: true,
        }
    }
}

impl EmailConfig {
    /// Whether sending is possible: enabled and fully specified.
    pub fn can_send(&self) -> bool {
        self.send && self.sender.is_some() && self.reciever.is_some() && self.pw.is_some()
    }

    /// Read the secret referenced by `pw`, if configured and readable.
    pub fn read_password(&self) -> Option<String> {
        let path = self.pw.as_ref()?;
        match std::fs::read_to_string(path) {
            Ok(pw) => Some(pw.trim().to_string()),
            Err(e) => {
                eprintln!("warning: could not read email secret {}: {e}", path.display());
                None
            }
        }
    }
}

/// One experiment's raw field set, after merging `common_args` with the
/// per-experiment override map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ExperimentSpec {
    experiment_number: Option<u32>,
    model_type: Option<ModelType>,
    dataset: Option<Dataset>,
    prune_method: Option<PruneMethod>,
    prune_compression: Option<f64>,
    finetune_epochs: Option<u32>,
    quantization: Option<u32>,
    model_path: Option<PathBuf>,
    debug: Option<u32>,
    best_model_metric: Option<BestMetric>,
    attack_method: Option<AttackMethod>,
    attack_kwargs: Option<AttackKwargs>,
    email_verbose: Option<bool>,
    save_one_checkpoint: Option<bool>,
    seed: Option<u64>,
}

impl ExperimentSpec {
    fn build(self, index: usize) -> Result<ExperimentDescriptor, ConfigError> {
        let missing = |field| ConfigError::MissingField { index, field };
        let descriptor = ExperimentDescriptor {
            experiment_number: self.experiment_number.ok_or(missing("experiment_number"))?,
            model_type: self.model_type.ok_or(missing("model_type"))?,
            dataset: self.dataset.ok_or(missing("dataset"))?,
            prune_method: self.prune_method,
            prune_compression: self.prune_compression.unwrap_or(1.0),
            finetune_epochs: self.finetune_epochs.unwrap_or(0),
            quantization: self.quantization,
            model_path: self.model_path,
            debug: self.debug,
            best_model_metric: self.best_model_metric,
            attack_method: self.attack_method,
            attack_kwargs: self.attack_kwargs.unwrap_or_default(),
            email_verbose: self.email_verbose.unwrap_or(false),
            save_one_checkpoint: self.save_one_checkpoint.unwrap_or(false),
            seed: self.seed.unwrap_or(42),
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Notification transport settings.
    pub email: EmailConfig,
    /// Root directory for checkpoints and results. Defaults to `experiments`.
    pub root: Option<PathBuf>,
    /// Default values merged into every experiment.
    pub common_args: Mapping,
    /// Ordered list of per-experiment override maps.
    pub experiments: Vec<Value>,
    /// Optional sweep axes, expanded into one entry per combination and
    /// appended after `experiments`.
    pub grid: Option<Mapping>,
}

impl Config {
    /// Load and parse a config file. Validation happens in [`Self::descriptors`].
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_str(&text)
    }

    /// Parse a config document from YAML text.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(text: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Root directory for persisted state.
    pub fn root(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(|| PathBuf::from("experiments"))
    }

    /// Merge, construct, and validate every experiment descriptor, in
    /// declaration order. All-or-nothing: the first error aborts.
    pub fn descriptors(&self) -> Result<Vec<ExperimentDescriptor>, ConfigError> {
        let entries = self.entries()?;
        if entries.is_empty() {
            return Err(ConfigError::NoExperiments);
        }
        entries
            .into_iter()
            .enumerate()
            .map(|(index, overrides)| {
                let merged = merge(&self.common_args, &overrides);
                let spec: ExperimentSpec = serde_yaml::from_value(Value::Mapping(merged))
                    .map_err(|e| ConfigError::Parse(format!("experiment {index}: {e}")))?;
                spec.build(index)
            })
            .collect()
    }

    /// Flat list of override maps: the literal `experiments` entries followed
    /// by every combination the `grid` expands to.
    fn entries(&self) -> Result<Vec<Mapping>, ConfigError> {
        let mut entries = Vec::with_capacity(self.experiments.len());
        for (index, entry) in self.experiments.iter().enumerate() {
            let overrides = entry
                .as_mapping()
                .ok_or(ConfigError::NotAMapping { index })?;
            entries.push(overrides.clone());
        }
        if let Some(grid) = &self.grid {
            entries.extend(generate_permutations(grid));
        }
        Ok(entries)
    }

    /// Validate the whole document without retaining the descriptors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.descriptors().map(|_| ())
    }
}

/// Expand a mapping of sweep axes into every combination of its values.
///
/// A sequence value contributes one entry per element; a scalar value is held
/// fixed across all combinations. Axes combine in declaration order with the
/// last axis varying fastest, so the expansion order is stable. An empty grid
/// expands to nothing.
pub fn generate_permutations(grid: &Mapping) -> Vec<Mapping> {
    if grid.is_empty() {
        return Vec::new();
    }
    let mut combos = vec![Mapping::new()];
    for (key, value) in grid {
        let choices: Vec<Value> = match value {
            Value::Sequence(seq) => seq.clone(),
            other => vec![other.clone()],
        };
        let mut next = Vec::with_capacity(combos.len() * choices.len());
        for combo in &combos {
            for choice in &choices {
                let mut expanded = combo.clone();
                expanded.insert(key.clone(), choice.clone());
                next.push(expanded);
            }
        }
        combos = next;
    }
    combos
}

/// Key-wise merge of defaults and overrides; the override wins on collision.
fn merge(defaults: &Mapping, overrides: &Mapping) -> Mapping {
    let mut merged = defaults.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{PruneCriterion, PruneScope};

    const EXAMPLE: &str = r#"
email:
  sender: lab@example.com
  pw: secrets/email_pw
  reciever: oncall@example.com
  send: true
  once_per_experiment: true
common_args:
  experiment_number: 1
  dataset: CIFAR10
  attack_method: pgd
  attack_kwargs: { eps: 0.00784, eps_iter: 0.001, train: false }
  email_verbose: true
  save_one_checkpoint: true
experiments:
  - { model_type: resnet20, prune_method: RandomPruning,
      prune_compression: 2, finetune_epochs: 40 }
  - { model_type: vgg_bn_drop, prune_method: GlobalMagWeight,
      prune_compression: 4, finetune_epochs: 20, email_verbose: false }
"#;

    #[test]
    fn test_parse_and_build_descriptors() {
        let config = Config::from_str(EXAMPLE).unwrap();
        let descriptors = config.descriptors().unwrap();
        assert_eq!(descriptors.len(), 2);

        let first = &descriptors[0];
        assert_eq!(first.experiment_number, 1);
        assert_eq!(first.model_type, ModelType::Resnet20);
        assert_eq!(first.dataset, Dataset::Cifar10);
        assert_eq!(first.prune_method, Some(PruneMethod::random()));
        assert!((first.prune_compression - 2.0).abs() < f64::EPSILON);
        assert_eq!(first.finetune_epochs, 40);
        assert!(first.email_verbose);
        assert!(first.save_one_checkpoint);
        assert_eq!(first.attack_method, Some(AttackMethod::Pgd));
        assert!(!first.attack_kwargs.train);
        assert_eq!(first.seed, 42);
    }

    #[test]
    fn test_override_wins_over_common_args() {
        let config = Config::from_str(EXAMPLE).unwrap();
        let descriptors = config.descriptors().unwrap();
        // common_args says email_verbose: true, second entry overrides it.
        assert!(descriptors[0].email_verbose);
        assert!(!descriptors[1].email_verbose);
        assert_eq!(
            descriptors[1].prune_method,
            Some(PruneMethod::new(PruneScope::Global, PruneCriterion::Weight))
        );
    }

    #[test]
    fn test_descriptor_construction_is_idempotent() {
        let config = Config::from_str(EXAMPLE).unwrap();
        let once = config.descriptors().unwrap();
        let twice = config.descriptors().unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_missing_model_type_rejected() {
        let config = Config::from_str(
            "common_args: {experiment_number: 1, dataset: CIFAR10}\nexperiments:\n  - {}\n",
        )
        .unwrap();
        assert!(matches!(
            config.descriptors(),
            Err(ConfigError::MissingField { field: "model_type", .. })
        ));
    }

    #[test]
    fn test_incompatible_pairing_rejected_before_execution() {
        let yaml = r#"
common_args: { experiment_number: 1, dataset: CIFAR10 }
experiments:
  - { model_type: vgg_bn_drop_100, prune_method: RandomPruning,
      prune_compression: 2, finetune_epochs: 10 }
"#;
        let config = Config::from_str(yaml).unwrap();
        assert!(matches!(
            config.descriptors(),
            Err(ConfigError::IncompatibleModel { .. })
        ));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = r#"
common_args: { experiment_number: 1, dataset: CIFAR10 }
experiments:
  - { model_type: resnet20, prune_strategy: RandomPruning }
"#;
        let config = Config::from_str(yaml).unwrap();
        assert!(matches!(config.descriptors(), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_unknown_prune_method_rejected() {
        let yaml = r#"
common_args: { experiment_number: 1, dataset: CIFAR10 }
experiments:
  - { model_type: resnet20, prune_method: Lottery,
      prune_compression: 2, finetune_epochs: 10 }
"#;
        let config = Config::from_str(yaml).unwrap();
        assert!(matches!(config.descriptors(), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_grid_expands_every_combination() {
        let yaml = r#"
common_args: { experiment_number: 1, dataset: CIFAR10 }
grid:
  model_type: [resnet20, resnet56]
  prune_method: [RandomPruning, GlobalMagWeight]
  prune_compression: 2
  finetune_epochs: 10
"#;
        let config = Config::from_str(yaml).unwrap();
        let descriptors = config.descriptors().unwrap();
        assert_eq!(descriptors.len(), 4);

        // Declaration order, last axis varying fastest.
        let pairs: Vec<(ModelType, PruneMethod)> = descriptors
            .iter()
            .map(|d| (d.model_type, d.prune_method.unwrap()))
            .collect();
        let weight = PruneMethod::new(PruneScope::Global, PruneCriterion::Weight);
        assert_eq!(
            pairs,
            vec![
                (ModelType::Resnet20, PruneMethod::random()),
                (ModelType::Resnet20, weight),
                (ModelType::Resnet56, PruneMethod::random()),
                (ModelType::Resnet56, weight),
            ]
        );
        // Scalar axes are held fixed across the sweep.
        assert!(descriptors
            .iter()
            .all(|d| (d.prune_compression - 2.0).abs() < f64::EPSILON));
    }

    #[test]
    fn test_grid_entries_follow_literal_experiments() {
        let yaml = r#"
common_args:
  experiment_number: 1
  dataset: CIFAR10
  prune_method: RandomPruning
  prune_compression: 2
  finetune_epochs: 10
experiments:
  - { model_type: mobilenet_v2 }
grid:
  model_type: [resnet20, resnet56]
"#;
        let config = Config::from_str(yaml).unwrap();
        let descriptors = config.descriptors().unwrap();
        let models: Vec<ModelType> = descriptors.iter().map(|d| d.model_type).collect();
        assert_eq!(
            models,
            vec![ModelType::MobileNetV2, ModelType::Resnet20, ModelType::Resnet56]
        );
    }

    #[test]
    fn test_grid_alone_satisfies_the_config() {
        let yaml = r#"
common_args: { experiment_number: 1, dataset: CIFAR10 }
grid:
  model_type: [resnet20]
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.descriptors().unwrap().len(), 1);
    }

    #[test]
    fn test_best_model_metric_parsed() {
        let yaml = r#"
common_args: { experiment_number: 1, dataset: CIFAR10, best_model_metric: accuracy }
experiments:
  - { model_type: resnet20 }
  - { model_type: resnet56, best_model_metric: loss }
"#;
        let config = Config::from_str(yaml).unwrap();
        let descriptors = config.descriptors().unwrap();
        assert_eq!(descriptors[0].best_model_metric, Some(BestMetric::Accuracy));
        assert_eq!(descriptors[1].best_model_metric, Some(BestMetric::Loss));
    }

    #[test]
    fn test_empty_experiment_list_rejected() {
        let config = Config::from_str("common_args: {}\n").unwrap();
        assert!(matches!(config.descriptors(), Err(ConfigError::NoExperiments)));
    }

    #[test]
    fn test_email_defaults() {
        let config = Config::from_str("experiments:\n  - {}\n").unwrap();
        assert!(config.email.send);
        assert!(config.email.once_per_experiment);
        assert!(!config.email.can_send());
    }

    #[test]
    fn test_email_password_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let pw_path = dir.path().join("pw");
        std::fs::write(&pw_path, "hunter2\n").unwrap();

        let email = EmailConfig {
            sender: Some("a@example.com".into()),
            reciever: Some("b@example.com".into()),
            pw: Some(pw_path),
            ..EmailConfig::default()
        };
        assert!(email.can_send());
        assert_eq!(email.read_password().as_deref(), Some("hunter2"));
    }

    #[test]
    fn test_missing_password_file_downgrades() {
        let email = EmailConfig {
            sender: Some("a@example.com".into()),
            reciever: Some("b@example.com".into()),
            pw: Some(PathBuf::from("/nonexistent/pw")),
            ..EmailConfig::default()
        };
        assert!(email.read_password().is_none());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Merging is deterministic and the override always wins.
        #[test]
        fn override_always_wins(default_val in 0u32..1000, override_val in 0u32..1000) {
            let mut defaults = Mapping::new();
            defaults.insert("finetune_epochs".into(), default_val.into());
            let mut overrides = Mapping::new();
            overrides.insert("finetune_epochs".into(), override_val.into());

            let merged = merge(&defaults, &overrides);
            prop_assert_eq!(
                merged.get(Value::from("finetune_epochs")),
                Some(&Value::from(override_val))
            );
            // Idempotent: merging again changes nothing.
            prop_assert_eq!(merge(&merged, &overrides), merged);
        }

        /// A grid expands to exactly the product of its axis lengths.
        #[test]
        fn grid_size_is_product_of_axes(a in 1usize..5, b in 1usize..5) {
            let mut grid = Mapping::new();
            grid.insert(
                "seed".into(),
                Value::Sequence((0..a).map(|i| Value::from(i as u64)).collect()),
            );
            grid.insert(
                "finetune_epochs".into(),
                Value::Sequence((0..b).map(|i| Value::from(i as u64)).collect()),
            );
            prop_assert_eq!(generate_permutations(&grid).len(), a * b);
        }
    }
}
