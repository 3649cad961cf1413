//! Architecture catalog, dataset tags, and attack parameters

use serde::{Deserialize, Serialize};

/// Dataset tag an experiment trains and evaluates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dataset {
    #[serde(rename = "CIFAR10")]
    Cifar10,
    #[serde(rename = "CIFAR100")]
    Cifar100,
}

impl Dataset {
    /// Number of label classes in the dataset.
    pub fn num_classes(&self) -> usize {
        match self {
            Dataset::Cifar10 => 10,
            Dataset::Cifar100 => 100,
        }
    }

    /// Canonical name as it appears in config files.
    pub fn name(&self) -> &'static str {
        match self {
            Dataset::Cifar10 => "CIFAR10",
            Dataset::Cifar100 => "CIFAR100",
        }
    }
}

impl std::fmt::Display for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Model architecture catalog.
///
/// Each architecture is tagged with the datasets it is compatible with; an
/// incompatible pairing is a configuration error caught before any execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    VggBnDrop,
    #[serde(rename = "vgg_bn_drop_100")]
    VggBnDrop100,
    Resnet20,
    Resnet56,
    #[serde(rename = "googlenet")]
    GoogLeNet,
    #[serde(rename = "mobilenet_v2")]
    MobileNetV2,
}

impl ModelType {
    /// Whether this architecture's classifier head matches the dataset.
    pub fn compatible_with(&self, dataset: Dataset) -> bool {
        match self {
            ModelType::VggBnDrop100 => dataset == Dataset::Cifar100,
            ModelType::VggBnDrop => dataset == Dataset::Cifar10,
            // The remaining heads are built per-dataset.
            ModelType::Resnet20
            | ModelType::Resnet56
            | ModelType::GoogLeNet
            | ModelType::MobileNetV2 => true,
        }
    }

    /// Canonical lowercase name, used in folder names and checkpoint tags.
    pub fn name(&self) -> &'static str {
        match self {
            ModelType::VggBnDrop => "vgg_bn_drop",
            ModelType::VggBnDrop100 => "vgg_bn_drop_100",
            ModelType::Resnet20 => "resnet20",
            ModelType::Resnet56 => "resnet56",
            ModelType::GoogLeNet => "googlenet",
            ModelType::MobileNetV2 => "mobilenet_v2",
        }
    }

    /// Default number of from-scratch training epochs for this architecture.
    ///
    /// Debug mode overrides this to 1.
    pub fn default_train_epochs(&self) -> u32 {
        match self {
            ModelType::Resnet20 | ModelType::Resnet56 => 30,
            ModelType::VggBnDrop | ModelType::VggBnDrop100 => 20,
            ModelType::GoogLeNet | ModelType::MobileNetV2 => 25,
        }
    }

    /// Default learning rate for this architecture.
    pub fn default_lr(&self) -> f32 {
        match self {
            ModelType::MobileNetV2 => 0.05,
            _ => 0.1,
        }
    }
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Checkpoint-selection metric for training and fine-tuning.
///
/// When set, each epoch's model is evaluated on the held-out split and the
/// best-scoring epoch snapshot is kept instead of the last one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BestMetric {
    /// Highest held-out accuracy wins.
    Accuracy,
    /// Lowest held-out loss wins.
    Loss,
}

impl std::fmt::Display for BestMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BestMetric::Accuracy => f.write_str("accuracy"),
            BestMetric::Loss => f.write_str("loss"),
        }
    }
}

/// Adversarial attack method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttackMethod {
    /// Projected gradient descent (iterative bounded perturbation).
    Pgd,
}

impl std::fmt::Display for AttackMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttackMethod::Pgd => f.write_str("pgd"),
        }
    }
}

fn default_eps() -> f64 {
    2.0 / 255.0
}

fn default_eps_iter() -> f64 {
    1e-3
}

fn default_nb_iter() -> u32 {
    5
}

/// Attack-specific scalars passed through to the attack collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttackKwargs {
    /// Perturbation bound (L-infinity radius).
    #[serde(default = "default_eps")]
    pub eps: f64,
    /// Per-iteration step size.
    #[serde(default = "default_eps_iter")]
    pub eps_iter: f64,
    /// Number of attack iterations.
    #[serde(default = "default_nb_iter")]
    pub nb_iter: u32,
    /// Attack the training split instead of the test split.
    #[serde(default)]
    pub train: bool,
}

impl Default for AttackKwargs {
    fn default() -> Self {
        Self {
            eps: default_eps(),
            eps_iter: default_eps_iter(),
            nb_iter: default_nb_iter(),
            train: false,
        }
    }
}
