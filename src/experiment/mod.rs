//! Experiment descriptors and the model/method catalog
//!
//! An [`ExperimentDescriptor`] is an immutable value describing one
//! compression run: which architecture, which pruning method, how hard to
//! compress, how long to fine-tune, and which adversarial attack to measure the
//! result with. Descriptors are only constructed by merging the config's
//! `common_args` defaults with a per-experiment override map; see
//! [`crate::config`].

mod catalog;
mod descriptor;
mod method;

pub use catalog::{AttackKwargs, AttackMethod, BestMetric, Dataset, ModelType};
pub use descriptor::ExperimentDescriptor;
pub use method::{PruneCriterion, PruneMethod, PruneScope};
