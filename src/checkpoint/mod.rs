//! Checkpoint persistence between stages and across restarts
//!
//! One checkpoint file per `(experiment_number, model_type, prune_method,
//! stage)` tag, plus a small per-descriptor manifest recording completed
//! stages, so a restarted orchestrator resumes from the last completed stage
//! instead of repeating prior work.
//!
//! Writes are atomic at the filesystem boundary: serialize to a `.tmp`
//! sibling, then rename. A concurrent `load` never observes partial state.
//! With `save_one_checkpoint`, each save removes the descriptor's other
//! checkpoint files after the rename, bounding disk use to one file.

use crate::backend::{Model, OptimizerState};
use crate::experiment::{ExperimentDescriptor, ModelType, PruneMethod};
use crate::runner::RunState;
use crate::stage::StageKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint serialization: {0}")]
    Serde(String),

    #[error("checkpoint {file} is corrupt: digest mismatch")]
    DigestMismatch { file: String },
}

/// Deterministic checkpoint identity.
///
/// Derived entirely from descriptor fields plus the stage name, so a
/// restarted orchestrator computes the same tag and finds the same file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointTag {
    pub experiment_number: u32,
    pub model_type: ModelType,
    pub prune_method: Option<PruneMethod>,
    pub stage: StageKind,
}

impl CheckpointTag {
    pub fn new(descriptor: &ExperimentDescriptor, stage: StageKind) -> Self {
        Self {
            experiment_number: descriptor.experiment_number,
            model_type: descriptor.model_type,
            prune_method: descriptor.prune_method,
            stage,
        }
    }

    /// File name inside the descriptor's checkpoint directory.
    pub fn file_name(&self) -> String {
        format!("checkpoint_{}.json", self.stage)
    }
}

impl std::fmt::Display for CheckpointTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prune = self.prune_method.map(|m| m.name()).unwrap_or("none");
        write!(
            f,
            "exp{}_{}_{}_{}",
            self.experiment_number, self.model_type, prune, self.stage
        )
    }
}

/// Persisted snapshot of one stage boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub tag: String,
    pub model: Model,
    pub optimizer: OptimizerState,
    pub run_state: RunState,
    pub saved_at: DateTime<Utc>,
}

/// One manifest record per checkpoint file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub file: String,
    pub sha256: String,
    pub saved_at: DateTime<Utc>,
}

/// Per-descriptor manifest: completed stages plus live checkpoint files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub descriptor: String,
    /// Stages completed for this descriptor, in completion order. Survives
    /// checkpoint file removal under `save_one_checkpoint`.
    pub completed: Vec<StageKind>,
    /// Live checkpoint files, keyed by stage name.
    pub checkpoints: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    pub fn is_completed(&self, stage: StageKind) -> bool {
        self.completed.contains(&stage)
    }
}

/// Persists and restores model/optimizer/run state for one descriptor.
pub struct CheckpointManager {
    dir: PathBuf,
    descriptor: String,
    save_one: bool,
}

const MANIFEST_FILE: &str = "manifest.json";

impl CheckpointManager {
    /// Open (creating directories as needed) the checkpoint namespace for a
    /// descriptor: `<root>/experiment_<n>/<dataset>/<descriptor_name>/`.
    ///
    /// The dataset is its own path level: the descriptor name encodes the
    /// architecture and compression settings but not the dataset, and two
    /// runs of one architecture on different datasets must never share a
    /// manifest (the resumed model would carry the wrong classifier head).
    pub fn for_descriptor(
        root: &Path,
        descriptor: &ExperimentDescriptor,
    ) -> Result<Self, CheckpointError> {
        let dir = root
            .join(format!("experiment_{}", descriptor.experiment_number))
            .join(descriptor.dataset.name())
            .join(descriptor.name());
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            descriptor: descriptor.name(),
            save_one: descriptor.save_one_checkpoint,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Atomically persist a stage-boundary snapshot and record the stage as
    /// completed in the manifest.
    pub fn save(
        &self,
        tag: &CheckpointTag,
        model: &Model,
        optimizer: &OptimizerState,
        run_state: &RunState,
    ) -> Result<PathBuf, CheckpointError> {
        let checkpoint = Checkpoint {
            tag: tag.to_string(),
            model: model.clone(),
            optimizer: optimizer.clone(),
            run_state: run_state.clone(),
            saved_at: Utc::now(),
        };
        let json = serde_json::to_string(&checkpoint)
            .map_err(|e| CheckpointError::Serde(e.to_string()))?;

        let file = tag.file_name();
        let path = self.dir.join(&file);
        let tmp = self.dir.join(format!("{file}.tmp"));
        fs::write(&tmp, &json)?;
        fs::rename(&tmp, &path)?;

        let mut manifest = self.manifest()?;
        manifest.descriptor = self.descriptor.clone();
        if !manifest.is_completed(tag.stage) {
            manifest.completed.push(tag.stage);
        }
        if self.save_one {
            self.remove_other_checkpoints(&file)?;
            manifest.checkpoints.retain(|_, entry| entry.file == file);
        }
        manifest.checkpoints.insert(
            tag.stage.name().to_string(),
            ManifestEntry {
                file,
                sha256: hex_digest(json.as_bytes()),
                saved_at: checkpoint.saved_at,
            },
        );
        self.store_manifest(&manifest)?;
        Ok(path)
    }

    /// Load the checkpoint for a tag, verifying its digest against the
    /// manifest. `Ok(None)` when no such checkpoint exists.
    pub fn load(&self, tag: &CheckpointTag) -> Result<Option<Checkpoint>, CheckpointError> {
        self.load_file(&tag.file_name())
    }

    /// The last completed stage that still has a live checkpoint file.
    pub fn latest(&self) -> Result<Option<(StageKind, Checkpoint)>, CheckpointError> {
        let manifest = self.manifest()?;
        for &stage in manifest.completed.iter().rev() {
            if let Some(entry) = manifest.checkpoints.get(stage.name()) {
                if let Some(checkpoint) = self.load_file(&entry.file)? {
                    return Ok(Some((stage, checkpoint)));
                }
            }
        }
        Ok(None)
    }

    /// The descriptor's manifest; empty default when none was written yet.
    pub fn manifest(&self) -> Result<Manifest, CheckpointError> {
        let path = self.dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(Manifest::default());
        }
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| CheckpointError::Serde(e.to_string()))
    }

    /// Checkpoint files currently on disk for this descriptor.
    pub fn checkpoint_files(&self) -> Result<Vec<PathBuf>, CheckpointError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.starts_with("checkpoint_") && name.ends_with(".json") {
                    files.push(path);
                }
            }
        }
        files.sort();
        Ok(files)
    }

    fn load_file(&self, file: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.dir.join(file);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        let manifest = self.manifest()?;
        if let Some(entry) = manifest.checkpoints.values().find(|e| e.file == file) {
            if entry.sha256 != hex_digest(text.as_bytes()) {
                return Err(CheckpointError::DigestMismatch { file: file.to_string() });
            }
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| CheckpointError::Serde(e.to_string()))
    }

    fn store_manifest(&self, manifest: &Manifest) -> Result<(), CheckpointError> {
        let json = serde_json::to_string_pretty(manifest)
            .map_err(|e| CheckpointError::Serde(e.to_string()))?;
        let path = self.dir.join(MANIFEST_FILE);
        let tmp = self.dir.join(format!("{MANIFEST_FILE}.tmp"));
        fs::write(&tmp, json)?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    fn remove_other_checkpoints(&self, keep: &str) -> Result<(), CheckpointError> {
        for path in self.checkpoint_files()? {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if name != keep {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
