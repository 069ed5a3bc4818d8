//! Resumable training checkpoints.
//!
//! Layout of `<output_dir>/checkpoint-<global_step>/`:
//!
//! ```text
//! unet/model.mpk          trained weights
//! unet_ema/model.mpk      EMA shadow weights (EMA runs only)
//! optimizer.mpk           optimizer state
//! training_state.json     step counters, see TrainingState
//! ```
//!
//! A checkpoint is written into a temporary sibling directory and renamed
//! into place, so a directory named `checkpoint-<n>` is always complete.

use std::fs;
use std::path::{Path, PathBuf};

use burn::module::{AutodiffModule, Module};
use burn::optim::Optimizer;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;

use super::TrainingState;
use crate::ema::ExponentialMovingAverage;
use crate::error::{DdpmError, Result};

pub const CHECKPOINT_PREFIX: &str = "checkpoint-";
const STATE_FILE: &str = "training_state.json";

type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

pub fn checkpoint_dir_name(step: usize) -> String {
    format!("{CHECKPOINT_PREFIX}{step}")
}

/// Step encoded in a checkpoint directory name, if it is one.
pub fn parse_checkpoint_step(name: &str) -> Option<usize> {
    name.strip_prefix(CHECKPOINT_PREFIX)?.parse().ok()
}

/// Finds, resolves and prunes checkpoint directories below a run directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    root: PathBuf,
    total_limit: Option<usize>,
}

impl CheckpointManager {
    pub fn new(root: impl Into<PathBuf>, total_limit: Option<usize>) -> Self {
        Self {
            root: root.into(),
            total_limit,
        }
    }

    pub fn path_for(&self, step: usize) -> PathBuf {
        self.root.join(checkpoint_dir_name(step))
    }

    /// All complete checkpoints, oldest first.
    pub fn list(&self) -> Result<Vec<(usize, PathBuf)>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut found: Vec<(usize, PathBuf)> = fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                parse_checkpoint_step(&name).map(|step| (step, entry.path()))
            })
            .collect();
        found.sort_by_key(|(step, _)| *step);
        Ok(found)
    }

    /// Checkpoint with the largest step.
    pub fn latest(&self) -> Result<Option<(usize, PathBuf)>> {
        Ok(self.list()?.pop())
    }

    /// Resolve `"latest"` or a checkpoint name/path to an existing checkpoint below the root.
    ///
    /// Only the last path component of `target` is considered.
    pub fn resolve(&self, target: &str) -> Result<Option<(usize, PathBuf)>> {
        if target == "latest" {
            return self.latest();
        }
        let name = Path::new(target)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(target);
        let Some(step) = parse_checkpoint_step(name) else {
            return Ok(None);
        };
        let dir = self.root.join(name);
        Ok(dir.is_dir().then_some((step, dir)))
    }

    /// Delete the oldest checkpoints beyond the retention limit.
    pub fn prune(&self) -> Result<Vec<PathBuf>> {
        let Some(limit) = self.total_limit else {
            return Ok(Vec::new());
        };
        let mut found = self.list()?;
        let mut removed = Vec::new();
        while found.len() > limit {
            let (step, path) = found.remove(0);
            match fs::remove_dir_all(&path) {
                Ok(()) => {
                    tracing::info!("removed old checkpoint {}", path.display());
                    removed.push(path);
                }
                Err(err) => tracing::warn!("failed to remove old checkpoint {step}: {err}"),
            }
        }
        Ok(removed)
    }

    /// Write a complete checkpoint for `state.global_step`, then apply retention.
    pub fn save<B, M, O>(
        &self,
        model: &M,
        optimizer: &O,
        ema: Option<&ExponentialMovingAverage<B::InnerBackend>>,
        state: &TrainingState,
    ) -> Result<PathBuf>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let target = self.path_for(state.global_step);
        let staging = self.root.join(format!("{}.tmp", checkpoint_dir_name(state.global_step)));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(staging.join("unet"))?;

        let recorder = CheckpointRecorder::new();
        model.clone().save_file(staging.join("unet").join("model"), &recorder)?;
        if let Some(ema) = ema {
            fs::create_dir_all(staging.join("unet_ema"))?;
            ema.shadow_module(&model.valid())
                .save_file(staging.join("unet_ema").join("model"), &recorder)?;
        }
        recorder.record(optimizer.to_record(), staging.join("optimizer"))?;
        fs::write(staging.join(STATE_FILE), serde_json::to_string_pretty(state)?)?;

        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::rename(&staging, &target)?;
        tracing::info!("saved state to {}", target.display());
        self.prune()?;
        Ok(target)
    }
}

/// Everything restored from a checkpoint directory.
pub struct LoadedCheckpoint<B: AutodiffBackend, M: AutodiffModule<B>, O> {
    pub model: M,
    pub optimizer: O,
    /// EMA shadow weights, when the checkpoint carries them.
    pub ema_shadow: Option<M::InnerModule>,
    pub state: TrainingState,
}

/// Restore a checkpoint written by [`CheckpointManager::save`].
///
/// `model` and `optimizer` are only templates; nothing is modified on failure.
pub fn load_checkpoint<B, M, O>(
    dir: &Path,
    model: &M,
    optimizer: &O,
    device: &B::Device,
) -> Result<LoadedCheckpoint<B, M, O>>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let resume_err = |reason: String| DdpmError::Resume {
        checkpoint: dir.display().to_string(),
        reason,
    };
    let state_path = dir.join(STATE_FILE);
    if !state_path.is_file() {
        return Err(resume_err(format!("missing {STATE_FILE}")));
    }
    let state: TrainingState = serde_json::from_str(&fs::read_to_string(state_path)?)?;

    let recorder = CheckpointRecorder::new();
    let model = model.clone().load_file(dir.join("unet").join("model"), &recorder, device)?;
    let record = recorder.load(dir.join("optimizer"), device)?;
    let optimizer = optimizer.clone().load_record(record);

    let ema_path = dir.join("unet_ema").join("model");
    let ema_shadow = if ema_path.with_extension("mpk").is_file() {
        Some(model.valid().load_file(ema_path, &recorder, device)?)
    } else {
        None
    };

    Ok(LoadedCheckpoint {
        model,
        optimizer,
        ema_shadow,
        state,
    })
}
