//! Training checkpoints.
//!
//! A [`Checkpoint`] captures everything needed to continue a search: the
//! model state dict (backbone and controller logits), the controller
//! optimizer's moments, the LR scheduler, the loss scaler, the epoch just
//! finished and the configuration snapshot. Files are `bincode`-encoded and
//! replaced atomically (write to `*.tmp`, then rename).

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::{DiffRateConfig, BEST_CHECKPOINT_FILE, CHECKPOINT_FILE};
use crate::error::CheckpointError;
use crate::schedule::SchedulerState;
use crate::state_dict::StateDict;

// ---------------------------------------------------------------------------
// State records
// ---------------------------------------------------------------------------

/// AdamW state keyed by parameter name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    /// Number of optimizer steps taken.
    pub step: u64,
    /// Learning rate in effect when the state was captured.
    pub lr: f64,
    /// First moments.
    pub exp_avg: StateDict,
    /// Second moments.
    pub exp_avg_sq: StateDict,
}

/// Dynamic loss-scaler state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossScalerState {
    /// Current scale applied to the loss before backward.
    pub scale: f64,
    /// Multiplier applied after `growth_interval` clean steps.
    pub growth_factor: f64,
    /// Multiplier applied after a non-finite gradient.
    pub backoff_factor: f64,
    /// Clean steps required before growing the scale.
    pub growth_interval: usize,
    /// Clean steps since the last change.
    pub growth_tracker: usize,
}

impl Default for LossScalerState {
    fn default() -> Self {
        LossScalerState {
            scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            growth_tracker: 0,
        }
    }
}

/// Complete training state after an epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Epoch that produced this state (the next run starts at `epoch + 1`).
    pub epoch: usize,
    /// Model parameters, including the controller logits.
    pub model: StateDict,
    /// Controller optimizer.
    pub optimizer: Option<OptimizerState>,
    /// Learning-rate scheduler.
    pub scheduler: Option<SchedulerState>,
    /// Loss scaler.
    pub scaler: Option<LossScalerState>,
    /// Lowest evaluation loss seen so far.
    pub min_loss: Option<f64>,
    /// Configuration of the run that wrote the checkpoint.
    pub config: DiffRateConfig,
}

impl Checkpoint {
    /// Model-only checkpoint (no optimizer, scheduler or scaler state).
    pub fn model_only(epoch: usize, model: StateDict, config: DiffRateConfig) -> Self {
        Checkpoint { epoch, model, optimizer: None, scheduler: None, scaler: None, min_loss: None, config }
    }

    /// Epoch the resumed run starts from.
    pub fn next_epoch(&self) -> usize {
        self.epoch + 1
    }

    /// Encode to `path`, replacing any existing file atomically.
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| CheckpointError::io(parent, e))?;
        }
        let bytes = bincode::serialize(self).map_err(|e| CheckpointError::codec(path, e))?;
        let tmp = tmp_path(path);
        fs::write(&tmp, &bytes).map_err(|e| CheckpointError::io(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| CheckpointError::io(path, e))?;
        debug!("saved checkpoint for epoch {} ({} bytes) to {}", self.epoch, bytes.len(), path.display());
        Ok(())
    }

    /// Decode from `path`.
    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let bytes = fs::read(path).map_err(|e| CheckpointError::io(path, e))?;
        let ckpt: Checkpoint = bincode::deserialize(&bytes).map_err(|e| CheckpointError::codec(path, e))?;
        info!("loaded checkpoint from {} (epoch {})", path.display(), ckpt.epoch);
        Ok(ckpt)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Rolling and best checkpoints inside one output directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    min_loss: Option<f64>,
}

impl CheckpointManager {
    /// Manager rooted at `dir` (created on first save).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        CheckpointManager { dir: dir.into(), min_loss: None }
    }

    /// Continue tracking the best loss of a resumed run.
    pub fn with_min_loss(mut self, min_loss: Option<f64>) -> Self {
        self.min_loss = min_loss;
        self
    }

    /// `dir/checkpoint.bin`.
    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    /// `dir/model_best.bin`.
    pub fn best_path(&self) -> PathBuf {
        self.dir.join(BEST_CHECKPOINT_FILE)
    }

    /// Lowest loss recorded so far.
    pub fn min_loss(&self) -> Option<f64> {
        self.min_loss
    }

    /// Write the rolling checkpoint.
    pub fn save_latest(&self, ckpt: &Checkpoint) -> Result<PathBuf, CheckpointError> {
        let path = self.latest_path();
        ckpt.save(&path)?;
        Ok(path)
    }

    /// Record `loss`; when it is a new minimum and `is_main` is set, copy the
    /// rolling checkpoint to the best-checkpoint path.
    ///
    /// Returns whether `loss` improved on the previous minimum. A non-finite
    /// loss never counts as an improvement.
    pub fn update_best(&mut self, loss: f64, is_main: bool) -> Result<bool, CheckpointError> {
        let improved = loss.is_finite() && self.min_loss.map_or(true, |m| loss < m);
        if !improved {
            return Ok(false);
        }
        self.min_loss = Some(loss);
        if is_main {
            let (src, dst) = (self.latest_path(), self.best_path());
            let tmp = tmp_path(&dst);
            fs::copy(&src, &tmp).map_err(|e| CheckpointError::io(&src, e))?;
            fs::rename(&tmp, &dst).map_err(|e| CheckpointError::io(&dst, e))?;
            info!("new best loss {loss:.4}; copied checkpoint to {}", dst.display());
        }
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};
    use tempfile::tempdir;

    fn sample() -> Checkpoint {
        let mut model = StateDict::new();
        model.insert("blocks.0.prune.logits", ArrayD::from_elem(IxDyn(&[5]), 0.25));
        model.insert("pos_embed", ArrayD::zeros(IxDyn(&[1, 5, 4])));
        let mut ckpt = Checkpoint::model_only(7, model.clone(), DiffRateConfig::default());
        ckpt.optimizer = Some(OptimizerState { step: 42, lr: 0.003, exp_avg: model.clone(), exp_avg_sq: model });
        ckpt.scheduler = Some(crate::schedule::CosineScheduler::new(0.01, 0.001, 300));
        ckpt.scaler = Some(LossScalerState::default());
        ckpt.min_loss = Some(1.5);
        ckpt
    }

    #[test]
    fn save_load_round_trip() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("nested").join("checkpoint.bin");
        let ckpt = sample();
        ckpt.save(&path).unwrap();
        assert!(!tmp_path(&path).exists());
        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded, ckpt);
        assert_eq!(loaded.next_epoch(), 8);
    }

    #[test]
    fn corrupt_file_is_a_codec_error() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("checkpoint.bin");
        fs::write(&path, [1u8, 2, 3]).unwrap();
        assert!(matches!(Checkpoint::load(&path), Err(CheckpointError::Codec { .. })));
    }

    #[test]
    fn best_copy_only_on_improvement_and_main_rank() {
        let tmp = tempdir().unwrap();
        let mut mgr = CheckpointManager::new(tmp.path());
        mgr.save_latest(&sample()).unwrap();

        assert!(mgr.update_best(2.0, true).unwrap());
        assert!(mgr.best_path().exists());
        assert!(!mgr.update_best(3.0, true).unwrap());
        assert!(!mgr.update_best(f64::NAN, true).unwrap());
        assert_eq!(mgr.min_loss(), Some(2.0));

        let other = tempdir().unwrap();
        let mut worker = CheckpointManager::new(other.path());
        worker.save_latest(&sample()).unwrap();
        assert!(worker.update_best(1.0, false).unwrap());
        assert!(!worker.best_path().exists());
    }
}
