//! Per-epoch cosine learning-rate schedule for the controller parameters.
//!
//! ```text
//! cycle i      = ⌊t / t_initial⌋
//! lr_max(i)    = base_lr · cycle_decay^i
//! lr(t)        = lr_min + ½ (lr_max(i) - lr_min) (1 + cos(π · (t mod t_initial) / t_initial))
//! lr(t)        = lr_min                         once i >= cycle_limit
//! ```
//!
//! The trainer calls [`CosineScheduler::step`] with `epoch + 1` after each
//! epoch; the value is part of the checkpoint so a resumed run continues on
//! the same curve.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Cosine annealing with optional decayed restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CosineScheduler {
    base_lr: f64,
    lr_min: f64,
    t_initial: usize,
    cycle_decay: f64,
    cycle_limit: usize,
    last_epoch: usize,
}

/// Serializable scheduler state stored in checkpoints.
pub type SchedulerState = CosineScheduler;

impl CosineScheduler {
    /// Single-cycle schedule from `base_lr` to `lr_min` over `t_initial` epochs.
    pub fn new(base_lr: f64, lr_min: f64, t_initial: usize) -> Self {
        CosineScheduler { base_lr, lr_min, t_initial: t_initial.max(1), cycle_decay: 1.0, cycle_limit: 1, last_epoch: 0 }
    }

    /// Scale the peak of each restart by `decay`.
    pub fn with_cycle_decay(mut self, decay: f64) -> Self {
        self.cycle_decay = decay;
        self
    }

    /// Allow `limit` cycles before settling at `lr_min`.
    pub fn with_cycle_limit(mut self, limit: usize) -> Self {
        self.cycle_limit = limit.max(1);
        self
    }

    /// Learning rate at epoch `t`.
    #[must_use]
    pub fn lr_at(&self, t: usize) -> f64 {
        let cycle = t / self.t_initial;
        if cycle >= self.cycle_limit {
            return self.lr_min;
        }
        let t_curr = (t % self.t_initial) as f64;
        let lr_max = self.base_lr * self.cycle_decay.powi(cycle as i32);
        self.lr_min + 0.5 * (lr_max - self.lr_min) * (1.0 + (PI * t_curr / self.t_initial as f64).cos())
    }

    /// Move to `epoch` and return its learning rate.
    pub fn step(&mut self, epoch: usize) -> f64 {
        self.last_epoch = epoch;
        self.current_lr()
    }

    /// Learning rate of the last epoch passed to [`step`](Self::step).
    #[must_use]
    pub fn current_lr(&self) -> f64 {
        self.lr_at(self.last_epoch)
    }

    /// Last epoch passed to [`step`](Self::step).
    #[must_use]
    pub fn last_epoch(&self) -> usize {
        self.last_epoch
    }

    /// Snapshot for checkpointing.
    pub fn state(&self) -> SchedulerState {
        self.clone()
    }

    /// Restore from a checkpoint snapshot.
    pub fn load_state(&mut self, state: SchedulerState) {
        *self = state;
    }
}
