//! Compute-budget objective.
//!
//! ```text
//! total = task + penalty + similarity
//!
//! task        label-smoothed CE (classifier families) or 0
//! penalty     weight · relu((F - T) / T)²            (0 while warm-up holds it off)
//! similarity  alpha · (1 - mean cos(features, features_full))
//! ```

use tch::{Kind, Reduction, Tensor};

use diffrate_core::budget::penalty_active;
use diffrate_core::config::DiffRateConfig;

use crate::model::ModelOutput;

/// Scalar parts of one loss evaluation, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossBreakdown {
    /// Classification term.
    pub task: f64,
    /// Budget overshoot term.
    pub penalty: f64,
    /// Feature-preservation term.
    pub similarity: f64,
    /// Sum of the three.
    pub total: f64,
    /// Expected GFLOPs of the pass.
    pub flops: f64,
}

/// Combined objective for the controllers.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionLoss {
    target_flops: f64,
    penalty_weight: f64,
    alpha: f64,
    smoothing: f64,
    warmup: bool,
    task_loss: bool,
}

impl CompressionLoss {
    /// Loss for `config`; `task_loss` is false for similarity-only families.
    pub fn new(config: &DiffRateConfig, task_loss: bool) -> Self {
        CompressionLoss {
            target_flops: config.target_flops,
            penalty_weight: config.flops_penalty_weight,
            alpha: config.alpha,
            smoothing: config.smoothing,
            warmup: config.warmup_compression_rate,
            task_loss,
        }
    }

    /// Budget target in GFLOPs.
    pub fn target_flops(&self) -> f64 {
        self.target_flops
    }

    /// `weight · relu((flops - target) / target)²`, or zero when inactive.
    pub fn penalty(&self, flops: &Tensor, epoch: usize) -> Tensor {
        if !penalty_active(epoch, self.warmup) {
            return flops * 0.0;
        }
        let excess = ((flops - self.target_flops) / self.target_flops).relu();
        excess.square() * self.penalty_weight
    }

    /// `alpha · (1 - mean cosine)`; `reference` is treated as a constant.
    pub fn similarity(&self, features: &Tensor, reference: &Tensor) -> Tensor {
        let cos = Tensor::cosine_similarity(features, &reference.detach(), -1, 1e-8);
        (1.0 - cos.mean(Kind::Float)) * self.alpha
    }

    /// Label-smoothed cross entropy, or zero.
    pub fn task(&self, logits: &Tensor, targets: &Tensor) -> Tensor {
        if !self.task_loss {
            return logits.zeros_like().sum(Kind::Float);
        }
        logits.cross_entropy_loss::<Tensor>(targets, None, Reduction::Mean, -100, self.smoothing)
    }

    /// Total loss for a compressed pass against the full-model reference.
    pub fn compute(
        &self,
        output: &ModelOutput,
        reference: &ModelOutput,
        targets: &Tensor,
        epoch: usize,
    ) -> (Tensor, LossBreakdown) {
        let task = self.task(&output.logits, targets);
        let penalty = self.penalty(&output.flops, epoch);
        let similarity = self.similarity(&output.features, &reference.features);
        let total = &task + &penalty + &similarity;
        let breakdown = LossBreakdown {
            task: task.double_value(&[]),
            penalty: penalty.double_value(&[]),
            similarity: similarity.double_value(&[]),
            total: total.double_value(&[]),
            flops: output.flops.double_value(&[]),
        };
        (total, breakdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use tch::Device;

    fn loss(warmup: bool) -> CompressionLoss {
        let config = DiffRateConfig { target_flops: 2.0, warmup_compression_rate: warmup, ..Default::default() };
        CompressionLoss::new(&config, true)
    }

    fn scalar(v: f64) -> Tensor {
        Tensor::scalar_tensor(v, (Kind::Float, Device::Cpu))
    }

    #[test]
    fn penalty_is_zero_under_budget_and_grows_above() {
        let l = loss(false);
        assert_eq!(l.penalty(&scalar(1.5), 0).double_value(&[]), 0.0);
        let over = l.penalty(&scalar(3.0), 0).double_value(&[]);
        assert_relative_eq!(over, 5.0 * 0.25, epsilon = 1e-6);
        assert!(l.penalty(&scalar(4.0), 0).double_value(&[]) > over);
    }

    #[test]
    fn warmup_disables_penalty_in_first_epoch() {
        let l = loss(true);
        assert_eq!(l.penalty(&scalar(3.0), 0).double_value(&[]), 0.0);
        assert!(l.penalty(&scalar(3.0), 1).double_value(&[]) > 0.0);
    }

    #[test]
    fn identical_features_cost_nothing() {
        let l = loss(false);
        let f = Tensor::randn([4, 8], (Kind::Float, Device::Cpu));
        assert!(l.similarity(&f, &f).double_value(&[]).abs() < 1e-2);
        assert!(l.similarity(&f, &(-&f)).double_value(&[]) > 9_000.0);
    }

    #[test]
    fn similarity_only_family_has_zero_task_loss() {
        let l = CompressionLoss::new(&DiffRateConfig::default(), false);
        let logits = Tensor::randn([2, 5], (Kind::Float, Device::Cpu));
        let targets = Tensor::from_slice(&[0i64, 3]);
        assert_eq!(l.task(&logits, &targets).double_value(&[]), 0.0);
        assert!(loss(false).task(&logits, &targets).double_value(&[]) > 0.0);
    }
}
