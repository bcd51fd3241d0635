//! Token Budget Controller: learnable kept-count decisions.
//!
//! Every block owns two [`DecisionStage`]s (prune, merge). A stage holds one
//! logit per kept-count candidate and turns it into a [`StageDecision`]
//! through a single entry point, [`DecisionStage::decide`]:
//!
//! ```text
//! Soft:  p = softmax(logits)
//!        survival[i] = Σ_{c > i} p_c                  (probability position i is kept)
//!        kept        = argmax candidate, clamped to tokens_in
//!        keep mask   = 1 - survival.detach() + survival   on [0, kept)    (value 1, grad +ds)
//!        merge wts   = 1 - (survival - survival.detach()) on merged tail  (value 1, grad -ds)
//!        expected    = min(Σ p_c · c, tokens_in)    (merge: also <= expected prune)
//! Hard:  kept only; expected is the constant kept count.
//! ```
//!
//! Fixed schedules build a [`StageDecision`] directly with
//! [`StageDecision::fixed`], so the block sees the same structure in every
//! mode.

use std::sync::Arc;
use tch::{nn, Device, Kind, Tensor};

use diffrate_core::budget::KeptCandidates;

use crate::error::TrainResult;

/// How a learned stage produces its decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecideMode {
    /// Differentiable relaxation used during the search.
    Soft,
    /// Argmax decision used for evaluation and materialization.
    Hard,
}

// ---------------------------------------------------------------------------
// StageDecision
// ---------------------------------------------------------------------------

/// Outcome of one prune or merge stage.
#[derive(Debug)]
pub struct StageDecision {
    /// Tokens kept after the stage.
    pub kept: usize,
    /// Survival curve over the stage's input positions (soft mode only).
    survival: Option<Tensor>,
    /// Expected kept count, a scalar. Differentiable in soft mode.
    pub expected: Tensor,
}

impl StageDecision {
    /// Decision with a fixed count and no gradient path.
    pub fn fixed(kept: usize, device: Device) -> Self {
        StageDecision { kept, survival: None, expected: Tensor::scalar_tensor(kept as f64, (Kind::Float, device)) }
    }

    /// Whether the decision carries gradients back to its logits.
    pub fn is_soft(&self) -> bool {
        self.survival.is_some()
    }

    /// Straight-through weights for the kept positions `[0, kept)`.
    pub fn keep_mask(&self) -> Option<Tensor> {
        self.survival.as_ref().map(|s| {
            let s = s.narrow(0, 0, self.kept as i64);
            1.0 - s.detach() + s
        })
    }

    /// Straight-through weights for positions `[start, end)` that are merged
    /// away. Forward value 1.
    pub fn merge_weights(&self, start: usize, end: usize) -> Option<Tensor> {
        self.survival.as_ref().map(|s| {
            let s = s.narrow(0, start as i64, (end - start) as i64);
            1.0 - (&s - s.detach())
        })
    }
}

// ---------------------------------------------------------------------------
// DecisionStage
// ---------------------------------------------------------------------------

/// Learnable distribution over kept-count candidates.
#[derive(Debug)]
pub struct DecisionStage {
    logits: Tensor,
    candidates: Arc<KeptCandidates>,
    indicator: Tensor,
    values: Tensor,
}

impl DecisionStage {
    /// Stage with zero-initialised logits registered as `path/logits`.
    pub fn new(path: &nn::Path, candidates: Arc<KeptCandidates>) -> Self {
        let k = candidates.len() as i64;
        let n = candidates.max_tokens() as i64;
        let device = path.device();
        let logits = path.zeros("logits", &[k]);
        let indicator = Tensor::from_slice(&candidates.survival_indicator()).reshape([k, n]).to_device(device);
        let values: Vec<f32> = candidates.values().iter().map(|&v| v as f32).collect();
        let values = Tensor::from_slice(&values).to_device(device);
        DecisionStage { logits, candidates, indicator, values }
    }

    /// Candidate set.
    pub fn candidates(&self) -> &KeptCandidates {
        &self.candidates
    }

    /// Current logits, detached and copied to the host.
    pub fn logits_vec(&self) -> TrainResult<Vec<f32>> {
        let host = self.logits.detach().to_device(Device::Cpu).to_kind(Kind::Float);
        Ok(Vec::<f32>::try_from(&host)?)
    }

    /// Softmax over candidates.
    pub fn probabilities(&self) -> Tensor {
        self.logits.softmax(-1, Kind::Float)
    }

    /// Decide how many of `tokens_in` tokens survive this stage.
    pub fn decide(&self, mode: DecideMode, tokens_in: usize) -> TrainResult<StageDecision> {
        let kept = self.candidates.hard_count(&self.logits_vec()?, tokens_in);
        let decision = match mode {
            DecideMode::Hard => StageDecision::fixed(kept, self.logits.device()),
            DecideMode::Soft => {
                let probs = self.probabilities();
                let survival = probs
                    .unsqueeze(0)
                    .matmul(&self.indicator)
                    .squeeze_dim(0)
                    .narrow(0, 0, tokens_in as i64);
                let expected = (&probs * &self.values).sum(Kind::Float).clamp_max(tokens_in as f64);
                StageDecision { kept, survival: Some(survival), expected }
            }
        };
        Ok(decision)
    }
}

/// Prune and merge stages of one block.
#[derive(Debug)]
pub struct BlockController {
    /// Pruning stage, registered under `blocks.{i}.prune`.
    pub prune: DecisionStage,
    /// Merging stage, registered under `blocks.{i}.merge`.
    pub merge: DecisionStage,
}

impl BlockController {
    /// Controller whose variables live under `block_path` (`blocks.{i}`).
    pub fn new(block_path: &nn::Path, candidates: Arc<KeptCandidates>) -> Self {
        BlockController {
            prune: DecisionStage::new(&(block_path / "prune"), candidates.clone()),
            merge: DecisionStage::new(&(block_path / "merge"), candidates),
        }
    }

    /// Prune decision on `tokens_in`, then merge decision on the survivors.
    ///
    /// In soft mode the expected merge count is also bounded by the expected
    /// prune count, so both stages feed the cost estimate.
    pub fn decide(&self, mode: DecideMode, tokens_in: usize) -> TrainResult<(StageDecision, StageDecision)> {
        let prune = self.prune.decide(mode, tokens_in)?;
        let mut merge = self.merge.decide(mode, prune.kept)?;
        if merge.is_soft() {
            merge.expected = merge.expected.minimum(&prune.expected);
        }
        Ok((prune, merge))
    }
}
