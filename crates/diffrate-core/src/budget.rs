//! Kept-token budgets: candidates, per-layer budgets and the global target.
//!
//! A block's compression decision is a choice among [`KeptCandidates`]: the
//! full token count followed by every multiple of the granularity below it,
//! down to a declared minimum. The hard choice is the first candidate with the
//! largest logit, so an untrained (all-zero) decision keeps every token.
//!
//! ```rust
//! use diffrate_core::budget::KeptCandidates;
//!
//! let cands = KeptCandidates::new(197, 4, 1).unwrap();
//! assert_eq!(&cands.values()[..3], &[197, 196, 192]);
//! assert_eq!(*cands.values().last().unwrap(), 1);
//! assert_eq!(cands.hard_count(&vec![0.0; cands.len()], 197), 197);
//! ```

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::BudgetError;
use crate::flops::FlopsModel;

// ---------------------------------------------------------------------------
// KeptCandidates
// ---------------------------------------------------------------------------

/// Valid kept-token counts for one block, in descending order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeptCandidates {
    values: Vec<usize>,
    granularity: usize,
}

impl KeptCandidates {
    /// Candidates for a block of at most `max_tokens` tokens.
    ///
    /// The list is `max_tokens`, then every multiple of `granularity` in
    /// `[max(min_kept, 1), max_tokens)`, then `min_kept` itself when it is not
    /// a multiple. Zero is never a candidate.
    pub fn new(max_tokens: usize, granularity: usize, min_kept: usize) -> Result<Self, BudgetError> {
        if granularity == 0 {
            return Err(BudgetError::ZeroGranularity);
        }
        if max_tokens == 0 {
            return Err(BudgetError::ZeroTokens(max_tokens));
        }
        let floor = min_kept.clamp(1, max_tokens);
        let mut values = vec![max_tokens];
        let mut v = (max_tokens - 1) / granularity * granularity;
        while v >= floor && v > 0 {
            values.push(v);
            v -= granularity;
        }
        if floor < max_tokens && floor % granularity != 0 {
            values.push(floor);
        }
        Ok(KeptCandidates { values, granularity })
    }

    /// Candidate counts, largest first.
    pub fn values(&self) -> &[usize] {
        &self.values
    }

    /// Number of candidates (length of a decision logit vector).
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Always `false`; a candidate list holds at least `max_tokens`.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Step between consecutive candidates.
    pub fn granularity(&self) -> usize {
        self.granularity
    }

    /// Largest candidate (the full token count).
    pub fn max_tokens(&self) -> usize {
        self.values[0]
    }

    /// Smallest candidate.
    pub fn min_tokens(&self) -> usize {
        self.values[self.values.len() - 1]
    }

    /// Whether `value` is one of the candidates.
    pub fn contains(&self, value: usize) -> bool {
        self.values.contains(&value)
    }

    /// Index of the first maximal logit. NaN logits never win.
    pub fn argmax(logits: &[f32]) -> usize {
        let mut best = 0;
        let mut best_val = f32::NEG_INFINITY;
        for (i, &v) in logits.iter().enumerate() {
            if v > best_val {
                best = i;
                best_val = v;
            }
        }
        best
    }

    /// Largest candidate that is `<= min(value, bound)`.
    ///
    /// When `bound` is below every candidate the bound itself is returned:
    /// a block can never keep more tokens than it receives.
    pub fn snap_down(&self, value: usize, bound: usize) -> usize {
        let limit = value.min(bound);
        self.values.iter().copied().find(|&c| c <= limit).unwrap_or(limit)
    }

    /// Hard decision: the argmax candidate, clamped to `tokens_in`.
    pub fn hard_count(&self, logits: &[f32], tokens_in: usize) -> usize {
        let idx = Self::argmax(logits).min(self.values.len() - 1);
        self.snap_down(self.values[idx], tokens_in)
    }

    /// Expected kept count under a probability vector over candidates.
    pub fn expected(&self, probs: &[f32]) -> f64 {
        self.values.iter().zip(probs).map(|(&c, &p)| c as f64 * p as f64).sum()
    }

    /// Row-major `[len, max_tokens]` indicator with entry `(c, i)` equal to
    /// one when candidate `c` keeps sorted position `i` (`values[c] > i`).
    ///
    /// Multiplying a probability row vector by this matrix yields the
    /// survival curve: the probability that each sorted position is kept.
    pub fn survival_indicator(&self) -> Vec<f32> {
        let n = self.max_tokens();
        let mut out = Vec::with_capacity(self.values.len() * n);
        for &c in &self.values {
            out.extend((0..n).map(|i| if c > i { 1.0 } else { 0.0 }));
        }
        out
    }

    /// Survival curve for `probs` over the first `n` sorted positions.
    pub fn survival_curve(&self, probs: &[f32], n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| {
                self.values
                    .iter()
                    .zip(probs)
                    .filter(|(&c, _)| c > i)
                    .map(|(_, &p)| p)
                    .sum()
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// LayerBudget
// ---------------------------------------------------------------------------

/// Discrete token counts of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerBudget {
    /// Tokens entering the block.
    pub tokens_in: usize,
    /// Tokens left after pruning.
    pub prune_kept_num: usize,
    /// Tokens left after merging.
    pub merge_kept_num: usize,
}

impl LayerBudget {
    /// Validating constructor for block `block`.
    ///
    /// # Errors
    ///
    /// [`BudgetError::ChainViolated`] unless
    /// `1 <= merge_kept_num <= prune_kept_num <= tokens_in`.
    pub fn new(block: usize, tokens_in: usize, prune: usize, merge: usize) -> Result<Self, BudgetError> {
        if merge == 0 || merge > prune || prune > tokens_in {
            return Err(BudgetError::ChainViolated { block, tokens_in, prune, merge });
        }
        Ok(LayerBudget { tokens_in, prune_kept_num: prune, merge_kept_num: merge })
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// Fixed per-block schedule as stored in the compression rate table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    /// Kept tokens after pruning, one entry per block.
    pub prune_kept_num: Vec<usize>,
    /// Kept tokens after merging, one entry per block.
    pub merge_kept_num: Vec<usize>,
}

impl Schedule {
    /// Schedule that keeps all `tokens` in each of `depth` blocks.
    pub fn full(depth: usize, tokens: usize) -> Self {
        Schedule { prune_kept_num: vec![tokens; depth], merge_kept_num: vec![tokens; depth] }
    }

    /// Number of blocks covered.
    pub fn depth(&self) -> usize {
        self.prune_kept_num.len()
    }

    /// Chain the schedule into per-block budgets starting from `max_tokens`.
    ///
    /// # Errors
    ///
    /// [`BudgetError::LengthMismatch`] when the two lists differ in length and
    /// [`BudgetError::ChainViolated`] for the first offending block.
    pub fn layer_budgets(&self, max_tokens: usize) -> Result<Vec<LayerBudget>, BudgetError> {
        if self.prune_kept_num.len() != self.merge_kept_num.len() {
            return Err(BudgetError::LengthMismatch {
                prune: self.prune_kept_num.len(),
                merge: self.merge_kept_num.len(),
            });
        }
        let mut tokens_in = max_tokens;
        let mut out = Vec::with_capacity(self.depth());
        for (block, (&p, &m)) in self.prune_kept_num.iter().zip(&self.merge_kept_num).enumerate() {
            let budget = LayerBudget::new(block, tokens_in, p, m)?;
            tokens_in = budget.merge_kept_num;
            out.push(budget);
        }
        Ok(out)
    }

    /// Like [`Schedule::layer_budgets`] but also checks the depth.
    pub fn layer_budgets_for(&self, depth: usize, max_tokens: usize) -> Result<Vec<LayerBudget>, BudgetError> {
        if self.depth() != depth {
            return Err(BudgetError::DepthMismatch { expected: depth, actual: self.depth() });
        }
        self.layer_budgets(max_tokens)
    }
}

// ---------------------------------------------------------------------------
// GlobalBudget
// ---------------------------------------------------------------------------

/// Compute target and candidate granularity of a search run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalBudget {
    /// Target forward cost in GFLOPs.
    pub target_flops: f64,
    /// Token gap between consecutive kept-count candidates.
    pub granularity: usize,
    /// Smallest kept count a block may choose.
    pub min_kept_tokens: usize,
}

/// Reachability of a FLOPs target for a given model and candidate set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Feasibility {
    /// Cost of the most aggressive schedule.
    pub min_gflops: f64,
    /// Cost without compression.
    pub full_gflops: f64,
    /// Requested target.
    pub target_gflops: f64,
}

impl Feasibility {
    /// Whether some schedule reaches the target.
    pub fn is_reachable(&self) -> bool {
        self.min_gflops <= self.target_gflops
    }

    /// Whether the uncompressed model already meets the target.
    pub fn is_trivial(&self) -> bool {
        self.full_gflops <= self.target_gflops
    }
}

impl GlobalBudget {
    /// Validating constructor.
    pub fn new(target_flops: f64, granularity: usize, min_kept_tokens: usize) -> Result<Self, BudgetError> {
        if !target_flops.is_finite() || target_flops <= 0.0 {
            return Err(BudgetError::InvalidTarget(target_flops));
        }
        if granularity == 0 {
            return Err(BudgetError::ZeroGranularity);
        }
        Ok(GlobalBudget { target_flops, granularity, min_kept_tokens })
    }

    /// Candidate list for blocks of at most `max_tokens` tokens.
    pub fn candidates(&self, max_tokens: usize) -> Result<KeptCandidates, BudgetError> {
        KeptCandidates::new(max_tokens, self.granularity, self.min_kept_tokens)
    }

    /// Compare the target against the cheapest and the uncompressed schedule.
    pub fn feasibility(&self, flops: &FlopsModel, depth: usize, candidates: &KeptCandidates) -> Feasibility {
        Feasibility {
            min_gflops: flops.minimum_gflops(depth, candidates.max_tokens(), candidates.min_tokens()),
            full_gflops: flops.uniform_gflops(depth, candidates.max_tokens()),
            target_gflops: self.target_flops,
        }
    }

    /// Log a warning when the target cannot be reached or is already met.
    pub fn warn_if_infeasible(&self, flops: &FlopsModel, depth: usize, candidates: &KeptCandidates) -> Feasibility {
        let f = self.feasibility(flops, depth, candidates);
        if !f.is_reachable() {
            warn!(
                "target of {:.2} GFLOPs is unreachable: the cheapest schedule with granularity {} costs {:.2} GFLOPs",
                f.target_gflops, self.granularity, f.min_gflops
            );
        } else if f.is_trivial() {
            warn!(
                "target of {:.2} GFLOPs is above the uncompressed cost of {:.2} GFLOPs; the penalty will stay at zero",
                f.target_gflops, f.full_gflops
            );
        }
        f
    }
}

/// Whether the compute-budget penalty applies in `epoch`.
///
/// With warm-up enabled the constraint is inactive for the first epoch so the
/// controller can settle under the full token count.
pub fn penalty_active(epoch: usize, warmup: bool) -> bool {
    !(warmup && epoch == 0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_are_granularity_aligned_below_max() {
        let c = KeptCandidates::new(197, 4, 1).unwrap();
        for &v in &c.values()[1..] {
            assert!(v % 4 == 0 || v == 1, "{v} not aligned");
        }
        assert_eq!(c.values()[0], 197);
        assert!(c.values().windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn declared_minimum_bounds_candidates() {
        let c = KeptCandidates::new(197, 4, 50).unwrap();
        assert_eq!(c.min_tokens(), 50);
        assert_eq!(&c.values()[c.len() - 2..], &[52, 50]);
    }

    #[test]
    fn aligned_max_is_not_duplicated() {
        let c = KeptCandidates::new(16, 4, 4).unwrap();
        assert_eq!(c.values(), &[16, 12, 8, 4]);
    }

    #[test]
    fn zero_granularity_rejected() {
        assert_eq!(KeptCandidates::new(10, 0, 1), Err(BudgetError::ZeroGranularity));
    }

    #[test]
    fn hard_count_clamps_to_tokens_in() {
        let c = KeptCandidates::new(17, 4, 1).unwrap();
        let mut logits = vec![0.0; c.len()];
        logits[0] = 1.0; // full count
        assert_eq!(c.hard_count(&logits, 13), 12);
        assert_eq!(c.hard_count(&logits, 17), 17);
    }

    #[test]
    fn argmax_prefers_first_on_ties_and_skips_nan() {
        assert_eq!(KeptCandidates::argmax(&[0.5, 0.5, 0.1]), 0);
        assert_eq!(KeptCandidates::argmax(&[f32::NAN, 0.2, 0.3]), 2);
    }

    #[test]
    fn survival_curve_matches_indicator() {
        let c = KeptCandidates::new(9, 4, 1).unwrap(); // [9, 8, 4, 1]
        let probs = [0.1, 0.2, 0.3, 0.4];
        let curve = c.survival_curve(&probs, 9);
        let ind = c.survival_indicator();
        for i in 0..9 {
            let via_ind: f32 = (0..c.len()).map(|k| probs[k] * ind[k * 9 + i]).sum();
            assert!((curve[i] - via_ind).abs() < 1e-6);
        }
        assert!((curve[0] - 1.0).abs() < 1e-6);
        assert!(curve.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn layer_budget_rejects_broken_chain() {
        assert!(LayerBudget::new(0, 197, 150, 160).is_err());
        assert!(LayerBudget::new(0, 100, 150, 120).is_err());
        assert!(LayerBudget::new(0, 197, 150, 120).is_ok());
    }

    #[test]
    fn schedule_chains_tokens_in() {
        let s = Schedule { prune_kept_num: vec![197, 120], merge_kept_num: vec![150, 100] };
        let b = s.layer_budgets(197).unwrap();
        assert_eq!(b[1].tokens_in, 150);
        let bad = Schedule { prune_kept_num: vec![197, 160], merge_kept_num: vec![150, 100] };
        assert!(matches!(bad.layer_budgets(197), Err(BudgetError::ChainViolated { block: 1, .. })));
    }

    #[test]
    fn warmup_disables_penalty_only_in_first_epoch() {
        assert!(!penalty_active(0, true));
        assert!(penalty_active(1, true));
        assert!(penalty_active(0, false));
    }
}
