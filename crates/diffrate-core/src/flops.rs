//! FLOPs model for a token-compressed ViT forward pass.
//!
//! Costs are multiply-accumulate counts reported in GFLOPs, the unit used by
//! `target_flops`. Per block, attention runs on the `N` tokens entering the
//! block and the MLP runs on the `M` tokens left after pruning and merging:
//!
//! ```text
//! block(N, M) = 4·N·C² + 2·N²·C + 2·M·C·H
//!               └ qkv+proj ┘ └ qkᵀ, av ┘ └ fc1+fc2 ┘
//! ```
//!
//! The coefficients are exposed through [`BlockCoefficients`] so the tensor
//! backend can evaluate the same polynomial on expected (soft) token counts.

use crate::budget::LayerBudget;
use crate::registry::ModelSpec;

/// Scale from raw multiply-accumulates to GFLOPs.
pub const GFLOPS: f64 = 1e-9;

/// Polynomial coefficients of the per-block cost, in raw MACs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockCoefficients {
    /// Coefficient of `N` (qkv and output projections): `4·C²`.
    pub attn_linear: f64,
    /// Coefficient of `N²` (attention scores and weighted sum): `2·C`.
    pub attn_quadratic: f64,
    /// Coefficient of `M` (two MLP projections): `2·C·H`.
    pub mlp_linear: f64,
}

/// Cost model for one backbone configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct FlopsModel {
    embed_dim: f64,
    mlp_hidden: f64,
    num_patches: f64,
    patch_pixels: f64,
    num_classes: f64,
}

impl FlopsModel {
    /// Build the cost model for `spec` with a `num_classes`-way head
    /// (`0` for headless feature towers).
    pub fn new(spec: &ModelSpec, num_classes: usize) -> Self {
        FlopsModel {
            embed_dim: spec.embed_dim as f64,
            mlp_hidden: spec.mlp_hidden_dim() as f64,
            num_patches: spec.num_patches() as f64,
            patch_pixels: (spec.in_chans * spec.patch_size * spec.patch_size) as f64,
            num_classes: num_classes as f64,
        }
    }

    /// Per-block polynomial coefficients.
    pub fn coefficients(&self) -> BlockCoefficients {
        let c = self.embed_dim;
        BlockCoefficients {
            attn_linear: 4.0 * c * c,
            attn_quadratic: 2.0 * c,
            mlp_linear: 2.0 * c * self.mlp_hidden,
        }
    }

    /// Cost that does not depend on the compression schedule: patch
    /// embedding and classifier head.
    pub fn fixed_flops(&self) -> f64 {
        self.num_patches * self.patch_pixels * self.embed_dim + self.embed_dim * self.num_classes
    }

    /// Cost of one block with `tokens_in` attention tokens and `merged` MLP tokens.
    pub fn block_flops(&self, tokens_in: f64, merged: f64) -> f64 {
        let k = self.coefficients();
        k.attn_linear * tokens_in + k.attn_quadratic * tokens_in * tokens_in + k.mlp_linear * merged
    }

    /// Total GFLOPs of a forward pass under `budgets`.
    pub fn schedule_gflops(&self, budgets: &[LayerBudget]) -> f64 {
        let blocks: f64 = budgets
            .iter()
            .map(|b| self.block_flops(b.tokens_in as f64, b.merge_kept_num as f64))
            .sum();
        (self.fixed_flops() + blocks) * GFLOPS
    }

    /// GFLOPs when every block keeps `tokens` tokens.
    pub fn uniform_gflops(&self, depth: usize, tokens: usize) -> f64 {
        let n = tokens as f64;
        (self.fixed_flops() + depth as f64 * self.block_flops(n, n)) * GFLOPS
    }

    /// GFLOPs of the most aggressive schedule: the first block attends over
    /// all `max_tokens` and every MLP and later block runs on `min_tokens`.
    pub fn minimum_gflops(&self, depth: usize, max_tokens: usize, min_tokens: usize) -> f64 {
        if depth == 0 {
            return self.fixed_flops() * GFLOPS;
        }
        let n0 = max_tokens as f64;
        let m = min_tokens as f64;
        let first = self.block_flops(n0, m);
        let rest = (depth - 1) as f64 * self.block_flops(m, m);
        (self.fixed_flops() + first + rest) * GFLOPS
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModelRegistry;
    use approx::assert_relative_eq;

    fn deit_base() -> ModelSpec {
        ModelRegistry::with_defaults().get("vit_deit_base_patch16_224").unwrap().clone()
    }

    #[test]
    fn uncompressed_deit_base_is_about_17_6_gflops() {
        let spec = deit_base();
        let model = FlopsModel::new(&spec, 1000);
        let full = model.uniform_gflops(spec.depth, spec.num_tokens());
        assert!((17.4..17.8).contains(&full), "got {full}");
    }

    #[test]
    fn schedule_matches_uniform_when_nothing_is_dropped() {
        let spec = deit_base();
        let model = FlopsModel::new(&spec, 1000);
        let n = spec.num_tokens();
        let budgets: Vec<LayerBudget> =
            (0..spec.depth).map(|i| LayerBudget::new(i, n, n, n).unwrap()).collect();
        assert_relative_eq!(
            model.schedule_gflops(&budgets),
            model.uniform_gflops(spec.depth, n),
            max_relative = 1e-12
        );
    }

    #[test]
    fn merging_reduces_cost() {
        let spec = deit_base();
        let model = FlopsModel::new(&spec, 1000);
        assert!(model.block_flops(197.0, 100.0) < model.block_flops(197.0, 197.0));
        assert!(model.block_flops(100.0, 100.0) < model.block_flops(197.0, 100.0));
    }

    #[test]
    fn minimum_is_below_full() {
        let spec = deit_base();
        let model = FlopsModel::new(&spec, 1000);
        let min = model.minimum_gflops(spec.depth, 197, 4);
        let full = model.uniform_gflops(spec.depth, 197);
        assert!(min < full);
        assert!(min > model.fixed_flops() * GFLOPS);
    }
}
