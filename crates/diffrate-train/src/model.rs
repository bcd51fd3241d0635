//! ViT backbone patched with DiffRate blocks.
//!
//! Parameters live in two [`nn::VarStore`]s:
//!
//! * the **model** store holds the backbone in timm naming
//!   (`patch_embed.proj.weight`, `blocks.{i}.attn.qkv.weight`, `head.weight`, ...)
//!   and is frozen during the search;
//! * the **arch** store holds the controller logits
//!   (`blocks.{i}.prune.logits`, `blocks.{i}.merge.logits`), the only
//!   trainable parameters.
//!
//! Both stores are flattened into a single state dict when checkpointing.

use std::sync::Arc;
use tch::nn::{self, Module};
use tch::{Device, Kind, Tensor};
use tracing::{debug, info};

use diffrate_core::budget::{KeptCandidates, LayerBudget, Schedule};
use diffrate_core::flops::{FlopsModel, GFLOPS};
use diffrate_core::registry::ModelSpec;

use crate::block::{Block, BlockAccount, BlockPlan, DiffRateBlock, TokenState};
use crate::controller::DecideMode;
use crate::error::{TrainError, TrainResult};
use crate::patch::{PatchStrategy, Pooling};

// ---------------------------------------------------------------------------
// BudgetSource
// ---------------------------------------------------------------------------

/// Origin of the per-block kept counts for one forward pass.
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetSource {
    /// Controllers decide, softly (search) or by argmax (evaluation).
    Learned(DecideMode),
    /// A materialized schedule, one budget per block.
    Fixed(Vec<LayerBudget>),
}

impl BudgetSource {
    /// Fixed source from a table schedule, validated against the model.
    pub fn from_schedule(schedule: &Schedule, depth: usize, max_tokens: usize) -> TrainResult<Self> {
        Ok(BudgetSource::Fixed(schedule.layer_budgets_for(depth, max_tokens)?))
    }

    fn plan(&self, block: usize) -> TrainResult<BlockPlan> {
        match self {
            BudgetSource::Learned(mode) => Ok(BlockPlan::Decide(*mode)),
            BudgetSource::Fixed(budgets) => budgets
                .get(block)
                .map(|b| BlockPlan::Fixed { prune: b.prune_kept_num, merge: b.merge_kept_num })
                .ok_or_else(|| TrainError::training_step(format!("fixed schedule has no entry for block {block}"))),
        }
    }
}

/// Result of a forward pass.
#[derive(Debug)]
pub struct ModelOutput {
    /// Head output, `[B, num_classes]`.
    pub logits: Tensor,
    /// Pooled, normalised features before the head, `[B, C]`.
    pub features: Tensor,
    /// Per-block counts.
    pub accounts: Vec<BlockAccount>,
    /// Expected GFLOPs, differentiable w.r.t. the controllers in soft mode.
    pub flops: Tensor,
}

impl ModelOutput {
    /// Discrete counts of the pass.
    pub fn budgets(&self) -> Vec<LayerBudget> {
        self.accounts.iter().map(|a| a.budget).collect()
    }
}

// ---------------------------------------------------------------------------
// DiffRateVit
// ---------------------------------------------------------------------------

/// Vision transformer whose blocks prune and merge tokens.
#[derive(Debug)]
pub struct DiffRateVit {
    patch_embed: nn::Conv2D,
    cls_token: Tensor,
    pos_embed: Tensor,
    norm_pre: Option<nn::LayerNorm>,
    blocks: Vec<DiffRateBlock>,
    final_norm: nn::LayerNorm,
    head: Option<nn::Linear>,
    pooling: Pooling,
    flops: FlopsModel,
    num_tokens: usize,
}

impl DiffRateVit {
    /// Build the backbone under `model` and the controllers under `arch`.
    pub fn new(
        model: &nn::Path,
        arch: &nn::Path,
        spec: &ModelSpec,
        strategy: &dyn PatchStrategy,
        candidates: Arc<KeptCandidates>,
        num_classes: usize,
        drop_path: f64,
    ) -> Self {
        let c = spec.embed_dim as i64;
        let p = spec.patch_size as i64;
        let n = spec.num_tokens() as i64;
        let ln = nn::LayerNormConfig { eps: strategy.layer_norm_eps(), ..Default::default() };

        let conv = nn::ConvConfig { stride: p, bias: strategy.patch_embed_bias(), ..Default::default() };
        let patch_embed = nn::conv2d(model / "patch_embed" / "proj", spec.in_chans as i64, c, p, conv);
        let cls_token = model.randn("cls_token", &[1, 1, c], 0.0, 0.02);
        let pos_embed = model.randn("pos_embed", &[1, n, c], 0.0, 0.02);
        let norm_pre = strategy.norm_pre().then(|| nn::layer_norm(model / "norm_pre", vec![c], ln));

        let depth = spec.depth;
        let blocks = (0..depth)
            .map(|i| {
                let rate = if depth > 1 { drop_path * i as f64 / (depth - 1) as f64 } else { 0.0 };
                let block = Block::new(
                    &(model / "blocks" / i),
                    c,
                    spec.num_heads as i64,
                    spec.mlp_hidden_dim() as i64,
                    rate,
                    strategy,
                );
                DiffRateBlock::new(i, block, &(arch / "blocks" / i), candidates.clone())
            })
            .collect();

        let pooling = strategy.pooling();
        let norm_name = match pooling {
            Pooling::ClassToken => "norm",
            Pooling::SizeWeightedMean => "fc_norm",
        };
        let final_norm = nn::layer_norm(model / norm_name, vec![c], ln);
        let head = (num_classes > 0).then(|| nn::linear(model / "head", c, num_classes as i64, Default::default()));

        debug!("built {} ({} blocks, {} tokens, pooling {:?})", spec.display_name, depth, n, pooling);
        DiffRateVit {
            patch_embed,
            cls_token,
            pos_embed,
            norm_pre,
            blocks,
            final_norm,
            head,
            pooling,
            flops: FlopsModel::new(spec, num_classes),
            num_tokens: n as usize,
        }
    }

    /// Number of blocks.
    pub fn depth(&self) -> usize {
        self.blocks.len()
    }

    /// Tokens entering block 0 (class token included).
    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    /// Patched blocks.
    pub fn blocks(&self) -> &[DiffRateBlock] {
        &self.blocks
    }

    /// Cost model of this backbone.
    pub fn flops_model(&self) -> &FlopsModel {
        &self.flops
    }

    /// Source that keeps every token in every block.
    pub fn full_budget(&self) -> BudgetSource {
        let n = self.num_tokens;
        BudgetSource::Fixed(vec![LayerBudget { tokens_in: n, prune_kept_num: n, merge_kept_num: n }; self.depth()])
    }

    /// Current controller logits, `(prune, merge)` per block.
    pub fn arch_logits(&self) -> TrainResult<Vec<(Vec<f32>, Vec<f32>)>> {
        self.blocks
            .iter()
            .map(|b| Ok((b.controller().prune.logits_vec()?, b.controller().merge.logits_vec()?)))
            .collect()
    }

    fn embed(&self, images: &Tensor) -> Tensor {
        let x = self.patch_embed.forward(images).flatten(2, -1).transpose(1, 2);
        let b = x.size()[0];
        let cls = self.cls_token.expand([b, -1, -1], false);
        let x = Tensor::cat(&[cls, x], 1) + &self.pos_embed;
        match &self.norm_pre {
            Some(norm) => norm.forward(&x),
            None => x,
        }
    }

    fn pool(&self, state: &TokenState) -> Tensor {
        match self.pooling {
            Pooling::SizeWeightedMean if state.num_tokens() > 1 => {
                let n = state.num_tokens() as i64;
                let x = state.x.narrow(1, 1, n - 1);
                let size = state.size.narrow(1, 1, n - 1);
                let pooled = (&x * &size).sum_dim_intlist(&[1i64][..], false, Kind::Float)
                    / size.sum_dim_intlist(&[1i64][..], false, Kind::Float);
                self.final_norm.forward(&pooled)
            }
            _ => self.final_norm.forward(&state.x).select(1, 0),
        }
    }

    /// Forward `images` (`[B, 3, H, W]`) under `source`.
    pub fn forward(&self, images: &Tensor, source: &BudgetSource, train: bool) -> TrainResult<ModelOutput> {
        let mut state = TokenState::new(self.embed(images));
        let mut accounts = Vec::with_capacity(self.depth());
        for (i, block) in self.blocks.iter().enumerate() {
            let (next, account) = block.forward(state, source.plan(i)?, train)?;
            state = next;
            accounts.push(account);
        }

        let features = self.pool(&state);
        let logits = match &self.head {
            Some(head) => head.forward(&features),
            None => features.shallow_clone(),
        };
        let flops = expected_gflops(&self.flops, &accounts, self.num_tokens, images.device());
        Ok(ModelOutput { logits, features, accounts, flops })
    }
}

/// Differentiable GFLOPs estimate from chained expected counts.
///
/// Block 0 attends over all `num_tokens`; block `i + 1` attends over the
/// expected merge count of block `i`.
pub fn expected_gflops(flops: &FlopsModel, accounts: &[BlockAccount], num_tokens: usize, device: Device) -> Tensor {
    let k = flops.coefficients();
    let mut total = Tensor::scalar_tensor(flops.fixed_flops(), (Kind::Float, device));
    let mut tokens_in = Tensor::scalar_tensor(num_tokens as f64, (Kind::Float, device));
    for account in accounts {
        let merged = &account.expected_merge;
        total = total
            + &tokens_in * k.attn_linear
            + (&tokens_in * &tokens_in) * k.attn_quadratic
            + merged * k.mlp_linear;
        tokens_in = merged.shallow_clone();
    }
    total * GFLOPS
}

// ---------------------------------------------------------------------------
// DiffRateModel
// ---------------------------------------------------------------------------

/// Backbone plus controllers with their two variable stores.
pub struct DiffRateModel {
    /// Backbone parameters.
    pub model_vs: nn::VarStore,
    /// Controller logits.
    pub arch_vs: nn::VarStore,
    /// The network.
    pub vit: DiffRateVit,
    spec: ModelSpec,
}

impl std::fmt::Debug for DiffRateModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiffRateModel").field("spec", &self.spec.arch).field("vit", &self.vit).finish()
    }
}

impl DiffRateModel {
    /// Build a model on `device`.
    pub fn new(
        spec: &ModelSpec,
        strategy: &dyn PatchStrategy,
        candidates: KeptCandidates,
        num_classes: usize,
        drop_path: f64,
        device: Device,
    ) -> Self {
        let model_vs = nn::VarStore::new(device);
        let arch_vs = nn::VarStore::new(device);
        let vit = DiffRateVit::new(
            &model_vs.root(),
            &arch_vs.root(),
            spec,
            strategy,
            Arc::new(candidates),
            num_classes,
            drop_path,
        );
        info!(
            "{}: {} backbone tensors, {} controller parameters",
            spec.display_name,
            model_vs.variables().len(),
            Self::count(&arch_vs)
        );
        DiffRateModel { model_vs, arch_vs, vit, spec: spec.clone() }
    }

    /// Backbone spec.
    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    /// Device of both stores.
    pub fn device(&self) -> Device {
        self.model_vs.device()
    }

    fn count(vs: &nn::VarStore) -> usize {
        vs.trainable_variables().iter().map(|t| t.numel()).sum()
    }

    /// Number of trainable controller parameters.
    pub fn n_parameters(&self) -> usize {
        Self::count(&self.arch_vs)
    }

    /// Stop gradients into the backbone.
    pub fn freeze_backbone(&mut self) {
        self.model_vs.freeze();
    }

    /// Forward with a source.
    pub fn forward(&self, images: &Tensor, source: &BudgetSource, train: bool) -> TrainResult<ModelOutput> {
        self.vit.forward(images, source, train)
    }

    /// No-grad forward of the uncompressed backbone.
    pub fn forward_full(&self, images: &Tensor) -> TrainResult<ModelOutput> {
        let full = self.vit.full_budget();
        tch::no_grad(|| self.vit.forward(images, &full, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::{DeitPatch, MaePatch};
    use diffrate_core::registry::ModelFamily;

    pub(crate) fn tiny_spec(family: ModelFamily) -> ModelSpec {
        ModelSpec {
            arch: "tiny".into(),
            display_name: "ViT-Tiny-Test".into(),
            family,
            img_size: 32,
            patch_size: 8,
            in_chans: 3,
            embed_dim: 32,
            depth: 2,
            num_heads: 2,
            mlp_ratio: 4.0,
            num_prefix_tokens: 1,
        }
    }

    fn tiny(strategy: &dyn PatchStrategy) -> DiffRateModel {
        tch::manual_seed(0);
        let spec = tiny_spec(strategy.family());
        let cands = KeptCandidates::new(spec.num_tokens(), 4, 1).unwrap();
        DiffRateModel::new(&spec, strategy, cands, 10, 0.0, Device::Cpu)
    }

    fn images() -> Tensor {
        Tensor::randn([2, 3, 32, 32], (Kind::Float, Device::Cpu))
    }

    #[test]
    fn full_forward_matches_flops_model() {
        let m = tiny(&DeitPatch);
        let out = m.forward_full(&images()).unwrap();
        assert_eq!(out.logits.size(), vec![2, 10]);
        let expected = m.vit.flops_model().uniform_gflops(2, 17);
        assert!((out.flops.double_value(&[]) - expected).abs() < 1e-9);
    }

    #[test]
    fn fixed_schedule_is_followed() {
        let m = tiny(&MaePatch);
        let schedule = Schedule { prune_kept_num: vec![16, 12], merge_kept_num: vec![13, 8] };
        let source = BudgetSource::from_schedule(&schedule, 2, 17).unwrap();
        let out = m.forward(&images(), &source, false).unwrap();
        let budgets = out.budgets();
        assert_eq!(budgets[0], LayerBudget { tokens_in: 17, prune_kept_num: 16, merge_kept_num: 13 });
        assert_eq!(budgets[1], LayerBudget { tokens_in: 13, prune_kept_num: 12, merge_kept_num: 8 });
        assert_eq!(out.features.size(), vec![2, 32]);
    }

    #[test]
    fn soft_flops_reach_arch_parameters_only() {
        let mut m = tiny(&DeitPatch);
        m.freeze_backbone();
        let out = m.forward(&images(), &BudgetSource::Learned(DecideMode::Soft), true).unwrap();
        (&out.flops + out.features.mean(Kind::Float)).backward();
        for (name, var) in m.arch_vs.variables() {
            assert!(var.grad().defined(), "{name} has no gradient");
        }
        assert!(m.model_vs.variables().values().all(|v| !v.requires_grad()));
        // Candidates for 17 tokens at granularity 4: 17, 16, 12, 8, 4, 1.
        assert_eq!(m.n_parameters(), 2 * 2 * 6);
    }

    #[test]
    fn parameter_names_follow_timm() {
        let m = tiny(&DeitPatch);
        let names = m.model_vs.variables();
        for key in ["patch_embed.proj.weight", "cls_token", "pos_embed", "blocks.1.attn.qkv.weight", "norm.bias", "head.weight"] {
            assert!(names.contains_key(key), "{key}");
        }
    }
}
