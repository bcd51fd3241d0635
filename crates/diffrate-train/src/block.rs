//! Patched transformer block: attention, importance sort, prune, merge, MLP.
//!
//! ```text
//!   TokenState { x, size, mask, source }            N tokens
//!        │
//!        ├─ attention (size-proportional, mask added in log space)
//!        │     └─► class-token attention (importance), mean keys (metric)
//!        │
//!        ├─ sort patch tokens by importance (class token stays first)
//!        ├─ prune  to K = prune_kept_num               gather rows
//!        ├─ merge  [M, K) into [1, M) by key cosine    scatter-add rows
//!        │
//!        └─ MLP on M = merge_kept_num tokens
//! ```
//!
//! Every mode produces a [`TokenState`] and a [`BlockAccount`]; only the
//! presence of straight-through weights in the decisions differs.

use std::sync::Arc;
use tch::nn::{self, Module};
use tch::{Device, Kind, Tensor};
use tracing::debug;

use diffrate_core::budget::{KeptCandidates, LayerBudget};

use crate::controller::{BlockController, DecideMode, StageDecision};
use crate::error::TrainResult;
use crate::patch::{Activation, PatchStrategy};

// ---------------------------------------------------------------------------
// Token bookkeeping
// ---------------------------------------------------------------------------

/// Tokens flowing between blocks together with their identity record.
#[derive(Debug)]
pub struct TokenState {
    /// Token features, `[B, N, C]`.
    pub x: Tensor,
    /// Original patches represented by each token, `[B, N, 1]`.
    pub size: Tensor,
    /// Straight-through keep weights of the current tokens, `[B, N]` (soft mode).
    pub mask: Option<Tensor>,
    /// Weight of each original token in each current token, `[B, N, N0]`.
    pub source: Tensor,
}

impl TokenState {
    /// Fresh state for embedded tokens: unit sizes, identity sources.
    pub fn new(x: Tensor) -> Self {
        let (b, n) = (x.size()[0], x.size()[1]);
        let opts = (x.kind(), x.device());
        let size = Tensor::ones([b, n, 1], opts);
        let source = Tensor::eye(n, opts).unsqueeze(0).expand([b, n, n], false).contiguous();
        TokenState { x, size, mask: None, source }
    }

    /// Current token count.
    pub fn num_tokens(&self) -> usize {
        self.x.size()[1] as usize
    }

    fn gather(&self, order: &Tensor) -> TokenState {
        let take = |t: &Tensor| {
            let last = t.size()[2];
            t.gather(1, &order.unsqueeze(-1).expand([-1, -1, last], false), false)
        };
        TokenState {
            x: take(&self.x),
            size: take(&self.size),
            mask: self.mask.as_ref().map(|m| m.gather(1, order, false)),
            source: take(&self.source),
        }
    }
}

/// Token counts of one block, hard and expected.
#[derive(Debug)]
pub struct BlockAccount {
    /// Discrete counts used by the forward pass.
    pub budget: LayerBudget,
    /// Expected tokens after pruning (scalar tensor).
    pub expected_prune: Tensor,
    /// Expected tokens after merging (scalar tensor).
    pub expected_merge: Tensor,
}

// ---------------------------------------------------------------------------
// Attention / MLP
// ---------------------------------------------------------------------------

/// Multi-head self-attention with size-proportional weighting.
#[derive(Debug)]
pub struct Attention {
    qkv: nn::Linear,
    proj: nn::Linear,
    num_heads: i64,
    scale: f64,
}

/// Attention outputs consumed by the compression stages.
#[derive(Debug)]
pub struct AttentionOutput {
    /// Projected output, `[B, N, C]`.
    pub out: Tensor,
    /// Class-token attention to each patch token averaged over heads, `[B, N - 1]`.
    pub cls_attn: Tensor,
    /// Keys averaged over heads, `[B, N, C / H]`.
    pub metric: Tensor,
}

impl Attention {
    /// Attention under `path` (`blocks.{i}.attn`).
    pub fn new(path: &nn::Path, dim: i64, num_heads: i64) -> Self {
        let head_dim = dim / num_heads;
        Attention {
            qkv: nn::linear(path / "qkv", dim, 3 * dim, Default::default()),
            proj: nn::linear(path / "proj", dim, dim, Default::default()),
            num_heads,
            scale: (head_dim as f64).powf(-0.5),
        }
    }

    /// Attend over `x` with token sizes `size` and optional keep weights `mask`.
    pub fn forward(&self, x: &Tensor, size: &Tensor, mask: Option<&Tensor>) -> AttentionOutput {
        let dims = x.size();
        let (b, n, c) = (dims[0], dims[1], dims[2]);
        let h = self.num_heads;
        let qkv = self.qkv.forward(x).reshape([b, n, 3, h, c / h]).permute([2, 0, 3, 1, 4]);
        let (q, k, v) = (qkv.get(0), qkv.get(1), qkv.get(2));

        let mut logits = q.matmul(&k.transpose(-2, -1)) * self.scale;
        logits = logits + size.log().reshape([b, 1, 1, n]);
        if let Some(mask) = mask {
            logits = logits + mask.log().reshape([b, 1, 1, n]);
        }
        let attn = logits.softmax(-1, Kind::Float);

        let out = attn.matmul(&v).transpose(1, 2).reshape([b, n, c]);
        let cls_attn = attn.select(2, 0).mean_dim(&[1i64][..], false, Kind::Float).narrow(1, 1, n - 1);
        let metric = k.mean_dim(&[1i64][..], false, Kind::Float);
        AttentionOutput { out: self.proj.forward(&out), cls_attn, metric }
    }
}

/// Two-layer MLP.
#[derive(Debug)]
pub struct Mlp {
    fc1: nn::Linear,
    fc2: nn::Linear,
    act: Activation,
}

impl Mlp {
    /// MLP under `path` (`blocks.{i}.mlp`).
    pub fn new(path: &nn::Path, dim: i64, hidden: i64, act: Activation) -> Self {
        Mlp {
            fc1: nn::linear(path / "fc1", dim, hidden, Default::default()),
            fc2: nn::linear(path / "fc2", hidden, dim, Default::default()),
            act,
        }
    }
}

impl Module for Mlp {
    fn forward(&self, x: &Tensor) -> Tensor {
        let h = self.fc1.forward(x);
        let h = match self.act {
            Activation::Gelu => h.gelu("none"),
            Activation::QuickGelu => &h * (&h * 1.702).sigmoid(),
        };
        self.fc2.forward(&h)
    }
}

/// Per-sample stochastic depth.
pub fn drop_path(x: &Tensor, prob: f64, train: bool) -> Tensor {
    if !train || prob <= 0.0 {
        return x.shallow_clone();
    }
    let keep = 1.0 - prob;
    let b = x.size()[0];
    let noise = (Tensor::rand([b, 1, 1], (x.kind(), x.device())) + keep).floor();
    x * noise / keep
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

/// Pre-norm transformer block (timm layout).
#[derive(Debug)]
pub struct Block {
    norm1: nn::LayerNorm,
    attn: Attention,
    norm2: nn::LayerNorm,
    mlp: Mlp,
    drop_path: f64,
}

impl Block {
    /// Block under `path` (`blocks.{i}`).
    pub fn new(path: &nn::Path, dim: i64, num_heads: i64, mlp_hidden: i64, drop_path: f64, strategy: &dyn PatchStrategy) -> Self {
        let ln = nn::LayerNormConfig { eps: strategy.layer_norm_eps(), ..Default::default() };
        Block {
            norm1: nn::layer_norm(path / "norm1", vec![dim], ln),
            attn: Attention::new(&(path / "attn"), dim, num_heads),
            norm2: nn::layer_norm(path / "norm2", vec![dim], ln),
            mlp: Mlp::new(&(path / "mlp"), dim, mlp_hidden, strategy.activation()),
            drop_path,
        }
    }
}

// ---------------------------------------------------------------------------
// DiffRateBlock
// ---------------------------------------------------------------------------

/// Where a block's kept counts come from in a forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockPlan {
    /// Ask the controller.
    Decide(DecideMode),
    /// Use these counts (clamped to the incoming token count).
    Fixed {
        /// Kept tokens after pruning.
        prune: usize,
        /// Kept tokens after merging.
        merge: usize,
    },
}

/// A [`Block`] wrapped with its compression controller.
#[derive(Debug)]
pub struct DiffRateBlock {
    index: usize,
    block: Block,
    controller: BlockController,
}

impl DiffRateBlock {
    /// Wrap `block` with a controller whose logits live under `arch_path`.
    pub fn new(index: usize, block: Block, arch_path: &nn::Path, candidates: Arc<KeptCandidates>) -> Self {
        DiffRateBlock { index, block, controller: BlockController::new(arch_path, candidates) }
    }

    /// Block index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The controller of this block.
    pub fn controller(&self) -> &BlockController {
        &self.controller
    }

    fn decisions(&self, plan: BlockPlan, tokens_in: usize, device: Device) -> TrainResult<(StageDecision, StageDecision)> {
        match plan {
            BlockPlan::Decide(mode) => self.controller.decide(mode, tokens_in),
            BlockPlan::Fixed { prune, merge } => {
                let prune = prune.clamp(1, tokens_in);
                let merge = merge.clamp(1, prune);
                Ok((StageDecision::fixed(prune, device), StageDecision::fixed(merge, device)))
            }
        }
    }

    /// Run the block on `state`.
    pub fn forward(&self, state: TokenState, plan: BlockPlan, train: bool) -> TrainResult<(TokenState, BlockAccount)> {
        let tokens_in = state.num_tokens();
        let device = state.x.device();
        let (prune, merge) = self.decisions(plan, tokens_in, device)?;
        let budget = LayerBudget::new(self.index, tokens_in, prune.kept, merge.kept)?;

        let att = self.block.attn.forward(&self.block.norm1.forward(&state.x), &state.size, state.mask.as_ref());
        let x = &state.x + drop_path(&att.out, self.block.drop_path, train);
        let state = TokenState { x, ..state };

        // Class token first, patch tokens by descending importance.
        let b = state.x.size()[0];
        let patch_order = att.cls_attn.argsort(-1, true) + 1;
        let cls = Tensor::zeros([b, 1], (Kind::Int64, device));
        let order = Tensor::cat(&[cls, patch_order], 1);
        let metric = att.metric.gather(1, &order.unsqueeze(-1).expand([-1, -1, att.metric.size()[2]], false), false);
        let sorted = state.gather(&order);

        let pruned = prune_tokens(sorted, &prune);
        let metric = metric.narrow(1, 0, prune.kept as i64);
        let merged = merge_tokens(pruned, &metric, &merge);

        let x = &merged.x + drop_path(&self.block.mlp.forward(&self.block.norm2.forward(&merged.x)), self.block.drop_path, train);
        let account = BlockAccount { budget, expected_prune: prune.expected, expected_merge: merge.expected };
        Ok((TokenState { x, ..merged }, account))
    }
}

/// Running mask over the first `kept` positions combined with a stage's
/// straight-through weights.
fn combine_mask(prev: Option<Tensor>, stage: Option<Tensor>, batch: i64, kept: i64) -> Option<Tensor> {
    match (prev, stage) {
        (Some(p), Some(st)) => Some(p.narrow(1, 0, kept) * st.unsqueeze(0)),
        (None, Some(st)) => Some(st.unsqueeze(0).expand([batch, kept], false)),
        (Some(p), None) => Some(p.narrow(1, 0, kept)),
        (None, None) => None,
    }
}

/// Keep the first `decision.kept` sorted tokens.
fn prune_tokens(state: TokenState, decision: &StageDecision) -> TokenState {
    let k = decision.kept as i64;
    let mask = combine_mask(state.mask, decision.keep_mask(), state.x.size()[0], k);
    TokenState {
        x: state.x.narrow(1, 0, k),
        size: state.size.narrow(1, 0, k),
        mask,
        source: state.source.narrow(1, 0, k),
    }
}

/// Fold the sorted tail `[M, K)` into `[1, M)` by cosine similarity of keys.
///
/// Features are averaged by size; sources add up. With `M <= 1` there is no
/// destination besides the class token: the tail is dropped like a prune, and
/// its `source` rows and sizes leave the identity record, so the surviving
/// sizes no longer sum to the original patch count.
fn merge_tokens(state: TokenState, metric: &Tensor, decision: &StageDecision) -> TokenState {
    let k = state.num_tokens() as i64;
    let m = decision.kept as i64;
    let b = state.x.size()[0];
    if m >= k {
        let mask = combine_mask(state.mask, decision.keep_mask(), b, m);
        return TokenState { mask, ..state };
    }
    if m <= 1 {
        debug!("merge to {m} token(s): dropping {} tail tokens and their source rows", k - m);
        return TokenState {
            x: state.x.narrow(1, 0, m),
            size: state.size.narrow(1, 0, m),
            mask: combine_mask(state.mask, decision.keep_mask(), b, m),
            source: state.source.narrow(1, 0, m),
        };
    }

    let c = state.x.size()[2];
    let n0 = state.source.size()[2];
    let metric = metric / metric.norm_scalaropt_dim(2.0, &[-1i64][..], true).clamp_min(1e-12);
    let dst_metric = metric.narrow(1, 1, m - 1);
    let src_metric = metric.narrow(1, m, k - m);
    let dst_idx = src_metric.matmul(&dst_metric.transpose(-2, -1)).argmax(-1, false) + 1; // [B, K-M]

    let src_x = state.x.narrow(1, m, k - m);
    let src_size = state.size.narrow(1, m, k - m);
    let weight = match decision.merge_weights(m as usize, k as usize) {
        Some(w) => &src_size * w.reshape([1, k - m, 1]),
        None => src_size.shallow_clone(),
    };

    let head_x = state.x.narrow(1, 0, m);
    let head_size = state.size.narrow(1, 0, m);
    let idx = |width: i64| dst_idx.unsqueeze(-1).expand([-1, -1, width], false);

    let weighted = (&head_x * &head_size).scatter_add(1, &idx(c), &(&src_x * &weight));
    let size = head_size.scatter_add(1, &idx(1), &weight);
    let x = weighted / &size;
    let source = state.source.narrow(1, 0, m).scatter_add(1, &idx(n0), &state.source.narrow(1, m, k - m));

    let mask = combine_mask(state.mask, decision.keep_mask(), b, m);
    TokenState { x, size, mask, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::DeitPatch;

    fn block(vs: &nn::VarStore, max: usize) -> DiffRateBlock {
        let root = vs.root();
        let b = Block::new(&(&root / "blocks" / 0), 16, 2, 32, 0.0, &DeitPatch);
        let cands = Arc::new(KeptCandidates::new(max, 2, 1).unwrap());
        DiffRateBlock::new(0, b, &(&root / "blocks" / 0), cands)
    }

    fn state(b: i64, n: i64) -> TokenState {
        TokenState::new(Tensor::randn([b, n, 16], (Kind::Float, Device::Cpu)))
    }

    #[test]
    fn fixed_plan_reduces_tokens_and_conserves_size() {
        tch::manual_seed(0);
        let vs = nn::VarStore::new(Device::Cpu);
        let blk = block(&vs, 9);
        let (out, acc) = blk.forward(state(2, 9), BlockPlan::Fixed { prune: 8, merge: 5 }, false).unwrap();
        assert_eq!(out.x.size(), vec![2, 5, 16]);
        assert_eq!(acc.budget, LayerBudget { tokens_in: 9, prune_kept_num: 8, merge_kept_num: 5 });
        // One token pruned, three merged: sizes sum to eight originals.
        let total = out.size.sum_dim_intlist(&[1i64][..], false, Kind::Float);
        assert!((total.double_value(&[0, 0]) - 8.0).abs() < 1e-4);
        let src = out.source.sum_dim_intlist(&[1i64, 2][..], false, Kind::Float);
        assert!((src.double_value(&[1]) - 8.0).abs() < 1e-4);
        // Class token stays first and unmerged.
        assert!((out.source.double_value(&[0, 0, 0]) - 1.0).abs() < 1e-6);
        assert!((out.size.double_value(&[0, 0, 0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn drop_path_is_identity_in_eval_and_zeroes_whole_samples_in_train() {
        tch::manual_seed(1);
        let x = Tensor::ones([64, 3, 4], (Kind::Float, Device::Cpu));
        assert_eq!(drop_path(&x, 0.5, false), x);
        let y = drop_path(&x, 0.5, true);
        let per_sample = y.sum_dim_intlist(&[1i64, 2][..], false, Kind::Float);
        let values = Vec::<f32>::try_from(&per_sample).unwrap();
        assert!(values.iter().all(|&v| v == 0.0 || (v - 24.0).abs() < 1e-4));
        assert!(values.iter().any(|&v| v == 0.0) && values.iter().any(|&v| v > 0.0));
    }

    #[test]
    fn merge_to_class_token_only_drops_tail() {
        let vs = nn::VarStore::new(Device::Cpu);
        let blk = block(&vs, 9);
        let (out, _) = blk.forward(state(1, 9), BlockPlan::Fixed { prune: 9, merge: 1 }, false).unwrap();
        assert_eq!(out.num_tokens(), 1);
        // Only the class token's own row survives.
        assert_eq!(out.source.size(), vec![1, 1, 9]);
        assert!((out.source.sum(Kind::Float).double_value(&[]) - 1.0).abs() < 1e-6);
        assert!((out.size.double_value(&[0, 0, 0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn fixed_counts_are_clamped_to_chain() {
        let vs = nn::VarStore::new(Device::Cpu);
        let blk = block(&vs, 9);
        let (out, acc) = blk.forward(state(1, 5), BlockPlan::Fixed { prune: 8, merge: 7 }, false).unwrap();
        assert_eq!(out.num_tokens(), 5);
        assert!(acc.budget.merge_kept_num <= acc.budget.prune_kept_num);
    }

    #[test]
    fn soft_plan_carries_mask_and_gradients() {
        let vs = nn::VarStore::new(Device::Cpu);
        let blk = block(&vs, 9);
        let (out, acc) = blk.forward(state(2, 9), BlockPlan::Decide(DecideMode::Soft), true).unwrap();
        assert_eq!(out.mask.as_ref().map(|m| m.size()), Some(vec![2, 9]));
        let mask = out.mask.as_ref().unwrap().sum(Kind::Float);
        (acc.expected_merge + mask).backward();
        for (name, v) in vs.variables().iter().filter(|(k, _)| k.ends_with("logits")) {
            let g = v.grad();
            assert!(g.defined(), "{name} has no gradient");
            assert!(g.abs().sum(Kind::Float).double_value(&[]) > 0.0, "{name}");
        }
    }
}
