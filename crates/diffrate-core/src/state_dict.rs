//! Backend-independent state dicts and load-time reconciliation.
//!
//! A [`StateDict`] maps timm-style parameter names to `f32` arrays. Loading a
//! checkpoint into a model goes through [`reconcile`], which applies the
//! recovery rules for resume and finetune:
//!
//! ```text
//! checkpoint entry                      action
//! ───────────────────────────────────── ─────────────────────────────────
//! head.* / head_dist.*, shape differs   dropped (re-initialised head)
//! pos_embed, token count differs        bicubic resample of the patch grid
//! any other shape difference            StateDictError::ShapeMismatch
//! key unknown to the model              reported as unexpected, ignored
//! model key absent from checkpoint      reported as missing
//! ```

use ndarray::{concatenate, Array3, ArrayD, Axis, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::error::StateDictError;

/// Keys of classifier heads that may legitimately change shape.
pub const HEAD_KEYS: [&str; 4] = ["head.weight", "head.bias", "head_dist.weight", "head_dist.bias"];

/// Name of the learned position embedding.
pub const POS_EMBED_KEY: &str = "pos_embed";

// ---------------------------------------------------------------------------
// StateDict
// ---------------------------------------------------------------------------

/// Ordered map from parameter name to tensor data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDict {
    tensors: BTreeMap<String, ArrayD<f32>>,
}

impl StateDict {
    /// Empty state dict.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a tensor.
    pub fn insert(&mut self, key: impl Into<String>, value: ArrayD<f32>) -> Option<ArrayD<f32>> {
        self.tensors.insert(key.into(), value)
    }

    /// Tensor stored under `key`.
    pub fn get(&self, key: &str) -> Option<&ArrayD<f32>> {
        self.tensors.get(key)
    }

    /// Remove and return the tensor stored under `key`.
    pub fn remove(&mut self, key: &str) -> Option<ArrayD<f32>> {
        self.tensors.remove(key)
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.tensors.contains_key(key)
    }

    /// Shape of the tensor stored under `key`.
    pub fn shape(&self, key: &str) -> Option<&[usize]> {
        self.tensors.get(key).map(|t| t.shape())
    }

    /// Parameter names in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// `(name, tensor)` pairs in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArrayD<f32>)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether the dict holds no tensors.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Total number of scalar parameters.
    pub fn num_elements(&self) -> usize {
        self.tensors.values().map(|t| t.len()).sum()
    }

    /// Subset whose keys satisfy `pred`.
    pub fn filter(&self, pred: impl Fn(&str) -> bool) -> StateDict {
        StateDict {
            tensors: self
                .tensors
                .iter()
                .filter(|(k, _)| pred(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Name-to-shape map, as produced by a model.
    pub fn shapes(&self) -> ModelShapes {
        self.tensors.iter().map(|(k, v)| (k.clone(), v.shape().to_vec())).collect()
    }
}

impl FromIterator<(String, ArrayD<f32>)> for StateDict {
    fn from_iter<I: IntoIterator<Item = (String, ArrayD<f32>)>>(iter: I) -> Self {
        StateDict { tensors: iter.into_iter().collect() }
    }
}

/// Expected parameter shapes of a model.
pub type ModelShapes = BTreeMap<String, Vec<usize>>;

/// Whether `key` names a classifier-head parameter.
pub fn is_head_key(key: &str) -> bool {
    HEAD_KEYS.contains(&key)
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// What [`reconcile`] changed or noticed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Head entries removed because their shape differs.
    pub dropped: Vec<String>,
    /// Entries resampled to the model's shape.
    pub resized: Vec<String>,
    /// Model parameters absent from the checkpoint.
    pub missing: Vec<String>,
    /// Checkpoint entries the model does not have.
    pub unexpected: Vec<String>,
}

/// Adapt `checkpoint` to a model with parameter shapes `model`.
///
/// The returned dict only contains keys known to the model, each with the
/// model's shape, so it can be copied into the backend without further
/// checks. `num_prefix_tokens` is the number of non-spatial position tokens
/// kept verbatim when `pos_embed` is resampled.
///
/// # Errors
///
/// [`StateDictError::ShapeMismatch`] for a non-recoverable shape difference,
/// [`StateDictError::NotSquare`] when a position grid is not square.
pub fn reconcile(
    mut checkpoint: StateDict,
    model: &ModelShapes,
    num_prefix_tokens: usize,
) -> Result<(StateDict, LoadReport), StateDictError> {
    let mut report = LoadReport::default();

    for key in HEAD_KEYS {
        if let (Some(actual), Some(expected)) = (checkpoint.shape(key), model.get(key)) {
            if actual != expected.as_slice() {
                info!("Removing key {key} from pretrained checkpoint");
                checkpoint.remove(key);
                report.dropped.push(key.to_string());
            }
        }
    }

    let mut out = StateDict::new();
    for (key, value) in checkpoint.tensors {
        let Some(expected) = model.get(&key) else {
            report.unexpected.push(key);
            continue;
        };
        if value.shape() == expected.as_slice() {
            out.insert(key, value);
            continue;
        }
        if key == POS_EMBED_KEY {
            let resized = resize_pos_embed(&value, expected, num_prefix_tokens)?;
            info!("Resized {key} from {:?} to {:?}", value.shape(), resized.shape());
            report.resized.push(key.clone());
            out.insert(key, resized);
            continue;
        }
        return Err(StateDictError::ShapeMismatch {
            key,
            expected: expected.clone(),
            actual: value.shape().to_vec(),
        });
    }

    report.missing = model.keys().filter(|k| !out.contains(k)).cloned().collect();
    if !report.missing.is_empty() {
        warn!("{} model parameters missing from checkpoint: {:?}", report.missing.len(), report.missing);
    }
    if !report.unexpected.is_empty() {
        info!("ignoring {} unexpected checkpoint entries", report.unexpected.len());
    }
    Ok((out, report))
}

// ---------------------------------------------------------------------------
// Position embedding resampling
// ---------------------------------------------------------------------------

/// Resample a `[1, P + G², C]` position embedding to the model's `[1, P + H·W, C]`.
///
/// Prefix tokens are copied unchanged; the spatial grid is interpolated
/// bicubically. The target grid is taken to be square.
pub fn resize_pos_embed(
    pos_embed: &ArrayD<f32>,
    target_shape: &[usize],
    num_prefix_tokens: usize,
) -> Result<ArrayD<f32>, StateDictError> {
    let to_3d = |shape: &[usize]| -> Result<(usize, usize, usize), StateDictError> {
        match shape {
            [b, n, c] => Ok((*b, *n, *c)),
            other => Err(StateDictError::invalid(POS_EMBED_KEY, format!("expected rank 3, got shape {other:?}"))),
        }
    };
    let (batch, src_tokens, dim) = to_3d(pos_embed.shape())?;
    let (_, dst_tokens, dst_dim) = to_3d(target_shape)?;
    if dim != dst_dim || batch != 1 {
        return Err(StateDictError::ShapeMismatch {
            key: POS_EMBED_KEY.to_string(),
            expected: target_shape.to_vec(),
            actual: pos_embed.shape().to_vec(),
        });
    }
    if src_tokens < num_prefix_tokens || dst_tokens < num_prefix_tokens {
        return Err(StateDictError::invalid(POS_EMBED_KEY, "fewer tokens than prefix tokens"));
    }
    let src_side = square_side(src_tokens - num_prefix_tokens)?;
    let dst_side = square_side(dst_tokens - num_prefix_tokens)?;
    if src_side == 0 || dst_side == 0 {
        return Err(StateDictError::invalid(
            POS_EMBED_KEY,
            format!("empty patch grid ({src_side}x{src_side} to {dst_side}x{dst_side})"),
        ));
    }

    let pos = pos_embed
        .view()
        .into_dimensionality::<ndarray::Ix3>()
        .map_err(|e| StateDictError::invalid(POS_EMBED_KEY, e.to_string()))?;
    let prefix = pos.slice(ndarray::s![.., ..num_prefix_tokens, ..]);
    let grid = pos.slice(ndarray::s![0, num_prefix_tokens.., ..]);

    let mut resized = Array3::<f32>::zeros((1, dst_side * dst_side, dim));
    let mut plane = vec![0.0f32; src_side * src_side];
    for c in 0..dim {
        for (i, v) in plane.iter_mut().enumerate() {
            *v = grid[[i, c]];
        }
        let out = bicubic_resize(&plane, (src_side, src_side), (dst_side, dst_side));
        for (i, v) in out.into_iter().enumerate() {
            resized[[0, i, c]] = v;
        }
    }

    let joined = concatenate(Axis(1), &[prefix, resized.view()])
        .map_err(|e| StateDictError::invalid(POS_EMBED_KEY, e.to_string()))?;
    Ok(joined.into_dyn())
}

fn square_side(tokens: usize) -> Result<usize, StateDictError> {
    let side = (tokens as f64).sqrt().round() as usize;
    if side * side != tokens {
        return Err(StateDictError::NotSquare { key: POS_EMBED_KEY.to_string(), tokens });
    }
    Ok(side)
}

const CUBIC_A: f32 = -0.75;

fn cubic_weights(t: f32) -> [f32; 4] {
    let near = |x: f32| ((CUBIC_A + 2.0) * x - (CUBIC_A + 3.0)) * x * x + 1.0;
    let far = |x: f32| ((CUBIC_A * x - 5.0 * CUBIC_A) * x + 8.0 * CUBIC_A) * x - 4.0 * CUBIC_A;
    [far(t + 1.0), near(t), near(1.0 - t), far(2.0 - t)]
}

/// Bicubic resampling of one row-major plane with `align_corners = false`.
///
/// Matches `torch.nn.functional.interpolate(mode="bicubic")`: source
/// coordinates are `(dst + 0.5) · in/out - 0.5` and taps outside the plane
/// read the nearest border value.
pub fn bicubic_resize(src: &[f32], (in_h, in_w): (usize, usize), (out_h, out_w): (usize, usize)) -> Vec<f32> {
    if in_h == out_h && in_w == out_w {
        return src.to_vec();
    }
    let scale_h = in_h as f32 / out_h as f32;
    let scale_w = in_w as f32 / out_w as f32;
    let at = |y: isize, x: isize| {
        let y = y.clamp(0, in_h as isize - 1) as usize;
        let x = x.clamp(0, in_w as isize - 1) as usize;
        src[y * in_w + x]
    };

    let mut out = Vec::with_capacity(out_h * out_w);
    for oy in 0..out_h {
        let fy = (oy as f32 + 0.5) * scale_h - 0.5;
        let iy = fy.floor();
        let wy = cubic_weights(fy - iy);
        let iy = iy as isize;
        for ox in 0..out_w {
            let fx = (ox as f32 + 0.5) * scale_w - 0.5;
            let ix = fx.floor();
            let wx = cubic_weights(fx - ix);
            let ix = ix as isize;
            let mut acc = 0.0f32;
            for (dy, wy) in wy.iter().enumerate() {
                let row: f32 = wx
                    .iter()
                    .enumerate()
                    .map(|(dx, wx)| wx * at(iy - 1 + dy as isize, ix - 1 + dx as isize))
                    .sum();
                acc += wy * row;
            }
            out.push(acc);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// OpenAI CLIP conversion
// ---------------------------------------------------------------------------

/// Prefix of vision-tower keys in Hugging Face CLIP checkpoints.
pub const CLIP_VISION_PREFIX: &str = "vision_model.";

const CLIP_SWAPS: [(&str, &str); 11] = [
    ("embeddings.patch_embedding", "patch_embed.proj"),
    ("embeddings.position_embedding.weight", "pos_embed"),
    ("embeddings.class_embedding", "cls_token"),
    ("self_attn", "attn"),
    ("encoder.layers.", "blocks."),
    ("pre_layrnorm", "norm_pre"),
    ("post_layernorm", "norm"),
    ("layer_norm1", "norm1"),
    ("layer_norm2", "norm2"),
    ("out_proj", "proj"),
    ("visual_projection", "head"),
];

/// Convert a Hugging Face CLIP checkpoint into timm ViT naming.
///
/// Separate `q_proj`/`k_proj`/`v_proj` tensors are fused into
/// `blocks.{i}.attn.qkv.*` (concatenated along the output dimension in
/// q, k, v order), the class embedding becomes `[1, 1, C]`, the position
/// embedding becomes `[1, N, C]` and a zero `head.bias` accompanies the
/// projection. Keys outside the vision tower are dropped.
pub fn convert_openai_clip(state_dict: &StateDict) -> Result<StateDict, StateDictError> {
    let mut out = StateDict::new();
    let mut qkv: BTreeMap<(usize, &'static str), [Option<ArrayD<f32>>; 3]> = BTreeMap::new();

    for (raw_key, value) in state_dict.iter() {
        if !raw_key.starts_with(CLIP_VISION_PREFIX) && !raw_key.contains("visual_projection") {
            continue;
        }
        let mut key = raw_key.replacen(CLIP_VISION_PREFIX, "", 1);
        for (from, to) in CLIP_SWAPS {
            key = key.replace(from, to);
        }

        match key.as_str() {
            "head.weight" => {
                out.insert("head.bias", ArrayD::zeros(IxDyn(&[value.shape()[0]])));
                out.insert(key, value.clone());
            }
            "cls_token" => {
                let dim = value.len();
                let v = value
                    .clone()
                    .into_shape(IxDyn(&[1, 1, dim]))
                    .map_err(|e| StateDictError::invalid(raw_key, e.to_string()))?;
                out.insert(key, v);
            }
            "pos_embed" => {
                let v = value.clone().insert_axis(Axis(0));
                out.insert(key, v);
            }
            _ => {
                if let Some((block, slot, kind)) = split_qkv_key(&key) {
                    qkv.entry((block, kind)).or_default()[slot] = Some(value.clone());
                } else {
                    out.insert(key, value.clone());
                }
            }
        }
    }

    for ((block, kind), parts) in qkv {
        let name = format!("blocks.{block}.attn.qkv.{kind}");
        let views = parts
            .iter()
            .map(|p| p.as_ref().map(|a| a.view()))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| StateDictError::MissingKey(format!("blocks.{block}.attn.{{q,k,v}}_proj.{kind}")))?;
        let fused = concatenate(Axis(0), &views).map_err(|e| StateDictError::invalid(&name, e.to_string()))?;
        out.insert(name, fused);
    }
    Ok(out)
}

/// `blocks.{i}.attn.{q,k,v}_proj.{weight,bias}` → `(i, slot, kind)`.
fn split_qkv_key(key: &str) -> Option<(usize, usize, &'static str)> {
    let rest = key.strip_prefix("blocks.")?;
    let (idx, tail) = rest.split_once('.')?;
    let block = idx.parse().ok()?;
    let slot = match tail {
        t if t.starts_with("attn.q_proj.") => 0,
        t if t.starts_with("attn.k_proj.") => 1,
        t if t.starts_with("attn.v_proj.") => 2,
        _ => return None,
    };
    let kind = match tail.rsplit('.').next()? {
        "weight" => "weight",
        "bias" => "bias",
        _ => return None,
    };
    Some((block, slot, kind))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn arr(shape: &[usize], fill: f32) -> ArrayD<f32> {
        ArrayD::from_elem(IxDyn(shape), fill)
    }

    #[test]
    fn identity_resize_is_exact() {
        let src: Vec<f32> = (0..16).map(|v| v as f32).collect();
        assert_eq!(bicubic_resize(&src, (4, 4), (4, 4)), src);
    }

    #[test]
    fn constant_plane_stays_constant() {
        let src = vec![2.5f32; 9];
        for v in bicubic_resize(&src, (3, 3), (7, 7)) {
            assert_abs_diff_eq!(v, 2.5, epsilon = 1e-5);
        }
    }

    #[test]
    fn cubic_weights_sum_to_one() {
        for t in [0.0f32, 0.25, 0.5, 0.9] {
            let w = cubic_weights(t);
            assert_abs_diff_eq!(w.iter().sum::<f32>(), 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn pos_embed_resize_keeps_prefix_and_hits_target() {
        let mut pos = arr(&[1, 1 + 14 * 14, 8], 0.5);
        pos[[0, 0, 3]] = 9.0;
        let out = resize_pos_embed(&pos, &[1, 1 + 16 * 16, 8], 1).unwrap();
        assert_eq!(out.shape(), &[1, 257, 8]);
        assert_eq!(out[[0, 0, 3]], 9.0);
        assert_abs_diff_eq!(out[[0, 100, 2]], 0.5, epsilon = 1e-5);
    }

    #[test]
    fn prefix_only_pos_embed_is_a_load_error() {
        let err = resize_pos_embed(&arr(&[1, 1, 8], 0.0), &[1, 17, 8], 1).unwrap_err();
        assert!(matches!(err, StateDictError::InvalidTensor { .. }), "{err}");
        let err = resize_pos_embed(&arr(&[1, 17, 8], 0.0), &[1, 1, 8], 1).unwrap_err();
        assert!(matches!(err, StateDictError::InvalidTensor { .. }), "{err}");
    }

    #[test]
    fn non_square_grid_is_rejected() {
        let pos = arr(&[1, 1 + 15, 4], 0.0);
        let err = resize_pos_embed(&pos, &[1, 1 + 16, 4], 1).unwrap_err();
        assert!(matches!(err, StateDictError::NotSquare { tokens: 15, .. }));
    }

    #[test]
    fn reconcile_drops_mismatched_head_only() {
        let mut ckpt = StateDict::new();
        ckpt.insert("head.weight", arr(&[1000, 8], 1.0));
        ckpt.insert("head.bias", arr(&[1000], 1.0));
        ckpt.insert("blocks.0.norm1.weight", arr(&[8], 1.0));
        ckpt.insert("extra", arr(&[2], 1.0));

        let mut model = ModelShapes::new();
        model.insert("head.weight".into(), vec![10, 8]);
        model.insert("head.bias".into(), vec![10]);
        model.insert("blocks.0.norm1.weight".into(), vec![8]);
        model.insert("blocks.0.prune.logits".into(), vec![5]);

        let (sd, report) = reconcile(ckpt, &model, 1).unwrap();
        assert_eq!(report.dropped, vec!["head.weight", "head.bias"]);
        assert_eq!(report.unexpected, vec!["extra"]);
        assert!(report.missing.contains(&"blocks.0.prune.logits".to_string()));
        assert!(sd.contains("blocks.0.norm1.weight"));
        assert!(!sd.contains("head.weight"));
    }

    #[test]
    fn reconcile_rejects_other_mismatches() {
        let mut ckpt = StateDict::new();
        ckpt.insert("blocks.0.attn.qkv.weight", arr(&[24, 8], 0.0));
        let mut model = ModelShapes::new();
        model.insert("blocks.0.attn.qkv.weight".into(), vec![48, 16]);
        assert!(matches!(reconcile(ckpt, &model, 1), Err(StateDictError::ShapeMismatch { .. })));
    }

    #[test]
    fn clip_keys_are_converted_and_qkv_fused() {
        let mut hf = StateDict::new();
        hf.insert("vision_model.embeddings.class_embedding", arr(&[4], 1.0));
        hf.insert("vision_model.embeddings.position_embedding.weight", arr(&[5, 4], 0.0));
        hf.insert("vision_model.encoder.layers.0.self_attn.q_proj.weight", arr(&[4, 4], 1.0));
        hf.insert("vision_model.encoder.layers.0.self_attn.k_proj.weight", arr(&[4, 4], 2.0));
        hf.insert("vision_model.encoder.layers.0.self_attn.v_proj.weight", arr(&[4, 4], 3.0));
        hf.insert("vision_model.encoder.layers.0.self_attn.q_proj.bias", arr(&[4], 1.0));
        hf.insert("vision_model.encoder.layers.0.self_attn.k_proj.bias", arr(&[4], 2.0));
        hf.insert("vision_model.encoder.layers.0.self_attn.v_proj.bias", arr(&[4], 3.0));
        hf.insert("vision_model.encoder.layers.0.self_attn.out_proj.weight", arr(&[4, 4], 0.0));
        hf.insert("vision_model.pre_layrnorm.weight", arr(&[4], 1.0));
        hf.insert("visual_projection.weight", arr(&[6, 4], 0.0));
        hf.insert("text_model.embeddings.token_embedding.weight", arr(&[3, 4], 0.0));

        let sd = convert_openai_clip(&hf).unwrap();
        assert_eq!(sd.shape("cls_token"), Some(&[1, 1, 4][..]));
        assert_eq!(sd.shape("pos_embed"), Some(&[1, 5, 4][..]));
        assert_eq!(sd.shape("blocks.0.attn.qkv.weight"), Some(&[12, 4][..]));
        assert_eq!(sd.shape("head.bias"), Some(&[6][..]));
        assert!(sd.contains("blocks.0.attn.proj.weight"));
        assert!(sd.contains("norm_pre.weight"));
        assert!(!sd.keys().any(|k| k.contains("q_proj") || k.starts_with("text_model")));
        let qkv = sd.get("blocks.0.attn.qkv.bias").unwrap();
        assert_eq!(qkv[[0]], 1.0);
        assert_eq!(qkv[[4]], 2.0);
        assert_eq!(qkv[[8]], 3.0);
    }
}
