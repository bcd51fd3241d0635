//! Family-specific patch strategies.
//!
//! Each supported backbone family differs from a plain timm ViT in a handful
//! of places: the MLP activation, an extra pre-norm, how the final tokens are
//! pooled and whether the run has a classification objective. A
//! [`PatchStrategy`] answers those questions once, when the model is built;
//! nothing downstream inspects the architecture name.
//!
//! ```text
//! family   activation  norm_pre  final norm  pooling                 objective
//! ──────   ──────────  ────────  ──────────  ──────────────────────  ─────────────────────
//! deit     GELU        no        norm        class token             CE + similarity
//! mae      GELU        no        fc_norm     size-weighted mean      CE + similarity
//! clip     QuickGELU   yes       norm        class token             similarity only
//! ```

use std::collections::HashMap;

use diffrate_core::error::ConfigError;
use diffrate_core::registry::ModelFamily;

/// MLP non-linearity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Exact GELU.
    Gelu,
    /// `x · sigmoid(1.702 · x)`, as in OpenAI CLIP.
    QuickGelu,
}

/// Reduction of the final token sequence to one feature vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pooling {
    /// The class token after the final norm.
    ClassToken,
    /// Mean of the patch tokens weighted by how many patches each represents,
    /// followed by `fc_norm`.
    SizeWeightedMean,
}

/// Family-specific construction choices for a patched ViT.
pub trait PatchStrategy: Send + Sync {
    /// Family handled by this strategy.
    fn family(&self) -> ModelFamily;

    /// MLP activation.
    fn activation(&self) -> Activation;

    /// Token pooling before the head.
    fn pooling(&self) -> Pooling;

    /// Whether a LayerNorm is applied to the embedded tokens before block 0.
    fn norm_pre(&self) -> bool {
        false
    }

    /// LayerNorm epsilon.
    fn layer_norm_eps(&self) -> f64 {
        1e-6
    }

    /// Whether the patch-embedding convolution carries a bias.
    fn patch_embed_bias(&self) -> bool {
        true
    }

    /// Whether the run optimises a classification loss next to the
    /// similarity term.
    fn has_task_loss(&self) -> bool {
        self.family().is_classifier()
    }
}

/// Supervised DeiT.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeitPatch;

impl PatchStrategy for DeitPatch {
    fn family(&self) -> ModelFamily {
        ModelFamily::Deit
    }
    fn activation(&self) -> Activation {
        Activation::Gelu
    }
    fn pooling(&self) -> Pooling {
        Pooling::ClassToken
    }
}

/// MAE-pretrained, finetuned with average pooling.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaePatch;

impl PatchStrategy for MaePatch {
    fn family(&self) -> ModelFamily {
        ModelFamily::Mae
    }
    fn activation(&self) -> Activation {
        Activation::Gelu
    }
    fn pooling(&self) -> Pooling {
        Pooling::SizeWeightedMean
    }
}

/// OpenAI CLIP vision tower.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClipPatch;

impl PatchStrategy for ClipPatch {
    fn family(&self) -> ModelFamily {
        ModelFamily::Clip
    }
    fn activation(&self) -> Activation {
        Activation::QuickGelu
    }
    fn pooling(&self) -> Pooling {
        Pooling::ClassToken
    }
    fn norm_pre(&self) -> bool {
        true
    }
    fn layer_norm_eps(&self) -> f64 {
        1e-5
    }
    fn patch_embed_bias(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// PatchRegistry
// ---------------------------------------------------------------------------

/// Mapping from [`ModelFamily`] to its strategy.
pub struct PatchRegistry {
    strategies: HashMap<ModelFamily, Box<dyn PatchStrategy>>,
}

impl Default for PatchRegistry {
    fn default() -> Self {
        let mut registry = PatchRegistry { strategies: HashMap::new() };
        registry.register(Box::new(DeitPatch));
        registry.register(Box::new(MaePatch));
        registry.register(Box::new(ClipPatch));
        registry
    }
}

impl PatchRegistry {
    /// Registry with no strategies.
    pub fn empty() -> Self {
        PatchRegistry { strategies: HashMap::new() }
    }

    /// Add or replace the strategy for its family.
    pub fn register(&mut self, strategy: Box<dyn PatchStrategy>) {
        self.strategies.insert(strategy.family(), strategy);
    }

    /// Strategy for `family`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnsupportedFamily`] when no strategy is registered.
    pub fn resolve(&self, family: ModelFamily) -> Result<&dyn PatchStrategy, ConfigError> {
        self.strategies
            .get(&family)
            .map(|s| s.as_ref())
            .ok_or_else(|| ConfigError::UnsupportedFamily { family: family.tag().to_string() })
    }
}
