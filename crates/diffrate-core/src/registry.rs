//! Model registry: architecture names, display names and backbone dimensions.
//!
//! The registry is consulted once, when a run is configured. Everything that
//! depends on the model family afterwards receives the resolved
//! [`ModelSpec`] instead of re-inspecting the architecture name.
//!
//! ```rust
//! use diffrate_core::registry::{ModelFamily, ModelRegistry};
//!
//! let registry = ModelRegistry::with_defaults();
//! let spec = registry.get("vit_deit_base_patch16_224").unwrap();
//! assert_eq!(spec.display_name, "ViT-B-DeiT");
//! assert_eq!(spec.family, ModelFamily::Deit);
//! assert_eq!(spec.num_tokens(), 197);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// ModelFamily
// ---------------------------------------------------------------------------

/// Backbone family. Selects the patch strategy used to build the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    /// Supervised DeiT ViTs (class-token pooling, GELU).
    Deit,
    /// MAE-pretrained ViTs (size-weighted mean pooling, GELU).
    Mae,
    /// OpenAI CLIP vision towers (QuickGELU, pre-norm, feature objective).
    Clip,
}

impl ModelFamily {
    /// Lower-case tag used in logs and configuration files.
    pub fn tag(&self) -> &'static str {
        match self {
            ModelFamily::Deit => "deit",
            ModelFamily::Mae => "mae",
            ModelFamily::Clip => "clip",
        }
    }

    /// Whether the family is trained against class labels.
    ///
    /// CLIP towers have no classifier; their objective is the feature
    /// similarity to the uncompressed model.
    pub fn is_classifier(&self) -> bool {
        !matches!(self, ModelFamily::Clip)
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

// ---------------------------------------------------------------------------
// ModelSpec
// ---------------------------------------------------------------------------

/// Static description of a patchable ViT backbone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Architecture name as passed on the command line.
    pub arch: String,
    /// Name used as the top-level key of the compression rate table.
    pub display_name: String,
    /// Backbone family.
    pub family: ModelFamily,
    /// Input image side length in pixels.
    pub img_size: usize,
    /// Patch side length in pixels.
    pub patch_size: usize,
    /// Input channels.
    pub in_chans: usize,
    /// Token embedding width.
    pub embed_dim: usize,
    /// Number of transformer blocks.
    pub depth: usize,
    /// Attention heads per block.
    pub num_heads: usize,
    /// MLP hidden width as a multiple of `embed_dim`.
    pub mlp_ratio: f64,
    /// Non-spatial tokens prepended to the patch sequence (class token).
    pub num_prefix_tokens: usize,
}

impl ModelSpec {
    #[allow(clippy::too_many_arguments)]
    fn vit(
        arch: &str,
        display_name: &str,
        family: ModelFamily,
        patch_size: usize,
        embed_dim: usize,
        depth: usize,
        num_heads: usize,
    ) -> Self {
        ModelSpec {
            arch: arch.to_string(),
            display_name: display_name.to_string(),
            family,
            img_size: 224,
            patch_size,
            in_chans: 3,
            embed_dim,
            depth,
            num_heads,
            mlp_ratio: 4.0,
            num_prefix_tokens: 1,
        }
    }

    /// Copy of this spec with a different input resolution.
    pub fn with_img_size(mut self, img_size: usize) -> Self {
        self.img_size = img_size;
        self
    }

    /// Patches per side.
    pub fn grid_size(&self) -> usize {
        self.img_size / self.patch_size
    }

    /// Number of spatial patch tokens.
    pub fn num_patches(&self) -> usize {
        self.grid_size() * self.grid_size()
    }

    /// Tokens entering the first block (patches plus prefix tokens).
    pub fn num_tokens(&self) -> usize {
        self.num_patches() + self.num_prefix_tokens
    }

    /// MLP hidden width.
    pub fn mlp_hidden_dim(&self) -> usize {
        (self.embed_dim as f64 * self.mlp_ratio) as usize
    }

    /// Width of a single attention head.
    pub fn head_dim(&self) -> usize {
        self.embed_dim / self.num_heads
    }

    /// Check that the dimensions describe a buildable backbone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.patch_size == 0 || self.img_size < self.patch_size {
            return Err(ConfigError::invalid_value(
                "input_size",
                format!(
                    "image size {} must be at least one patch of {}",
                    self.img_size, self.patch_size
                ),
            ));
        }
        if self.img_size % self.patch_size != 0 {
            return Err(ConfigError::invalid_value(
                "input_size",
                format!("{} is not divisible by patch size {}", self.img_size, self.patch_size),
            ));
        }
        if self.depth == 0 {
            return Err(ConfigError::invalid_value("depth", "must be > 0"));
        }
        if self.num_heads == 0 || self.embed_dim % self.num_heads != 0 {
            return Err(ConfigError::invalid_value(
                "num_heads",
                format!("embed_dim {} is not divisible by {} heads", self.embed_dim, self.num_heads),
            ));
        }
        if self.mlp_ratio <= 0.0 {
            return Err(ConfigError::invalid_value("mlp_ratio", "must be > 0.0"));
        }
        if self.num_prefix_tokens == 0 {
            return Err(ConfigError::invalid_value(
                "num_prefix_tokens",
                "a class token is required for importance scoring",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ModelRegistry
// ---------------------------------------------------------------------------

/// Lookup table from architecture name to [`ModelSpec`].
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    specs: Vec<ModelSpec>,
}

impl ModelRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the supported DeiT, MAE and CLIP backbones.
    pub fn with_defaults() -> Self {
        use ModelFamily::*;
        let specs = vec![
            ModelSpec::vit("vit_deit_tiny_patch16_224", "ViT-T-DeiT", Deit, 16, 192, 12, 3),
            ModelSpec::vit("vit_deit_small_patch16_224", "ViT-S-DeiT", Deit, 16, 384, 12, 6),
            ModelSpec::vit("vit_deit_base_patch16_224", "ViT-B-DeiT", Deit, 16, 768, 12, 12),
            ModelSpec::vit("vit_base_patch16_mae", "ViT-B-MAE", Mae, 16, 768, 12, 12),
            ModelSpec::vit("vit_large_patch16_mae", "ViT-L-MAE", Mae, 16, 1024, 24, 16),
            ModelSpec::vit("vit_huge_patch14_mae", "ViT-H-MAE", Mae, 14, 1280, 32, 16),
            ModelSpec::vit("vit_base_patch16_clip_224.openai", "ViT-B-CLIP", Clip, 16, 768, 12, 12),
            ModelSpec::vit("vit_large_patch14_clip_224.openai", "ViT-L-CLIP", Clip, 14, 1024, 24, 16),
        ];
        ModelRegistry { specs }
    }

    /// Add or replace a spec, keyed by its architecture name.
    pub fn register(&mut self, spec: ModelSpec) -> &mut Self {
        self.specs.retain(|s| s.arch != spec.arch);
        self.specs.push(spec);
        self
    }

    /// Resolve an architecture name.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnknownModel`] when the name is not registered.
    pub fn get(&self, arch: &str) -> Result<&ModelSpec, ConfigError> {
        self.specs.iter().find(|s| s.arch == arch).ok_or_else(|| ConfigError::UnknownModel {
            name: arch.to_string(),
            supported: self.names().join(", "),
        })
    }

    /// Registered architecture names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.specs.iter().map(|s| s.arch.as_str()).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_models_validate() {
        let registry = ModelRegistry::with_defaults();
        for name in registry.names() {
            registry.get(name).unwrap().validate().unwrap();
        }
    }

    #[test]
    fn huge_mae_uses_patch14_grid() {
        let registry = ModelRegistry::with_defaults();
        let spec = registry.get("vit_huge_patch14_mae").unwrap();
        assert_eq!(spec.grid_size(), 16);
        assert_eq!(spec.num_tokens(), 257);
        assert_eq!(spec.mlp_hidden_dim(), 5120);
    }

    #[test]
    fn unknown_model_lists_supported_names() {
        let registry = ModelRegistry::with_defaults();
        let err = registry.get("caformer_s36").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("caformer_s36"));
        assert!(msg.contains("vit_deit_base_patch16_224"));
    }

    #[test]
    fn register_replaces_existing_arch() {
        let mut registry = ModelRegistry::with_defaults();
        let spec = registry.get("vit_deit_tiny_patch16_224").unwrap().clone().with_img_size(384);
        registry.register(spec);
        assert_eq!(registry.get("vit_deit_tiny_patch16_224").unwrap().grid_size(), 24);
        assert_eq!(registry.names().iter().filter(|n| **n == "vit_deit_tiny_patch16_224").count(), 1);
    }

    #[test]
    fn indivisible_input_size_is_rejected() {
        let registry = ModelRegistry::with_defaults();
        let spec = registry.get("vit_deit_small_patch16_224").unwrap().clone().with_img_size(200);
        assert!(spec.validate().is_err());
    }
}
