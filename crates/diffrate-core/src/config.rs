//! Run configuration for the DiffRate compression-rate search.
//!
//! [`DiffRateConfig`] is the single source of truth for a run: backbone
//! choice, search budget, controller optimisation, data sampling and
//! resume/finetune inputs. It is built once by the binary (defaults, then an
//! optional JSON file, then command-line overrides), validated, and passed
//! by reference to everything else. A copy travels inside every checkpoint.
//!
//! # Example
//!
//! ```rust
//! use diffrate_core::config::DiffRateConfig;
//!
//! let cfg = DiffRateConfig::default();
//! cfg.validate().expect("default config is valid");
//!
//! assert_eq!(cfg.granularity, 4);
//! assert_eq!(cfg.target_flops, 3.0);
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::budget::GlobalBudget;
use crate::error::ConfigError;

/// File name of the rolling checkpoint inside `output_dir`.
pub const CHECKPOINT_FILE: &str = "checkpoint.bin";
/// File name of the best checkpoint inside `output_dir`.
pub const BEST_CHECKPOINT_FILE: &str = "model_best.bin";
/// File name of the per-epoch JSON log inside `output_dir`.
pub const LOG_FILE: &str = "log.txt";

/// Layout of the weights passed with `finetune`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinetuneFormat {
    /// A checkpoint written by this tool, or any timm-named state dict.
    #[default]
    Timm,
    /// A Hugging Face CLIP checkpoint (`vision_model.*` keys).
    OpenaiClip,
}

// ---------------------------------------------------------------------------
// DiffRateConfig
// ---------------------------------------------------------------------------

/// Complete configuration of a search, evaluation or materialization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffRateConfig {
    // -----------------------------------------------------------------------
    // Model
    // -----------------------------------------------------------------------
    /// Architecture name, resolved through the model registry.
    /// Default: **`vit_base_patch16_clip_224.openai`**.
    pub model: String,

    /// Input image side length. Default: **224**.
    pub input_size: usize,

    /// Classifier width. Ignored for CLIP towers. Default: **1000**.
    pub num_classes: usize,

    /// Maximum stochastic-depth rate (last block). Default: **0.1**.
    pub drop_path: f64,

    // -----------------------------------------------------------------------
    // Compression search
    // -----------------------------------------------------------------------
    /// Target forward cost in GFLOPs. Default: **3.0**.
    pub target_flops: f64,

    /// Token gap between kept-count candidates. Default: **4**.
    pub granularity: usize,

    /// Smallest kept count any block may choose. Default: **1** (class token only).
    pub min_kept_tokens: usize,

    /// Run with the fixed schedule stored in the rate table instead of the
    /// learned controller. Default: **false**.
    pub load_compression_rate: bool,

    /// Location of the compression rate table. Default: **`compression_rate.json`**.
    pub compression_rate_path: PathBuf,

    /// Disable the compute-budget penalty during epoch 0. Default: **false**.
    pub warmup_compression_rate: bool,

    /// Weight of the feature-similarity term. Default: **5000**.
    pub alpha: f64,

    /// Weight of the compute-budget penalty. Default: **5.0**.
    pub flops_penalty_weight: f64,

    /// Label smoothing of the classification loss. Default: **0.1**.
    pub smoothing: f64,

    // -----------------------------------------------------------------------
    // Optimisation
    // -----------------------------------------------------------------------
    /// Per-replica mini-batch size. Default: **256**.
    pub batch_size: usize,

    /// Total number of epochs. Default: **300**.
    pub epochs: usize,

    /// Epoch to start from when not resuming. Default: **0**.
    pub start_epoch: usize,

    /// Peak learning rate of the controller parameters. Default: **0.01**.
    pub arch_lr: f64,

    /// Floor of the cosine schedule. Default: **0.001**.
    pub arch_min_lr: f64,

    /// Peak decay applied at each cosine restart. Default: **0.1**.
    pub decay_rate: f64,

    /// AdamW epsilon. Default: **1e-8**.
    pub opt_eps: f64,

    /// AdamW `(β1, β2)`. Default: **(0.9, 0.999)**.
    pub opt_betas: (f64, f64),

    /// Gradient-norm clip applied before the controller step. Default: **None**.
    pub clip_grad: Option<f64>,

    /// Dynamic loss scaling for reduced-precision backward passes. Default: **false**.
    pub use_amp: bool,

    // -----------------------------------------------------------------------
    // Data
    // -----------------------------------------------------------------------
    /// Fraction of the training set used per epoch. Default: **0.1**.
    pub train_sampling_rate: f64,

    /// Fraction of the validation set drawn (with replacement). Default: **0.1**.
    pub test_sampling_rate: f64,

    /// Samples in the synthetic training set used for dry runs. Default: **2560**.
    pub synthetic_train_samples: usize,

    /// Samples in the synthetic validation set. Default: **500**.
    pub synthetic_val_samples: usize,

    // -----------------------------------------------------------------------
    // Infrastructure
    // -----------------------------------------------------------------------
    /// Directory for checkpoints and `log.txt`. Default: **`./log/temp`**.
    pub output_dir: PathBuf,

    /// Resume from this checkpoint. Default: **None**.
    pub resume: Option<PathBuf>,

    /// Resume from `output_dir/checkpoint.bin` when it exists. Default: **false**.
    pub autoresume: bool,

    /// Initialise the backbone from these weights. Default: **None**.
    pub finetune: Option<PathBuf>,

    /// Key layout of the `finetune` weights. Default: **timm**.
    pub finetune_format: FinetuneFormat,

    /// Evaluate once and exit. Default: **false**.
    pub eval: bool,

    /// Base RNG seed; each replica adds its rank. Default: **0**.
    pub seed: u64,

    /// Log a progress line every this many steps. Default: **100**.
    pub log_interval: usize,

    /// Run on CUDA when available. Default: **false**.
    pub use_gpu: bool,

    /// CUDA ordinal used when `use_gpu` is set. Default: **0**.
    pub gpu_device_id: i64,
}

impl Default for DiffRateConfig {
    fn default() -> Self {
        DiffRateConfig {
            model: "vit_base_patch16_clip_224.openai".to_string(),
            input_size: 224,
            num_classes: 1000,
            drop_path: 0.1,

            target_flops: 3.0,
            granularity: 4,
            min_kept_tokens: 1,
            load_compression_rate: false,
            compression_rate_path: PathBuf::from("compression_rate.json"),
            warmup_compression_rate: false,
            alpha: 5000.0,
            flops_penalty_weight: 5.0,
            smoothing: 0.1,

            batch_size: 256,
            epochs: 300,
            start_epoch: 0,
            arch_lr: 0.01,
            arch_min_lr: 0.001,
            decay_rate: 0.1,
            opt_eps: 1e-8,
            opt_betas: (0.9, 0.999),
            clip_grad: None,
            use_amp: false,

            train_sampling_rate: 0.1,
            test_sampling_rate: 0.1,
            synthetic_train_samples: 2560,
            synthetic_val_samples: 500,

            output_dir: PathBuf::from("./log/temp"),
            resume: None,
            autoresume: false,
            finetune: None,
            finetune_format: FinetuneFormat::Timm,
            eval: false,
            seed: 0,
            log_interval: 100,
            use_gpu: false,
            gpu_device_id: 0,
        }
    }
}

impl DiffRateConfig {
    /// Load and validate a configuration from a JSON file.
    ///
    /// Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// [`ConfigError::FileRead`], [`ConfigError::ParseError`] or any
    /// validation error.
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::FileRead { path: path.to_path_buf(), source })?;
        let cfg: DiffRateConfig = serde_json::from_str(&contents)
            .map_err(|source| ConfigError::ParseError { path: path.to_path_buf(), source })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Write the configuration as pretty JSON, creating parent directories.
    pub fn to_json(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|source| ConfigError::FileRead { path: parent.to_path_buf(), source })?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::invalid_value("(serialization)", e.to_string()))?;
        std::fs::write(path, json).map_err(|source| ConfigError::FileRead { path: path.to_path_buf(), source })?;
        Ok(())
    }

    /// Search budget derived from `target_flops`, `granularity` and `min_kept_tokens`.
    pub fn global_budget(&self) -> Result<GlobalBudget, ConfigError> {
        GlobalBudget::new(self.target_flops, self.granularity, self.min_kept_tokens)
            .map_err(|e| ConfigError::invalid_value("target_flops", e.to_string()))
    }

    /// `output_dir/checkpoint.bin`.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.output_dir.join(CHECKPOINT_FILE)
    }

    /// `output_dir/model_best.bin`.
    pub fn best_checkpoint_path(&self) -> PathBuf {
        self.output_dir.join(BEST_CHECKPOINT_FILE)
    }

    /// `output_dir/log.txt`.
    pub fn log_path(&self) -> PathBuf {
        self.output_dir.join(LOG_FILE)
    }

    /// Checkpoint to resume from: the explicit `resume` path, else the
    /// rolling checkpoint when `autoresume` is set and it exists.
    pub fn resume_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.resume {
            return Some(path.clone());
        }
        let rolling = self.checkpoint_path();
        (self.autoresume && rolling.exists()).then_some(rolling)
    }

    /// Validate all fields.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidValue`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.is_empty() {
            return Err(ConfigError::invalid_value("model", "must not be empty"));
        }
        if self.input_size == 0 {
            return Err(ConfigError::invalid_value("input_size", "must be > 0"));
        }
        if self.num_classes == 0 {
            return Err(ConfigError::invalid_value("num_classes", "must be > 0"));
        }
        if !(0.0..1.0).contains(&self.drop_path) {
            return Err(ConfigError::invalid_value("drop_path", "must be in [0, 1)"));
        }

        if !self.target_flops.is_finite() || self.target_flops <= 0.0 {
            return Err(ConfigError::invalid_value("target_flops", "must be finite and > 0"));
        }
        if self.granularity == 0 {
            return Err(ConfigError::invalid_value("granularity", "must be > 0"));
        }
        if self.min_kept_tokens == 0 {
            return Err(ConfigError::invalid_value("min_kept_tokens", "must be >= 1 (the class token)"));
        }
        if self.load_compression_rate && !self.eval {
            return Err(ConfigError::invalid_value(
                "load_compression_rate",
                "a fixed schedule has no trainable decisions; combine it with `eval`",
            ));
        }
        if self.alpha < 0.0 || !self.alpha.is_finite() {
            return Err(ConfigError::invalid_value("alpha", "must be finite and >= 0"));
        }
        if self.flops_penalty_weight < 0.0 || !self.flops_penalty_weight.is_finite() {
            return Err(ConfigError::invalid_value("flops_penalty_weight", "must be finite and >= 0"));
        }
        if !(0.0..1.0).contains(&self.smoothing) {
            return Err(ConfigError::invalid_value("smoothing", "must be in [0, 1)"));
        }

        if self.batch_size == 0 {
            return Err(ConfigError::invalid_value("batch_size", "must be > 0"));
        }
        if self.epochs == 0 {
            return Err(ConfigError::invalid_value("epochs", "must be > 0"));
        }
        if self.arch_lr <= 0.0 {
            return Err(ConfigError::invalid_value("arch_lr", "must be > 0.0"));
        }
        if self.arch_min_lr < 0.0 || self.arch_min_lr > self.arch_lr {
            return Err(ConfigError::invalid_value(
                "arch_min_lr",
                format!("must be in [0, arch_lr = {}], got {}", self.arch_lr, self.arch_min_lr),
            ));
        }
        if self.decay_rate <= 0.0 || self.decay_rate > 1.0 {
            return Err(ConfigError::invalid_value("decay_rate", "must be in (0, 1]"));
        }
        if self.opt_eps <= 0.0 {
            return Err(ConfigError::invalid_value("opt_eps", "must be > 0.0"));
        }
        let (b1, b2) = self.opt_betas;
        if !(0.0..1.0).contains(&b1) || !(0.0..1.0).contains(&b2) {
            return Err(ConfigError::invalid_value("opt_betas", "both betas must be in [0, 1)"));
        }
        if let Some(clip) = self.clip_grad {
            if clip <= 0.0 {
                return Err(ConfigError::invalid_value("clip_grad", "must be > 0.0 when set"));
            }
        }

        for (field, rate) in [
            ("train_sampling_rate", self.train_sampling_rate),
            ("test_sampling_rate", self.test_sampling_rate),
        ] {
            if rate <= 0.0 || rate > 1.0 {
                return Err(ConfigError::invalid_value(field, format!("must be in (0, 1], got {rate}")));
            }
        }
        if self.synthetic_train_samples == 0 || self.synthetic_val_samples == 0 {
            return Err(ConfigError::invalid_value("synthetic_train_samples", "synthetic datasets must not be empty"));
        }

        if self.log_interval == 0 {
            return Err(ConfigError::invalid_value("log_interval", "must be > 0"));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid_value("output_dir", "must not be empty"));
        }
        if self.gpu_device_id < 0 {
            return Err(ConfigError::invalid_value("gpu_device_id", "must be >= 0"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_is_valid() {
        DiffRateConfig::default().validate().expect("default config must be valid");
    }

    #[test]
    fn json_round_trip() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("cfg.json");
        let mut cfg = DiffRateConfig::default();
        cfg.model = "vit_deit_small_patch16_224".into();
        cfg.clip_grad = Some(1.0);
        cfg.finetune_format = FinetuneFormat::OpenaiClip;
        cfg.to_json(&path).unwrap();
        assert_eq!(DiffRateConfig::from_json(&path).unwrap(), cfg);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("cfg.json");
        std::fs::write(&path, r#"{"target_flops": 2.9, "epochs": 3}"#).unwrap();
        let cfg = DiffRateConfig::from_json(&path).unwrap();
        assert_eq!(cfg.target_flops, 2.9);
        assert_eq!(cfg.epochs, 3);
        assert_eq!(cfg.batch_size, 256);
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("cfg.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(DiffRateConfig::from_json(&path), Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn zero_granularity_is_invalid() {
        let cfg = DiffRateConfig { granularity: 0, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidValue { field: "granularity", .. })));
    }

    #[test]
    fn fixed_schedule_requires_eval() {
        let cfg = DiffRateConfig { load_compression_rate: true, ..Default::default() };
        assert!(cfg.validate().is_err());
        let cfg = DiffRateConfig { load_compression_rate: true, eval: true, ..Default::default() };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn min_lr_above_peak_is_invalid() {
        let cfg = DiffRateConfig { arch_min_lr: 0.1, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn sampling_rate_bounds() {
        let cfg = DiffRateConfig { test_sampling_rate: 0.0, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidValue { field: "test_sampling_rate", .. })));
        let cfg = DiffRateConfig { train_sampling_rate: 1.0, ..Default::default() };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn autoresume_only_uses_existing_checkpoint() {
        let tmp = tempdir().unwrap();
        let cfg = DiffRateConfig { output_dir: tmp.path().to_path_buf(), autoresume: true, ..Default::default() };
        assert_eq!(cfg.resume_path(), None);
        std::fs::write(cfg.checkpoint_path(), b"x").unwrap();
        assert_eq!(cfg.resume_path(), Some(cfg.checkpoint_path()));
    }
}
