//! # DiffRate core
//!
//! Backend-independent half of the DiffRate compression-rate search for
//! vision transformers: configuration, kept-token budgets, the FLOPs model,
//! the persisted compression rate table and its materializer, state-dict
//! reconciliation, checkpoints, the cosine scheduler, dataset sampling and
//! replica context. The tensor side (controller, patched blocks, losses,
//! training loop) lives in `diffrate-train`.
//!
//! ## Architecture
//!
//! ```text
//! DiffRateConfig ──► ModelRegistry ──► ModelSpec ──► FlopsModel
//!       │                                  │
//!       │                           GlobalBudget ──► KeptCandidates
//!       │                                  │
//!       ├──► CompressionRateTable ◄── Materializer ◄── StateDict (controller logits)
//!       │
//!       ├──► Checkpoint / CheckpointManager (StateDict, OptimizerState, CosineScheduler)
//!       │
//!       └──► ImageDataset ──► samplers ──► DataLoader
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use diffrate_core::budget::Schedule;
//! use diffrate_core::rate_table::CompressionRateTable;
//! use diffrate_core::registry::ModelRegistry;
//!
//! let spec = ModelRegistry::with_defaults().get("vit_deit_small_patch16_224").unwrap().clone();
//! let mut table = CompressionRateTable::new();
//! table.upsert(&spec.display_name, 2.9, &Schedule::full(spec.depth, spec.num_tokens()));
//!
//! let schedule = table.lookup("ViT-S-DeiT", 2.9).unwrap();
//! assert!(schedule.layer_budgets(spec.num_tokens()).is_ok());
//! assert!(table.lookup("ViT-S-DeiT", 3.0).is_err());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod budget;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod dist;
pub mod error;
pub mod flops;
pub mod materialize;
pub mod rate_table;
pub mod registry;
pub mod schedule;
pub mod state_dict;
pub mod stats;

// Convenient re-exports at the crate root.
pub use budget::{GlobalBudget, KeptCandidates, LayerBudget, Schedule};
pub use checkpoint::{Checkpoint, CheckpointManager, LossScalerState, OptimizerState};
pub use config::{DiffRateConfig, FinetuneFormat};
pub use dataset::{DataLoader, ImageBatch, ImageDataset, ImageSample, SyntheticImageDataset};
pub use dist::{DistContext, GradientSync, LocalSync};
pub use error::{
    BudgetError, CheckpointError, ConfigError, DatasetError, DiffRateError, DiffRateResult, RateTableError,
    StateDictError,
};
pub use flops::FlopsModel;
pub use materialize::Materializer;
pub use rate_table::CompressionRateTable;
pub use registry::{ModelFamily, ModelRegistry, ModelSpec};
pub use schedule::CosineScheduler;
pub use state_dict::StateDict;

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
