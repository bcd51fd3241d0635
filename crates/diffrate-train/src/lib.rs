//! # DiffRate training
//!
//! Tensor side of the compression-rate search: the Token Budget Controller,
//! the patched transformer block, the ViT backbone, the compute-budget loss
//! and the training loop. Everything that touches libtorch lives behind the
//! `tch-backend` feature; the patch-strategy registry and the error type are
//! always available.
//!
//! ## Architecture
//!
//! ```text
//! DiffRateConfig ──► Trainer ──► DiffRateModel ──► DiffRateVit
//!                      │              │                 │
//!                      │        model_vs / arch_vs   DiffRateBlock × depth
//!                      │                                 │
//!                      │                          BlockController (prune, merge)
//!                      │
//!                      ├──► CompressionLoss (task + penalty + similarity)
//!                      ├──► LossScaler ──► GradientSync ──► ArchAdamW
//!                      └──► Materializer ──► CompressionRateTable
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod patch;

#[cfg(feature = "tch-backend")]
pub mod block;
#[cfg(feature = "tch-backend")]
pub mod controller;
#[cfg(feature = "tch-backend")]
pub mod convert;
#[cfg(feature = "tch-backend")]
pub mod losses;
#[cfg(feature = "tch-backend")]
pub mod model;
#[cfg(feature = "tch-backend")]
pub mod optim;
#[cfg(feature = "tch-backend")]
pub mod trainer;

pub use error::{TrainError, TrainResult};
pub use patch::{PatchRegistry, PatchStrategy};

#[cfg(feature = "tch-backend")]
pub use controller::{BlockController, DecideMode, DecisionStage, StageDecision};
#[cfg(feature = "tch-backend")]
pub use losses::{CompressionLoss, LossBreakdown};
#[cfg(feature = "tch-backend")]
pub use model::{BudgetSource, DiffRateModel, DiffRateVit, ModelOutput};
#[cfg(feature = "tch-backend")]
pub use trainer::{FitReport, Trainer};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
