//! Error types for the DiffRate compression-rate search.
//!
//! Every module in this crate takes its error type from here. Lower-level
//! errors convert into [`DiffRateError`] through [`From`], so orchestration
//! code can use `?` across module boundaries.
//!
//! ## Hierarchy
//!
//! ```text
//! DiffRateError (top-level)
//! ├── ConfigError      (config validation / file loading / unknown models)
//! ├── BudgetError      (kept-count chain and candidate violations)
//! ├── RateTableError   (compression_rate.json lookup and parsing)
//! ├── StateDictError   (shape reconciliation on resume / finetune)
//! ├── CheckpointError  (checkpoint encode / decode / I/O)
//! └── DatasetError     (sample access and sampling rates)
//! ```

use std::path::PathBuf;
use thiserror::Error;

// ---------------------------------------------------------------------------
// DiffRateResult
// ---------------------------------------------------------------------------

/// Convenient `Result` alias used by orchestration-level functions.
pub type DiffRateResult<T> = Result<T, DiffRateError>;

// ---------------------------------------------------------------------------
// DiffRateError: top-level aggregator
// ---------------------------------------------------------------------------

/// Top-level error type for the compression-rate search.
#[derive(Debug, Error)]
pub enum DiffRateError {
    /// A configuration validation or loading error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A kept-count budget violated its invariants.
    #[error("Budget error: {0}")]
    Budget(#[from] BudgetError),

    /// The compression rate table could not be used.
    #[error("Compression rate table error: {0}")]
    RateTable(#[from] RateTableError),

    /// A state dict could not be reconciled with the model.
    #[error("State dict error: {0}")]
    StateDict(#[from] StateDictError),

    /// A checkpoint could not be saved or loaded.
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// A dataset access error.
    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A collective operation across replicas failed. Fatal for the run.
    #[error("Distributed synchronisation failed: {0}")]
    Distributed(String),
}

impl DiffRateError {
    /// Construct a [`DiffRateError::Distributed`].
    pub fn distributed<S: Into<String>>(msg: S) -> Self {
        DiffRateError::Distributed(msg.into())
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors produced when loading or validating a [`DiffRateConfig`].
///
/// [`DiffRateConfig`]: crate::config::DiffRateConfig
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field has an invalid value.
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue {
        /// Name of the field.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },

    /// A configuration file could not be read from disk.
    #[error("Cannot read config file `{path}`: {source}")]
    FileRead {
        /// Path that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration file contains malformed JSON.
    #[error("Cannot parse config file `{path}`: {source}")]
    ParseError {
        /// Path that was being parsed.
        path: PathBuf,
        /// Underlying JSON parse error.
        #[source]
        source: serde_json::Error,
    },

    /// The requested model is not in the registry.
    #[error("Unknown model `{name}`; supported models: {supported}")]
    UnknownModel {
        /// Requested architecture name.
        name: String,
        /// Comma-separated list of registered names.
        supported: String,
    },

    /// The model family has no patch strategy.
    #[error("Model family `{family}` cannot be patched; only deit, mae and clip are supported")]
    UnsupportedFamily {
        /// Family tag.
        family: String,
    },
}

impl ConfigError {
    /// Construct a [`ConfigError::InvalidValue`].
    pub fn invalid_value<S: Into<String>>(field: &'static str, reason: S) -> Self {
        ConfigError::InvalidValue { field, reason: reason.into() }
    }
}

// ---------------------------------------------------------------------------
// BudgetError
// ---------------------------------------------------------------------------

/// Violations of the kept-count invariants.
#[derive(Debug, Error, PartialEq)]
pub enum BudgetError {
    /// `merge_kept_num <= prune_kept_num <= tokens_in` does not hold.
    #[error(
        "Block {block}: kept-count chain violated (tokens_in={tokens_in}, \
         prune_kept_num={prune}, merge_kept_num={merge})"
    )]
    ChainViolated {
        /// Block index.
        block: usize,
        /// Tokens entering the block.
        tokens_in: usize,
        /// Tokens kept after pruning.
        prune: usize,
        /// Tokens kept after merging.
        merge: usize,
    },

    /// Granularity must be strictly positive.
    #[error("Granularity must be > 0")]
    ZeroGranularity,

    /// The token count must be at least one (the class token).
    #[error("Max token count must be >= 1, got {0}")]
    ZeroTokens(usize),

    /// The FLOPs target must be finite and strictly positive.
    #[error("target_flops must be finite and > 0, got {0}")]
    InvalidTarget(f64),

    /// Prune and merge schedules have different lengths.
    #[error("Schedule length mismatch: {prune} prune entries vs {merge} merge entries")]
    LengthMismatch {
        /// Number of prune entries.
        prune: usize,
        /// Number of merge entries.
        merge: usize,
    },

    /// Schedule length differs from the model depth.
    #[error("Schedule has {actual} entries but the model has {expected} blocks")]
    DepthMismatch {
        /// Model depth.
        expected: usize,
        /// Number of schedule entries.
        actual: usize,
    },
}

// ---------------------------------------------------------------------------
// RateTableError
// ---------------------------------------------------------------------------

/// Errors produced while reading, querying or writing `compression_rate.json`.
#[derive(Debug, Error)]
pub enum RateTableError {
    /// The table has no entry for the requested model and FLOPs target.
    #[error("compression rate table does not contain {model} with {target_flops}G flops: entry not found")]
    EntryNotFound {
        /// Model display name.
        model: String,
        /// Target FLOPs key as written in the table.
        target_flops: String,
    },

    /// A low-level I/O error while reading or writing the table.
    #[error("I/O error on `{path}`: {source}")]
    Io {
        /// Path of the table file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The table is not valid JSON or has the wrong structure.
    #[error("Malformed compression rate table `{path}`: {source}")]
    Json {
        /// Path of the table file.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A kept-count expression could not be evaluated.
    #[error("Cannot evaluate `{field}` expression `{expr}`: {reason}")]
    Expression {
        /// Field name (`prune_kept_num` / `merge_kept_num`).
        field: &'static str,
        /// The expression text.
        expr: String,
        /// Parser diagnostic.
        reason: String,
    },

    /// The entry parsed but violates the budget invariants.
    #[error("Invalid schedule for {model} @ {target_flops}G: {source}")]
    InvalidSchedule {
        /// Model display name.
        model: String,
        /// Target FLOPs key.
        target_flops: String,
        /// Underlying invariant violation.
        #[source]
        source: BudgetError,
    },
}

// ---------------------------------------------------------------------------
// StateDictError
// ---------------------------------------------------------------------------

/// Errors produced while reconciling a loaded state dict with a model.
#[derive(Debug, Error)]
pub enum StateDictError {
    /// A tensor's shape differs from the model's and cannot be recovered.
    #[error("Shape mismatch for `{key}`: checkpoint {actual:?}, model {expected:?}")]
    ShapeMismatch {
        /// Parameter name.
        key: String,
        /// Shape expected by the model.
        expected: Vec<usize>,
        /// Shape found in the checkpoint.
        actual: Vec<usize>,
    },

    /// A position-embedding grid is not square.
    #[error("`{key}` has {tokens} spatial tokens, which is not a square grid")]
    NotSquare {
        /// Parameter name.
        key: String,
        /// Number of spatial tokens.
        tokens: usize,
    },

    /// A tensor has an unexpected rank or layout.
    #[error("Invalid tensor `{key}`: {reason}")]
    InvalidTensor {
        /// Parameter name.
        key: String,
        /// Human-readable reason.
        reason: String,
    },

    /// A tensor required by a conversion is missing.
    #[error("Missing tensor `{0}`")]
    MissingKey(String),
}

impl StateDictError {
    /// Construct a [`StateDictError::InvalidTensor`].
    pub fn invalid<S: Into<String>>(key: impl Into<String>, reason: S) -> Self {
        StateDictError::InvalidTensor { key: key.into(), reason: reason.into() }
    }
}

// ---------------------------------------------------------------------------
// CheckpointError
// ---------------------------------------------------------------------------

/// Errors produced while writing or reading checkpoint files.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// A low-level I/O error.
    #[error("I/O error on `{path}`: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Binary encoding or decoding failed.
    #[error("Cannot encode/decode checkpoint `{path}`: {source}")]
    Codec {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying bincode error.
        #[source]
        source: bincode::Error,
    },
}

impl CheckpointError {
    /// Construct a [`CheckpointError::Io`].
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CheckpointError::Io { path: path.into(), source }
    }

    /// Construct a [`CheckpointError::Codec`].
    pub fn codec(path: impl Into<PathBuf>, source: bincode::Error) -> Self {
        CheckpointError::Codec { path: path.into(), source }
    }
}

// ---------------------------------------------------------------------------
// DatasetError
// ---------------------------------------------------------------------------

/// Errors produced while accessing or sampling a dataset.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// A sample index is out of bounds.
    #[error("Index {idx} out of bounds (dataset has {len} samples)")]
    IndexOutOfBounds {
        /// The requested index.
        idx: usize,
        /// Total length of the dataset.
        len: usize,
    },

    /// The dataset has no samples.
    #[error("Dataset is empty")]
    Empty,

    /// A sampling rate outside `(0, 1]`.
    #[error("Sampling rate must be in (0, 1], got {0}")]
    InvalidSamplingRate(f64),

    /// Samples in one batch have different shapes.
    #[error("Sample {idx} has shape {actual:?}, batch expects {expected:?}")]
    InconsistentShape {
        /// Sample index.
        idx: usize,
        /// Shape of the first sample in the batch.
        expected: Vec<usize>,
        /// Shape of the offending sample.
        actual: Vec<usize>,
    },
}
