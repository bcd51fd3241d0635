//! Error type for the tensor side of the search.
//!
//! ```text
//! TrainError (top-level)
//! ├── Core           (every diffrate-core error, via DiffRateError)
//! ├── Tensor         (libtorch failures, tch-backend only)
//! ├── TrainingStep   (non-recoverable step failures)
//! └── ShapeMismatch  (tensor layout disagreements)
//! ```

use thiserror::Error;

use diffrate_core::error::{
    BudgetError, CheckpointError, ConfigError, DatasetError, DiffRateError, RateTableError, StateDictError,
};

// ---------------------------------------------------------------------------
// TrainResult
// ---------------------------------------------------------------------------

/// Convenient `Result` alias used by orchestration-level functions.
pub type TrainResult<T> = Result<T, TrainError>;

// ---------------------------------------------------------------------------
// TrainError: top-level aggregator
// ---------------------------------------------------------------------------

/// Top-level error type of the training crate.
#[derive(Debug, Error)]
pub enum TrainError {
    /// An error from the backend-independent core.
    #[error(transparent)]
    Core(#[from] DiffRateError),

    /// A libtorch operation failed.
    #[cfg(feature = "tch-backend")]
    #[error("Tensor backend error: {0}")]
    Tensor(#[from] tch::TchError),

    /// A training or evaluation step could not complete.
    #[error("Training step failed: {0}")]
    TrainingStep(String),

    /// Two tensors disagree in shape.
    #[error("Shape mismatch for `{name}`: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Tensor or parameter name.
        name: String,
        /// Expected shape.
        expected: Vec<i64>,
        /// Actual shape.
        actual: Vec<i64>,
    },
}

impl TrainError {
    /// Construct a [`TrainError::TrainingStep`].
    pub fn training_step<S: Into<String>>(msg: S) -> Self {
        TrainError::TrainingStep(msg.into())
    }

    /// Construct a [`TrainError::ShapeMismatch`].
    pub fn shape_mismatch(name: impl Into<String>, expected: Vec<i64>, actual: Vec<i64>) -> Self {
        TrainError::ShapeMismatch { name: name.into(), expected, actual }
    }

    /// Whether this is the fatal "entry not found" rate-table error.
    pub fn is_entry_not_found(&self) -> bool {
        matches!(self, TrainError::Core(DiffRateError::RateTable(RateTableError::EntryNotFound { .. })))
    }
}

macro_rules! from_core_error {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for TrainError {
                fn from(e: $ty) -> Self {
                    TrainError::Core(DiffRateError::from(e))
                }
            }
        )*
    };
}

from_core_error!(ConfigError, BudgetError, RateTableError, StateDictError, CheckpointError, DatasetError);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_convert_and_keep_message() {
        let err: TrainError = RateTableError::EntryNotFound { model: "ViT-B-DeiT".into(), target_flops: "3.0".into() }.into();
        assert!(err.is_entry_not_found());
        assert!(err.to_string().contains("entry not found"));

        let err: TrainError = ConfigError::invalid_value("granularity", "must be > 0").into();
        assert!(!err.is_entry_not_found());
        assert!(err.to_string().contains("granularity"));
    }
}
