// THEORY:
// Every fatal condition an analysis request can hit is a variant of `AnalysisError`.
// Flat or all-zero activation maps are deliberately absent: they are valid inputs
// with well-defined fallbacks in the normalizer and metrics extractor.
//
// `TensorError` covers shape bookkeeping inside the numeric layer. It never leaves
// the crate on its own; a shape mismatch between what a classifier promised and
// what it produced means the classifier is unusable for activation mapping, so it
// converts into `AnalysisError::ModelIncompatible`.

use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AnalysisError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    #[error("failed to load classifier: {0}")]
    ModelLoad(String),
    #[error("classifier is incompatible with activation mapping: {0}")]
    ModelIncompatible(String),
    #[error("malformed scan input: {0}")]
    Encoding(String),
    #[error("storage collaborator failed: {0}")]
    Storage(String),
}

/// Machine-readable failure reason carried by a `Failed` request state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ModelLoad,
    ModelIncompatible,
    Encoding,
    Storage,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::ModelLoad => "model_load",
            FailureReason::ModelIncompatible => "model_incompatible",
            FailureReason::Encoding => "encoding",
            FailureReason::Storage => "storage",
        }
    }
}

impl AnalysisError {
    pub fn reason(&self) -> FailureReason {
        match self {
            AnalysisError::ModelLoad(_) => FailureReason::ModelLoad,
            AnalysisError::ModelIncompatible(_) => FailureReason::ModelIncompatible,
            AnalysisError::Encoding(_) => FailureReason::Encoding,
            AnalysisError::Storage(_) => FailureReason::Storage,
        }
    }

    /// Whether re-submitting the same request unchanged could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AnalysisError::ModelLoad(_) | AnalysisError::Storage(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TensorError {
    #[error("tensor data has {found} values but shape {shape:?} needs {expected}")]
    DataLength {
        shape: (usize, usize, usize),
        expected: usize,
        found: usize,
    },
    #[error("shape mismatch: {left:?} vs {right:?}")]
    ShapeMismatch {
        left: (usize, usize, usize),
        right: (usize, usize, usize),
    },
    #[error("value {value} at index {index} is outside the unit interval")]
    OutOfUnitRange { index: usize, value: f32 },
}

impl From<TensorError> for AnalysisError {
    fn from(err: TensorError) -> Self {
        AnalysisError::ModelIncompatible(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_load_and_storage_failures_are_retryable() {
        assert!(AnalysisError::ModelLoad("gone".into()).is_retryable());
        assert!(AnalysisError::Storage("disk full".into()).is_retryable());
        assert!(!AnalysisError::ModelIncompatible("1x1".into()).is_retryable());
        assert!(!AnalysisError::Encoding("no screen".into()).is_retryable());
    }

    #[test]
    fn tensor_errors_surface_as_incompatible_models() {
        let err: AnalysisError = TensorError::ShapeMismatch {
            left: (2, 2, 1),
            right: (2, 2, 3),
        }
        .into();
        assert_eq!(err.reason(), FailureReason::ModelIncompatible);
        assert_eq!(err.reason().as_str(), "model_incompatible");
    }
}
