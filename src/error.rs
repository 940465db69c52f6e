//! Error types for the cell-based NAS spaces

use thiserror::Error;

/// Result type alias for search-space operations
pub type Result<T> = std::result::Result<T, NasError>;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum NasError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown primitive: {0}")]
    UnknownPrimitive(String),

    #[error("Invalid shape: expected {expected}, got {actual}")]
    ShapeError { expected: String, actual: String },

    #[error("Weight length mismatch: expected {expected}, got {actual}")]
    WeightLengthMismatch { expected: usize, actual: usize },

    #[error("Invalid parameter: {name} = {value}, {reason}")]
    InvalidParameter {
        name: String,
        value: String,
        reason: String,
    },

    #[error("Convergence failed after {iterations} iterations")]
    ConvergenceError { iterations: usize },

    #[error("Computation error: {0}")]
    ComputationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl NasError {
    pub(crate) fn shape(expected: impl ToString, actual: impl ToString) -> Self {
        NasError::ShapeError {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

impl From<serde_json::Error> for NasError {
    fn from(err: serde_json::Error) -> Self {
        NasError::SerializationError(err.to_string())
    }
}

impl From<ndarray::ShapeError> for NasError {
    fn from(err: ndarray::ShapeError) -> Self {
        NasError::ShapeError {
            expected: "valid shape".to_string(),
            actual: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NasError::ConfigError("empty vocabulary".to_string());
        assert_eq!(err.to_string(), "Configuration error: empty vocabulary");

        let err = NasError::WeightLengthMismatch { expected: 8, actual: 7 };
        assert_eq!(err.to_string(), "Weight length mismatch: expected 8, got 7");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: NasError = io_err.into();
        assert!(matches!(err, NasError::IoError(_)));
    }

    #[test]
    fn test_error_from_ndarray_shape() {
        let err = ndarray::Array1::<f64>::zeros(6).into_shape((4, 2)).unwrap_err();
        let err: NasError = err.into();
        assert!(matches!(err, NasError::ShapeError { .. }));
    }
}
