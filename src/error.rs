//! Error types for the cipherml quantized-inference engine

use thiserror::Error;

/// Result type alias for cipherml operations
pub type Result<T> = std::result::Result<T, CipherMlError>;

/// Main error type for the cipherml crate
#[derive(Error, Debug)]
pub enum CipherMlError {
    #[error("Degenerate calibration range: min == max == {0}, scale would be zero")]
    DegenerateRange(f64),

    #[error("Model is not calibrated, call fit() first")]
    UncalibratedModel,

    #[error("Cannot compile before fit(), the model has no integer program yet")]
    PrecompileOrder,

    #[error("Backend execution requested but the model is not compiled, call compile() first")]
    NotCompiled,

    #[error("Backend rejected the program: {0}")]
    BackendCompilation(String),

    #[error("Tree cannot be represented as a fixed-shape tensor: {0}")]
    UnsupportedTreeStructure(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Invalid shape: expected {expected}, got {actual}")]
    Shape { expected: String, actual: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Computation error: {0}")]
    Computation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<polars::error::PolarsError> for CipherMlError {
    fn from(err: polars::error::PolarsError) -> Self {
        CipherMlError::Data(err.to_string())
    }
}

impl From<serde_json::Error> for CipherMlError {
    fn from(err: serde_json::Error) -> Self {
        CipherMlError::Serialization(err.to_string())
    }
}

impl From<ndarray::ShapeError> for CipherMlError {
    fn from(err: ndarray::ShapeError) -> Self {
        CipherMlError::Shape {
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
        let err = CipherMlError::NotCompiled;
        assert!(err.to_string().contains("compile()"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: CipherMlError = io_err.into();
        assert!(matches!(err, CipherMlError::Io(_)));
    }

    #[test]
    fn test_degenerate_range_message() {
        let err = CipherMlError::DegenerateRange(3.5);
        assert!(err.to_string().contains("3.5"));
    }
}
