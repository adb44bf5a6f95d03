//! Unified error type for the gridflow crates.
//!
//! Domain modules define their own `thiserror` enums; this type is the
//! common representation at API boundaries so callers can handle
//! configuration, structural and solver errors uniformly.

use thiserror::Error;

/// Unified error type for gridflow operations.
///
/// Non-convergence of a power-flow solve is NOT an error: it is reported as
/// a terminal per-component status. This enum covers conditions that
/// prevent a solve from being attempted or completed structurally.
#[derive(Error, Debug)]
pub enum GridError {
    /// I/O errors (file access, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Data validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration errors, rejected before any solve starts
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network structure errors
    #[error("Network error: {0}")]
    Network(String),

    /// Generic errors (for wrapping external errors)
    #[error("{0}")]
    Other(String),
}

/// Convenience alias for Results using [`GridError`].
pub type GridResult<T> = Result<T, GridError>;

impl From<anyhow::Error> for GridError {
    fn from(err: anyhow::Error) -> Self {
        GridError::Other(err.to_string())
    }
}

impl From<String> for GridError {
    fn from(s: String) -> Self {
        GridError::Other(s)
    }
}

impl From<&str> for GridError {
    fn from(s: &str) -> Self {
        GridError::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GridError::Config("negative tolerance".into());
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("negative tolerance"));
    }

    #[test]
    fn test_question_mark_operator() {
        fn inner() -> GridResult<()> {
            Err(GridError::Validation("bad".into()))
        }
        fn outer() -> GridResult<()> {
            inner()?;
            Ok(())
        }
        assert!(outer().is_err());
    }
}
