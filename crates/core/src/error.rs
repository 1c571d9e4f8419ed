//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid download status: {0}")]
    InvalidStatus(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
