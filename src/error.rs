//! Error types for vndbkit.

use thiserror::Error;

use crate::wire::WireError;

#[derive(Error, Debug)]
pub enum VndbError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Wire(#[from] WireError),
}

impl VndbError {
    /// Whether the same request may succeed if the caller tries again later.
    pub fn is_transient(&self) -> bool {
        match self {
            VndbError::Wire(e) => e.is_transient(),
            VndbError::ConfigError(_) => false,
        }
    }

    /// The protocol-level error, if this is one.
    pub fn as_wire(&self) -> Option<&WireError> {
        match self {
            VndbError::Wire(e) => Some(e),
            VndbError::ConfigError(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, VndbError>;
