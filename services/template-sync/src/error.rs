use gbt_protocol::ErrorCategory;
use thiserror::Error;

use crate::primitives::DecodeError;
use crate::template::BuildError;

#[derive(Debug, Error)]
pub enum MiningError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("template build failed: {0}")]
    BuildFailure(#[from] BuildError),

    #[error("rejected: {0}")]
    ValidationRejected(String),

    #[error("verify error: {0}")]
    Verify(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MiningError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            MiningError::InvalidInput(_) => ErrorCategory::InvalidInput,
            MiningError::Unavailable(_) => ErrorCategory::Unavailable,
            MiningError::BuildFailure(_) => ErrorCategory::BuildFailure,
            MiningError::ValidationRejected(_) => ErrorCategory::ValidationRejected,
            MiningError::Verify(_) => ErrorCategory::VerifyError,
            MiningError::Internal(_) => ErrorCategory::Internal,
        }
    }

    pub fn decode(what: &str, err: DecodeError) -> Self {
        MiningError::InvalidInput(format!("{what} decode failed: {err}"))
    }
}

pub type MiningResult<T> = Result<T, MiningError>;
