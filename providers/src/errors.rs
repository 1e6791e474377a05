use kb_core::error::{ErrorCode, KbError};
use thiserror::Error;

/// Matches the classification every external provider call carries (spec
/// §6: `{unreachable, model-not-found, rate-limited, bad-request, internal}`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider unreachable: {0}")]
    Unreachable(String),
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("provider rate limited")]
    RateLimited,
    #[error("bad request to provider: {0}")]
    BadRequest(String),
    #[error("provider returned an unusable response: {0}")]
    BadResponse(String),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("internal provider error: {0}")]
    Internal(String),
}

impl KbError for ProviderError {
    fn error_code(&self) -> ErrorCode {
        match self {
            ProviderError::Unreachable(_) => ErrorCode::ProviderUnavailable,
            ProviderError::ModelNotFound(_) => ErrorCode::ProviderUnavailable,
            ProviderError::RateLimited => ErrorCode::ProviderBusy,
            ProviderError::BadRequest(_) => ErrorCode::ProviderBadResponse,
            ProviderError::BadResponse(_) => ErrorCode::ProviderBadResponse,
            ProviderError::DimensionMismatch { .. } => ErrorCode::DimensionMismatch,
            ProviderError::Internal(_) => ErrorCode::ProviderBadResponse,
        }
    }
}
