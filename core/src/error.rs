use serde::{Deserialize, Serialize};

/// The eleven error kinds every fallible operation in this workspace maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Validation,
    NotFound,
    Forbidden,
    Precondition,
    StorageError,
    DbError,
    VectorError,
    ProviderUnavailable,
    ProviderBusy,
    ProviderBadResponse,
    ConversionFailed,
    DimensionMismatch,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::Validation => "VALIDATION",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::Precondition => "PRECONDITION",
            ErrorCode::StorageError => "STORAGE_ERROR",
            ErrorCode::DbError => "DB_ERROR",
            ErrorCode::VectorError => "VECTOR_ERROR",
            ErrorCode::ProviderUnavailable => "PROVIDER_UNAVAILABLE",
            ErrorCode::ProviderBusy => "PROVIDER_BUSY",
            ErrorCode::ProviderBadResponse => "PROVIDER_BAD_RESPONSE",
            ErrorCode::ConversionFailed => "CONVERSION_FAILED",
            ErrorCode::DimensionMismatch => "DIMENSION_MISMATCH",
        };
        write!(f, "{}", s)
    }
}

/// Implemented by every crate-local error enum so call sites can map to the
/// shared taxonomy without a bespoke `match` at each boundary.
pub trait KbError: std::error::Error {
    fn error_code(&self) -> ErrorCode;
}
