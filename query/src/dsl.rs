use serde::{Deserialize, Serialize};
use thiserror::Error;

use kb_core::error::{ErrorCode, KbError};

const DEFAULT_TOP_K: u32 = 10;
const MIN_TOP_K: u32 = 1;
const MAX_TOP_K: u32 = 50;
const MIN_TEMPERATURE: f32 = 0.0;
const MAX_TEMPERATURE: f32 = 2.0;
const MAX_TOP_K_RETRIEVE: usize = 100;

/// The administrator scope-widening parameter a query request may carry
/// (spec §4.7). A non-admin caller's request is always collapsed to their
/// own tenant regardless of what this field asks for — see
/// `kb_core::ownership::resolve_query_scope`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum RequestedScope {
    #[default]
    SelfScope,
    User(i64),
    All,
}

/// Request parameters for [`crate::engine::RetrievalService::query`] (spec
/// §4.7). Optional fields fall back to the asking tenant's
/// [`kb_core::model::TenantSettings`] when absent.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryOptions {
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub rerank: Option<bool>,
    #[serde(default)]
    pub rerank_model: Option<String>,
    #[serde(default)]
    pub scope: RequestedScope,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            top_k: None,
            temperature: None,
            provider: None,
            model: None,
            rerank: None,
            rerank_model: None,
            scope: RequestedScope::SelfScope,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryValidationError {
    #[error("query must not be empty")]
    EmptyQuery,
}

impl KbError for QueryValidationError {
    fn error_code(&self) -> ErrorCode {
        ErrorCode::Validation
    }
}

/// Validates the free-text query and clamps `top_k`/`temperature` into
/// their documented ranges (spec §8: `top_k=0 ⇒ VALIDATION`,
/// `top_k=51 ⇒ clamped to 50`; empty query ⇒ `VALIDATION`).
pub fn validate_query_text(text: &str) -> Result<(), QueryValidationError> {
    if text.trim().is_empty() {
        return Err(QueryValidationError::EmptyQuery);
    }
    Ok(())
}

pub fn clamp_top_k(requested: Option<u32>, default: u32) -> u32 {
    requested.unwrap_or(default).clamp(MIN_TOP_K, MAX_TOP_K)
}

/// `top_k=0` is invalid (not merely clamped) — spec §8 distinguishes the
/// boundary `0` from an out-of-range value above the ceiling.
pub fn top_k_is_invalid(requested: Option<u32>) -> bool {
    matches!(requested, Some(0))
}

pub fn clamp_temperature(requested: Option<f32>, default: f32) -> f32 {
    requested.unwrap_or(default).clamp(MIN_TEMPERATURE, MAX_TEMPERATURE)
}

/// `top_k_retrieve = max(top_k, rerank ? 4*top_k : top_k)`, capped at 100
/// (spec §4.7).
pub fn top_k_retrieve(top_k: u32, rerank_enabled: bool) -> usize {
    let widened = if rerank_enabled { top_k.saturating_mul(4) } else { top_k };
    (widened as usize).min(MAX_TOP_K_RETRIEVE)
}
