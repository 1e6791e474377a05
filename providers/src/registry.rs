use crate::chat::ChatLlm;
use crate::embedder::Embedder;
use crate::errors::ProviderError;
use crate::ocr::Ocr;
use crate::pdf::PdfToMarkdown;
use crate::rate_limiter::RateLimiter;
use crate::rerank::Reranker;
use kb_core::error::{ErrorCode, KbError};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("chat provider not configured: {0}")]
    ChatProviderNotConfigured(String),
    #[error("rerank provider not configured: {0}")]
    RerankProviderNotConfigured(String),
}

impl KbError for RegistryError {
    fn error_code(&self) -> ErrorCode {
        ErrorCode::ProviderUnavailable
    }
}

/// The process-wide provider wiring (spec §9: "provider registry, initialized
/// once, immutable after" is one of only two pieces of global state). Holds
/// the single configured embedder (its `dimension` is fixed for the whole
/// deployment) plus named chat/rerank providers a tenant's settings select
/// between.
pub struct ProviderRegistry {
    embedder: Embedder,
    chat_llms: HashMap<String, ChatLlm>,
    rerankers: HashMap<String, Reranker>,
    min_text_chars: usize,
    ocr: Ocr,
    rate_limit_per_minute: Option<u32>,
    limiters: Mutex<HashMap<String, RateLimiter>>,
}

impl ProviderRegistry {
    pub fn new(embedder: Embedder, min_text_chars: usize, ocr: Ocr) -> Self {
        Self {
            embedder,
            chat_llms: HashMap::new(),
            rerankers: HashMap::new(),
            min_text_chars,
            ocr,
            rate_limit_per_minute: None,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    /// Installs a per-provider token-bucket rate limit (spec §5: "Embeddings
    /// and LLM calls are rate-limited per provider via a token bucket sized
    /// from configuration; excess traffic fails with `PROVIDER_BUSY`").
    /// Each distinct provider key (the embedder, or a named chat/rerank
    /// provider) gets its own bucket, lazily created on first use.
    pub fn with_rate_limit_per_minute(mut self, limit_per_minute: u32) -> Self {
        self.rate_limit_per_minute = Some(limit_per_minute);
        self
    }

    /// Returns `PROVIDER_BUSY` if the named bucket is exhausted; a no-op
    /// when no rate limit is configured.
    fn check_rate_limit(&self, key: &str) -> Result<(), ProviderError> {
        let Some(limit) = self.rate_limit_per_minute else {
            return Ok(());
        };
        let mut limiters = self.limiters.lock().unwrap();
        let limiter = limiters
            .entry(key.to_string())
            .or_insert_with(|| RateLimiter::per_minute(limit));
        if limiter.try_acquire() {
            Ok(())
        } else {
            Err(ProviderError::RateLimited)
        }
    }

    pub fn check_embed_rate_limit(&self) -> Result<(), ProviderError> {
        self.check_rate_limit("embedder")
    }

    pub fn check_chat_rate_limit(&self, provider_name: &str) -> Result<(), ProviderError> {
        self.check_rate_limit(&format!("chat:{provider_name}"))
    }

    pub fn check_rerank_rate_limit(&self, provider_name: &str) -> Result<(), ProviderError> {
        self.check_rate_limit(&format!("rerank:{provider_name}"))
    }

    pub fn register_chat_llm(&mut self, provider_name: impl Into<String>, llm: ChatLlm) {
        self.chat_llms.insert(provider_name.into(), llm);
    }

    pub fn register_reranker(&mut self, provider_name: impl Into<String>, reranker: Reranker) {
        self.rerankers.insert(provider_name.into(), reranker);
    }

    pub fn embedder(&self) -> &Embedder {
        &self.embedder
    }

    pub fn ocr(&self) -> &Ocr {
        &self.ocr
    }

    pub fn min_text_chars(&self) -> usize {
        self.min_text_chars
    }

    pub fn resolve_chat_llm(&self, provider_name: &str) -> Result<&ChatLlm, RegistryError> {
        self.chat_llms
            .get(provider_name)
            .ok_or_else(|| RegistryError::ChatProviderNotConfigured(provider_name.to_string()))
    }

    pub fn resolve_reranker(&self, provider_name: &str) -> Result<&Reranker, RegistryError> {
        self.rerankers
            .get(provider_name)
            .ok_or_else(|| RegistryError::RerankProviderNotConfigured(provider_name.to_string()))
    }

    /// A deployment-startup check: all embedder variants must agree on
    /// `dimension` with the vector collection (spec §4.1, §8 boundary
    /// behavior). Returns `DIMENSION_MISMATCH` rather than silently
    /// truncating or padding vectors.
    pub fn validate_collection_dimension(&self, collection_dimension: usize) -> Result<(), ProviderError> {
        if self.embedder.dimension() != collection_dimension {
            return Err(ProviderError::DimensionMismatch {
                expected: collection_dimension,
                actual: self.embedder.dimension(),
            });
        }
        Ok(())
    }

    /// C5 step 4's PDF cascade: layout-aware engine first, falling back to
    /// plain-text extraction if it raises (spec §4.5).
    pub fn convert_pdf(&self, pdf_bytes: &[u8]) -> Result<String, ProviderError> {
        match PdfToMarkdown::LayoutAwareEngine.convert(pdf_bytes) {
            Ok(markdown) => Ok(markdown),
            Err(err) => {
                warn!(error = %err, "layout-aware pdf conversion failed, falling back to plain text");
                PdfToMarkdown::PlainTextExtractor.convert(pdf_bytes)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimension_mismatch_is_detected() {
        let registry = ProviderRegistry::new(Embedder::Hash { dimension: 128 }, 200, Ocr::Disabled);
        let err = registry.validate_collection_dimension(256).unwrap_err();
        assert_eq!(
            err,
            ProviderError::DimensionMismatch {
                expected: 256,
                actual: 128
            }
        );
    }

    #[test]
    fn dimension_agreement_passes() {
        let registry = ProviderRegistry::new(Embedder::Hash { dimension: 256 }, 200, Ocr::Disabled);
        assert!(registry.validate_collection_dimension(256).is_ok());
    }

    #[test]
    fn unconfigured_chat_provider_errors() {
        let registry = ProviderRegistry::new(Embedder::Hash { dimension: 8 }, 200, Ocr::Disabled);
        let err = registry.resolve_chat_llm("nonexistent").unwrap_err();
        assert!(matches!(err, RegistryError::ChatProviderNotConfigured(_)));
    }

    #[test]
    fn unlimited_registry_never_throttles() {
        let registry = ProviderRegistry::new(Embedder::Hash { dimension: 8 }, 200, Ocr::Disabled);
        for _ in 0..1000 {
            registry.check_embed_rate_limit().unwrap();
        }
    }

    #[test]
    fn rate_limited_registry_throttles_per_provider_key() {
        let registry = ProviderRegistry::new(Embedder::Hash { dimension: 8 }, 200, Ocr::Disabled)
            .with_rate_limit_per_minute(2);
        assert!(registry.check_embed_rate_limit().is_ok());
        assert!(registry.check_embed_rate_limit().is_ok());
        assert!(registry.check_embed_rate_limit().is_err());

        // A distinct provider key has its own bucket.
        assert!(registry.check_chat_rate_limit("local-runtime").is_ok());
    }
}
