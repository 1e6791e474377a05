pub mod chat;
pub mod embedder;
pub mod errors;
pub mod ocr;
pub mod pdf;
pub mod rate_limiter;
pub mod registry;
pub mod rerank;

pub use chat::ChatLlm;
pub use embedder::{Embedder, ProviderHealth};
pub use errors::ProviderError;
pub use ocr::Ocr;
pub use pdf::PdfToMarkdown;
pub use rate_limiter::RateLimiter;
pub use registry::{ProviderRegistry, RegistryError};
pub use rerank::Reranker;
