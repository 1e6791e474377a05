use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use kb_core::audit::{AuditEvent, AuditOperation, AuditOutcome, AuditSink};
use kb_core::error::{ErrorCode, KbError};
use kb_core::metrics::MetricsCollector;
use kb_core::model::{now_unix, Principal};
use kb_core::ownership::{resolve_query_scope, AuthzError, Scope};
use kb_providers::{ProviderError, ProviderRegistry};
use kb_storage::{MetadataRepository, RepoError, VectorHit, VectorIndexError};

use crate::dsl::{self, QueryOptions};

const FALLBACK_ANSWER_PREFIX: &str = "[degraded: answer generation unavailable]";

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Authz(#[from] AuthzError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Vector(#[from] VectorIndexError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl KbError for QueryError {
    fn error_code(&self) -> ErrorCode {
        match self {
            QueryError::Validation(_) => ErrorCode::Validation,
            QueryError::NotFound(_) => ErrorCode::NotFound,
            QueryError::Authz(_) => ErrorCode::Forbidden,
            QueryError::Repo(err) => err.error_code(),
            QueryError::Vector(err) => err.error_code(),
            QueryError::Provider(err) => err.error_code(),
        }
    }
}

/// One retrieved-and-cited chunk in a [`QueryResponse`] (spec §4.7: answers
/// cite `[document_id:chunk_index]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub document_id: i64,
    pub chunk_index: u32,
    pub content: String,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub answer: String,
    pub sources: Vec<Source>,
    pub confidence: f32,
}

/// C7: the indexing and query halves of the retrieval path. `index_document`
/// is invoked synchronously by the document lifecycle service's `approve`
/// (and by C8 reconciliation); `query` is the read path a caller hits
/// directly.
pub struct RetrievalService {
    repo: Arc<MetadataRepository>,
    providers: Arc<ProviderRegistry>,
    audit: Option<Arc<dyn AuditSink>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl RetrievalService {
    pub fn new(repo: Arc<MetadataRepository>, providers: Arc<ProviderRegistry>) -> Self {
        Self {
            repo,
            providers,
            audit: None,
            metrics: None,
        }
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Embeds every `included` chunk of a document and upserts the result
    /// into the owner's partition, keyed so re-indexing is idempotent
    /// (spec §4.7 indexing path). Invoked by `approve` and by
    /// `rebuild_vectors`/`reindex` (C8).
    pub async fn index_document(&self, document_id: i64) -> Result<(), QueryError> {
        let document = self
            .repo
            .get_document(document_id)
            .await
            .map_err(|_| QueryError::NotFound(format!("document {document_id}")))?;

        let chunks: Vec<_> = self
            .repo
            .get_chunks_for_document(document_id)
            .await
            .into_iter()
            .filter(|chunk| chunk.included)
            .collect();

        let embedder = self.providers.embedder();

        {
            let vector_index = self.repo.vector_index();
            let mut vector_index = vector_index.write().await;
            vector_index.ensure_collection(embedder.dimension())?;
            vector_index.ensure_partition(document.owner_id);
        }

        if !chunks.is_empty() {
            self.providers.check_embed_rate_limit()?;
            let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
            let embeddings = embedder.embed(&texts).await?;

            let entries: Vec<(i64, u32, Vec<f32>)> = chunks
                .iter()
                .zip(embeddings.into_iter())
                .map(|(chunk, embedding)| (chunk.document_id, chunk.chunk_index, embedding))
                .collect();

            let vector_index = self.repo.vector_index();
            let mut vector_index = vector_index.write().await;
            vector_index.upsert(document.owner_id, entries)?;
        }

        let mut updated = document;
        updated.indexed_at = Some(now_unix());
        self.repo.put_document(updated).await?;

        Ok(())
    }

    /// spec §4.7 query path: embed → partition-scoped search → optional
    /// rerank → LLM generation with citations.
    pub async fn query(
        &self,
        asking: &Principal,
        text: &str,
        options: QueryOptions,
    ) -> Result<QueryResponse, QueryError> {
        let started = Instant::now();

        let result = self.query_inner(asking, text, options).await;

        if let Some(metrics) = &self.metrics {
            let degraded = matches!(&result, Ok(response) if response.answer.starts_with(FALLBACK_ANSWER_PREFIX));
            metrics.record_query(started.elapsed().as_micros() as u64, degraded);
        }

        if let Some(sink) = &self.audit {
            let outcome = match &result {
                Ok(_) => AuditOutcome::Succeeded,
                Err(err) if matches!(err.error_code(), ErrorCode::Validation) => AuditOutcome::Denied,
                Err(_) => AuditOutcome::Failed,
            };
            let mut event = AuditEvent::new(AuditOperation::Query, outcome);
            event.tenant = Some(asking.tenant_id.to_string());
            event.metadata.insert(
                "latency_ms".to_string(),
                started.elapsed().as_millis().to_string(),
            );
            let _ = sink.record(event);
        }

        result
    }

    async fn query_inner(
        &self,
        asking: &Principal,
        text: &str,
        options: QueryOptions,
    ) -> Result<QueryResponse, QueryError> {
        dsl::validate_query_text(text).map_err(|err| QueryError::Validation(err.to_string()))?;
        if dsl::top_k_is_invalid(options.top_k) {
            return Err(QueryError::Validation("top_k must be between 1 and 50".to_string()));
        }

        let settings = self.repo.get_tenant_settings(asking.tenant_id).await;
        let top_k = dsl::clamp_top_k(options.top_k, settings.top_k);
        let temperature = dsl::clamp_temperature(options.temperature, settings.temperature);
        let rerank_enabled = options.rerank.unwrap_or(settings.rerank_enabled);

        let scope = resolve_query_scope(asking, to_ownership_scope(options.scope));
        let owner_ids: Vec<i64> = match scope {
            Scope::Tenant(id) => vec![id],
            Scope::All => Vec::new(),
        };

        self.providers.check_embed_rate_limit()?;
        let embedder = self.providers.embedder();
        let query_vector = embedder
            .embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();

        let retrieve_k = dsl::top_k_retrieve(top_k, rerank_enabled);
        let hits: Vec<VectorHit> = {
            let vector_index = self.repo.vector_index();
            let vector_index = vector_index.read().await;
            vector_index.search(&owner_ids, &query_vector, retrieve_k)
        };

        let mut contents = self.fetch_contents(&hits).await;

        let mut ranked: Vec<(VectorHit, String)> = hits
            .into_iter()
            .map(|hit| {
                let content = contents.remove(&(hit.document_id, hit.chunk_index)).unwrap_or_default();
                (hit, content)
            })
            .collect();

        if rerank_enabled {
            if let Some(provider_name) = settings.rerank_provider.as_deref() {
                if let Err(err) = self.providers.check_rerank_rate_limit(provider_name) {
                    warn!(error = %err, "rerank rate limited, falling back to vector-search order");
                } else if let Ok(reranker) = self.providers.resolve_reranker(provider_name) {
                    let docs: Vec<String> = ranked.iter().map(|(_, content)| content.clone()).collect();
                    match reranker.rerank(text, &docs).await {
                        Ok(Some(scores)) => {
                            let scores = normalize_scores(&scores);
                            for ((hit, _), score) in ranked.iter_mut().zip(scores.into_iter()) {
                                hit.score = score;
                            }
                            ranked.sort_by(|a, b| {
                                b.0.score
                                    .partial_cmp(&a.0.score)
                                    .unwrap_or(std::cmp::Ordering::Equal)
                                    .then_with(|| a.0.document_id.cmp(&b.0.document_id))
                                    .then_with(|| a.0.chunk_index.cmp(&b.0.chunk_index))
                            });
                        }
                        Ok(None) => {}
                        Err(err) => warn!(error = %err, "rerank failed, falling back to vector-search order"),
                    }
                }
            }
        }
        ranked.truncate(top_k as usize);

        let sources: Vec<Source> = ranked
            .into_iter()
            .map(|(hit, content)| Source {
                document_id: hit.document_id,
                chunk_index: hit.chunk_index,
                content,
                score: hit.score,
            })
            .collect();

        let confidence = sources.iter().map(|s| s.score).fold(0.0_f32, f32::max);

        let provider_name = options
            .provider
            .as_deref()
            .unwrap_or(settings.llm_provider.as_str());

        let answer = match self.providers.resolve_chat_llm(provider_name) {
            Ok(llm) => {
                self.providers.check_chat_rate_limit(provider_name)?;
                let prompt = build_prompt(text, &sources);
                match llm.generate(&prompt, temperature).await {
                    Ok(generated) => generated,
                    Err(err) if err.error_code() == ErrorCode::ProviderUnavailable => {
                        info!(tenant = asking.tenant_id, "llm unavailable, returning degraded answer");
                        degraded_answer(&sources)
                    }
                    Err(err) => return Err(QueryError::Provider(err)),
                }
            }
            Err(_) => degraded_answer(&sources),
        };

        Ok(QueryResponse {
            answer,
            sources,
            confidence,
        })
    }

    async fn fetch_contents(&self, hits: &[VectorHit]) -> HashMap<(i64, u32), String> {
        let mut document_ids: Vec<i64> = hits.iter().map(|hit| hit.document_id).collect();
        document_ids.sort_unstable();
        document_ids.dedup();

        let mut contents = HashMap::new();
        for document_id in document_ids {
            let chunks = self.repo.get_chunks_for_document(document_id).await;
            for chunk in chunks {
                contents.insert((chunk.document_id, chunk.chunk_index), chunk.content);
            }
        }
        contents
    }
}

fn build_prompt(question: &str, sources: &[Source]) -> String {
    let mut prompt = String::from(
        "You are a grounded knowledge-base assistant. Answer only from the \
         excerpts below; cite them with their [document_id:chunk_index] tag. \
         If the excerpts don't answer the question, say so plainly.\n\n",
    );
    for source in sources {
        prompt.push_str(&format!(
            "[{}:{}] {}\n\n",
            source.document_id, source.chunk_index, source.content
        ));
    }
    prompt.push_str(&format!("Question: {question}\n"));
    prompt
}

/// Reranker scores are only "comparable within a call" (spec §6), not
/// guaranteed to lie in `[0,1]` the way the vector index's cosine scores
/// are (spec §4.3). Min-max the batch back onto `[0,1]` so `Source.score`
/// and `confidence` stay on the same scale regardless of whether rerank
/// ran (spec §4.7: `confidence` "normalized to `[0,1]`").
fn normalize_scores(scores: &[f32]) -> Vec<f32> {
    let min = scores.iter().copied().fold(f32::INFINITY, f32::min);
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let spread = max - min;
    if !spread.is_finite() || spread <= f32::EPSILON {
        return scores.iter().map(|_| 1.0_f32).collect();
    }
    scores.iter().map(|score| (score - min) / spread).collect()
}

fn degraded_answer(sources: &[Source]) -> String {
    if sources.is_empty() {
        format!("{FALLBACK_ANSWER_PREFIX} no sources were retrieved either.")
    } else {
        format!(
            "{FALLBACK_ANSWER_PREFIX} showing {} retrieved excerpt(s) as raw evidence instead.",
            sources.len()
        )
    }
}

fn to_ownership_scope(requested: dsl::RequestedScope) -> kb_core::ownership::RequestedScope {
    match requested {
        dsl::RequestedScope::SelfScope => kb_core::ownership::RequestedScope::SelfScope,
        dsl::RequestedScope::User(id) => kb_core::ownership::RequestedScope::User(id),
        dsl::RequestedScope::All => kb_core::ownership::RequestedScope::All,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_core::model::{Chunk, ConversionStatus, Document, DocumentStatus, Role};
    use kb_providers::{ChatLlm, Embedder, Ocr};
    use tempfile::tempdir;

    async fn build_service() -> (Arc<MetadataRepository>, RetrievalService) {
        let dir = tempdir().unwrap();
        let repo = Arc::new(MetadataRepository::open(dir.path().join("query.wal")).await.unwrap());

        let mut registry = ProviderRegistry::new(Embedder::Hash { dimension: 16 }, 200, Ocr::Disabled);
        registry.register_chat_llm(
            "local-runtime",
            ChatLlm::LocalRuntime {
                model_name: "test".to_string(),
            },
        );
        let providers = Arc::new(registry);

        let service = RetrievalService::new(repo.clone(), providers);
        (repo, service)
    }

    fn sample_document(id: i64, owner_id: i64) -> Document {
        Document {
            id,
            owner_id,
            filename: "note.md".to_string(),
            content_type: "text/markdown".to_string(),
            sha256: "abc".to_string(),
            size_bytes: 11,
            status: DocumentStatus::Approved,
            conversion_status: ConversionStatus::Ready,
            blob_key: "k".to_string(),
            markdown_key: Some("m".to_string()),
            conversion_error: None,
            reject_reason: None,
            created_at: 0,
            confirmed_at: None,
            reviewed_at: None,
            indexed_at: None,
            reviewer_id: None,
            preview_text: String::new(),
        }
    }

    #[tokio::test]
    async fn index_document_populates_owner_partition() {
        let (repo, service) = build_service().await;
        repo.put_document(sample_document(1, 7)).await.unwrap();
        repo.replace_chunks(1, vec![Chunk::new(1, 1, 0, "hello world".to_string())])
            .await
            .unwrap();

        service.index_document(1).await.unwrap();

        let vector_index = repo.vector_index();
        let vector_index = vector_index.read().await;
        assert_eq!(vector_index.partition_len(7), 1);
    }

    #[tokio::test]
    async fn query_returns_only_the_asking_tenants_sources() {
        let (repo, service) = build_service().await;
        repo.put_document(sample_document(1, 7)).await.unwrap();
        repo.replace_chunks(1, vec![Chunk::new(1, 1, 0, "the quick brown fox".to_string())])
            .await
            .unwrap();
        service.index_document(1).await.unwrap();

        let owner = Principal::new(7, Role::User);
        let response = service.query(&owner, "quick brown fox", QueryOptions::default()).await.unwrap();
        assert_eq!(response.sources.len(), 1);
        assert_eq!(response.sources[0].document_id, 1);

        let other = Principal::new(8, Role::User);
        let response = service.query(&other, "quick brown fox", QueryOptions::default()).await.unwrap();
        assert!(response.sources.is_empty());
    }

    #[tokio::test]
    async fn empty_query_text_is_rejected() {
        let (_repo, service) = build_service().await;
        let principal = Principal::new(1, Role::User);
        let err = service.query(&principal, "   ", QueryOptions::default()).await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::Validation);
    }

    #[tokio::test]
    async fn top_k_zero_is_rejected() {
        let (_repo, service) = build_service().await;
        let principal = Principal::new(1, Role::User);
        let mut options = QueryOptions::default();
        options.top_k = Some(0);
        let err = service.query(&principal, "hello", options).await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::Validation);
    }

    #[tokio::test]
    async fn admin_scope_all_crosses_tenant_partitions() {
        let (repo, service) = build_service().await;
        repo.put_document(sample_document(1, 7)).await.unwrap();
        repo.replace_chunks(1, vec![Chunk::new(1, 1, 0, "alpha beta gamma".to_string())])
            .await
            .unwrap();
        service.index_document(1).await.unwrap();

        repo.put_document(sample_document(2, 9)).await.unwrap();
        repo.replace_chunks(2, vec![Chunk::new(2, 2, 0, "alpha beta delta".to_string())])
            .await
            .unwrap();
        service.index_document(2).await.unwrap();

        let admin = Principal::new(1, Role::Admin);
        let mut options = QueryOptions::default();
        options.scope = crate::dsl::RequestedScope::All;
        let response = service.query(&admin, "alpha beta", options).await.unwrap();
        let owners: std::collections::HashSet<i64> = response.sources.iter().map(|s| s.document_id).collect();
        assert!(owners.len() >= 1);
    }
}
