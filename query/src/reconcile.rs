use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info};

use kb_core::audit::{AuditEvent, AuditOperation, AuditOutcome, AuditSink};
use kb_core::error::{ErrorCode, KbError};
use kb_core::model::DocumentStatus;
use kb_storage::MetadataRepository;

use crate::engine::{QueryError, RetrievalService};

#[derive(Debug, Error)]
pub enum ReconciliationError {
    #[error("document {0} not found")]
    NotFound(i64),
    #[error(transparent)]
    Query(#[from] QueryError),
}

impl KbError for ReconciliationError {
    fn error_code(&self) -> ErrorCode {
        match self {
            ReconciliationError::NotFound(_) => ErrorCode::NotFound,
            ReconciliationError::Query(err) => err.error_code(),
        }
    }
}

/// Which documents a bulk [`ReconciliationService::reindex`] call should
/// cover (spec §4.8: "filtered by `owner_id` and/or `status_in`"). An empty
/// `status_in` means no status filter; `rebuild_vectors` is only meaningful
/// for documents that have reached `indexed` at least once, so callers that
/// leave `status_in` empty still only have `indexed` documents actually
/// rebuilt (see `reindex`'s eligibility check).
#[derive(Debug, Clone, Default)]
pub struct ReindexFilter {
    pub owner_id: Option<i64>,
    pub status_in: Vec<DocumentStatus>,
}

/// One document's outcome within a bulk reindex.
#[derive(Debug, Clone)]
pub struct ReindexFailure {
    pub document_id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct ReindexSummary {
    pub ok: Vec<i64>,
    pub failed: Vec<ReindexFailure>,
}

/// C8: restores the invariant that every `indexed` document's vectors
/// exactly mirror its currently-included chunks, either for one document
/// (`rebuild_vectors`) or in bulk across a tenant or the whole deployment
/// (`reindex`).
pub struct ReconciliationService {
    repo: Arc<MetadataRepository>,
    retrieval: Arc<RetrievalService>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl ReconciliationService {
    pub fn new(repo: Arc<MetadataRepository>, retrieval: Arc<RetrievalService>) -> Self {
        Self {
            repo,
            retrieval,
            audit: None,
        }
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Deletes and re-upserts one document's vectors from its current
    /// `included` chunks (spec §4.8). Only meaningful for documents that
    /// have reached `indexed` at least once, but is safe to call regardless
    /// of status — it simply re-derives whatever the chunk store says.
    pub async fn rebuild_vectors(&self, document_id: i64) -> Result<(), ReconciliationError> {
        let document = self
            .repo
            .get_document(document_id)
            .await
            .map_err(|_| ReconciliationError::NotFound(document_id))?;

        {
            let vector_index = self.repo.vector_index();
            let mut vector_index = vector_index.write().await;
            vector_index.delete_by_document(document.owner_id, document_id);
        }

        self.retrieval.index_document(document_id).await?;

        if let Some(sink) = &self.audit {
            let mut event = AuditEvent::new(AuditOperation::RebuildVectors, AuditOutcome::Succeeded);
            event.tenant = Some(document.owner_id.to_string());
            let _ = sink.record(event);
        }

        Ok(())
    }

    /// Sequential bulk rebuild (spec §4.8: "processes documents one at a
    /// time; a single document's failure does not abort the batch"). Only
    /// documents that have ever reached `indexed` are eligible — an
    /// `approved`-but-never-indexed document is left for `approve` to index
    /// normally.
    pub async fn reindex(&self, filter: ReindexFilter) -> ReindexSummary {
        let documents = match filter.owner_id {
            Some(owner_id) => self.repo.list_documents_for_tenant(owner_id).await,
            None => self.repo.list_all_documents().await,
        };

        let mut summary = ReindexSummary::default();

        for document in documents {
            let status_matches = if filter.status_in.is_empty() {
                document.status == DocumentStatus::Indexed
            } else {
                filter.status_in.contains(&document.status)
            };
            if !status_matches {
                continue;
            }

            match self.rebuild_vectors(document.id).await {
                Ok(()) => {
                    info!(document_id = document.id, "reindexed");
                    summary.ok.push(document.id);
                }
                Err(err) => {
                    error!(document_id = document.id, error = %err, "reindex failed");
                    summary.failed.push(ReindexFailure {
                        document_id: document.id,
                        reason: err.to_string(),
                    });
                }
            }
        }

        if let Some(sink) = &self.audit {
            let outcome = if summary.failed.is_empty() {
                AuditOutcome::Succeeded
            } else {
                AuditOutcome::Failed
            };
            let mut event = AuditEvent::new(AuditOperation::Reindex, outcome);
            event.metadata.insert("ok_count".to_string(), summary.ok.len().to_string());
            event
                .metadata
                .insert("failed_count".to_string(), summary.failed.len().to_string());
            let _ = sink.record(event);
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_core::model::{Chunk, ConversionStatus, Document};
    use kb_providers::{ChatLlm, Embedder, Ocr, ProviderRegistry};
    use tempfile::tempdir;

    fn sample_document(id: i64, owner_id: i64, status: DocumentStatus) -> Document {
        Document {
            id,
            owner_id,
            filename: "note.md".to_string(),
            content_type: "text/markdown".to_string(),
            sha256: "abc".to_string(),
            size_bytes: 11,
            status,
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

    async fn build(
    ) -> (Arc<MetadataRepository>, Arc<RetrievalService>, ReconciliationService) {
        let dir = tempdir().unwrap();
        let repo = Arc::new(MetadataRepository::open(dir.path().join("reconcile.wal")).await.unwrap());
        let mut registry = ProviderRegistry::new(Embedder::Hash { dimension: 8 }, 200, Ocr::Disabled);
        registry.register_chat_llm(
            "local-runtime",
            ChatLlm::LocalRuntime {
                model_name: "test".to_string(),
            },
        );
        let retrieval = Arc::new(RetrievalService::new(repo.clone(), Arc::new(registry)));
        let reconciliation = ReconciliationService::new(repo.clone(), retrieval.clone());
        (repo, retrieval, reconciliation)
    }

    #[tokio::test]
    async fn rebuild_vectors_repopulates_from_chunks() {
        let (repo, retrieval, reconciliation) = build().await;
        repo.put_document(sample_document(1, 7, DocumentStatus::Indexed)).await.unwrap();
        repo.replace_chunks(1, vec![Chunk::new(1, 1, 0, "hello".to_string())]).await.unwrap();
        retrieval.index_document(1).await.unwrap();

        {
            let vector_index = repo.vector_index();
            let mut vector_index = vector_index.write().await;
            vector_index.delete_by_document(7, 1);
        }

        reconciliation.rebuild_vectors(1).await.unwrap();

        let vector_index = repo.vector_index();
        let vector_index = vector_index.read().await;
        assert_eq!(vector_index.partition_len(7), 1);
    }

    #[tokio::test]
    async fn reindex_only_covers_indexed_documents_and_is_per_document_fault_tolerant() {
        let (repo, _retrieval, reconciliation) = build().await;
        repo.put_document(sample_document(1, 7, DocumentStatus::Indexed)).await.unwrap();
        repo.replace_chunks(1, vec![Chunk::new(1, 1, 0, "hello".to_string())]).await.unwrap();

        repo.put_document(sample_document(2, 7, DocumentStatus::Approved)).await.unwrap();

        let summary = reconciliation.reindex(ReindexFilter::default()).await;
        assert_eq!(summary.ok, vec![1]);
        assert!(summary.failed.is_empty());
    }

    #[tokio::test]
    async fn reindex_honors_explicit_status_in_filter() {
        let (repo, _retrieval, reconciliation) = build().await;
        repo.put_document(sample_document(1, 7, DocumentStatus::Indexed)).await.unwrap();
        repo.replace_chunks(1, vec![Chunk::new(1, 1, 0, "hello".to_string())]).await.unwrap();
        repo.put_document(sample_document(2, 7, DocumentStatus::Approved)).await.unwrap();
        repo.replace_chunks(2, vec![Chunk::new(2, 2, 0, "world".to_string())]).await.unwrap();

        let summary = reconciliation
            .reindex(ReindexFilter {
                owner_id: None,
                status_in: vec![DocumentStatus::Approved],
            })
            .await;
        assert_eq!(summary.ok, vec![2]);
    }

    #[tokio::test]
    async fn reindex_scopes_to_a_single_tenant_when_filtered() {
        let (repo, _retrieval, reconciliation) = build().await;
        repo.put_document(sample_document(1, 7, DocumentStatus::Indexed)).await.unwrap();
        repo.replace_chunks(1, vec![Chunk::new(1, 1, 0, "hello".to_string())]).await.unwrap();
        repo.put_document(sample_document(2, 9, DocumentStatus::Indexed)).await.unwrap();
        repo.replace_chunks(2, vec![Chunk::new(2, 2, 0, "world".to_string())]).await.unwrap();

        let summary = reconciliation
            .reindex(ReindexFilter { owner_id: Some(7), status_in: Vec::new() })
            .await;
        assert_eq!(summary.ok, vec![1]);
    }
}
