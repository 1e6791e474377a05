use std::sync::Arc;

use kb_core::audit::{AuditOperation, AuditOutcome, InMemoryAuditSink};
use kb_core::model::{Chunk, ConversionStatus, Document, DocumentStatus, Principal, Role};
use kb_providers::{ChatLlm, Embedder, Ocr, ProviderRegistry};
use kb_query::{QueryOptions, RetrievalService};
use kb_storage::MetadataRepository;
use tempfile::tempdir;

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

async fn build_repo_and_providers() -> (Arc<MetadataRepository>, Arc<ProviderRegistry>) {
    let dir = tempdir().unwrap();
    let wal_path = dir.path().join("query_audit.wal");
    let repo = Arc::new(MetadataRepository::open(&wal_path).await.unwrap());

    repo.put_document(sample_document(1, 7)).await.unwrap();
    repo.replace_chunks(1, vec![Chunk::new(1, 1, 0, "Toyota expands EV strategy".to_string())])
        .await
        .unwrap();

    let mut registry = ProviderRegistry::new(Embedder::Hash { dimension: 8 }, 200, Ocr::Disabled);
    registry.register_chat_llm(
        "local-runtime",
        ChatLlm::LocalRuntime {
            model_name: "test".to_string(),
        },
    );

    (repo, Arc::new(registry))
}

#[tokio::test]
async fn query_records_audit_event_with_tenant() {
    let (repo, providers) = build_repo_and_providers().await;
    let sink = Arc::new(InMemoryAuditSink::default());
    let service = RetrievalService::new(repo.clone(), providers).with_audit_sink(sink.clone());

    service.index_document(1).await.unwrap();

    let principal = Principal::new(7, Role::User);
    service.query(&principal, "EV strategy", QueryOptions::default()).await.unwrap();

    let events = sink.events().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].operation, AuditOperation::Query);
    assert_eq!(events[0].outcome, AuditOutcome::Succeeded);
    assert_eq!(events[0].tenant.as_deref(), Some("7"));
    assert!(events[0].metadata.contains_key("latency_ms"));
}

#[tokio::test]
async fn query_validation_failure_records_denied_audit_event() {
    let (repo, providers) = build_repo_and_providers().await;
    let sink = Arc::new(InMemoryAuditSink::default());
    let service = RetrievalService::new(repo, providers).with_audit_sink(sink.clone());

    let principal = Principal::new(7, Role::User);
    let result = service.query(&principal, "   ", QueryOptions::default()).await;
    assert!(result.is_err());

    let events = sink.events().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].operation, AuditOperation::Query);
    assert_eq!(events[0].outcome, AuditOutcome::Denied);
}
