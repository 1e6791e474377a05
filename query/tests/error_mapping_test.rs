use std::sync::Arc;

use kb_core::error::{ErrorCode, KbError};
use kb_core::metrics::MetricsCollector;
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

async fn build_service() -> (Arc<MetadataRepository>, RetrievalService) {
    let dir = tempdir().unwrap();
    let repo = Arc::new(MetadataRepository::open(dir.path().join("error_mapping.wal")).await.unwrap());
    repo.put_document(sample_document(1, 7)).await.unwrap();
    repo.replace_chunks(1, vec![Chunk::new(1, 1, 0, "EV strategy".to_string())])
        .await
        .unwrap();

    let registry = ProviderRegistry::new(Embedder::Hash { dimension: 8 }, 200, Ocr::Disabled);
    let service = RetrievalService::new(repo.clone(), Arc::new(registry));
    service.index_document(1).await.unwrap();
    (repo, service)
}

#[tokio::test]
async fn empty_query_maps_to_validation() {
    let (_repo, service) = build_service().await;
    let principal = Principal::new(7, Role::User);

    let err = service.query(&principal, "   ", QueryOptions::default()).await.unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::Validation);
}

#[tokio::test]
async fn top_k_zero_maps_to_validation() {
    let (_repo, service) = build_service().await;
    let principal = Principal::new(7, Role::User);

    let mut options = QueryOptions::default();
    options.top_k = Some(0);
    let err = service.query(&principal, "EV strategy", options).await.unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::Validation);
}

#[tokio::test]
async fn top_k_above_ceiling_is_clamped_instead_of_rejected() {
    let (_repo, service) = build_service().await;
    let principal = Principal::new(7, Role::User);

    let mut options = QueryOptions::default();
    options.top_k = Some(51);
    let response = service.query(&principal, "EV strategy", options).await.unwrap();
    assert!(response.sources.len() <= 50);
}

#[tokio::test]
async fn no_chat_provider_configured_falls_back_to_a_degraded_answer() {
    let (_repo, service) = build_service().await;
    let principal = Principal::new(7, Role::User);

    let response = service
        .query(&principal, "EV strategy", QueryOptions::default())
        .await
        .unwrap();

    assert!(response.answer.starts_with("[degraded:"));
}

#[tokio::test]
async fn query_metrics_track_degraded_rate() {
    let dir = tempdir().unwrap();
    let repo = Arc::new(MetadataRepository::open(dir.path().join("error_metrics.wal")).await.unwrap());
    repo.put_document(sample_document(1, 7)).await.unwrap();
    repo.replace_chunks(1, vec![Chunk::new(1, 1, 0, "EV strategy".to_string())])
        .await
        .unwrap();

    let mut registry = ProviderRegistry::new(Embedder::Hash { dimension: 8 }, 200, Ocr::Disabled);
    registry.register_chat_llm(
        "local-runtime",
        ChatLlm::LocalRuntime {
            model_name: "test".to_string(),
        },
    );
    let metrics = Arc::new(MetricsCollector::new(100));
    let service = RetrievalService::new(repo.clone(), Arc::new(registry)).with_metrics(metrics.clone());
    service.index_document(1).await.unwrap();

    let principal = Principal::new(7, Role::User);
    service.query(&principal, "EV strategy", QueryOptions::default()).await.unwrap();

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.total_queries, 1);
    assert_eq!(snapshot.degraded_rate, 0.0);
}
