use std::sync::Arc;

use kb_core::model::{Chunk, ConversionStatus, Document, DocumentStatus, Principal, Role};
use kb_providers::{ChatLlm, Embedder, Ocr, ProviderRegistry};
use kb_query::{QueryOptions, RequestedScope, RetrievalService};
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
    let wal_path = dir.path().join("query_authz.wal");
    let repo = Arc::new(MetadataRepository::open(&wal_path).await.unwrap());

    repo.put_document(sample_document(1, 7)).await.unwrap();
    repo.replace_chunks(1, vec![Chunk::new(1, 1, 0, "Toyota expands EV strategy".to_string())])
        .await
        .unwrap();
    repo.put_document(sample_document(2, 9)).await.unwrap();
    repo.replace_chunks(2, vec![Chunk::new(2, 2, 0, "Honda expands EV strategy".to_string())])
        .await
        .unwrap();

    let mut registry = ProviderRegistry::new(Embedder::Hash { dimension: 8 }, 200, Ocr::Disabled);
    registry.register_chat_llm(
        "local-runtime",
        ChatLlm::LocalRuntime {
            model_name: "test".to_string(),
        },
    );
    let service = RetrievalService::new(repo.clone(), Arc::new(registry));
    service.index_document(1).await.unwrap();
    service.index_document(2).await.unwrap();

    (repo, service)
}

#[tokio::test]
async fn user_sees_only_their_own_tenants_chunks() {
    let (_repo, service) = build_service().await;
    let principal = Principal::new(7, Role::User);

    let response = service
        .query(&principal, "EV strategy", QueryOptions::default())
        .await
        .unwrap();

    assert!(response.sources.iter().all(|source| source.document_id == 1));
}

#[tokio::test]
async fn user_widening_scope_is_silently_ignored() {
    let (_repo, service) = build_service().await;
    let principal = Principal::new(7, Role::User);

    let mut options = QueryOptions::default();
    options.scope = RequestedScope::All;

    let response = service
        .query(&principal, "EV strategy", options)
        .await
        .unwrap();

    assert!(response.sources.iter().all(|source| source.document_id == 1));
}

#[tokio::test]
async fn admin_can_widen_scope_to_another_tenant() {
    let (_repo, service) = build_service().await;
    let admin = Principal::new(1, Role::Admin);

    let mut options = QueryOptions::default();
    options.scope = RequestedScope::User(9);

    let response = service
        .query(&admin, "EV strategy", options)
        .await
        .unwrap();

    assert!(response.sources.iter().all(|source| source.document_id == 2));
}

#[tokio::test]
async fn admin_scope_all_sees_every_tenant() {
    let (_repo, service) = build_service().await;
    let admin = Principal::new(1, Role::Admin);

    let mut options = QueryOptions::default();
    options.scope = RequestedScope::All;

    let response = service
        .query(&admin, "EV strategy", options)
        .await
        .unwrap();

    let document_ids: std::collections::HashSet<i64> =
        response.sources.iter().map(|source| source.document_id).collect();
    assert!(document_ids.contains(&1) || document_ids.contains(&2));
}
