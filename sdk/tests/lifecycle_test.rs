use std::sync::Arc;

use kb_core::error::{ErrorCode, KbError};
use kb_core::model::{ConversionStatus, DocumentStatus, Principal, Role};
use kb_jobs::{ChannelJobQueue, JobQueue};
use kb_providers::{Embedder, Ocr, ProviderRegistry};
use kb_query::RetrievalService;
use kb_sdk::{ChunkUpdate, DocumentLifecycleService, LifecycleConfig, ListFilter};
use kb_storage::{FsObjectStoreGateway, MetadataRepository};
use tempfile::tempdir;
use tokio::sync::mpsc;

async fn build_service() -> (tempfile::TempDir, Arc<MetadataRepository>, DocumentLifecycleService) {
    let dir = tempdir().unwrap();
    let repo = Arc::new(MetadataRepository::open(dir.path().join("lifecycle.wal")).await.unwrap());
    let object_store = Arc::new(FsObjectStoreGateway::new(dir.path().join("blobs")));
    let (tx, _rx) = mpsc::channel(64);
    let queue: Arc<dyn JobQueue> = Arc::new(ChannelJobQueue::new(tx));
    let registry = ProviderRegistry::new(Embedder::Hash { dimension: 8 }, 200, Ocr::Disabled);
    let retrieval = Arc::new(RetrievalService::new(repo.clone(), Arc::new(registry)));

    let service = DocumentLifecycleService::new(repo.clone(), object_store, queue, retrieval, LifecycleConfig::default());
    (dir, repo, service)
}

async fn confirm_and_mark_ready(repo: &MetadataRepository, id: i64) {
    let mut document = repo.get_document(id).await.unwrap();
    document.conversion_status = ConversionStatus::Ready;
    document.markdown_key = Some("m".to_string());
    repo.put_document(document).await.unwrap();
    repo.replace_chunks(
        id,
        vec![
            kb_core::model::Chunk::new(repo.allocate_chunk_id(), id, 0, "first chunk of prose".to_string()),
            kb_core::model::Chunk::new(repo.allocate_chunk_id(), id, 1, "second chunk of prose".to_string()),
        ],
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn upload_persists_document_and_enqueues_conversion() {
    let (_dir, repo, service) = build_service().await;
    let owner = Principal::new(7, Role::User);

    let id = service
        .upload(&owner, b"hello world".to_vec(), "note.txt".to_string(), "text/plain".to_string())
        .await
        .unwrap();

    let document = repo.get_document(id).await.unwrap();
    assert_eq!(document.status, DocumentStatus::Uploaded);
    assert_eq!(document.conversion_status, ConversionStatus::Pending);
    assert_eq!(document.owner_id, 7);
}

#[tokio::test]
async fn upload_rejects_unsupported_content_type() {
    let (_dir, _repo, service) = build_service().await;
    let owner = Principal::new(7, Role::User);

    let err = service
        .upload(&owner, b"binary".to_vec(), "file.exe".to_string(), "application/octet-stream".to_string())
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::Validation);
}

#[tokio::test]
async fn confirm_requires_ready_conversion() {
    let (_dir, repo, service) = build_service().await;
    let owner = Principal::new(7, Role::User);
    let id = service
        .upload(&owner, b"hello".to_vec(), "note.txt".to_string(), "text/plain".to_string())
        .await
        .unwrap();

    let err = service.confirm(&owner, id).await.unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::Precondition);

    confirm_and_mark_ready(&repo, id).await;
    service.confirm(&owner, id).await.unwrap();

    let document = repo.get_document(id).await.unwrap();
    assert_eq!(document.status, DocumentStatus::Confirmed);
}

#[tokio::test]
async fn approve_from_uploaded_indexes_the_document() {
    let (_dir, repo, service) = build_service().await;
    let owner = Principal::new(7, Role::User);
    let id = service
        .upload(&owner, b"hello".to_vec(), "note.txt".to_string(), "text/plain".to_string())
        .await
        .unwrap();
    confirm_and_mark_ready(&repo, id).await;

    service.approve(&owner, id).await.unwrap();

    let document = repo.get_document(id).await.unwrap();
    assert_eq!(document.status, DocumentStatus::Indexed);
    assert!(document.indexed_at.is_some());

    let vector_index = repo.vector_index();
    let vector_index = vector_index.read().await;
    assert_eq!(vector_index.partition_len(7), 2);
}

#[tokio::test]
async fn reject_then_resubmit_returns_to_confirmed() {
    let (_dir, repo, service) = build_service().await;
    let owner = Principal::new(7, Role::User);
    let id = service
        .upload(&owner, b"hello".to_vec(), "note.txt".to_string(), "text/plain".to_string())
        .await
        .unwrap();
    confirm_and_mark_ready(&repo, id).await;

    service.reject(&owner, id, "needs more detail".to_string()).await.unwrap();
    let document = repo.get_document(id).await.unwrap();
    assert_eq!(document.status, DocumentStatus::Rejected);
    assert_eq!(document.reject_reason.as_deref(), Some("needs more detail"));

    service.resubmit(&owner, id).await.unwrap();
    let document = repo.get_document(id).await.unwrap();
    assert_eq!(document.status, DocumentStatus::Confirmed);
    assert!(document.reject_reason.is_none());
}

#[tokio::test]
async fn delete_chunk_renumbers_remaining_chunks() {
    let (_dir, repo, service) = build_service().await;
    let owner = Principal::new(7, Role::User);
    let id = service
        .upload(&owner, b"hello".to_vec(), "note.txt".to_string(), "text/plain".to_string())
        .await
        .unwrap();
    confirm_and_mark_ready(&repo, id).await;
    service
        .create_chunk(&owner, id, "third chunk of prose".to_string(), false)
        .await
        .unwrap();

    service.delete_chunk(&owner, id, 0, false).await.unwrap();

    let chunks = repo.get_chunks_for_document(id).await;
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].chunk_index, 0);
    assert_eq!(chunks[1].chunk_index, 1);
    assert_eq!(chunks[0].content, "second chunk of prose");
}

#[tokio::test]
async fn update_chunk_sync_vectors_rebuilds_an_indexed_documents_partition() {
    let (_dir, repo, service) = build_service().await;
    let owner = Principal::new(7, Role::User);
    let id = service
        .upload(&owner, b"hello".to_vec(), "note.txt".to_string(), "text/plain".to_string())
        .await
        .unwrap();
    confirm_and_mark_ready(&repo, id).await;
    service.approve(&owner, id).await.unwrap();

    service
        .update_chunk(
            &owner,
            id,
            0,
            ChunkUpdate {
                content: Some("edited chunk content".to_string()),
                included: None,
            },
            true,
        )
        .await
        .unwrap();

    let vector_index = repo.vector_index();
    let vector_index = vector_index.read().await;
    assert_eq!(vector_index.partition_len(7), 2);
}

#[tokio::test]
async fn excluding_a_chunk_and_syncing_drops_it_from_the_partition() {
    let (_dir, repo, service) = build_service().await;
    let owner = Principal::new(7, Role::User);
    let id = service
        .upload(&owner, b"hello".to_vec(), "note.txt".to_string(), "text/plain".to_string())
        .await
        .unwrap();
    confirm_and_mark_ready(&repo, id).await;
    service.approve(&owner, id).await.unwrap();

    service
        .update_chunk(
            &owner,
            id,
            1,
            ChunkUpdate { content: None, included: Some(false) },
            true,
        )
        .await
        .unwrap();

    let vector_index = repo.vector_index();
    let vector_index = vector_index.read().await;
    assert_eq!(vector_index.chunk_indexes_for_document(7, id), vec![0]);
}

#[tokio::test]
async fn other_tenants_cannot_touch_documents_they_do_not_own() {
    let (_dir, _repo, service) = build_service().await;
    let owner = Principal::new(7, Role::User);
    let stranger = Principal::new(9, Role::User);

    let id = service
        .upload(&owner, b"hello".to_vec(), "note.txt".to_string(), "text/plain".to_string())
        .await
        .unwrap();

    let err = service.get_status(&stranger, id).await.unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::Forbidden);
}

#[tokio::test]
async fn admin_can_list_across_tenants_while_a_user_sees_only_their_own() {
    let (_dir, _repo, service) = build_service().await;
    let tenant_a = Principal::new(7, Role::User);
    let tenant_b = Principal::new(9, Role::User);
    let admin = Principal::new(1, Role::Admin);

    service.upload(&tenant_a, b"a".to_vec(), "a.txt".to_string(), "text/plain".to_string()).await.unwrap();
    service.upload(&tenant_b, b"b".to_vec(), "b.txt".to_string(), "text/plain".to_string()).await.unwrap();

    let user_page = service.list(&tenant_a, ListFilter::default()).await;
    assert_eq!(user_page.total, 1);

    let admin_page = service.list(&admin, ListFilter::default()).await;
    assert_eq!(admin_page.total, 2);
}

#[tokio::test]
async fn upload_markdown_recovers_a_failed_conversion_and_returns_to_confirmed() {
    let (_dir, repo, service) = build_service().await;
    let owner = Principal::new(7, Role::User);
    let id = service
        .upload(&owner, b"hello".to_vec(), "note.txt".to_string(), "text/plain".to_string())
        .await
        .unwrap();

    let mut document = repo.get_document(id).await.unwrap();
    document.conversion_status = ConversionStatus::Failed;
    document.conversion_error = Some("pdf extraction failed".to_string());
    repo.put_document(document).await.unwrap();

    service
        .upload_markdown(&owner, id, b"# Recovered\n\nOwner-supplied markdown.".to_vec())
        .await
        .unwrap();

    let document = repo.get_document(id).await.unwrap();
    assert_eq!(document.status, DocumentStatus::Confirmed);
    assert_eq!(document.conversion_status, ConversionStatus::Ready);
    assert!(document.conversion_error.is_none());

    let chunks = repo.get_chunks_for_document(id).await;
    assert!(!chunks.is_empty());
}

#[tokio::test]
async fn upload_markdown_rejects_non_utf8_bytes() {
    let (_dir, repo, service) = build_service().await;
    let owner = Principal::new(7, Role::User);
    let id = service
        .upload(&owner, b"hello".to_vec(), "note.txt".to_string(), "text/plain".to_string())
        .await
        .unwrap();
    confirm_and_mark_ready(&repo, id).await;

    let err = service.upload_markdown(&owner, id, vec![0xff, 0xfe, 0xfd]).await.unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::Validation);
}

#[tokio::test]
async fn retry_conversion_requeues_a_failed_document() {
    let (_dir, repo, service) = build_service().await;
    let owner = Principal::new(7, Role::User);
    let id = service
        .upload(&owner, b"hello".to_vec(), "note.txt".to_string(), "text/plain".to_string())
        .await
        .unwrap();

    let mut document = repo.get_document(id).await.unwrap();
    document.conversion_status = ConversionStatus::Failed;
    document.conversion_error = Some("timed out".to_string());
    repo.put_document(document).await.unwrap();

    service.retry_conversion(&owner, id).await.unwrap();
}

#[tokio::test]
async fn retry_conversion_rejects_a_document_that_is_already_ready() {
    let (_dir, repo, service) = build_service().await;
    let owner = Principal::new(7, Role::User);
    let id = service
        .upload(&owner, b"hello".to_vec(), "note.txt".to_string(), "text/plain".to_string())
        .await
        .unwrap();
    confirm_and_mark_ready(&repo, id).await;

    let err = service.retry_conversion(&owner, id).await.unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::Precondition);
}

#[tokio::test]
async fn delete_cascades_chunks_and_vectors() {
    let (_dir, repo, service) = build_service().await;
    let owner = Principal::new(7, Role::User);
    let id = service
        .upload(&owner, b"hello".to_vec(), "note.txt".to_string(), "text/plain".to_string())
        .await
        .unwrap();
    confirm_and_mark_ready(&repo, id).await;
    service.approve(&owner, id).await.unwrap();

    service.delete(&owner, id).await.unwrap();

    assert!(repo.get_document(id).await.is_err());
    assert!(repo.get_chunks_for_document(id).await.is_empty());
    let vector_index = repo.vector_index();
    let vector_index = vector_index.read().await;
    assert_eq!(vector_index.partition_len(7), 0);
}
