use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use kb_core::audit::{AuditEvent, AuditOperation, AuditOutcome, AuditSink};
use kb_core::error::{ErrorCode, KbError};
use kb_core::model::{
    content_sha256, now_unix, Chunk, Document, ConversionStatus, DocumentStatus, Principal,
    ReviewAction, ReviewActionKind,
};
use kb_core::ownership::{authorize_owner, AuthzError};
use kb_ingestion::{chunk_splitter_for_strategy, detect_content_kind, ContentKind};
use kb_jobs::{Job, JobQueue, QueueError};
use kb_query::{QueryError, RetrievalService};
use kb_storage::{safe_filename, MetadataRepository, ObjectStoreError, ObjectStoreGateway, RepoError};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("precondition not met: {0}")]
    Precondition(String),
    #[error(transparent)]
    Authz(#[from] AuthzError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Query(#[from] QueryError),
}

impl KbError for LifecycleError {
    fn error_code(&self) -> ErrorCode {
        match self {
            LifecycleError::Validation(_) => ErrorCode::Validation,
            LifecycleError::NotFound(_) => ErrorCode::NotFound,
            LifecycleError::Precondition(_) => ErrorCode::Precondition,
            LifecycleError::Authz(_) => ErrorCode::Forbidden,
            LifecycleError::Repo(err) => err.error_code(),
            LifecycleError::ObjectStore(err) => err.error_code(),
            LifecycleError::Queue(err) => err.error_code(),
            LifecycleError::Query(err) => err.error_code(),
        }
    }
}

/// A page of results, 1-indexed, clamped to [`MAX_PAGE_SIZE`].
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
}

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

fn paginate<T>(all: Vec<T>, page: Option<usize>, page_size: Option<usize>) -> Page<T> {
    let total = all.len();
    let page_size = page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let page = page.unwrap_or(1).max(1);
    let start = (page - 1) * page_size;
    let items = if start >= total {
        Vec::new()
    } else {
        all.into_iter().skip(start).take(page_size).collect()
    };
    Page { items, page, page_size, total }
}

/// Filters accepted by [`DocumentLifecycleService::list`]. `owner` widens
/// scope for an admin caller the same way `kb_query`'s `RequestedScope` does
/// for queries; a non-admin's `owner` is always ignored in favor of their own
/// tenant (spec §4.7's scope rule, mirrored here for listing).
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub owner: Option<i64>,
    pub status: Option<DocumentStatus>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

/// Patch applied by [`DocumentLifecycleService::update_chunk`]. Absent fields
/// are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct ChunkUpdate {
    pub content: Option<String>,
    pub included: Option<bool>,
}

pub struct LifecycleConfig {
    pub chunk_strategy: String,
    pub chunk_size: usize,
    pub overlap_percent: u32,
    pub delimiters: Vec<String>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            chunk_strategy: "semantic-paragraph".to_string(),
            chunk_size: 1000,
            overlap_percent: 10,
            delimiters: Vec::new(),
        }
    }
}

/// C6: the document lifecycle state machine (spec §4.6). Every operation
/// takes the acting [`Principal`] and enforces tenant ownership before
/// touching metadata, blobs, or vectors.
pub struct DocumentLifecycleService {
    repo: Arc<MetadataRepository>,
    object_store: Arc<dyn ObjectStoreGateway>,
    queue: Arc<dyn JobQueue>,
    retrieval: Arc<RetrievalService>,
    config: LifecycleConfig,
    audit: Option<Arc<dyn AuditSink>>,
}

impl DocumentLifecycleService {
    pub fn new(
        repo: Arc<MetadataRepository>,
        object_store: Arc<dyn ObjectStoreGateway>,
        queue: Arc<dyn JobQueue>,
        retrieval: Arc<RetrievalService>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            repo,
            object_store,
            queue,
            retrieval,
            config,
            audit: None,
        }
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    fn record(&self, operation: AuditOperation, outcome: AuditOutcome, tenant: i64) {
        if let Some(sink) = &self.audit {
            let mut event = AuditEvent::new(operation, outcome);
            event.tenant = Some(tenant.to_string());
            let _ = sink.record(event);
        }
    }

    /// Persists metadata and the original blob, then enqueues the conversion
    /// job (spec §4.6 `upload`).
    pub async fn upload(
        &self,
        principal: &Principal,
        file_bytes: Vec<u8>,
        filename: String,
        content_type: String,
    ) -> Result<i64, LifecycleError> {
        if detect_content_kind(&content_type, Some(&filename)) == ContentKind::Unsupported {
            self.record(AuditOperation::Upload, AuditOutcome::Denied, principal.tenant_id);
            return Err(LifecycleError::Validation(format!(
                "unsupported content type for {filename}"
            )));
        }

        let id = self.repo.allocate_document_id();
        let owner_id = principal.tenant_id;
        let upload_uuid = uuid::Uuid::new_v4();
        let blob_key = format!(
            "tenant_{owner_id}/documents/{upload_uuid}/{}",
            safe_filename(&filename)
        );

        self.object_store.put(&blob_key, &file_bytes).await?;

        let document = Document {
            id,
            owner_id,
            filename,
            content_type,
            sha256: content_sha256(&file_bytes),
            size_bytes: file_bytes.len() as u64,
            status: DocumentStatus::Uploaded,
            conversion_status: ConversionStatus::Pending,
            blob_key,
            markdown_key: None,
            conversion_error: None,
            reject_reason: None,
            created_at: now_unix(),
            confirmed_at: None,
            reviewed_at: None,
            indexed_at: None,
            reviewer_id: None,
            preview_text: String::new(),
        };
        self.repo.put_document(document).await?;

        self.queue
            .enqueue(Job::ConvertDocument { document_id: id, attempt: 1 })
            .await?;

        self.record(AuditOperation::Upload, AuditOutcome::Succeeded, owner_id);
        Ok(id)
    }

    pub async fn get_status(&self, principal: &Principal, id: i64) -> Result<Document, LifecycleError> {
        let document = self.load_owned(principal, id).await?;
        Ok(document)
    }

    /// spec §4.6 `list`: a non-admin is always scoped to their own tenant
    /// regardless of `filter.owner` (mirrors `kb_query`'s scope rule).
    pub async fn list(&self, principal: &Principal, filter: ListFilter) -> Page<Document> {
        let mut documents = if principal.is_admin() {
            match filter.owner {
                Some(owner_id) => self.repo.list_documents_for_tenant(owner_id).await,
                None => self.repo.list_all_documents().await,
            }
        } else {
            self.repo.list_documents_for_tenant(principal.tenant_id).await
        };

        if let Some(status) = filter.status {
            documents.retain(|doc| doc.status == status);
        }

        paginate(documents, filter.page, filter.page_size)
    }

    pub async fn download_markdown(&self, principal: &Principal, id: i64) -> Result<Vec<u8>, LifecycleError> {
        let document = self.load_owned(principal, id).await?;
        let key = document
            .markdown_key
            .ok_or_else(|| LifecycleError::Precondition("document has no converted markdown yet".to_string()))?;
        Ok(self.object_store.get(&key).await?)
    }

    /// Replacing Markdown re-runs the splitter, resets chunks, and drops the
    /// document back to `confirmed` since the authoritative content changed
    /// by the owner's hand (spec §4.6 `upload_markdown`).
    pub async fn upload_markdown(&self, principal: &Principal, id: i64, bytes: Vec<u8>) -> Result<(), LifecycleError> {
        let mut document = self.load_owned(principal, id).await?;

        if !matches!(document.conversion_status, ConversionStatus::Ready | ConversionStatus::Failed) {
            return Err(LifecycleError::Precondition(
                "markdown can only be replaced once conversion has reached ready or failed".to_string(),
            ));
        }

        let markdown = String::from_utf8(bytes.clone())
            .map_err(|_| LifecycleError::Validation("markdown must be valid utf-8".to_string()))?;

        let markdown_key = document
            .markdown_key
            .clone()
            .unwrap_or_else(|| format!("tenant_{}/markdown/{}.md", document.owner_id, document.id));
        self.object_store.put(&markdown_key, &bytes).await?;

        let splitter = chunk_splitter_for_strategy(
            &self.config.chunk_strategy,
            self.config.chunk_size,
            self.config.overlap_percent,
            &self.config.delimiters,
        );
        let pieces = splitter.split(&markdown);
        let mut chunks = Vec::with_capacity(pieces.len());
        for (index, content) in pieces.into_iter().enumerate() {
            let chunk_id = self.repo.allocate_chunk_id();
            chunks.push(Chunk::new(chunk_id, id, index as u32, content));
        }
        self.repo.replace_chunks(id, chunks).await?;

        // The document is no longer `indexed` after this — any existing
        // vectors for it are stale and would otherwise violate invariant 4
        // the next time this document is reconciled.
        {
            let vector_index = self.repo.vector_index();
            let mut vector_index = vector_index.write().await;
            vector_index.delete_by_document(document.owner_id, id);
        }

        document.conversion_status = ConversionStatus::Ready;
        document.conversion_error = None;
        document.markdown_key = Some(markdown_key);
        document.status = DocumentStatus::Confirmed;
        document.confirmed_at = Some(now_unix());
        document.preview_text = markdown.chars().take(280).collect();
        self.repo.put_document(document).await?;

        Ok(())
    }

    /// Only valid when conversion is stuck or has given up (spec §4.6
    /// `retry_conversion`); the worker itself re-validates state before
    /// acting on the requeued job.
    pub async fn retry_conversion(&self, principal: &Principal, id: i64) -> Result<(), LifecycleError> {
        let document = self.load_owned(principal, id).await?;

        if !matches!(document.conversion_status, ConversionStatus::Failed | ConversionStatus::Pending) {
            return Err(LifecycleError::Precondition(
                "conversion can only be retried while pending or failed".to_string(),
            ));
        }

        self.queue
            .enqueue(Job::ConvertDocument { document_id: id, attempt: 1 })
            .await?;
        Ok(())
    }

    pub async fn confirm(&self, principal: &Principal, id: i64) -> Result<(), LifecycleError> {
        let mut document = self.load_owned(principal, id).await?;

        if document.status != DocumentStatus::Uploaded || document.conversion_status != ConversionStatus::Ready {
            return Err(LifecycleError::Precondition(
                "confirm requires status=uploaded and conversion_status=ready".to_string(),
            ));
        }

        document.status = DocumentStatus::Confirmed;
        document.confirmed_at = Some(now_unix());
        self.repo.put_document(document).await?;

        self.record(AuditOperation::Confirm, AuditOutcome::Succeeded, principal.tenant_id);
        Ok(())
    }

    pub async fn list_chunks(&self, principal: &Principal, id: i64, page: Option<usize>, page_size: Option<usize>) -> Result<Page<Chunk>, LifecycleError> {
        self.load_owned(principal, id).await?;
        let chunks = self.repo.get_chunks_for_document(id).await;
        Ok(paginate(chunks, page, page_size))
    }

    /// Appends a chunk at the end of the document (density is preserved
    /// automatically since the new index equals the prior count).
    pub async fn create_chunk(&self, principal: &Principal, id: i64, content: String, sync_vectors: bool) -> Result<Chunk, LifecycleError> {
        if content.trim().is_empty() {
            return Err(LifecycleError::Validation("chunk content must not be empty".to_string()));
        }

        let document = self.load_owned(principal, id).await?;
        let mut chunks = self.repo.get_chunks_for_document(id).await;

        let chunk_id = self.repo.allocate_chunk_id();
        let new_chunk = Chunk::new(chunk_id, id, chunks.len() as u32, content);
        chunks.push(new_chunk.clone());
        self.repo.replace_chunks(id, chunks).await?;

        if sync_vectors {
            self.sync_vectors(&document).await?;
        }

        Ok(new_chunk)
    }

    /// Updates a chunk's content and/or inclusion flag in place, leaving its
    /// `chunk_index` untouched (update never changes the chunk count, so
    /// density is unaffected).
    pub async fn update_chunk(
        &self,
        principal: &Principal,
        id: i64,
        chunk_index: u32,
        update: ChunkUpdate,
        sync_vectors: bool,
    ) -> Result<Chunk, LifecycleError> {
        if let Some(content) = &update.content {
            if content.trim().is_empty() {
                return Err(LifecycleError::Validation("chunk content must not be empty".to_string()));
            }
        }

        let document = self.load_owned(principal, id).await?;
        let mut chunks = self.repo.get_chunks_for_document(id).await;
        let position = chunks
            .iter()
            .position(|chunk| chunk.chunk_index == chunk_index)
            .ok_or_else(|| LifecycleError::NotFound(format!("chunk {chunk_index} on document {id}")))?;

        if let Some(content) = update.content {
            chunks[position].char_count = content.chars().count() as u32;
            chunks[position].content = content;
        }
        if let Some(included) = update.included {
            chunks[position].included = included;
        }
        let updated = chunks[position].clone();

        self.repo.replace_chunks(id, chunks).await?;

        if sync_vectors {
            self.sync_vectors(&document).await?;
        }

        Ok(updated)
    }

    /// Removes a chunk and renumbers the remainder to preserve density
    /// (invariant 1).
    pub async fn delete_chunk(&self, principal: &Principal, id: i64, chunk_index: u32, sync_vectors: bool) -> Result<(), LifecycleError> {
        let document = self.load_owned(principal, id).await?;
        let mut chunks = self.repo.get_chunks_for_document(id).await;
        let position = chunks
            .iter()
            .position(|chunk| chunk.chunk_index == chunk_index)
            .ok_or_else(|| LifecycleError::NotFound(format!("chunk {chunk_index} on document {id}")))?;

        chunks.remove(position);
        for (index, chunk) in chunks.iter_mut().enumerate() {
            chunk.chunk_index = index as u32;
        }
        self.repo.replace_chunks(id, chunks).await?;

        if sync_vectors {
            self.sync_vectors(&document).await?;
        }

        Ok(())
    }

    /// Rebuilds the owner's vector partition for this document from its
    /// current chunks — the same delete-then-reindex sequence C8's
    /// `rebuild_vectors` performs, reused here since a chunk edit can shift
    /// every index after it.
    async fn sync_vectors(&self, document: &Document) -> Result<(), LifecycleError> {
        if document.status != DocumentStatus::Indexed {
            return Ok(());
        }

        {
            let vector_index = self.repo.vector_index();
            let mut vector_index = vector_index.write().await;
            vector_index.delete_by_document(document.owner_id, document.id);
        }
        self.retrieval.index_document(document.id).await?;
        Ok(())
    }

    /// Requires `status ∈ {uploaded, confirmed}` and `conversion_status =
    /// ready`; on indexing success the document becomes `indexed`, on
    /// failure it is left `approved` for retry (spec §4.6 `approve`).
    pub async fn approve(&self, principal: &Principal, id: i64) -> Result<(), LifecycleError> {
        let mut document = self.load_owned(principal, id).await?;

        if !matches!(document.status, DocumentStatus::Uploaded | DocumentStatus::Confirmed)
            || document.conversion_status != ConversionStatus::Ready
        {
            return Err(LifecycleError::Precondition(
                "approve requires status in {uploaded, confirmed} and conversion_status=ready".to_string(),
            ));
        }

        document.status = DocumentStatus::Approved;
        document.reviewed_at = Some(now_unix());
        document.reviewer_id = Some(principal.tenant_id);
        self.repo.put_document(document).await?;

        let review_action_id = self.repo.allocate_review_action_id();
        self.repo
            .record_review_action(ReviewAction {
                id: review_action_id,
                document_id: id,
                reviewer_id: principal.tenant_id,
                action: ReviewActionKind::Approve,
                reason: None,
                created_at: now_unix(),
            })
            .await?;

        match self.retrieval.index_document(id).await {
            Ok(()) => {
                let mut indexed = self.repo.get_document(id).await?;
                indexed.status = DocumentStatus::Indexed;
                self.repo.put_document(indexed).await?;
                self.record(AuditOperation::Approve, AuditOutcome::Succeeded, principal.tenant_id);
                Ok(())
            }
            Err(err) => {
                self.record(AuditOperation::Approve, AuditOutcome::Failed, principal.tenant_id);
                Err(LifecycleError::Query(err))
            }
        }
    }

    pub async fn reject(&self, principal: &Principal, id: i64, reason: String) -> Result<(), LifecycleError> {
        let mut document = self.load_owned(principal, id).await?;

        if !matches!(document.status, DocumentStatus::Uploaded | DocumentStatus::Confirmed) {
            return Err(LifecycleError::Precondition(
                "reject requires status in {uploaded, confirmed}".to_string(),
            ));
        }

        document.status = DocumentStatus::Rejected;
        document.reject_reason = Some(reason.clone());
        document.reviewed_at = Some(now_unix());
        document.reviewer_id = Some(principal.tenant_id);
        self.repo.put_document(document).await?;

        let review_action_id = self.repo.allocate_review_action_id();
        self.repo
            .record_review_action(ReviewAction {
                id: review_action_id,
                document_id: id,
                reviewer_id: principal.tenant_id,
                action: ReviewActionKind::Reject,
                reason: Some(reason),
                created_at: now_unix(),
            })
            .await?;

        self.record(AuditOperation::Reject, AuditOutcome::Succeeded, principal.tenant_id);
        Ok(())
    }

    pub async fn resubmit(&self, principal: &Principal, id: i64) -> Result<(), LifecycleError> {
        let mut document = self.load_owned(principal, id).await?;

        if document.status != DocumentStatus::Rejected {
            return Err(LifecycleError::Precondition("resubmit requires status=rejected".to_string()));
        }

        document.status = DocumentStatus::Confirmed;
        document.reject_reason = None;
        self.repo.put_document(document).await?;

        self.record(AuditOperation::Resubmit, AuditOutcome::Succeeded, principal.tenant_id);
        Ok(())
    }

    /// Permitted from any state; cascades to chunks, vectors, and blobs.
    /// Downstream artifact failures are logged, not propagated — the
    /// reconciliation service is the backstop (spec §4.6 `delete`).
    pub async fn delete(&self, principal: &Principal, id: i64) -> Result<(), LifecycleError> {
        let document = self.load_owned(principal, id).await?;

        {
            let vector_index = self.repo.vector_index();
            let mut vector_index = vector_index.write().await;
            vector_index.delete_by_document(document.owner_id, id);
        }

        if let Err(err) = self.object_store.delete(&document.blob_key).await {
            warn!(document_id = id, error = %err, "failed to delete original blob");
        }
        if let Some(markdown_key) = &document.markdown_key {
            if let Err(err) = self.object_store.delete(markdown_key).await {
                warn!(document_id = id, error = %err, "failed to delete markdown blob");
            }
        }

        self.repo.delete_document(id).await?;

        self.record(AuditOperation::Delete, AuditOutcome::Succeeded, principal.tenant_id);
        Ok(())
    }

    async fn load_owned(&self, principal: &Principal, id: i64) -> Result<Document, LifecycleError> {
        let document = self
            .repo
            .get_document(id)
            .await
            .map_err(|_| LifecycleError::NotFound(format!("document {id}")))?;
        authorize_owner(principal, document.owner_id)?;
        Ok(document)
    }
}
