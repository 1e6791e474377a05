use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use kb_core::model::{Chunk, ConversionStatus, DocumentStatus};
use kb_ingestion::{chunk_splitter_for_strategy, detect_content_kind, ContentKind};
use kb_providers::ProviderRegistry;
use kb_storage::{MetadataRepository, ObjectStoreGateway};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::queue::{Job, JobQueue};

pub struct ConversionWorkerConfig {
    pub pool_size: usize,
    pub max_retries: u32,
    pub job_timeout: Duration,
    pub min_text_chars: usize,
    pub chunk_strategy: String,
    pub chunk_size: usize,
    pub overlap_percent: u32,
    pub delimiters: Vec<String>,
}

/// C5: the bounded pool of workers that drain the conversion queue (spec
/// §4.5, §5). Each job loads the document, dispatches by content type,
/// converts to Markdown, and splits it into chunks — it never embeds;
/// embedding and vector upsert belong to the retrieval service's indexing
/// path (C7), triggered by approval, not by conversion. A `DashSet`
/// idempotency gate (grounded on the same pattern the originating
/// ingestion pipeline used for dedup locks) keeps two workers from ever
/// processing the same document concurrently — the state machine already
/// forbids it via `conversion_status`, this is defense in depth.
pub struct ConversionWorkerPool {
    repo: Arc<MetadataRepository>,
    object_store: Arc<dyn ObjectStoreGateway>,
    providers: Arc<ProviderRegistry>,
    queue: Arc<dyn JobQueue>,
    config: ConversionWorkerConfig,
    in_flight: Arc<DashSet<i64>>,
}

impl ConversionWorkerPool {
    pub fn new(
        repo: Arc<MetadataRepository>,
        object_store: Arc<dyn ObjectStoreGateway>,
        providers: Arc<ProviderRegistry>,
        queue: Arc<dyn JobQueue>,
        config: ConversionWorkerConfig,
    ) -> Self {
        Self {
            repo,
            object_store,
            providers,
            queue,
            config,
            in_flight: Arc::new(DashSet::new()),
        }
    }

    /// Spawns `pool_size` tasks sharing one receiver, and returns immediately;
    /// callers hold the returned join handles only if they want to await
    /// shutdown.
    pub fn spawn(self: Arc<Self>, receiver: mpsc::Receiver<Job>) -> Vec<tokio::task::JoinHandle<()>> {
        let receiver = Arc::new(Mutex::new(receiver));
        let mut handles = Vec::new();
        for worker_id in 0..self.config.pool_size.max(1) {
            let pool = self.clone();
            let receiver = receiver.clone();
            handles.push(tokio::spawn(async move {
                pool.run(worker_id, receiver).await;
            }));
        }
        handles
    }

    async fn run(self: Arc<Self>, worker_id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) {
        info!(worker_id, "conversion worker started");
        loop {
            let job = {
                let mut receiver = receiver.lock().await;
                receiver.recv().await
            };
            let Some(job) = job else {
                break;
            };

            let Job::ConvertDocument { document_id, attempt } = job;
            if !self.in_flight.insert(document_id) {
                warn!(document_id, "document already being converted, dropping duplicate job");
                continue;
            }

            let result = tokio::time::timeout(self.config.job_timeout, self.process(document_id)).await;
            self.in_flight.remove(&document_id);

            match result {
                Ok(Ok(())) => info!(document_id, "conversion succeeded"),
                Ok(Err(err)) => self.handle_failure(document_id, attempt, err).await,
                Err(_) => {
                    self.handle_failure(document_id, attempt, ConversionError::Timeout).await;
                }
            }
        }
        info!(worker_id, "conversion worker stopped");
    }

    /// Transient failures (storage I/O) are retried with exponential
    /// backoff up to `max_retries`; converter failures after fallback+OCR,
    /// and timeouts, are terminal (spec §4.5 retry policy).
    async fn handle_failure(&self, document_id: i64, attempt: u32, err: ConversionError) {
        error!(document_id, attempt, error = %err, "conversion job failed");

        if err.is_transient() && attempt < self.config.max_retries {
            let backoff = Duration::from_millis(200 * 2u64.pow(attempt.min(10)));
            info!(document_id, attempt, backoff_ms = backoff.as_millis() as u64, "retrying conversion job");
            tokio::time::sleep(backoff).await;
            if let Err(enqueue_err) = self
                .queue
                .enqueue(Job::ConvertDocument {
                    document_id,
                    attempt: attempt + 1,
                })
                .await
            {
                error!(document_id, error = %enqueue_err, "failed to re-enqueue conversion job");
            } else {
                return;
            }
        }

        if let Ok(mut document) = self.repo.get_document(document_id).await {
            document.conversion_status = ConversionStatus::Failed;
            document.conversion_error = Some(err.to_string());
            let _ = self.repo.put_document(document).await;
        }
    }

    /// The 8-step algorithm of spec §4.5.
    async fn process(&self, document_id: i64) -> Result<(), ConversionError> {
        let mut document = self.repo.get_document(document_id).await.map_err(|_| ConversionError::DocumentMissing)?;

        if !matches!(
            document.status,
            DocumentStatus::Uploaded | DocumentStatus::Confirmed | DocumentStatus::Approved
        ) || !matches!(document.conversion_status, ConversionStatus::Pending | ConversionStatus::Failed)
        {
            return Err(ConversionError::PreconditionNotMet);
        }

        document.conversion_status = ConversionStatus::Processing;
        self.repo.put_document(document.clone()).await.map_err(|_| ConversionError::Storage)?;

        let bytes = self
            .object_store
            .get(&document.blob_key)
            .await
            .map_err(|err| ConversionError::Storage0(err.to_string()))?;

        let markdown = self.convert_to_markdown(&document, &bytes).await?;

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
            chunks.push(Chunk::new(chunk_id, document_id, index as u32, content));
        }

        self.repo
            .replace_chunks(document_id, chunks)
            .await
            .map_err(|_| ConversionError::Storage)?;

        let markdown_key = format!("tenant_{}/markdown/{}.md", document.owner_id, document.id);
        self.object_store
            .put(&markdown_key, markdown.as_bytes())
            .await
            .map_err(|err| ConversionError::Storage0(err.to_string()))?;

        document.conversion_status = ConversionStatus::Ready;
        document.markdown_key = Some(markdown_key);
        document.conversion_error = None;
        document.preview_text = markdown.chars().take(280).collect();
        self.repo.put_document(document).await.map_err(|_| ConversionError::Storage)?;

        Ok(())
    }

    async fn convert_to_markdown(&self, document: &kb_core::model::Document, bytes: &[u8]) -> Result<String, ConversionError> {
        let kind = detect_content_kind(&document.content_type, Some(&document.filename));
        let markdown = match kind {
            ContentKind::Text | ContentKind::Markdown => {
                kb_ingestion::extract::extract_utf8(bytes).map_err(|err| ConversionError::Extraction(err.to_string()))?
            }
            ContentKind::Json => {
                let text = kb_ingestion::extract::extract_utf8(bytes).map_err(|err| ConversionError::Extraction(err.to_string()))?;
                format!("```json\n{text}\n```")
            }
            ContentKind::Csv => kb_ingestion::extract::extract_csv_to_markdown(bytes).map_err(|err| ConversionError::Extraction(err.to_string()))?,
            ContentKind::Xlsx => kb_ingestion::extract::extract_xlsx_to_markdown(bytes).map_err(|err| ConversionError::Extraction(err.to_string()))?,
            ContentKind::Docx => kb_ingestion::extract::extract_docx_to_markdown(bytes).map_err(|err| ConversionError::Extraction(err.to_string()))?,
            ContentKind::Pdf => self.providers.convert_pdf(bytes).map_err(|err| ConversionError::Extraction(err.to_string()))?,
            ContentKind::Unsupported => return Err(ConversionError::UnsupportedContent),
        };

        if kind == ContentKind::Pdf && markdown.trim().chars().count() < self.config.min_text_chars && self.providers.ocr().is_enabled() {
            warn!(document_id = document.id, "pdf text below threshold, falling back to ocr");
            let ocr_text = self
                .providers
                .ocr()
                .extract(bytes)
                .map_err(|err| ConversionError::Extraction(err.to_string()))?;
            if !ocr_text.trim().is_empty() {
                return Ok(ocr_text);
            }
        }

        Ok(markdown)
    }
}

#[derive(Debug, thiserror::Error)]
enum ConversionError {
    #[error("document not found")]
    DocumentMissing,
    #[error("document is not in a convertible state")]
    PreconditionNotMet,
    #[error("storage error")]
    Storage,
    #[error("storage error: {0}")]
    Storage0(String),
    #[error("extraction failed: {0}")]
    Extraction(String),
    #[error("unsupported content type")]
    UnsupportedContent,
    #[error("conversion job timed out")]
    Timeout,
}

impl ConversionError {
    /// Network/storage failures are transient and retried; a converter
    /// giving up after fallback+OCR, an unsupported content type, or a
    /// timeout are not (spec §4.5 retry policy).
    fn is_transient(&self) -> bool {
        matches!(self, ConversionError::Storage | ConversionError::Storage0(_))
    }
}
