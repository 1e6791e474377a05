use crate::crypto::{AtRestCipher, NoOpCipher};
use crate::snapshot::{SnapshotError, SnapshotManager};
use crate::vector_index::VectorIndex;
use crate::wal::{Wal, WalError};
use kb_core::model::{Chunk, Document, ReviewAction, TenantSettings};
use rkyv::ser::{serializers::AllocSerializer, Serializer};
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

use kb_core::error::{ErrorCode, KbError};

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("serialization error")]
    Serialization,
    #[error("deserialization error")]
    Deserialization,
    #[error("not found")]
    NotFound,
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),
    #[error("snapshot manager is not configured")]
    SnapshotNotConfigured,
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

impl KbError for RepoError {
    fn error_code(&self) -> ErrorCode {
        match self {
            RepoError::NotFound => ErrorCode::NotFound,
            _ => ErrorCode::DbError,
        }
    }
}

/// WAL entry types for durability. Postgres is notionally canonical (spec
/// §3, invariant 6); this WAL+snapshot repository plays that role in this
/// deployment, with the vector index treated as a derived, rebuildable
/// cache in front of it.
#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
pub enum WalEntry {
    PutDocument(Document),
    DeleteDocument(i64),
    PutChunks { document_id: i64, chunks: Vec<Chunk> },
    DeleteChunksForDocument(i64),
    SetChunkIncluded { chunk_id: i64, included: bool },
    PutReviewAction(ReviewAction),
    PutTenantSettings(TenantSettings),
    Transaction(Vec<WalEntry>),
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
struct RepositoryBackupSnapshot {
    lsn: u64,
    next_document_id: i64,
    next_chunk_id: i64,
    next_review_action_id: i64,
    documents: Vec<Document>,
    chunks: Vec<Chunk>,
    review_actions: Vec<ReviewAction>,
    tenant_settings: Vec<TenantSettings>,
}

struct MaterializedState {
    documents: HashMap<i64, Document>,
    chunks: HashMap<i64, Chunk>,
    review_actions: HashMap<i64, Vec<ReviewAction>>,
    tenant_settings: HashMap<i64, TenantSettings>,
    next_document_id: i64,
    next_chunk_id: i64,
    next_review_action_id: i64,
}

impl MaterializedState {
    fn empty() -> Self {
        Self {
            documents: HashMap::new(),
            chunks: HashMap::new(),
            review_actions: HashMap::new(),
            tenant_settings: HashMap::new(),
            next_document_id: 1,
            next_chunk_id: 1,
            next_review_action_id: 1,
        }
    }
}

/// The durable metadata store backing C6 (document lifecycle) and C8
/// (reconciliation): documents, their chunks, the reviewer audit trail, and
/// per-tenant settings. The in-memory `VectorIndex` handed to callers via
/// [`MetadataRepository::vector_index`] is a derived cache, never the
/// durability boundary — it is rebuilt from chunk content on reconciliation,
/// never replayed from the WAL itself.
pub struct MetadataRepository {
    wal: Arc<Mutex<Wal>>,
    tx_lock: Arc<Mutex<()>>,
    documents: Arc<RwLock<HashMap<i64, Document>>>,
    chunks: Arc<RwLock<HashMap<i64, Chunk>>>,
    review_actions: Arc<RwLock<HashMap<i64, Vec<ReviewAction>>>>,
    tenant_settings: Arc<RwLock<HashMap<i64, TenantSettings>>>,
    next_document_id: AtomicI64,
    next_chunk_id: AtomicI64,
    next_review_action_id: AtomicI64,
    vector_index: Arc<RwLock<VectorIndex>>,
    snapshot_manager: Option<SnapshotManager>,
}

impl MetadataRepository {
    pub async fn open(wal_path: impl AsRef<Path>) -> Result<Self, RepoError> {
        Self::open_with_cipher(wal_path, Arc::new(NoOpCipher)).await
    }

    pub async fn open_with_cipher(
        wal_path: impl AsRef<Path>,
        cipher: Arc<dyn AtRestCipher>,
    ) -> Result<Self, RepoError> {
        Self::open_internal(wal_path.as_ref().to_path_buf(), cipher, None).await
    }

    pub async fn open_with_snapshots(
        wal_path: impl AsRef<Path>,
        snapshot_dir: impl AsRef<Path>,
    ) -> Result<Self, RepoError> {
        Self::open_with_cipher_and_snapshots(wal_path, Arc::new(NoOpCipher), snapshot_dir).await
    }

    pub async fn open_with_cipher_and_snapshots(
        wal_path: impl AsRef<Path>,
        cipher: Arc<dyn AtRestCipher>,
        snapshot_dir: impl AsRef<Path>,
    ) -> Result<Self, RepoError> {
        let snapshot_manager = SnapshotManager::new(snapshot_dir.as_ref());
        Self::open_internal(wal_path.as_ref().to_path_buf(), cipher, Some(snapshot_manager)).await
    }

    async fn open_internal(
        wal_path: PathBuf,
        cipher: Arc<dyn AtRestCipher>,
        snapshot_manager: Option<SnapshotManager>,
    ) -> Result<Self, RepoError> {
        let wal_instance = Wal::open_with_cipher(&wal_path, cipher).await?;
        let wal = Arc::new(Mutex::new(wal_instance));
        let tx_lock = Arc::new(Mutex::new(()));
        let (mut materialized, base_lsn) =
            load_materialized_state_from_backup(snapshot_manager.as_ref(), None).await?;

        {
            let mut wal_lock = wal.lock().await;
            let last_replayed_lsn = wal_lock
                .replay(|lsn, data| {
                    if lsn <= base_lsn {
                        return Ok(());
                    }
                    let archived = rkyv::check_archived_root::<WalEntry>(&data[..])
                        .map_err(|_| WalError::CorruptEntry)?;
                    let entry: WalEntry = archived.deserialize(&mut rkyv::Infallible).unwrap();
                    apply_replayed_entry(&entry, &mut materialized);
                    Ok(())
                })
                .await?;

            if base_lsn > last_replayed_lsn {
                return Err(RepoError::SnapshotNotFound(format!("wal-lsn-{base_lsn}")));
            }
        }

        // Embeddings are not stored in the WAL (spec §3, invariant 6: vectors
        // are a derived index). The index starts empty on every open and is
        // repopulated by the retrieval service as chunks are (re)indexed, or
        // by explicit reconciliation (C8).
        let vector_index = VectorIndex::new();

        Ok(Self {
            wal,
            tx_lock,
            documents: Arc::new(RwLock::new(materialized.documents)),
            chunks: Arc::new(RwLock::new(materialized.chunks)),
            review_actions: Arc::new(RwLock::new(materialized.review_actions)),
            tenant_settings: Arc::new(RwLock::new(materialized.tenant_settings)),
            next_document_id: AtomicI64::new(materialized.next_document_id),
            next_chunk_id: AtomicI64::new(materialized.next_chunk_id),
            next_review_action_id: AtomicI64::new(materialized.next_review_action_id),
            vector_index: Arc::new(RwLock::new(vector_index)),
            snapshot_manager,
        })
    }

    pub fn vector_index(&self) -> Arc<RwLock<VectorIndex>> {
        self.vector_index.clone()
    }

    pub fn allocate_document_id(&self) -> i64 {
        self.next_document_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn allocate_chunk_id(&self) -> i64 {
        self.next_chunk_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn allocate_review_action_id(&self) -> i64 {
        self.next_review_action_id.fetch_add(1, Ordering::SeqCst)
    }

    pub async fn put_document(&self, document: Document) -> Result<(), RepoError> {
        self.append_and_apply(WalEntry::PutDocument(document)).await
    }

    pub async fn get_document(&self, id: i64) -> Result<Document, RepoError> {
        self.documents.read().await.get(&id).cloned().ok_or(RepoError::NotFound)
    }

    /// Administrator-scope listing, unfiltered by owner (spec §4.6 `list`,
    /// used when an admin widens scope).
    pub async fn list_all_documents(&self) -> Vec<Document> {
        let mut out: Vec<Document> = self.documents.read().await.values().cloned().collect();
        out.sort_by_key(|doc| doc.id);
        out
    }

    pub async fn list_documents_for_tenant(&self, tenant_id: i64) -> Vec<Document> {
        let mut out: Vec<Document> = self
            .documents
            .read()
            .await
            .values()
            .filter(|doc| doc.owner_id == tenant_id)
            .cloned()
            .collect();
        out.sort_by_key(|doc| doc.id);
        out
    }

    /// Cascading delete: document, its chunks, and its review trail (spec
    /// §4.6: "delete is permitted from any state").
    pub async fn delete_document(&self, id: i64) -> Result<(), RepoError> {
        self.append_and_apply(WalEntry::Transaction(vec![
            WalEntry::DeleteChunksForDocument(id),
            WalEntry::DeleteDocument(id),
        ]))
        .await
    }

    /// Replaces all chunks for a document atomically — used both at initial
    /// indexing and at reindex/rebuild time (spec §4.5 step 8, §4.8).
    pub async fn replace_chunks(&self, document_id: i64, chunks: Vec<Chunk>) -> Result<(), RepoError> {
        self.append_and_apply(WalEntry::Transaction(vec![
            WalEntry::DeleteChunksForDocument(document_id),
            WalEntry::PutChunks { document_id, chunks },
        ]))
        .await
    }

    pub async fn get_chunks_for_document(&self, document_id: i64) -> Vec<Chunk> {
        let mut out: Vec<Chunk> = self
            .chunks
            .read()
            .await
            .values()
            .filter(|chunk| chunk.document_id == document_id)
            .cloned()
            .collect();
        out.sort_by_key(|chunk| chunk.chunk_index);
        out
    }

    pub async fn get_chunk(&self, chunk_id: i64) -> Result<Chunk, RepoError> {
        self.chunks.read().await.get(&chunk_id).cloned().ok_or(RepoError::NotFound)
    }

    pub async fn set_chunk_included(&self, chunk_id: i64, included: bool) -> Result<(), RepoError> {
        self.append_and_apply(WalEntry::SetChunkIncluded { chunk_id, included }).await
    }

    pub async fn record_review_action(&self, action: ReviewAction) -> Result<(), RepoError> {
        self.append_and_apply(WalEntry::PutReviewAction(action)).await
    }

    pub async fn get_review_actions_for_document(&self, document_id: i64) -> Vec<ReviewAction> {
        let mut out = self
            .review_actions
            .read()
            .await
            .get(&document_id)
            .cloned()
            .unwrap_or_default();
        out.sort_by_key(|action| action.id);
        out
    }

    pub async fn get_tenant_settings(&self, tenant_id: i64) -> TenantSettings {
        self.tenant_settings
            .read()
            .await
            .get(&tenant_id)
            .cloned()
            .unwrap_or(TenantSettings {
                tenant_id,
                ..TenantSettings::default()
            })
    }

    pub async fn put_tenant_settings(&self, settings: TenantSettings) -> Result<(), RepoError> {
        self.append_and_apply(WalEntry::PutTenantSettings(settings)).await
    }

    async fn append_and_apply(&self, entry: WalEntry) -> Result<(), RepoError> {
        let _tx_guard = self.tx_lock.lock().await;
        let bytes = serialize_wal_entry(&entry)?;

        {
            let mut wal = self.wal.lock().await;
            wal.append(&bytes).await?;
            wal.flush().await?;
        }

        let mut documents = self.documents.write().await;
        let mut chunks = self.chunks.write().await;
        let mut review_actions = self.review_actions.write().await;
        let mut tenant_settings = self.tenant_settings.write().await;

        apply_entry(
            &entry,
            &mut documents,
            &mut chunks,
            &mut review_actions,
            &mut tenant_settings,
        );

        Ok(())
    }

    pub async fn current_snapshot_id(&self) -> String {
        let wal = self.wal.lock().await;
        format!("wal-lsn-{}", wal.current_lsn())
    }

    pub async fn create_backup_snapshot(&self) -> Result<String, RepoError> {
        let snapshot_manager = self.snapshot_manager.as_ref().ok_or(RepoError::SnapshotNotConfigured)?;

        let snapshot = {
            let _tx_guard = self.tx_lock.lock().await;

            let lsn = {
                let wal = self.wal.lock().await;
                wal.current_lsn()
            };

            let mut documents: Vec<Document> = self.documents.read().await.values().cloned().collect();
            documents.sort_by_key(|doc| doc.id);

            let mut chunks: Vec<Chunk> = self.chunks.read().await.values().cloned().collect();
            chunks.sort_by_key(|chunk| chunk.id);

            let mut review_actions: Vec<ReviewAction> = self
                .review_actions
                .read()
                .await
                .values()
                .flat_map(|actions| actions.iter().cloned())
                .collect();
            review_actions.sort_by_key(|action| action.id);

            let mut tenant_settings: Vec<TenantSettings> =
                self.tenant_settings.read().await.values().cloned().collect();
            tenant_settings.sort_by_key(|settings| settings.tenant_id);

            RepositoryBackupSnapshot {
                lsn,
                next_document_id: self.next_document_id.load(Ordering::SeqCst),
                next_chunk_id: self.next_chunk_id.load(Ordering::SeqCst),
                next_review_action_id: self.next_review_action_id.load(Ordering::SeqCst),
                documents,
                chunks,
                review_actions,
                tenant_settings,
            }
        };

        let encoded = serialize_backup_snapshot(&snapshot)?;
        snapshot_manager.create_snapshot(snapshot.lsn, &encoded).await?;

        Ok(format!("wal-lsn-{}", snapshot.lsn))
    }

    pub async fn restore_from_latest_backup(&self) -> Result<String, RepoError> {
        if self.snapshot_manager.is_none() {
            return Err(RepoError::SnapshotNotConfigured);
        }

        let _tx_guard = self.tx_lock.lock().await;
        let target_lsn = {
            let wal = self.wal.lock().await;
            wal.current_lsn()
        };

        let (mut materialized, base_lsn) =
            load_materialized_state_from_backup(self.snapshot_manager.as_ref(), Some(target_lsn)).await?;

        {
            let mut wal = self.wal.lock().await;
            wal.replay(|lsn, data| {
                if lsn <= base_lsn || lsn > target_lsn {
                    return Ok(());
                }
                let archived = rkyv::check_archived_root::<WalEntry>(&data[..])
                    .map_err(|_| WalError::CorruptEntry)?;
                let entry: WalEntry = archived.deserialize(&mut rkyv::Infallible).unwrap();
                apply_replayed_entry(&entry, &mut materialized);
                Ok(())
            })
            .await?;
        }

        *self.documents.write().await = materialized.documents;
        *self.chunks.write().await = materialized.chunks;
        *self.review_actions.write().await = materialized.review_actions;
        *self.tenant_settings.write().await = materialized.tenant_settings;
        self.next_document_id.store(materialized.next_document_id, Ordering::SeqCst);
        self.next_chunk_id.store(materialized.next_chunk_id, Ordering::SeqCst);
        self.next_review_action_id
            .store(materialized.next_review_action_id, Ordering::SeqCst);

        Ok(format!("wal-lsn-{target_lsn}"))
    }
}

fn serialize_wal_entry(entry: &WalEntry) -> Result<Vec<u8>, RepoError> {
    let mut serializer = AllocSerializer::<4096>::default();
    serializer.serialize_value(entry).map_err(|_| RepoError::Serialization)?;
    Ok(serializer.into_serializer().into_inner().to_vec())
}

fn serialize_backup_snapshot(snapshot: &RepositoryBackupSnapshot) -> Result<Vec<u8>, RepoError> {
    let mut serializer = AllocSerializer::<4096>::default();
    serializer.serialize_value(snapshot).map_err(|_| RepoError::Serialization)?;
    Ok(serializer.into_serializer().into_inner().to_vec())
}

async fn deserialize_backup_snapshot(path: &Path) -> Result<RepositoryBackupSnapshot, RepoError> {
    let bytes = fs::read(path).await.map_err(|err| RepoError::Snapshot(SnapshotError::Io(err)))?;
    let archived = rkyv::check_archived_root::<RepositoryBackupSnapshot>(&bytes[..])
        .map_err(|_| RepoError::Deserialization)?;
    archived.deserialize(&mut rkyv::Infallible).map_err(|_| RepoError::Deserialization)
}

async fn load_materialized_state_from_backup(
    snapshot_manager: Option<&SnapshotManager>,
    target_lsn: Option<u64>,
) -> Result<(MaterializedState, u64), RepoError> {
    let Some(manager) = snapshot_manager else {
        return Ok((MaterializedState::empty(), 0));
    };

    let selected = match target_lsn {
        Some(lsn) => manager.latest_snapshot_at_or_before(lsn).await?,
        None => manager.latest_snapshot().await?,
    };

    let Some((snapshot_lsn, path)) = selected else {
        return Ok((MaterializedState::empty(), 0));
    };

    let snapshot = deserialize_backup_snapshot(&path).await?;
    if snapshot.lsn != snapshot_lsn {
        return Err(RepoError::Deserialization);
    }

    let documents = snapshot.documents.into_iter().map(|doc| (doc.id, doc)).collect();
    let chunks = snapshot.chunks.into_iter().map(|chunk| (chunk.id, chunk)).collect();

    let mut review_actions: HashMap<i64, Vec<ReviewAction>> = HashMap::new();
    for action in snapshot.review_actions {
        review_actions.entry(action.document_id).or_default().push(action);
    }

    let tenant_settings = snapshot
        .tenant_settings
        .into_iter()
        .map(|settings| (settings.tenant_id, settings))
        .collect();

    Ok((
        MaterializedState {
            documents,
            chunks,
            review_actions,
            tenant_settings,
            next_document_id: snapshot.next_document_id,
            next_chunk_id: snapshot.next_chunk_id,
            next_review_action_id: snapshot.next_review_action_id,
        },
        snapshot_lsn,
    ))
}

fn apply_replayed_entry(entry: &WalEntry, state: &mut MaterializedState) {
    apply_entry(
        entry,
        &mut state.documents,
        &mut state.chunks,
        &mut state.review_actions,
        &mut state.tenant_settings,
    );
    bump_counters(entry, state);
}

fn bump_counters(entry: &WalEntry, state: &mut MaterializedState) {
    match entry {
        WalEntry::PutDocument(doc) => state.next_document_id = state.next_document_id.max(doc.id + 1),
        WalEntry::PutChunks { chunks, .. } => {
            for chunk in chunks {
                state.next_chunk_id = state.next_chunk_id.max(chunk.id + 1);
            }
        }
        WalEntry::PutReviewAction(action) => {
            state.next_review_action_id = state.next_review_action_id.max(action.id + 1)
        }
        WalEntry::Transaction(entries) => {
            for inner in entries {
                bump_counters(inner, state);
            }
        }
        _ => {}
    }
}

fn apply_entry(
    entry: &WalEntry,
    documents: &mut HashMap<i64, Document>,
    chunks: &mut HashMap<i64, Chunk>,
    review_actions: &mut HashMap<i64, Vec<ReviewAction>>,
    tenant_settings: &mut HashMap<i64, TenantSettings>,
) {
    match entry {
        WalEntry::PutDocument(doc) => {
            documents.insert(doc.id, doc.clone());
        }
        WalEntry::DeleteDocument(id) => {
            documents.remove(id);
        }
        WalEntry::PutChunks { chunks: new_chunks, .. } => {
            for chunk in new_chunks {
                chunks.insert(chunk.id, chunk.clone());
            }
        }
        WalEntry::DeleteChunksForDocument(document_id) => {
            chunks.retain(|_, chunk| chunk.document_id != *document_id);
        }
        WalEntry::SetChunkIncluded { chunk_id, included } => {
            if let Some(chunk) = chunks.get_mut(chunk_id) {
                chunk.included = *included;
            }
        }
        WalEntry::PutReviewAction(action) => {
            review_actions.entry(action.document_id).or_default().push(action.clone());
        }
        WalEntry::PutTenantSettings(settings) => {
            tenant_settings.insert(settings.tenant_id, settings.clone());
        }
        WalEntry::Transaction(entries) => {
            for inner in entries {
                apply_entry(inner, documents, chunks, review_actions, tenant_settings);
            }
        }
    }
}
