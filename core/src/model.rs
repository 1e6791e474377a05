use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};

/// A tenant's role. Administrators may widen scope beyond their own tenant;
/// users are always restricted to `owner_id == tenant_id`.
#[derive(
    Archive, Deserialize, Serialize, SerdeSerialize, SerdeDeserialize, Debug, Clone, Copy, PartialEq, Eq,
)]
#[archive(check_bytes)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
}

/// The authenticated caller, handed in by the (out-of-scope) auth layer.
/// This crate never parses tokens — it only ever sees the already-resolved
/// `(tenant_id, role)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub tenant_id: i64,
    pub role: Role,
}

impl Principal {
    pub fn new(tenant_id: i64, role: Role) -> Self {
        Self { tenant_id, role }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self.role, Role::Admin)
    }
}

#[derive(
    Archive, Deserialize, Serialize, SerdeSerialize, SerdeDeserialize, Debug, Clone, Copy, PartialEq, Eq,
)]
#[archive(check_bytes)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Uploaded,
    Confirmed,
    Approved,
    Indexed,
    Rejected,
}

#[derive(
    Archive, Deserialize, Serialize, SerdeSerialize, SerdeDeserialize, Debug, Clone, Copy, PartialEq, Eq,
)]
#[archive(check_bytes)]
#[serde(rename_all = "snake_case")]
pub enum ConversionStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

/// The unit of upload. See spec §3 for the full attribute list.
#[derive(Archive, Deserialize, Serialize, SerdeSerialize, SerdeDeserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct Document {
    pub id: i64,
    pub owner_id: i64,
    pub filename: String,
    pub content_type: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub status: DocumentStatus,
    pub conversion_status: ConversionStatus,
    pub blob_key: String,
    pub markdown_key: Option<String>,
    pub conversion_error: Option<String>,
    pub reject_reason: Option<String>,
    pub created_at: i64,
    pub confirmed_at: Option<i64>,
    pub reviewed_at: Option<i64>,
    pub indexed_at: Option<i64>,
    pub reviewer_id: Option<i64>,
    pub preview_text: String,
}

/// The unit of retrieval. `chunk_index` is 0-based and dense within a
/// document: invariant 1 of spec §3.
#[derive(Archive, Deserialize, Serialize, SerdeSerialize, SerdeDeserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct Chunk {
    pub id: i64,
    pub document_id: i64,
    pub chunk_index: u32,
    pub content: String,
    pub char_count: u32,
    pub included: bool,
}

impl Chunk {
    pub fn new(id: i64, document_id: i64, chunk_index: u32, content: String) -> Self {
        let char_count = content.chars().count() as u32;
        Self {
            id,
            document_id,
            chunk_index,
            content,
            char_count,
            included: true,
        }
    }
}

#[derive(
    Archive, Deserialize, Serialize, SerdeSerialize, SerdeDeserialize, Debug, Clone, Copy, PartialEq, Eq,
)]
#[archive(check_bytes)]
#[serde(rename_all = "snake_case")]
pub enum ReviewActionKind {
    Approve,
    Reject,
}

/// Append-only audit trail of reviewer decisions (spec §3).
#[derive(Archive, Deserialize, Serialize, SerdeSerialize, SerdeDeserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct ReviewAction {
    pub id: i64,
    pub document_id: i64,
    pub reviewer_id: i64,
    pub action: ReviewActionKind,
    pub reason: Option<String>,
    pub created_at: i64,
}

/// Per-tenant defaults for the retrieval path (spec §3).
#[derive(Archive, Deserialize, Serialize, SerdeSerialize, SerdeDeserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct TenantSettings {
    pub tenant_id: i64,
    pub llm_provider: String,
    pub llm_model: String,
    pub embedding_provider: String,
    pub embedding_model: String,
    pub top_k: u32,
    pub temperature: f32,
    pub rerank_enabled: bool,
    pub rerank_provider: Option<String>,
    pub rerank_model: Option<String>,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            tenant_id: 0,
            llm_provider: "local-runtime".to_string(),
            llm_model: "default".to_string(),
            embedding_provider: "hash".to_string(),
            embedding_model: "hash-default".to_string(),
            top_k: 10,
            temperature: 0.2,
            rerank_enabled: false,
            rerank_provider: None,
            rerank_model: None,
        }
    }
}

/// SHA-256 content hash used for dedup/idempotency and the upload→delete→
/// upload round-trip property (spec §8).
pub fn content_sha256(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Monotonic-ish wall clock in unix seconds. Durable records store plain
/// integers rather than `chrono`/`SystemTime` types so the WAL/snapshot
/// format stays independent of any particular time library.
pub fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
