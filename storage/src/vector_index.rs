use std::collections::HashMap;

use thiserror::Error;

use kb_core::error::{ErrorCode, KbError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VectorIndexError {
    #[error("collection already has dimension {existing}, cannot reconfigure to {requested}")]
    DimensionMismatch { existing: usize, requested: usize },
    #[error("collection is not initialized; call ensure_collection first")]
    CollectionNotInitialized,
}

impl KbError for VectorIndexError {
    fn error_code(&self) -> ErrorCode {
        ErrorCode::VectorError
    }
}

/// A single `(document_id, chunk_index, score)` hit from [`VectorIndex::search`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VectorHit {
    pub document_id: i64,
    pub chunk_index: u32,
    pub score: f32,
}

/// Derives the deterministic primary key a vector upsert/delete is keyed by
/// (spec §6: `pk = document_id * 10^6 + chunk_index`), so re-indexing the
/// same `(document_id, chunk_index)` is an idempotent replace rather than a
/// duplicate insert.
pub fn vector_pk(document_id: i64, chunk_index: u32) -> i64 {
    document_id * 1_000_000 + chunk_index as i64
}

/// C3: a single collection, schema `(pk, embedding[dimension], document_id,
/// chunk_index)`, with one lazily-created partition per tenant (spec §4.3).
/// Brute-force cosine search stands in for the abstract vector-store
/// product this spec treats as pluggable; it satisfies the same contract
/// (`ensure_collection`/`ensure_partition`/`upsert`/`delete_by_document`/
/// `search`) at the scale this deployment implies.
pub struct VectorIndex {
    dimension: Option<usize>,
    partitions: HashMap<i64, HashMap<i64, VectorEntry>>,
}

struct VectorEntry {
    document_id: i64,
    chunk_index: u32,
    embedding: Vec<f32>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self {
            dimension: None,
            partitions: HashMap::new(),
        }
    }

    /// Idempotent. Fails loudly on a dimension mismatch against an already
    /// configured collection rather than silently dropping vectors (spec
    /// §4.3).
    pub fn ensure_collection(&mut self, dimension: usize) -> Result<(), VectorIndexError> {
        match self.dimension {
            Some(existing) if existing != dimension => Err(VectorIndexError::DimensionMismatch {
                existing,
                requested: dimension,
            }),
            _ => {
                self.dimension = Some(dimension);
                Ok(())
            }
        }
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Idempotent partition creation (spec §4.3). A no-op if the partition
    /// already exists.
    pub fn ensure_partition(&mut self, owner_id: i64) {
        self.partitions.entry(owner_id).or_default();
    }

    /// Delete-by-key then insert (spec §4.3: "the vector store need not
    /// support in-place update"). Keying by [`vector_pk`] makes repeated
    /// upserts of the same `(document_id, chunk_index)` idempotent.
    pub fn upsert(
        &mut self,
        owner_id: i64,
        entries: Vec<(i64, u32, Vec<f32>)>,
    ) -> Result<(), VectorIndexError> {
        let Some(dimension) = self.dimension else {
            return Err(VectorIndexError::CollectionNotInitialized);
        };

        let partition = self.partitions.entry(owner_id).or_default();
        for (document_id, chunk_index, embedding) in entries {
            if embedding.len() != dimension {
                return Err(VectorIndexError::DimensionMismatch {
                    existing: dimension,
                    requested: embedding.len(),
                });
            }
            let pk = vector_pk(document_id, chunk_index);
            partition.insert(
                pk,
                VectorEntry {
                    document_id,
                    chunk_index,
                    embedding,
                },
            );
        }
        Ok(())
    }

    pub fn delete_one(&mut self, owner_id: i64, document_id: i64, chunk_index: u32) {
        if let Some(partition) = self.partitions.get_mut(&owner_id) {
            partition.remove(&vector_pk(document_id, chunk_index));
        }
    }

    /// Drops every vector belonging to a document in one pass (spec §4.3),
    /// used by document deletion and by reconciliation (C8).
    pub fn delete_by_document(&mut self, owner_id: i64, document_id: i64) {
        if let Some(partition) = self.partitions.get_mut(&owner_id) {
            partition.retain(|_, entry| entry.document_id != document_id);
        }
    }

    pub fn partition_len(&self, owner_id: i64) -> usize {
        self.partitions.get(&owner_id).map_or(0, HashMap::len)
    }

    /// The `chunk_index` set a document currently has vectors for, within
    /// one tenant partition — used to check invariant 4 after a rebuild.
    pub fn chunk_indexes_for_document(&self, owner_id: i64, document_id: i64) -> Vec<u32> {
        let Some(partition) = self.partitions.get(&owner_id) else {
            return Vec::new();
        };
        let mut indexes: Vec<u32> = partition
            .values()
            .filter(|entry| entry.document_id == document_id)
            .map(|entry| entry.chunk_index)
            .collect();
        indexes.sort_unstable();
        indexes
    }

    /// Top-k nearest neighbors. `owner_ids` with exactly one element
    /// searches only that partition; any other length (0 or 2+) means an
    /// administrator cross-partition search over the union (spec §4.3).
    /// Scores are cosine similarity normalized to `[0, 1]`; ties break on
    /// smaller `(document_id, chunk_index)` first so ordering stays
    /// reproducible (spec §4.7).
    pub fn search(&self, owner_ids: &[i64], query: &[f32], k: usize) -> Vec<VectorHit> {
        let scoped: Vec<&i64> = if owner_ids.len() == 1 {
            owner_ids.iter().collect()
        } else if owner_ids.is_empty() {
            self.partitions.keys().collect()
        } else {
            owner_ids.iter().collect()
        };

        let mut hits: Vec<VectorHit> = scoped
            .into_iter()
            .filter_map(|owner_id| self.partitions.get(owner_id))
            .flat_map(|partition| partition.values())
            .filter_map(|entry| {
                cosine_similarity(query, &entry.embedding).map(|cosine| VectorHit {
                    document_id: entry.document_id,
                    chunk_index: entry.chunk_index,
                    score: normalize(cosine),
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.document_id.cmp(&b.document_id))
                .then_with(|| a.chunk_index.cmp(&b.chunk_index))
        });
        hits.truncate(k);
        hits
    }
}

impl Default for VectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(cosine: f32) -> f32 {
    (cosine + 1.0) / 2.0
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return Some(0.0);
    }

    Some(dot / (norm_a * norm_b))
}
