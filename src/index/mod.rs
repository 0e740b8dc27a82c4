//! Index generations: immutable snapshots of the vector and lexical indexes,
//! published by atomic pointer swap.
//!
//! Readers pin a generation by cloning its `Arc` and keep querying it while
//! newer generations are published; a retired generation is freed when the
//! last pin drops.

pub mod flat;
pub mod lexical;
pub mod persist;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use crate::corpus::ChunkRecord;

pub use flat::FlatIndex;
pub use lexical::LexicalIndex;
pub use persist::{GenerationStore, LoadedGeneration, Manifest};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("vector has dimension {actual}, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("vector id {0} is already in the index")]
    DuplicateVectorId(u64),
    #[error("could not allocate room for {vectors} vectors")]
    Allocation { vectors: usize },
    #[error("vector/chunk mapping is not one-to-one: {0}")]
    MappingMismatch(String),
    #[error("generation {attempted} is not newer than current generation {current}")]
    StaleGeneration { current: u64, attempted: u64 },
    #[error("persisted index is corrupt: {0}")]
    CorruptPersistedIndex(String),
    #[error("lexical index error: {0}")]
    Lexical(String),
    #[error("index storage error: {0}")]
    Storage(String),
}

/// A published generation held by a reader.
pub type PinnedGeneration = Arc<IndexGeneration>;

#[derive(Debug, Clone, Serialize)]
pub struct GenerationInfo {
    pub generation_id: u64,
    pub vector_count: usize,
    pub dimension: usize,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct IndexGeneration {
    id: u64,
    created_at: DateTime<Utc>,
    model_id: String,
    vectors: FlatIndex,
    chunk_ids: HashMap<u64, String>,
    vector_ids: HashMap<String, u64>,
    lexical: LexicalIndex,
    /// Corpus records of the indexed chunks as they were at build time.
    records: HashMap<String, Arc<ChunkRecord>>,
}

impl IndexGeneration {
    /// Check that `chunk_ids` maps every vector in `vectors` to a distinct chunk
    /// and nothing else, then seal the parts into a generation.
    pub fn assemble(
        id: u64,
        model_id: impl Into<String>,
        vectors: FlatIndex,
        chunk_ids: HashMap<u64, String>,
        lexical: LexicalIndex,
    ) -> Result<Self, IndexError> {
        if chunk_ids.len() != vectors.len() {
            return Err(IndexError::MappingMismatch(format!(
                "{} vectors but {} mapped chunks",
                vectors.len(),
                chunk_ids.len()
            )));
        }
        let mut vector_ids = HashMap::with_capacity(chunk_ids.len());
        for &vector_id in vectors.ids() {
            let chunk_id = chunk_ids.get(&vector_id).ok_or_else(|| {
                IndexError::MappingMismatch(format!("vector {} has no chunk", vector_id))
            })?;
            if vector_ids.insert(chunk_id.clone(), vector_id).is_some() {
                return Err(IndexError::MappingMismatch(format!(
                    "chunk {} is mapped by more than one vector",
                    chunk_id
                )));
            }
        }
        Ok(Self {
            id,
            created_at: Utc::now(),
            model_id: model_id.into(),
            vectors,
            chunk_ids,
            vector_ids,
            lexical,
            records: HashMap::new(),
        })
    }

    /// Keep the records of indexed chunks so lookups through this generation
    /// survive later pruning of the corpus. Records of unindexed chunks are
    /// dropped.
    pub fn with_records(mut self, records: impl IntoIterator<Item = Arc<ChunkRecord>>) -> Self {
        self.records = records
            .into_iter()
            .filter(|r| self.vector_ids.contains_key(&r.chunk_id))
            .map(|r| (r.chunk_id.clone(), r))
            .collect();
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn dimension(&self) -> usize {
        self.vectors.dimension()
    }

    pub fn vector_count(&self) -> usize {
        self.vectors.len()
    }

    pub fn vectors(&self) -> &FlatIndex {
        &self.vectors
    }

    /// A mutable copy of the vector index for building the next generation.
    pub fn staging_copy(&self) -> FlatIndex {
        self.vectors.clone()
    }

    pub fn chunk_id(&self, vector_id: u64) -> Option<&str> {
        self.chunk_ids.get(&vector_id).map(String::as_str)
    }

    pub fn vector_id(&self, chunk_id: &str) -> Option<u64> {
        self.vector_ids.get(chunk_id).copied()
    }

    pub fn record(&self, chunk_id: &str) -> Option<&Arc<ChunkRecord>> {
        self.records.get(chunk_id)
    }

    pub fn chunk_ids(&self) -> impl Iterator<Item = (u64, &str)> {
        self.chunk_ids.iter().map(|(id, chunk)| (*id, chunk.as_str()))
    }

    /// Nearest chunks as `(vector_id, chunk_id, score)`.
    pub fn query(&self, vector: &[f32], k: usize) -> Result<Vec<(u64, &str, f32)>, IndexError> {
        Ok(self
            .vectors
            .query(vector, k)?
            .into_iter()
            .filter_map(|(id, score)| self.chunk_id(id).map(|chunk| (id, chunk, score)))
            .collect())
    }

    /// Chunks sharing the most terms with `text`, as `(vector_id, chunk_id, bm25)`.
    pub fn lexical_search(&self, text: &str, limit: usize) -> Result<Vec<(u64, &str, f32)>, IndexError> {
        Ok(self
            .lexical
            .search(text, limit)
            .map_err(|e| IndexError::Lexical(format!("{:#}", e)))?
            .into_iter()
            .filter_map(|(id, score)| self.chunk_id(id).map(|chunk| (id, chunk, score)))
            .collect())
    }

    pub fn info(&self) -> GenerationInfo {
        GenerationInfo {
            generation_id: self.id,
            vector_count: self.vectors.len(),
            dimension: self.vectors.dimension(),
            model_id: self.model_id.clone(),
            created_at: self.created_at,
        }
    }
}

impl Drop for IndexGeneration {
    fn drop(&mut self) {
        tracing::debug!("Generation {} released ({} vectors)", self.id, self.vectors.len());
    }
}

/// Holder of the current generation.
pub struct GenerationRegistry {
    current: ArcSwapOption<IndexGeneration>,
    publish_lock: Mutex<()>,
    published: watch::Sender<u64>,
}

impl Default for GenerationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationRegistry {
    pub fn new() -> Self {
        let (published, _) = watch::channel(0);
        Self {
            current: ArcSwapOption::empty(),
            publish_lock: Mutex::new(()),
            published,
        }
    }

    /// Pin the current generation. Never blocks.
    pub fn current(&self) -> Option<PinnedGeneration> {
        self.current.load_full()
    }

    pub fn current_id(&self) -> Option<u64> {
        self.current.load_full().map(|g| g.id)
    }

    /// Make `generation` current. Ids must increase; readers holding the
    /// previous generation keep it until they drop their pin.
    pub fn publish(&self, generation: IndexGeneration) -> Result<PinnedGeneration, IndexError> {
        let _guard = self.publish_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = self.current.load_full() {
            if generation.id <= current.id {
                return Err(IndexError::StaleGeneration {
                    current: current.id,
                    attempted: generation.id,
                });
            }
        }
        let generation = Arc::new(generation);
        self.current.store(Some(Arc::clone(&generation)));
        self.published.send_replace(generation.id);
        tracing::info!(
            "Published generation {} ({} vectors, model {})",
            generation.id,
            generation.vector_count(),
            generation.model_id
        );
        Ok(generation)
    }

    /// Receives the id of each newly published generation (0 before the first).
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.published.subscribe()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Generation over `(vector_id, chunk_id, vector)` rows with a lexical
    /// index over the chunk ids themselves.
    pub fn generation(id: u64, dimension: usize, rows: &[(u64, &str, Vec<f32>)]) -> IndexGeneration {
        let vectors =
            FlatIndex::build(dimension, rows.iter().map(|(v, _, vec)| (*v, vec.clone())).collect())
                .unwrap();
        let chunk_ids = rows.iter().map(|(v, c, _)| (*v, c.to_string())).collect();
        let lexical = LexicalIndex::build(rows.iter().map(|(v, c, _)| (*v, *c))).unwrap();
        IndexGeneration::assemble(id, "test-model", vectors, chunk_ids, lexical).unwrap()
    }

    /// Like [`generation`], carrying `records` for the chunks it indexes.
    pub fn generation_with(
        id: u64,
        dimension: usize,
        rows: &[(u64, &str, Vec<f32>)],
        records: Vec<ChunkRecord>,
    ) -> IndexGeneration {
        generation(id, dimension, rows).with_records(records.into_iter().map(Arc::new))
    }
}
