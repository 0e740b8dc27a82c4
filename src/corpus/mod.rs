//! The corpus: every chunk of every known paper, keyed by chunk id.
//!
//! Appends go to the durable backend first and only then become visible in
//! memory, so a failed write leaves the in-memory view exactly as it was.
//! Readers take a short std lock and never wait on disk.

pub mod lance;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sources::SourceKind;

pub use lance::LanceCorpus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub paper_id: String,
    pub source: SourceKind,
    pub title: String,
    pub authors: Vec<String>,
    pub text: String,
    pub fetched_at: DateTime<Utc>,
    /// Assigned once by the index builder; `None` until first embedded.
    pub vector_id: Option<u64>,
    pub ordinal: u32,
    /// Normalized external ids (`doi:...`, `arxiv:...`).
    #[serde(default)]
    pub identifiers: Vec<String>,
    #[serde(default)]
    pub abstract_simhash: Option<u64>,
}

impl ChunkRecord {
    pub fn chunk_id_for(paper_id: &str, ordinal: u32) -> String {
        format!("{}#{}", paper_id, ordinal)
    }
}

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("corpus write failed, nothing was committed: {0}")]
    WriteFailed(String),
    #[error("failed to open corpus: {0}")]
    Open(String),
    #[error("unknown chunk: {0}")]
    UnknownChunk(String),
    #[error("chunk {chunk_id} already has vector id {existing}, cannot assign {requested}")]
    VectorIdConflict {
        chunk_id: String,
        existing: u64,
        requested: u64,
    },
}

impl CorpusError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CorpusError::WriteFailed(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AppendOutcome {
    pub accepted: usize,
    /// Records whose chunk id was already present (or repeated in the batch).
    pub duplicates: usize,
    /// Papers that gained at least one chunk, in batch order.
    pub new_papers: Vec<String>,
}

/// Durable storage behind a [`CorpusStore`]. Rows carry their insertion
/// sequence number so reloads restore the original order.
#[async_trait]
pub trait CorpusBackend: Send + Sync {
    async fn append(&self, first_seq: u64, records: &[ChunkRecord]) -> anyhow::Result<()>;
    /// All rows as `(seq, record)`, sorted by `seq`.
    async fn load(&self) -> anyhow::Result<Vec<(u64, ChunkRecord)>>;
    async fn delete_paper(&self, paper_id: &str) -> anyhow::Result<()>;
}

#[derive(Default)]
struct State {
    records: HashMap<String, Arc<ChunkRecord>>,
    order: Vec<String>,
    chunks_per_paper: HashMap<String, usize>,
    next_seq: u64,
}

impl State {
    fn insert(&mut self, record: ChunkRecord) {
        *self.chunks_per_paper.entry(record.paper_id.clone()).or_insert(0) += 1;
        self.order.push(record.chunk_id.clone());
        self.records.insert(record.chunk_id.clone(), Arc::new(record));
    }
}

/// Point-in-time view of the corpus in insertion order. Iterating it again
/// yields the same records, whatever was appended since.
#[derive(Debug, Clone, Default)]
pub struct CorpusSnapshot {
    records: Vec<Arc<ChunkRecord>>,
}

impl CorpusSnapshot {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ChunkRecord>> {
        self.records.iter()
    }
}

pub struct CorpusStore {
    state: RwLock<State>,
    /// Serializes appends and prunes; holds the durable backend, if any.
    writer: tokio::sync::Mutex<Option<Box<dyn CorpusBackend>>>,
}

impl CorpusStore {
    /// Open (or create) the LanceDB-backed corpus at `path` and load it.
    pub async fn open(path: &Path) -> Result<Self, CorpusError> {
        let backend = LanceCorpus::open(path)
            .await
            .map_err(|e| CorpusError::Open(format!("{:#}", e)))?;
        Self::with_backend(Box::new(backend)).await
    }

    pub async fn with_backend(backend: Box<dyn CorpusBackend>) -> Result<Self, CorpusError> {
        let records = backend
            .load()
            .await
            .map_err(|e| CorpusError::Open(format!("{:#}", e)))?;
        let mut state = State::default();
        for (seq, mut record) in records {
            state.next_seq = state.next_seq.max(seq + 1);
            if state.records.contains_key(&record.chunk_id) {
                tracing::warn!("Skipping duplicate chunk {} in stored corpus", record.chunk_id);
                continue;
            }
            record.vector_id = None;
            state.insert(record);
        }
        tracing::info!(
            "Loaded corpus: {} chunks from {} papers",
            state.records.len(),
            state.chunks_per_paper.len()
        );
        Ok(Self {
            state: RwLock::new(state),
            writer: tokio::sync::Mutex::new(Some(backend)),
        })
    }

    /// A corpus that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(State::default()),
            writer: tokio::sync::Mutex::new(None),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Append new records. Chunk ids already present are counted as
    /// duplicates, not errors. Incoming `vector_id`s are ignored.
    pub async fn append(&self, records: Vec<ChunkRecord>) -> Result<AppendOutcome, CorpusError> {
        let backend = self.writer.lock().await;

        let (fresh, duplicates, first_seq) = {
            let state = self.read();
            let mut in_batch = HashSet::new();
            let mut fresh = Vec::with_capacity(records.len());
            let mut duplicates = 0;
            for mut record in records {
                if state.records.contains_key(&record.chunk_id)
                    || !in_batch.insert(record.chunk_id.clone())
                {
                    duplicates += 1;
                    continue;
                }
                record.vector_id = None;
                fresh.push(record);
            }
            (fresh, duplicates, state.next_seq)
        };

        if fresh.is_empty() {
            return Ok(AppendOutcome { duplicates, ..Default::default() });
        }

        if let Some(backend) = backend.as_ref() {
            backend
                .append(first_seq, &fresh)
                .await
                .map_err(|e| CorpusError::WriteFailed(format!("{:#}", e)))?;
        }

        let accepted = fresh.len();
        let mut new_papers: Vec<String> = Vec::new();
        let mut state = self.write();
        state.next_seq = first_seq + accepted as u64;
        for record in fresh {
            if !new_papers.contains(&record.paper_id) {
                new_papers.push(record.paper_id.clone());
            }
            state.insert(record);
        }
        tracing::debug!("Appended {} chunks ({} duplicates)", accepted, duplicates);
        Ok(AppendOutcome { accepted, duplicates, new_papers })
    }

    pub fn get(&self, chunk_id: &str) -> Option<Arc<ChunkRecord>> {
        self.read().records.get(chunk_id).cloned()
    }

    pub fn exists(&self, paper_id: &str) -> bool {
        self.read().chunks_per_paper.contains_key(paper_id)
    }

    pub fn snapshot(&self) -> CorpusSnapshot {
        let state = self.read();
        CorpusSnapshot {
            records: state
                .order
                .iter()
                .filter_map(|id| state.records.get(id).cloned())
                .collect(),
        }
    }

    /// Chunks of one paper, in insertion order.
    pub fn paper_chunks(&self, paper_id: &str) -> Vec<Arc<ChunkRecord>> {
        let state = self.read();
        state
            .order
            .iter()
            .filter_map(|id| state.records.get(id))
            .filter(|r| r.paper_id == paper_id)
            .cloned()
            .collect()
    }

    /// Record the vector id the index builder gave a chunk. Assigning the same
    /// id again is a no-op; a different one is refused.
    pub fn assign_vector_id(&self, chunk_id: &str, vector_id: u64) -> Result<(), CorpusError> {
        let mut state = self.write();
        let record = state
            .records
            .get_mut(chunk_id)
            .ok_or_else(|| CorpusError::UnknownChunk(chunk_id.to_string()))?;
        let current = record.vector_id;
        match current {
            Some(existing) if existing == vector_id => Ok(()),
            Some(existing) => Err(CorpusError::VectorIdConflict {
                chunk_id: chunk_id.to_string(),
                existing,
                requested: vector_id,
            }),
            None => {
                Arc::make_mut(record).vector_id = Some(vector_id);
                Ok(())
            }
        }
    }

    /// Remove every chunk of a paper. Returns how many chunks went.
    pub async fn prune_paper(&self, paper_id: &str) -> Result<usize, CorpusError> {
        let backend = self.writer.lock().await;
        if !self.exists(paper_id) {
            return Ok(0);
        }
        if let Some(backend) = backend.as_ref() {
            backend
                .delete_paper(paper_id)
                .await
                .map_err(|e| CorpusError::WriteFailed(format!("{:#}", e)))?;
        }

        let mut state = self.write();
        let State { records, order, chunks_per_paper, .. } = &mut *state;
        order.retain(|id| records.get(id).map_or(true, |r| r.paper_id != paper_id));
        records.retain(|_, r| r.paper_id != paper_id);
        let removed = chunks_per_paper.remove(paper_id).unwrap_or(0);
        tracing::info!("Pruned paper {} ({} chunks)", paper_id, removed);
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn paper_count(&self) -> usize {
        self.read().chunks_per_paper.len()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn record(paper_id: &str, ordinal: u32, text: &str) -> ChunkRecord {
        ChunkRecord {
            chunk_id: ChunkRecord::chunk_id_for(paper_id, ordinal),
            paper_id: paper_id.to_string(),
            source: SourceKind::Local,
            title: format!("Paper {}", paper_id),
            authors: vec!["Test Author".to_string()],
            text: text.to_string(),
            fetched_at: Utc::now(),
            vector_id: None,
            ordinal,
            identifiers: Vec::new(),
            abstract_simhash: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::record;
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakyBackend {
        fail: Arc<AtomicBool>,
    }

    #[async_trait]
    impl CorpusBackend for FlakyBackend {
        async fn append(&self, _first_seq: u64, _records: &[ChunkRecord]) -> anyhow::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("disk full");
            }
            Ok(())
        }

        async fn load(&self) -> anyhow::Result<Vec<(u64, ChunkRecord)>> {
            Ok(Vec::new())
        }

        async fn delete_paper(&self, _paper_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_append_is_idempotent() {
        let store = CorpusStore::in_memory();
        let first = store
            .append(vec![record("p1", 0, "alpha"), record("p1", 1, "beta")])
            .await
            .unwrap();
        assert_eq!(
            first,
            AppendOutcome { accepted: 2, duplicates: 0, new_papers: vec!["p1".to_string()] }
        );

        let again = store
            .append(vec![record("p1", 0, "alpha"), record("p2", 0, "gamma"), record("p2", 0, "gamma")])
            .await
            .unwrap();
        assert_eq!(
            again,
            AppendOutcome { accepted: 1, duplicates: 2, new_papers: vec!["p2".to_string()] }
        );

        let repeat = store.append(vec![record("p2", 0, "gamma")]).await.unwrap();
        assert!(repeat.new_papers.is_empty());
        assert_eq!(store.len(), 3);
        assert_eq!(store.paper_count(), 2);
        assert!(store.exists("p2"));
        assert!(!store.exists("p3"));
    }

    #[tokio::test]
    async fn test_snapshot_is_point_in_time() {
        let store = CorpusStore::in_memory();
        store.append(vec![record("p1", 0, "a")]).await.unwrap();
        let snap = store.snapshot();
        store.append(vec![record("p2", 0, "b")]).await.unwrap();

        let ids: Vec<&str> = snap.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["p1#0"]);
        let ids_again: Vec<&str> = snap.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, ids_again);
        assert_eq!(store.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_vector_id_set_once() {
        let store = CorpusStore::in_memory();
        let mut incoming = record("p1", 0, "a");
        incoming.vector_id = Some(99);
        store.append(vec![incoming]).await.unwrap();
        assert_eq!(store.get("p1#0").unwrap().vector_id, None);

        store.assign_vector_id("p1#0", 7).unwrap();
        store.assign_vector_id("p1#0", 7).unwrap();
        assert!(matches!(
            store.assign_vector_id("p1#0", 8),
            Err(CorpusError::VectorIdConflict { existing: 7, requested: 8, .. })
        ));
        assert!(matches!(
            store.assign_vector_id("nope#0", 1),
            Err(CorpusError::UnknownChunk(_))
        ));
        assert_eq!(store.get("p1#0").unwrap().vector_id, Some(7));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_view_unchanged() {
        let fail = Arc::new(AtomicBool::new(false));
        let store = CorpusStore::with_backend(Box::new(FlakyBackend { fail: fail.clone() }))
            .await
            .unwrap();
        store.append(vec![record("p1", 0, "a")]).await.unwrap();

        fail.store(true, Ordering::SeqCst);
        let err = store.append(vec![record("p2", 0, "b")]).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.len(), 1);
        assert!(!store.exists("p2"));

        fail.store(false, Ordering::SeqCst);
        let retried = store.append(vec![record("p2", 0, "b")]).await.unwrap();
        assert_eq!(retried.accepted, 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_prune_paper() {
        let store = CorpusStore::in_memory();
        store
            .append(vec![record("p1", 0, "a"), record("p2", 0, "b"), record("p1", 1, "c")])
            .await
            .unwrap();
        assert_eq!(store.prune_paper("p1").await.unwrap(), 2);
        assert_eq!(store.prune_paper("p1").await.unwrap(), 0);
        let ids: Vec<String> = store.snapshot().iter().map(|r| r.chunk_id.clone()).collect();
        assert_eq!(ids, vec!["p2#0"]);
        assert!(store.get("p1#1").is_none());
    }

    #[tokio::test]
    async fn test_concurrent_appends() {
        let store = Arc::new(CorpusStore::in_memory());
        let mut handles = Vec::new();
        for worker in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                // Every worker also appends the shared chunk.
                store
                    .append(vec![record(&format!("p{}", worker), 0, "x"), record("shared", 0, "s")])
                    .await
                    .unwrap()
            }));
        }
        let mut accepted = 0;
        for h in handles {
            accepted += h.await.unwrap().accepted;
        }
        assert_eq!(accepted, 9);
        assert_eq!(store.len(), 9);
    }
}
