//! Turns corpus snapshots into published index generations.
//!
//! One build runs at a time. Rebuild requests that arrive while a build is
//! in flight collapse into a single follow-up build. A build that fails for
//! any reason leaves the previous generation current.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;

use crate::corpus::{ChunkRecord, CorpusError, CorpusSnapshot, CorpusStore};
use crate::embed::{encode_normalized, EmbedError, EmbeddingProvider};
use crate::index::{
    FlatIndex, GenerationRegistry, GenerationStore, IndexError, IndexGeneration, LexicalIndex,
    LoadedGeneration,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Above this many new chunks, rebuild from scratch instead of adding to
    /// a staging copy.
    pub incremental_threshold: usize,
    pub max_vectors: usize,
    pub embed_concurrency: usize,
    /// Generation directories kept on disk, including the current one.
    pub retain_generations: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            incremental_threshold: 512,
            max_vectors: 1_000_000,
            embed_concurrency: 8,
            retain_generations: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStrategy {
    Full,
    Incremental,
    /// Nothing was added or removed; no generation was published.
    Unchanged,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    /// The published generation, or the still-current one when unchanged.
    pub generation_id: Option<u64>,
    pub strategy: BuildStrategy,
    pub vector_count: usize,
    pub added: usize,
    pub removed: usize,
    /// Chunks encoded during this build (cache misses that succeeded).
    pub embedded: usize,
    /// Chunks whose embedding failed; left out of this generation and retried
    /// on the next build.
    pub failed_chunks: Vec<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("embedding dimension {actual} does not match provider dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("corpus has {requested} embeddable chunks, index capacity is {max}")]
    CapacityExceeded { requested: usize, max: usize },
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    #[error("failed to persist generation, previous generation stays current: {0}")]
    Persist(String),
    #[error("cannot restore index: {0}")]
    Restore(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    /// Generation reloaded from disk as-is, if any.
    pub restored_generation: Option<u64>,
    /// Why the persisted generation was not used.
    pub fallback_reason: Option<String>,
    /// The build run after restoring (catching up with the corpus).
    pub build: BuildReport,
}

/// Mutable builder state, only touched under the build lock.
struct BuildState {
    /// Normalized embeddings keyed by chunk id.
    cache: HashMap<String, Arc<Vec<f32>>>,
    next_vector_id: u64,
    next_generation_id: u64,
}

struct Inner {
    corpus: Arc<CorpusStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    registry: Arc<GenerationRegistry>,
    store: Option<GenerationStore>,
    config: BuildConfig,
    state: tokio::sync::Mutex<BuildState>,
    pending: AtomicBool,
    worker_running: AtomicBool,
    idle: Notify,
    builds_completed: AtomicU64,
    last_report: Mutex<Option<BuildReport>>,
}

#[derive(Clone)]
pub struct IndexBuilder {
    inner: Arc<Inner>,
}

impl IndexBuilder {
    pub fn new(
        corpus: Arc<CorpusStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        registry: Arc<GenerationRegistry>,
        store: Option<GenerationStore>,
        config: BuildConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                corpus,
                embedder,
                registry,
                store,
                config,
                state: tokio::sync::Mutex::new(BuildState {
                    cache: HashMap::new(),
                    next_vector_id: 0,
                    next_generation_id: 1,
                }),
                pending: AtomicBool::new(false),
                worker_running: AtomicBool::new(false),
                idle: Notify::new(),
                builds_completed: AtomicU64::new(0),
                last_report: Mutex::new(None),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<GenerationRegistry> {
        &self.inner.registry
    }

    pub fn builds_completed(&self) -> u64 {
        self.inner.builds_completed.load(Ordering::SeqCst)
    }

    pub fn is_building(&self) -> bool {
        self.inner.worker_running.load(Ordering::SeqCst)
    }

    pub fn last_report(&self) -> Option<BuildReport> {
        self.inner
            .last_report
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Schedule a build in the background. Requests made while one is
    /// pending or running are folded into a single follow-up build.
    pub fn request_rebuild(&self) {
        self.inner.pending.store(true, Ordering::SeqCst);
        if self
            .inner
            .worker_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Rebuild already scheduled, coalescing request");
            return;
        }
        let builder = self.clone();
        tokio::spawn(async move { builder.drain_requests().await });
    }

    async fn drain_requests(&self) {
        loop {
            while self.inner.pending.swap(false, Ordering::SeqCst) {
                match self.rebuild_now().await {
                    Ok(report) => tracing::info!(
                        "Background build finished: {:?}, {} vectors, {} failed chunks",
                        report.strategy,
                        report.vector_count,
                        report.failed_chunks.len()
                    ),
                    Err(e) => tracing::error!("Background build failed: {}", e),
                }
            }
            self.inner.worker_running.store(false, Ordering::SeqCst);
            // A request may have landed between the last swap and the store above.
            if !self.inner.pending.load(Ordering::SeqCst)
                || self
                    .inner
                    .worker_running
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
            {
                break;
            }
        }
        self.inner.idle.notify_waiters();
    }

    /// Resolves once no background build is scheduled or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if !self.is_building() {
                return;
            }
            notified.await;
        }
    }

    /// Build from the current corpus and publish, waiting for any build in
    /// flight to finish first.
    pub async fn rebuild_now(&self) -> Result<BuildReport, BuildError> {
        let mut state = self.inner.state.lock().await;
        let started = Instant::now();
        let snapshot = self.inner.corpus.snapshot();
        let result = self.build_locked(&mut state, &snapshot, started).await;
        match &result {
            Ok(report) => {
                self.inner.builds_completed.fetch_add(1, Ordering::SeqCst);
                *self.inner.last_report.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(report.clone());
            }
            Err(e) => tracing::error!("Index build failed: {}", e),
        }
        result
    }

    async fn build_locked(
        &self,
        state: &mut BuildState,
        snapshot: &CorpusSnapshot,
        started: Instant,
    ) -> Result<BuildReport, BuildError> {
        let embedder = &self.inner.embedder;
        let dimension = embedder.dimension();
        let model_id = embedder.model_id().to_string();

        let live: HashSet<&str> = snapshot.iter().map(|r| r.chunk_id.as_str()).collect();
        state.cache.retain(|chunk_id, _| live.contains(chunk_id.as_str()));

        let missing: Vec<Arc<ChunkRecord>> = snapshot
            .iter()
            .filter(|r| !state.cache.contains_key(&r.chunk_id))
            .cloned()
            .collect();
        let (embedded, failed_chunks) = self.embed_missing(state, missing).await?;

        let included: Vec<&Arc<ChunkRecord>> = snapshot
            .iter()
            .filter(|r| state.cache.contains_key(&r.chunk_id))
            .collect();
        if included.len() > self.inner.config.max_vectors {
            return Err(BuildError::CapacityExceeded {
                requested: included.len(),
                max: self.inner.config.max_vectors,
            });
        }

        // Vector ids follow corpus insertion order and stick to their chunk.
        let mut rows: Vec<(u64, &ChunkRecord)> = Vec::with_capacity(included.len());
        for &record in &included {
            let vector_id = match record.vector_id {
                Some(id) => id,
                None => {
                    let id = state.next_vector_id;
                    self.inner.corpus.assign_vector_id(&record.chunk_id, id)?;
                    id
                }
            };
            state.next_vector_id = state.next_vector_id.max(vector_id + 1);
            rows.push((vector_id, &**record));
        }
        let mapping: HashMap<u64, String> =
            rows.iter().map(|(id, r)| (*id, r.chunk_id.clone())).collect();

        let current = self.inner.registry.current();
        let (added, removed) = match &current {
            Some(generation) => (
                rows.iter().filter(|(id, _)| generation.chunk_id(*id).is_none()).count(),
                generation
                    .chunk_ids()
                    .filter(|(id, chunk)| mapping.get(id).map(String::as_str) != Some(*chunk))
                    .count(),
            ),
            None => (rows.len(), 0),
        };

        let strategy = match &current {
            None => BuildStrategy::Full,
            Some(generation)
                if generation.model_id() != model_id || generation.dimension() != dimension =>
            {
                BuildStrategy::Full
            }
            Some(_) if removed > 0 => BuildStrategy::Full,
            Some(_) if added == 0 => BuildStrategy::Unchanged,
            Some(_) if added > self.inner.config.incremental_threshold => BuildStrategy::Full,
            Some(_) => BuildStrategy::Incremental,
        };

        if strategy == BuildStrategy::Unchanged {
            let generation_id = current.as_ref().map(|g| g.id());
            tracing::debug!("Corpus unchanged since generation {:?}", generation_id);
            return Ok(BuildReport {
                generation_id,
                strategy,
                vector_count: rows.len(),
                added,
                removed,
                embedded,
                failed_chunks,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }

        let cached = |record: &ChunkRecord| -> Vec<f32> {
            state
                .cache
                .get(&record.chunk_id)
                .map(|v| v.as_ref().clone())
                .unwrap_or_default()
        };
        let vectors = match (strategy, &current) {
            (BuildStrategy::Incremental, Some(generation)) => {
                let mut staging = generation.staging_copy();
                staging.reserve(added)?;
                for (vector_id, record) in &rows {
                    if !staging.contains(*vector_id) {
                        staging.add(&cached(record), *vector_id)?;
                    }
                }
                staging
            }
            _ => FlatIndex::build(
                dimension,
                rows.iter().map(|(id, record)| (*id, cached(record))).collect(),
            )?,
        };

        let lexical = LexicalIndex::build(rows.iter().map(|(id, record)| (*id, record.text.as_str())))
            .map_err(|e| IndexError::Lexical(format!("{:#}", e)))?;

        let vector_count = rows.len();
        let generation_id = state.next_generation_id;
        let generation = IndexGeneration::assemble(generation_id, model_id, vectors, mapping, lexical)?
            .with_records(included.iter().map(|&record| Arc::clone(record)));
        self.publish(state, generation).await?;

        Ok(BuildReport {
            generation_id: Some(generation_id),
            strategy,
            vector_count,
            added,
            removed,
            embedded,
            failed_chunks,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Encode chunks missing from the cache. Returns how many succeeded and
    /// the chunk ids that failed. A wrong-sized vector is fatal.
    async fn embed_missing(
        &self,
        state: &mut BuildState,
        missing: Vec<Arc<ChunkRecord>>,
    ) -> Result<(usize, Vec<String>), BuildError> {
        if missing.is_empty() {
            return Ok((0, Vec::new()));
        }
        let embedder = Arc::clone(&self.inner.embedder);
        let results: Vec<(String, Result<Vec<f32>, EmbedError>)> = stream::iter(missing)
            .map(|record| {
                let embedder = Arc::clone(&embedder);
                async move {
                    let result = encode_normalized(embedder.as_ref(), &record.text).await;
                    (record.chunk_id.clone(), result)
                }
            })
            .buffer_unordered(self.inner.config.embed_concurrency.max(1))
            .collect()
            .await;

        let mut embedded = 0;
        let mut failed = Vec::new();
        for (chunk_id, result) in results {
            match result {
                Ok(vector) => {
                    state.cache.insert(chunk_id, Arc::new(vector));
                    embedded += 1;
                }
                Err(EmbedError::DimensionMismatch { expected, actual }) => {
                    return Err(BuildError::DimensionMismatch { expected, actual });
                }
                Err(e) => {
                    tracing::warn!("Embedding failed for chunk {}: {}", chunk_id, e);
                    failed.push(chunk_id);
                }
            }
        }
        failed.sort();
        Ok((embedded, failed))
    }

    /// Persist (when a store is configured), then swap the generation in.
    async fn publish(&self, state: &mut BuildState, generation: IndexGeneration) -> Result<(), BuildError> {
        if let Some(store) = &self.inner.store {
            store
                .persist(&generation)
                .await
                .map_err(|e| BuildError::Persist(e.to_string()))?;
        }
        let id = generation.id();
        self.inner.registry.publish(generation)?;
        state.next_generation_id = id + 1;

        if let Some(store) = &self.inner.store {
            if let Err(e) = store.prune(self.inner.config.retain_generations, id) {
                tracing::warn!("Failed to prune old generations: {}", e);
            }
        }
        Ok(())
    }

    /// Bring the index back after a restart: reload the persisted generation
    /// when it is intact and matches the embedder, then build whatever the
    /// corpus gained since. Falls back to a full rebuild otherwise.
    pub async fn restore(&self) -> Result<RestoreReport, BuildError> {
        let Some(store) = &self.inner.store else {
            let build = self.rebuild_now().await?;
            return Ok(RestoreReport {
                restored_generation: None,
                fallback_reason: None,
                build,
            });
        };

        let mut restored_generation = None;
        let mut fallback_reason = None;
        match store.load_current().await {
            Ok(Some(loaded)) => match self.adopt(loaded).await {
                Ok(id) => restored_generation = Some(id),
                Err(reason) => {
                    tracing::warn!("Not reusing persisted generation: {}", reason);
                    fallback_reason = Some(reason);
                }
            },
            Ok(None) => {}
            Err(IndexError::CorruptPersistedIndex(reason)) => {
                tracing::warn!("Persisted index is corrupt, rebuilding from corpus: {}", reason);
                if self.inner.corpus.is_empty() {
                    return Err(BuildError::Restore(format!(
                        "persisted index is corrupt and the corpus is empty: {}",
                        reason
                    )));
                }
                let mut state = self.inner.state.lock().await;
                if let Ok(Some(id)) = store.current_id() {
                    state.next_generation_id = state.next_generation_id.max(id + 1);
                }
                fallback_reason = Some(reason);
            }
            Err(e) => return Err(e.into()),
        }

        let build = self.rebuild_now().await?;
        Ok(RestoreReport {
            restored_generation,
            fallback_reason,
            build,
        })
    }

    /// Seed the cache and vector ids from a loaded generation and publish it
    /// unchanged. Errors are reasons to fall back to a fresh build.
    async fn adopt(&self, loaded: LoadedGeneration) -> Result<u64, String> {
        let mut state = self.inner.state.lock().await;
        let manifest = &loaded.manifest;
        state.next_generation_id = state.next_generation_id.max(manifest.generation_id + 1);

        let embedder = &self.inner.embedder;
        if manifest.model_id != embedder.model_id() || manifest.dimension != embedder.dimension() {
            return Err(format!(
                "generation {} was built with {} ({} dims), embedder is {} ({} dims)",
                manifest.generation_id,
                manifest.model_id,
                manifest.dimension,
                embedder.model_id(),
                embedder.dimension()
            ));
        }

        let mut all_present = true;
        for (vector_id, vector) in loaded.vectors.iter() {
            state.next_vector_id = state.next_vector_id.max(vector_id + 1);
            let Some(chunk_id) = loaded.chunk_ids.get(&vector_id) else { continue };
            if self.inner.corpus.get(chunk_id).is_none() {
                all_present = false;
                continue;
            }
            if let Err(e) = self.inner.corpus.assign_vector_id(chunk_id, vector_id) {
                return Err(e.to_string());
            }
            state.cache.insert(chunk_id.clone(), Arc::new(vector.to_vec()));
        }
        if !all_present {
            return Err(format!(
                "generation {} references chunks no longer in the corpus",
                manifest.generation_id
            ));
        }

        let texts: Vec<(u64, Arc<ChunkRecord>)> = loaded
            .chunk_ids
            .iter()
            .filter_map(|(id, chunk_id)| self.inner.corpus.get(chunk_id).map(|r| (*id, r)))
            .collect();
        let lexical = LexicalIndex::build(texts.iter().map(|(id, r)| (*id, r.text.as_str())))
            .map_err(|e| format!("{:#}", e))?;

        let id = manifest.generation_id;
        let created_at = manifest.created_at;
        let generation = IndexGeneration::assemble(
            id,
            manifest.model_id.clone(),
            loaded.vectors,
            loaded.chunk_ids,
            lexical,
        )
        .map_err(|e| e.to_string())?
        .with_created_at(created_at)
        .with_records(texts.into_iter().map(|(_, record)| record));
        self.inner.registry.publish(generation).map_err(|e| e.to_string())?;
        tracing::info!("Restored generation {} from disk", id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::testing::record;
    use crate::embed::testing::TableEmbedder;
    use tempfile::TempDir;

    const DIM: usize = 16;

    fn builder_with(
        corpus: Arc<CorpusStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Option<GenerationStore>,
        config: BuildConfig,
    ) -> IndexBuilder {
        IndexBuilder::new(corpus, embedder, Arc::new(GenerationRegistry::new()), store, config)
    }

    fn texts(n: usize, prefix: &str) -> Vec<ChunkRecord> {
        (0..n)
            .map(|i| record(&format!("{}{}", prefix, i), 0, &format!("{} chunk number {}", prefix, i)))
            .collect()
    }

    #[tokio::test]
    async fn test_strategies() {
        let corpus = Arc::new(CorpusStore::in_memory());
        corpus.append(texts(3, "a")).await.unwrap();
        let builder = builder_with(
            corpus.clone(),
            Arc::new(TableEmbedder::new(DIM)),
            None,
            BuildConfig { incremental_threshold: 2, ..Default::default() },
        );

        let first = builder.rebuild_now().await.unwrap();
        assert_eq!(first.strategy, BuildStrategy::Full);
        assert_eq!(first.generation_id, Some(1));
        assert_eq!(first.vector_count, 3);

        let same = builder.rebuild_now().await.unwrap();
        assert_eq!(same.strategy, BuildStrategy::Unchanged);
        assert_eq!(same.generation_id, Some(1));
        assert_eq!(builder.registry().current_id(), Some(1));

        corpus.append(texts(2, "b")).await.unwrap();
        let grown = builder.rebuild_now().await.unwrap();
        assert_eq!(grown.strategy, BuildStrategy::Incremental);
        assert_eq!(grown.added, 2);
        assert_eq!(grown.embedded, 2);
        assert_eq!(builder.registry().current().unwrap().vector_count(), 5);

        corpus.append(texts(3, "c")).await.unwrap();
        let big = builder.rebuild_now().await.unwrap();
        assert_eq!(big.strategy, BuildStrategy::Full);

        corpus.prune_paper("a0").await.unwrap();
        let pruned = builder.rebuild_now().await.unwrap();
        assert_eq!(pruned.strategy, BuildStrategy::Full);
        assert_eq!(pruned.removed, 1);
        let current = builder.registry().current().unwrap();
        assert_eq!(current.id(), 4);
        assert_eq!(current.vector_count(), 7);
        assert!(current.vector_id("a0#0").is_none());
        assert!(current.record("a0#0").is_none());
        assert_eq!(
            current.record("c2#0").map(|r| r.text.as_str()),
            Some("c chunk number 2")
        );
    }

    #[tokio::test]
    async fn test_vector_ids_follow_insertion_order_and_stick() {
        let corpus = Arc::new(CorpusStore::in_memory());
        corpus.append(texts(3, "p")).await.unwrap();
        let builder = builder_with(corpus.clone(), Arc::new(TableEmbedder::new(DIM)), None, BuildConfig::default());
        builder.rebuild_now().await.unwrap();
        let ids: Vec<Option<u64>> = corpus.snapshot().iter().map(|r| r.vector_id).collect();
        assert_eq!(ids, vec![Some(0), Some(1), Some(2)]);

        corpus.prune_paper("p1").await.unwrap();
        corpus.append(texts(1, "q")).await.unwrap();
        builder.rebuild_now().await.unwrap();
        let current = builder.registry().current().unwrap();
        assert_eq!(current.vector_id("p2#0"), Some(2));
        assert_eq!(current.vector_id("q0#0"), Some(3), "pruned ids are not reused");
    }

    #[tokio::test]
    async fn test_identical_snapshots_give_identical_generations() {
        let mut neighbor_sets = Vec::new();
        for _ in 0..2 {
            let corpus = Arc::new(CorpusStore::in_memory());
            corpus.append(texts(6, "x")).await.unwrap();
            let builder = builder_with(corpus, Arc::new(TableEmbedder::new(DIM)), None, BuildConfig::default());
            builder.rebuild_now().await.unwrap();
            let generation = builder.registry().current().unwrap();
            let mut mapping: Vec<(u64, String)> =
                generation.chunk_ids().map(|(id, c)| (id, c.to_string())).collect();
            mapping.sort();
            let query = generation.vectors().iter().next().unwrap().1.to_vec();
            let neighbors: Vec<(u64, String)> = generation
                .query(&query, 4)
                .unwrap()
                .into_iter()
                .map(|(id, chunk, _)| (id, chunk.to_string()))
                .collect();
            neighbor_sets.push((mapping, neighbors));
        }
        assert_eq!(neighbor_sets[0], neighbor_sets[1]);
    }

    #[tokio::test]
    async fn test_failed_embeddings_are_retried_next_cycle() {
        let corpus = Arc::new(CorpusStore::in_memory());
        corpus.append(texts(3, "f")).await.unwrap();
        let embedder = Arc::new(TableEmbedder::new(DIM));
        embedder.fail_on("f chunk number 1");
        let builder = builder_with(corpus.clone(), embedder.clone(), None, BuildConfig::default());

        let first = builder.rebuild_now().await.unwrap();
        assert_eq!(first.failed_chunks, vec!["f1#0".to_string()]);
        assert_eq!(first.vector_count, 2);
        assert_eq!(embedder.calls(), 3);

        embedder.heal("f chunk number 1");
        let second = builder.rebuild_now().await.unwrap();
        assert_eq!(second.strategy, BuildStrategy::Incremental);
        assert!(second.failed_chunks.is_empty());
        assert_eq!(embedder.calls(), 4, "cached chunks are not re-encoded");
        assert_eq!(builder.registry().current().unwrap().vector_count(), 3);
    }

    #[tokio::test]
    async fn test_wrong_dimension_is_fatal() {
        struct Liar;
        #[async_trait::async_trait]
        impl EmbeddingProvider for Liar {
            fn model_id(&self) -> &str { "liar" }
            fn dimension(&self) -> usize { 8 }
            async fn encode(&self, _text: &str) -> Result<Vec<f32>, EmbedError> {
                Ok(vec![1.0; 4])
            }
        }
        let corpus = Arc::new(CorpusStore::in_memory());
        corpus.append(texts(1, "d")).await.unwrap();
        let builder = builder_with(corpus, Arc::new(Liar), None, BuildConfig::default());
        assert!(matches!(
            builder.rebuild_now().await,
            Err(BuildError::DimensionMismatch { expected: 8, actual: 4 })
        ));
        assert!(builder.registry().current().is_none());
    }

    #[tokio::test]
    async fn test_failed_build_keeps_previous_generation() {
        let corpus = Arc::new(CorpusStore::in_memory());
        corpus.append(texts(1, "k")).await.unwrap();
        let builder = builder_with(
            corpus.clone(),
            Arc::new(TableEmbedder::new(DIM)),
            None,
            BuildConfig { max_vectors: 1, ..Default::default() },
        );
        builder.rebuild_now().await.unwrap();
        corpus.append(texts(1, "l")).await.unwrap();
        assert!(matches!(
            builder.rebuild_now().await,
            Err(BuildError::CapacityExceeded { requested: 2, max: 1 })
        ));
        assert_eq!(builder.registry().current_id(), Some(1));
        assert_eq!(builder.builds_completed(), 1);
    }

    #[tokio::test]
    async fn test_persist_failure_means_no_publish() {
        let blocker = tempfile::NamedTempFile::new().unwrap();
        let corpus = Arc::new(CorpusStore::in_memory());
        corpus.append(texts(1, "z")).await.unwrap();
        let builder = builder_with(
            corpus,
            Arc::new(TableEmbedder::new(DIM)),
            Some(GenerationStore::new(blocker.path())),
            BuildConfig::default(),
        );
        assert!(matches!(builder.rebuild_now().await, Err(BuildError::Persist(_))));
        assert!(builder.registry().current().is_none());
    }

    #[tokio::test]
    async fn test_requests_coalesce() {
        let corpus = Arc::new(CorpusStore::in_memory());
        corpus.append(texts(4, "r")).await.unwrap();
        let builder = builder_with(corpus, Arc::new(TableEmbedder::new(DIM)), None, BuildConfig::default());
        let mut published = builder.registry().subscribe();
        for _ in 0..10 {
            builder.request_rebuild();
        }
        published.changed().await.unwrap();
        builder.wait_idle().await;
        assert_eq!(builder.builds_completed(), 1);
        assert_eq!(*published.borrow(), 1);
        assert!(!builder.is_building());
    }

    #[tokio::test]
    async fn test_restore_reuses_persisted_generation() {
        let tmp = TempDir::new().unwrap();
        let records = texts(3, "s");
        {
            let corpus = Arc::new(CorpusStore::in_memory());
            corpus.append(records.clone()).await.unwrap();
            let builder = builder_with(
                corpus,
                Arc::new(TableEmbedder::new(DIM)),
                Some(GenerationStore::new(tmp.path())),
                BuildConfig::default(),
            );
            builder.rebuild_now().await.unwrap();
        }

        let corpus = Arc::new(CorpusStore::in_memory());
        corpus.append(records).await.unwrap();
        corpus.append(texts(1, "t")).await.unwrap();
        let embedder = Arc::new(TableEmbedder::new(DIM));
        let builder = builder_with(
            corpus.clone(),
            embedder.clone(),
            Some(GenerationStore::new(tmp.path())),
            BuildConfig::default(),
        );
        let report = builder.restore().await.unwrap();
        assert_eq!(report.restored_generation, Some(1));
        assert_eq!(report.build.strategy, BuildStrategy::Incremental);
        assert_eq!(report.build.generation_id, Some(2));
        assert_eq!(embedder.calls(), 1, "only the new chunk is encoded");
        assert_eq!(corpus.get("s1#0").unwrap().vector_id, Some(1));
        assert_eq!(corpus.get("t0#0").unwrap().vector_id, Some(3));
    }

    #[tokio::test]
    async fn test_restore_falls_back_on_corruption() {
        let tmp = TempDir::new().unwrap();
        let records = texts(2, "u");
        {
            let corpus = Arc::new(CorpusStore::in_memory());
            corpus.append(records.clone()).await.unwrap();
            let builder = builder_with(
                corpus,
                Arc::new(TableEmbedder::new(DIM)),
                Some(GenerationStore::new(tmp.path())),
                BuildConfig::default(),
            );
            builder.rebuild_now().await.unwrap();
        }
        std::fs::remove_file(tmp.path().join("generations/gen-00000001/manifest.json")).unwrap();

        let empty = builder_with(
            Arc::new(CorpusStore::in_memory()),
            Arc::new(TableEmbedder::new(DIM)),
            Some(GenerationStore::new(tmp.path())),
            BuildConfig::default(),
        );
        assert!(matches!(empty.restore().await, Err(BuildError::Restore(_))));

        let corpus = Arc::new(CorpusStore::in_memory());
        corpus.append(records).await.unwrap();
        let builder = builder_with(
            corpus,
            Arc::new(TableEmbedder::new(DIM)),
            Some(GenerationStore::new(tmp.path())),
            BuildConfig::default(),
        );
        let report = builder.restore().await.unwrap();
        assert!(report.restored_generation.is_none());
        assert!(report.fallback_reason.is_some());
        assert_eq!(report.build.strategy, BuildStrategy::Full);
        assert_eq!(report.build.generation_id, Some(2));
    }
}
