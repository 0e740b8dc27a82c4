//! Ranked neighbor sets for query text.
//!
//! Every search runs against a generation the caller has already pinned, so a
//! multi-chunk review sees one consistent index even while new generations
//! are published underneath it.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;

use crate::chunking::TextChunk;
use crate::embed::{encode_normalized, EmbedError, EmbeddingProvider};
use crate::index::{IndexError, IndexGeneration};

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("query vector has dimension {actual}, generation expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("failed to encode query: {0}")]
    Embed(EmbedError),
    #[error(transparent)]
    Index(IndexError),
    #[error("search was not run before the deadline")]
    TimedOut,
}

impl From<EmbedError> for SearchError {
    fn from(e: EmbedError) -> Self {
        match e {
            EmbedError::DimensionMismatch { expected, actual } => {
                SearchError::DimensionMismatch { expected, actual }
            }
            other => SearchError::Embed(other),
        }
    }
}

impl From<IndexError> for SearchError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::DimensionMismatch { expected, actual } => {
                SearchError::DimensionMismatch { expected, actual }
            }
            other => SearchError::Index(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub vector_id: u64,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub query_chunk: String,
    pub generation_id: u64,
    /// Highest score first.
    pub matches: Vec<ScoredChunk>,
}

impl QueryResult {
    /// Score of the best match, 0 when there is none.
    pub fn max_similarity(&self) -> f32 {
        self.matches.first().map_or(0.0, |m| m.score)
    }
}

#[derive(Clone)]
pub struct SimilarityEngine {
    embedder: Arc<dyn EmbeddingProvider>,
}

impl SimilarityEngine {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { embedder }
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    pub async fn search(
        &self,
        query_text: &str,
        k: usize,
        generation: &IndexGeneration,
    ) -> Result<QueryResult, SearchError> {
        let vector = encode_normalized(self.embedder.as_ref(), query_text).await?;
        self.search_vector(query_text, &vector, k, generation)
    }

    /// Search with an already-normalized vector.
    pub fn search_vector(
        &self,
        query_chunk: &str,
        vector: &[f32],
        k: usize,
        generation: &IndexGeneration,
    ) -> Result<QueryResult, SearchError> {
        if vector.len() != generation.dimension() {
            return Err(SearchError::DimensionMismatch {
                expected: generation.dimension(),
                actual: vector.len(),
            });
        }
        let matches = generation
            .query(vector, k)?
            .into_iter()
            .map(|(vector_id, chunk_id, score)| ScoredChunk {
                chunk_id: chunk_id.to_string(),
                vector_id,
                score,
            })
            .collect();
        Ok(QueryResult {
            query_chunk: query_chunk.to_string(),
            generation_id: generation.id(),
            matches,
        })
    }

    /// Search every chunk, `concurrency` at a time, in chunk order. Chunks
    /// whose search has not finished by `deadline` come back as
    /// [`SearchError::TimedOut`].
    pub async fn search_chunks(
        &self,
        chunks: &[TextChunk],
        k: usize,
        generation: &IndexGeneration,
        concurrency: usize,
        deadline: Option<tokio::time::Instant>,
    ) -> Vec<Result<QueryResult, SearchError>> {
        let searches: Vec<_> = chunks
            .iter()
            .map(|chunk| async move {
                let Some(deadline) = deadline else {
                    return self.search(&chunk.text, k, generation).await;
                };
                if tokio::time::Instant::now() >= deadline {
                    return Err(SearchError::TimedOut);
                }
                tokio::time::timeout_at(deadline, self.search(&chunk.text, k, generation))
                    .await
                    .unwrap_or_else(|_| Err(SearchError::TimedOut))
            })
            .collect();
        let results: Vec<Result<QueryResult, SearchError>> = stream::iter(searches)
            .buffered(concurrency.max(1))
            .collect()
            .await;

        let timed_out = results
            .iter()
            .filter(|r| matches!(r, Err(SearchError::TimedOut)))
            .count();
        if timed_out > 0 {
            tracing::warn!(
                "Deadline reached: {} of {} searches did not complete",
                timed_out,
                chunks.len()
            );
        }
        results
    }
}
