//! Deep Search: grow the corpus around a topic.
//!
//! Sources are queried one after another in priority order until enough new
//! papers have been accepted. Each source's batch is appended on its own, so
//! papers committed before a later failure or cancellation stay in the corpus.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::builder::IndexBuilder;
use crate::chunking::{split_windows, ChunkingConfig};
use crate::corpus::{ChunkRecord, CorpusStore};
use crate::dedup::{
    abstract_fingerprint, canonical_paper_id, identifiers, DedupConfig, DedupIndex,
    PaperFingerprint,
};
use crate::sources::{PaperCandidate, PaperSource, SourceError, SourceKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepSearchConfig {
    /// Each source is asked for `remaining * overfetch` candidates, since
    /// some will be duplicates.
    pub overfetch: u32,
    pub max_attempts: u32,
    /// First retry delay; doubled on every further attempt.
    pub backoff_ms: u64,
    pub dedup: DedupConfig,
    pub chunking: ChunkingConfig,
}

impl Default for DeepSearchConfig {
    fn default() -> Self {
        Self {
            overfetch: 2,
            max_attempts: 3,
            backoff_ms: 500,
            dedup: DedupConfig::default(),
            chunking: ChunkingConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeepSearchError {
    #[error("topic is empty")]
    EmptyTopic,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceFailure {
    pub source: String,
    pub error: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AcceptedPaper {
    pub paper_id: String,
    pub title: String,
    pub source: String,
    pub chunks: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeepSearchOutcome {
    pub topic: String,
    pub accepted: usize,
    pub skipped_duplicates: usize,
    pub source_failures: Vec<SourceFailure>,
    pub accepted_papers: Vec<AcceptedPaper>,
    pub chunks_appended: usize,
    pub rebuild_requested: bool,
    pub elapsed_ms: u64,
}

/// Text of one paper, ready to be cut into corpus records.
pub struct PaperText<'a> {
    pub paper_id: &'a str,
    pub source: SourceKind,
    pub title: &'a str,
    pub authors: &'a [String],
    pub body: &'a str,
    pub identifiers: Vec<String>,
    pub abstract_simhash: Option<u64>,
}

impl PaperText<'_> {
    /// One record per overlapping window of the body, ids `<paper_id>#<ordinal>`.
    pub fn into_records(
        self,
        chunking: &ChunkingConfig,
        fetched_at: DateTime<Utc>,
    ) -> Vec<ChunkRecord> {
        split_windows(self.body, chunking)
            .into_iter()
            .map(|chunk| {
                let ordinal = chunk.ordinal as u32;
                ChunkRecord {
                    chunk_id: ChunkRecord::chunk_id_for(self.paper_id, ordinal),
                    paper_id: self.paper_id.to_string(),
                    source: self.source,
                    title: self.title.to_string(),
                    authors: self.authors.to_vec(),
                    text: chunk.text,
                    fetched_at,
                    vector_id: None,
                    ordinal,
                    identifiers: self.identifiers.clone(),
                    abstract_simhash: self.abstract_simhash,
                }
            })
            .collect()
    }
}

fn candidate_records(
    candidate: &PaperCandidate,
    paper_id: &str,
    chunking: &ChunkingConfig,
    fetched_at: DateTime<Utc>,
) -> Vec<ChunkRecord> {
    let body = match candidate.abstract_text.as_deref().map(str::trim) {
        Some(abstract_text) if !abstract_text.is_empty() => {
            format!("{}\n\n{}", candidate.title.trim(), abstract_text)
        }
        _ => candidate.title.trim().to_string(),
    };
    PaperText {
        paper_id,
        source: candidate.source,
        title: candidate.title.trim(),
        authors: &candidate.authors,
        body: &body,
        identifiers: identifiers(candidate),
        abstract_simhash: abstract_fingerprint(candidate),
    }
    .into_records(chunking, fetched_at)
}

pub struct DeepSearcher {
    sources: Vec<PaperSource>,
    corpus: Arc<CorpusStore>,
    builder: Option<IndexBuilder>,
    config: DeepSearchConfig,
}

impl DeepSearcher {
    /// `sources` are tried in the order given.
    pub fn new(
        sources: Vec<PaperSource>,
        corpus: Arc<CorpusStore>,
        builder: Option<IndexBuilder>,
        config: DeepSearchConfig,
    ) -> Self {
        Self {
            sources,
            corpus,
            builder,
            config,
        }
    }

    pub fn config(&self) -> &DeepSearchConfig {
        &self.config
    }

    /// Fetch up to `max_papers` new papers on `topic`, append them to the
    /// corpus and schedule a rebuild if anything was added.
    pub async fn run(
        &self,
        topic: &str,
        max_papers: usize,
    ) -> Result<DeepSearchOutcome, DeepSearchError> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(DeepSearchError::EmptyTopic);
        }
        let started = Instant::now();
        let mut outcome = DeepSearchOutcome {
            topic: topic.to_string(),
            ..Default::default()
        };

        let mut known = {
            let snapshot = self.corpus.snapshot();
            DedupIndex::from_records(snapshot.iter().map(|r| r.as_ref()))
        };

        for source in &self.sources {
            if outcome.accepted >= max_papers {
                break;
            }
            let remaining = max_papers - outcome.accepted;
            let request = (remaining as u32).saturating_mul(self.config.overfetch.max(1));

            let candidates = match self.fetch_with_retry(source, topic, request).await {
                Ok(candidates) => candidates,
                Err((e, attempts)) => {
                    warn!("{} failed after {} attempts: {}", source.name(), attempts, e);
                    outcome.source_failures.push(SourceFailure {
                        source: source.name().to_string(),
                        error: e.to_string(),
                        attempts,
                    });
                    continue;
                }
            };
            debug!("{} returned {} candidates", source.name(), candidates.len());

            let fetched_at = Utc::now();
            let mut batch = Vec::new();
            let mut batch_papers = Vec::new();
            for candidate in &candidates {
                if outcome.accepted + batch_papers.len() >= max_papers {
                    break;
                }
                let paper_id = canonical_paper_id(candidate);
                if paper_id.is_empty() {
                    continue;
                }
                if self.corpus.exists(&paper_id) || known.contains_paper(&paper_id) {
                    debug!("Skipping {}: already known", paper_id);
                    outcome.skipped_duplicates += 1;
                    continue;
                }
                let fingerprint = PaperFingerprint::from_candidate(candidate);
                let verdict = known.check(&fingerprint, &self.config.dedup);
                if verdict.is_duplicate() {
                    debug!("Skipping {}: {:?}", paper_id, verdict);
                    outcome.skipped_duplicates += 1;
                    continue;
                }

                let records =
                    candidate_records(candidate, &paper_id, &self.config.chunking, fetched_at);
                if records.is_empty() {
                    continue;
                }
                known.insert(&paper_id, fingerprint);
                batch_papers.push(AcceptedPaper {
                    paper_id,
                    title: candidate.title.trim().to_string(),
                    source: source.name().to_string(),
                    chunks: records.len(),
                });
                batch.extend(records);
            }

            if batch.is_empty() {
                continue;
            }
            match self.corpus.append(batch).await {
                Ok(appended) => {
                    // A concurrent search may have stored some of these first.
                    let (stored, raced): (Vec<_>, Vec<_>) = batch_papers
                        .into_iter()
                        .partition(|p| appended.new_papers.contains(&p.paper_id));
                    if !raced.is_empty() {
                        debug!("{} papers were stored by a concurrent search", raced.len());
                    }
                    outcome.chunks_appended += appended.accepted;
                    outcome.skipped_duplicates += raced.len();
                    outcome.accepted += stored.len();
                    outcome.accepted_papers.extend(stored);
                }
                Err(e) => {
                    warn!("Failed to store batch from {}: {}", source.name(), e);
                    outcome.source_failures.push(SourceFailure {
                        source: source.name().to_string(),
                        error: e.to_string(),
                        attempts: 1,
                    });
                }
            }
        }

        if outcome.chunks_appended > 0 {
            if let Some(builder) = &self.builder {
                builder.request_rebuild();
                outcome.rebuild_requested = true;
            }
        }
        outcome.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            "Deep search {:?}: {} accepted, {} duplicates, {} source failures",
            topic,
            outcome.accepted,
            outcome.skipped_duplicates,
            outcome.source_failures.len()
        );
        Ok(outcome)
    }

    async fn fetch_with_retry(
        &self,
        source: &PaperSource,
        topic: &str,
        max_results: u32,
    ) -> Result<Vec<PaperCandidate>, (SourceError, u32)> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut delay = Duration::from_millis(self.config.backoff_ms);
        let mut attempt = 1;
        loop {
            match source.search(topic, max_results).await {
                Ok(candidates) => return Ok(candidates),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    warn!(
                        "{} attempt {}/{} failed: {}; retrying in {:?}",
                        source.name(),
                        attempt,
                        max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err((e, attempt)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::builder::BuildConfig;
    use crate::corpus::testing::record;
    use crate::embed::hashing::HashingEmbedder;
    use crate::index::GenerationRegistry;
    use crate::sources::CatalogSource;

    fn paper(id: &str, title: &str, author: &str, doi: Option<&str>) -> PaperCandidate {
        PaperCandidate {
            id: id.to_string(),
            title: title.to_string(),
            authors: vec![author.to_string()],
            abstract_text: Some(format!("We study {} in depth.", title.to_lowercase())),
            year: Some(2023),
            source: SourceKind::Catalog,
            doi: doi.map(str::to_string),
            arxiv_id: None,
            url: String::new(),
            pdf_url: None,
        }
    }

    fn catalog(name: &str, entries: Vec<PaperCandidate>) -> PaperSource {
        PaperSource::Catalog(CatalogSource::in_memory(name, entries))
    }

    fn quick() -> DeepSearchConfig {
        DeepSearchConfig {
            backoff_ms: 1,
            ..Default::default()
        }
    }

    async fn seeded_corpus() -> Arc<CorpusStore> {
        let corpus = Arc::new(CorpusStore::in_memory());
        let mut existing = record("doi:10.1/existing", 0, "Qubits we already have");
        existing.identifiers = vec!["doi:10.1/existing".to_string()];
        corpus.append(vec![existing]).await.unwrap();
        corpus
    }

    fn two_sources() -> Vec<PaperSource> {
        vec![
            catalog(
                "a",
                vec![
                    paper("a:0", "Qubits we already have", "Known", Some("10.1/existing")),
                    paper("a:1", "Topological qubits", "Alpha", Some("10.2/a1")),
                    paper("a:2", "Qubits error correction codes", "Beta", None),
                    paper("a:3", "Photonic qubits", "Gamma", Some("10.2/a3")),
                ],
            ),
            catalog(
                "b",
                vec![
                    paper("b:0", "Topological Qubits (revised)", "Alpha", Some("https://doi.org/10.2/A1")),
                    paper("b:1", "Qubits: error-correction codes.", "B. Beta", None),
                    paper("b:2", "Superconducting qubits", "Delta", Some("10.3/b2")),
                ],
            ),
        ]
    }

    #[tokio::test]
    async fn test_two_sources_with_duplicates() {
        let corpus = seeded_corpus().await;
        let searcher = DeepSearcher::new(two_sources(), corpus.clone(), None, quick());

        let outcome = searcher.run("qubits", 5).await.unwrap();
        assert_eq!(outcome.accepted, 4);
        assert_eq!(outcome.skipped_duplicates, 3);
        assert!(outcome.source_failures.is_empty());
        assert!(!outcome.rebuild_requested);

        let ids: Vec<&str> = outcome.accepted_papers.iter().map(|p| p.paper_id.as_str()).collect();
        assert_eq!(ids, vec!["doi:10.2/a1", "a:2", "doi:10.2/a3", "doi:10.3/b2"]);
        assert_eq!(outcome.accepted_papers[3].source, "b");
        assert_eq!(corpus.paper_count(), 5);

        let record = corpus.get("doi:10.2/a1#0").unwrap();
        assert_eq!(record.identifiers, vec!["doi:10.2/a1".to_string()]);
        assert!(record.text.starts_with("Topological qubits"));
        assert!(record.abstract_simhash.is_some());
        assert_eq!(outcome.chunks_appended, corpus.len() - 1);
    }

    #[tokio::test]
    async fn test_stops_at_cap() {
        let corpus = Arc::new(CorpusStore::in_memory());
        let searcher = DeepSearcher::new(two_sources(), corpus.clone(), None, quick());
        let outcome = searcher.run("qubits", 2).await.unwrap();
        assert_eq!(outcome.accepted, 2);
        assert!(outcome.accepted_papers.iter().all(|p| p.source == "a"));
        assert_eq!(corpus.paper_count(), 2);

        let none = searcher.run("qubits", 0).await.unwrap();
        assert_eq!(none.accepted, 0);
        assert_eq!(none.chunks_appended, 0);
    }

    #[tokio::test]
    async fn test_rerun_skips_everything() {
        let corpus = Arc::new(CorpusStore::in_memory());
        let searcher = DeepSearcher::new(two_sources(), corpus.clone(), None, quick());
        let first = searcher.run("qubits", 10).await.unwrap();
        let before = corpus.len();

        let second = searcher.run("qubits", 10).await.unwrap();
        assert_eq!(second.accepted, 0);
        assert_eq!(second.skipped_duplicates, first.accepted + first.skipped_duplicates);
        assert_eq!(corpus.len(), before);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_runs_count_each_paper_once() {
        for _ in 0..20 {
            let corpus = Arc::new(CorpusStore::in_memory());
            let barrier = Arc::new(tokio::sync::Barrier::new(2));
            let runs: Vec<_> = (0..2)
                .map(|_| {
                    let searcher = DeepSearcher::new(two_sources(), corpus.clone(), None, quick());
                    let barrier = barrier.clone();
                    tokio::spawn(async move {
                        barrier.wait().await;
                        searcher.run("qubits", 10).await.unwrap()
                    })
                })
                .collect();

            let mut accepted = 0;
            let mut ids = HashSet::new();
            for run in runs {
                let outcome = run.await.unwrap();
                accepted += outcome.accepted;
                for paper in outcome.accepted_papers {
                    assert!(ids.insert(paper.paper_id), "paper counted by both runs");
                }
            }
            assert_eq!(accepted, corpus.paper_count());
            assert_eq!(accepted, 5);
        }
    }

    #[tokio::test]
    async fn test_failing_source_is_recorded_and_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = PaperSource::Catalog(CatalogSource::open(
            "broken",
            dir.path().join("missing.json"),
        ));
        let mut sources = vec![missing];
        sources.extend(two_sources());
        let corpus = Arc::new(CorpusStore::in_memory());
        let searcher = DeepSearcher::new(sources, corpus, None, quick());

        let outcome = searcher.run("qubits", 3).await.unwrap();
        assert_eq!(outcome.source_failures.len(), 1);
        assert_eq!(outcome.source_failures[0].source, "broken");
        assert_eq!(outcome.source_failures[0].attempts, 3);
        assert_eq!(outcome.accepted, 3);
    }

    #[tokio::test]
    async fn test_bad_catalog_is_not_retried() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, "not json").unwrap();
        let searcher = DeepSearcher::new(
            vec![PaperSource::Catalog(CatalogSource::open("garbled", path))],
            Arc::new(CorpusStore::in_memory()),
            None,
            quick(),
        );
        let outcome = searcher.run("qubits", 3).await.unwrap();
        assert_eq!(outcome.source_failures[0].attempts, 1);
        assert_eq!(outcome.accepted, 0);
    }

    #[tokio::test]
    async fn test_empty_topic() {
        let searcher =
            DeepSearcher::new(two_sources(), Arc::new(CorpusStore::in_memory()), None, quick());
        assert!(matches!(searcher.run("  ", 3).await, Err(DeepSearchError::EmptyTopic)));
    }

    #[tokio::test]
    async fn test_accepted_papers_reach_the_index() {
        let corpus = Arc::new(CorpusStore::in_memory());
        let builder = IndexBuilder::new(
            corpus.clone(),
            Arc::new(HashingEmbedder::new(64)),
            Arc::new(GenerationRegistry::new()),
            None,
            BuildConfig::default(),
        );
        let searcher = DeepSearcher::new(two_sources(), corpus.clone(), Some(builder.clone()), quick());

        let outcome = searcher.run("qubits", 10).await.unwrap();
        assert!(outcome.rebuild_requested);
        builder.wait_idle().await;

        let current = builder.registry().current().unwrap();
        assert_eq!(current.vector_count(), corpus.len());
        assert!(current.vector_id("doi:10.3/b2#0").is_some());
    }

    #[test]
    fn test_paper_text_windows() {
        let authors = vec!["Ada Lovelace".to_string()];
        let body = (0..25).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ");
        let chunking = ChunkingConfig {
            window_words: 10,
            overlap_words: 2,
            ..Default::default()
        };
        let records = PaperText {
            paper_id: "local:notes",
            source: SourceKind::Local,
            title: "Notes",
            authors: &authors,
            body: &body,
            identifiers: Vec::new(),
            abstract_simhash: None,
        }
        .into_records(&chunking, Utc::now());

        let ids: Vec<&str> = records.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["local:notes#0", "local:notes#1", "local:notes#2"]);
        assert!(records[1].text.starts_with("w8 "));
        assert!(records.iter().all(|r| r.vector_id.is_none()));
    }
}
