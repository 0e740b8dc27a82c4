//! One review pass: a submission checked for novelty and plagiarism against
//! a single pinned generation, plus a summary of its reference list.

use std::sync::Arc;
use std::time::{Duration, Instant};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chunking::{extract_claims, split_windows, ChunkingConfig};
use crate::corpus::CorpusStore;
use crate::dedup::{DedupConfig, DedupIndex, PaperFingerprint};
use crate::index::{GenerationRegistry, PinnedGeneration};
use crate::novelty::{NoveltyConfig, NoveltyScorer, NoveltyVerdict};
use crate::plagiarism::{PlagiarismConfig, PlagiarismDetector, PlagiarismReport};
use crate::similarity::{QueryResult, SearchError, SimilarityEngine};
use crate::sources::{PaperCandidate, SourceKind};

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ReferenceEntry {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub doi: Option<String>,
    #[serde(default)]
    pub arxiv_id: Option<String>,
}

impl ReferenceEntry {
    fn label(&self) -> String {
        self.doi
            .clone()
            .or_else(|| self.arxiv_id.clone())
            .or_else(|| self.title.clone())
            .unwrap_or_else(|| "(untitled reference)".to_string())
    }

    fn fingerprint(&self) -> PaperFingerprint {
        PaperFingerprint::from_candidate(&PaperCandidate {
            id: String::new(),
            title: self.title.clone().unwrap_or_default(),
            authors: self.authors.clone(),
            abstract_text: None,
            year: None,
            source: SourceKind::Local,
            doi: self.doi.clone(),
            arxiv_id: self.arxiv_id.clone(),
            url: String::new(),
            pdf_url: None,
        })
    }
}

/// Plain text of a submitted paper; extraction from PDF happens upstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Submission {
    #[serde(default)]
    pub title: Option<String>,
    pub text: String,
    #[serde(default)]
    pub references: Vec<ReferenceEntry>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CitationSummary {
    pub total: usize,
    /// References that match a corpus paper by identifier or title and author.
    pub resolved: usize,
    pub resolved_papers: Vec<String>,
    pub unresolved: Vec<String>,
    pub missing_identifiers: usize,
    /// References published in or before the configured cutoff year.
    pub outdated: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    pub novelty: NoveltyConfig,
    pub plagiarism: PlagiarismConfig,
    pub chunking: ChunkingConfig,
    pub dedup: DedupConfig,
    pub search_concurrency: usize,
    pub timeout_secs: u64,
    pub outdated_year: i32,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            novelty: NoveltyConfig::default(),
            plagiarism: PlagiarismConfig::default(),
            chunking: ChunkingConfig::default(),
            dedup: DedupConfig::default(),
            search_concurrency: 8,
            timeout_secs: 60,
            outdated_year: 2015,
        }
    }
}

fn check_unit(name: &str, value: f32) -> Result<(), ReviewError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ReviewError::InvalidConfig(format!("{} must be within [0, 1], got {}", name, value)))
    }
}

impl ReviewConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ReviewError> {
        let novelty = &self.novelty;
        let plagiarism = &self.plagiarism;
        check_unit("novelty_threshold", novelty.novelty_threshold)?;
        check_unit("partial_threshold", novelty.partial_threshold)?;
        check_unit("tie_epsilon", novelty.tie_epsilon)?;
        check_unit("semantic_threshold", plagiarism.semantic_threshold)?;
        check_unit("moderate_coverage", plagiarism.moderate_coverage)?;
        check_unit("high_coverage", plagiarism.high_coverage)?;

        if novelty.partial_threshold > novelty.novelty_threshold {
            return Err(ReviewError::InvalidConfig(format!(
                "partial_threshold {} is above novelty_threshold {}",
                novelty.partial_threshold, novelty.novelty_threshold
            )));
        }
        if plagiarism.semantic_threshold < novelty.novelty_threshold {
            return Err(ReviewError::InvalidConfig(format!(
                "plagiarism threshold {} must not be below novelty threshold {}",
                plagiarism.semantic_threshold, novelty.novelty_threshold
            )));
        }
        if plagiarism.moderate_coverage > plagiarism.high_coverage {
            return Err(ReviewError::InvalidConfig(
                "moderate_coverage is above high_coverage".to_string(),
            ));
        }
        if novelty.top_k == 0 || plagiarism.shingle_words == 0 || self.chunking.window_words == 0 {
            return Err(ReviewError::InvalidConfig(
                "top_k, shingle_words and window_words must be positive".to_string(),
            ));
        }
        if self.chunking.overlap_words >= self.chunking.window_words {
            return Err(ReviewError::InvalidConfig(format!(
                "overlap_words {} must be smaller than window_words {}",
                self.chunking.overlap_words, self.chunking.window_words
            )));
        }
        if !(0.0..=1.0).contains(&self.dedup.title_similarity) {
            return Err(ReviewError::InvalidConfig(format!(
                "title_similarity must be within [0, 1], got {}",
                self.dedup.title_similarity
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("invalid review configuration: {0}")]
    InvalidConfig(String),
    #[error("no index generation has been published yet")]
    NoGeneration,
    #[error("submission text is empty")]
    EmptySubmission,
    #[error("query vector has dimension {actual}, generation expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewReport {
    pub generation_id: u64,
    pub title: Option<String>,
    pub novelty: NoveltyVerdict,
    pub plagiarism: PlagiarismReport,
    pub citations: CitationSummary,
    pub degraded: bool,
    pub notes: Vec<String>,
    pub elapsed_ms: u64,
}

fn dimension_mismatch(results: &[Result<QueryResult, SearchError>]) -> Option<ReviewError> {
    results.iter().find_map(|r| match r {
        Err(SearchError::DimensionMismatch { expected, actual }) => Some(ReviewError::DimensionMismatch {
            expected: *expected,
            actual: *actual,
        }),
        _ => None,
    })
}

fn timed_out(results: &[Result<QueryResult, SearchError>]) -> usize {
    results
        .iter()
        .filter(|r| matches!(r, Err(SearchError::TimedOut)))
        .count()
}

pub struct Reviewer {
    engine: SimilarityEngine,
    corpus: Arc<CorpusStore>,
    registry: Arc<GenerationRegistry>,
    config: ReviewConfig,
    novelty: NoveltyScorer,
    plagiarism: PlagiarismDetector,
}

impl Reviewer {
    pub fn new(
        engine: SimilarityEngine,
        corpus: Arc<CorpusStore>,
        registry: Arc<GenerationRegistry>,
        config: ReviewConfig,
    ) -> Result<Self, ReviewError> {
        config.validate()?;
        Ok(Self {
            engine,
            corpus,
            registry,
            novelty: NoveltyScorer::new(config.novelty.clone()),
            plagiarism: PlagiarismDetector::new(config.plagiarism.clone()),
            config,
        })
    }

    pub fn config(&self) -> &ReviewConfig {
        &self.config
    }

    /// Review against the current generation with the configured timeout.
    pub async fn review(&self, submission: &Submission) -> Result<ReviewReport, ReviewError> {
        self.review_with_timeout(submission, self.config.timeout()).await
    }

    pub async fn review_with_timeout(
        &self,
        submission: &Submission,
        timeout: Duration,
    ) -> Result<ReviewReport, ReviewError> {
        let generation = self.registry.current().ok_or(ReviewError::NoGeneration)?;
        self.review_pinned(submission, generation, timeout).await
    }

    /// Review against `generation` only, whatever is published meanwhile.
    /// Searches stop once `timeout` elapses and the report is marked degraded.
    pub async fn review_pinned(
        &self,
        submission: &Submission,
        generation: PinnedGeneration,
        timeout: Duration,
    ) -> Result<ReviewReport, ReviewError> {
        let started = Instant::now();
        let text = submission.text.as_str();
        if text.trim().is_empty() {
            return Err(ReviewError::EmptySubmission);
        }
        // A timeout too large to represent means no deadline.
        let deadline = tokio::time::Instant::now().checked_add(timeout);
        let mut notes = Vec::new();

        let windows = split_windows(text, &self.config.chunking);
        let mut claims = extract_claims(text, &self.config.chunking);
        if claims.is_empty() {
            notes.push("No sentence qualified as a claim; novelty was scored over text windows".to_string());
            claims = windows.clone();
        }

        let concurrency = self.config.search_concurrency;
        let (claim_results, window_results) = tokio::join!(
            self.engine.search_chunks(
                &claims,
                self.config.novelty.top_k,
                &generation,
                concurrency,
                deadline
            ),
            self.engine.search_chunks(
                &windows,
                self.config.plagiarism.semantic_candidates,
                &generation,
                concurrency,
                deadline
            ),
        );
        if let Some(e) = dimension_mismatch(&claim_results).or_else(|| dimension_mismatch(&window_results)) {
            return Err(e);
        }

        let novelty = self.novelty.score(&claims, &claim_results, &generation);

        let mut hits = Vec::new();
        let mut failed_windows = 0;
        for (window, result) in windows.iter().zip(&window_results) {
            let outcome = match result {
                Ok(neighbors) => self
                    .plagiarism
                    .check_chunk(window, neighbors, &generation),
                Err(_) => {
                    failed_windows += 1;
                    continue;
                }
            };
            match outcome {
                Ok(found) => hits.extend(found),
                Err(e) => {
                    tracing::warn!("Plagiarism check failed for window {}: {}", window.ordinal, e);
                    failed_windows += 1;
                }
            }
        }
        let plagiarism = self
            .plagiarism
            .report(hits, text.len(), windows.len(), failed_windows);

        let late = timed_out(&claim_results) + timed_out(&window_results);
        if late > 0 {
            notes.push(format!(
                "Review deadline of {:?} reached; {} of {} searches did not complete",
                timeout,
                late,
                claim_results.len() + window_results.len()
            ));
        }
        let failed_claims = novelty.chunks.iter().filter(|c| c.error.is_some()).count()
            - timed_out(&claim_results);
        if failed_claims > 0 {
            notes.push(format!("{} claim searches failed and were left out of the score", failed_claims));
        }

        let citations = self.summarize_citations(&submission.references);
        if citations.total > 0 && citations.resolved == 0 {
            notes.push("None of the submitted references are in the corpus".to_string());
        }

        let generation_id = generation.id();
        drop(generation);

        let degraded = novelty.degraded || plagiarism.degraded;
        tracing::info!(
            "Reviewed submission against generation {}: novelty {:?}, risk {:?}, degraded {}",
            generation_id,
            novelty.novelty_score,
            plagiarism.risk,
            degraded
        );
        Ok(ReviewReport {
            generation_id,
            title: submission.title.clone(),
            novelty,
            plagiarism,
            citations,
            degraded,
            notes,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Match the reference list against the corpus.
    pub fn summarize_citations(&self, references: &[ReferenceEntry]) -> CitationSummary {
        let mut summary = CitationSummary {
            total: references.len(),
            ..Default::default()
        };
        if references.is_empty() {
            return summary;
        }

        let snapshot = self.corpus.snapshot();
        let known = DedupIndex::from_records(snapshot.iter().map(|r| &**r));
        for reference in references {
            if reference.doi.is_none() && reference.arxiv_id.is_none() {
                summary.missing_identifiers += 1;
            }
            if reference.year.is_some_and(|y| y <= self.config.outdated_year) {
                summary.outdated += 1;
            }
            match known.check(&reference.fingerprint(), &self.config.dedup).existing() {
                Some(paper_id) => {
                    summary.resolved += 1;
                    summary.resolved_papers.push(paper_id.to_string());
                }
                None => summary.unresolved.push(reference.label()),
            }
        }
        summary
    }
}
