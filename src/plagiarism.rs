//! Plagiarism: passages of a submission that closely paraphrase or copy
//! corpus text.
//!
//! Two detectors feed one report. High-scoring semantic neighbors flag a whole
//! chunk as a paraphrase; shared word shingles against candidate chunks flag
//! the exact copied sub-span as verbatim.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::chunking::{word_spans, Span, TextChunk};
use crate::fingerprint::fnv1a;
use crate::index::IndexGeneration;
use crate::novelty::paper_of;
use crate::similarity::{QueryResult, SearchError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlagiarismConfig {
    /// Semantic score at or above which a chunk counts as paraphrased.
    /// Stricter than the novelty threshold.
    pub semantic_threshold: f32,
    pub shingle_words: usize,
    /// Differing words tolerated inside one verbatim run.
    pub max_gap_words: usize,
    /// Shorter verbatim runs are ignored.
    pub min_verbatim_words: usize,
    pub semantic_candidates: usize,
    pub lexical_candidates: usize,
    pub moderate_coverage: f32,
    pub high_coverage: f32,
}

impl Default for PlagiarismConfig {
    fn default() -> Self {
        Self {
            semantic_threshold: 0.92,
            shingle_words: 5,
            max_gap_words: 1,
            min_verbatim_words: 8,
            semantic_candidates: 5,
            lexical_candidates: 5,
            moderate_coverage: 0.05,
            high_coverage: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Paraphrase,
    /// Ranks above paraphrase when overlapping findings merge.
    Verbatim,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    /// Byte range in the submitted text.
    pub span: Span,
    pub kind: MatchKind,
    /// Semantic score for paraphrases, fraction of matching shingles for
    /// verbatim runs.
    pub score: f32,
    pub source_chunks: Vec<String>,
}

impl Finding {
    fn outranks(&self, other: &Finding) -> bool {
        (self.kind, self.score) > (other.kind, other.score)
    }
}

/// One finding attributed to a corpus paper.
#[derive(Debug, Clone)]
pub struct SourceHit {
    pub paper_id: String,
    pub title: Option<String>,
    pub finding: Finding,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceFindings {
    pub paper_id: String,
    pub title: Option<String>,
    /// Merged findings, longest first.
    pub findings: Vec<Finding>,
    pub total_overlap: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlagiarismReport {
    /// Sources ordered by total overlap, largest first.
    pub sources: Vec<SourceFindings>,
    /// Fraction of the submission covered by any finding.
    pub coverage: f32,
    pub risk: RiskLevel,
    pub checked_chunks: usize,
    pub failed_chunks: usize,
    pub degraded: bool,
}

/// Normalized words of `text` with their byte spans; punctuation-only words
/// are dropped.
fn normalized_words(text: &str) -> Vec<(String, Span)> {
    word_spans(text)
        .into_iter()
        .filter_map(|span| {
            let word: String = text[span.start..span.end]
                .chars()
                .filter(|c| c.is_alphanumeric())
                .flat_map(char::to_lowercase)
                .collect();
            (!word.is_empty()).then_some((word, span))
        })
        .collect()
}

fn shingle_hashes(words: &[(String, Span)], n: usize) -> Vec<u64> {
    if n == 0 || words.len() < n {
        return Vec::new();
    }
    words
        .windows(n)
        .map(|w| {
            let joined = w.iter().map(|(word, _)| word.as_str()).collect::<Vec<_>>().join(" ");
            fnv1a(joined.as_bytes())
        })
        .collect()
}

/// Runs of `submission` text that also appear in `candidate`, as spans into
/// `submission` with the fraction of shingles in the run that matched.
pub fn verbatim_runs(
    submission: &str,
    candidate: &str,
    config: &PlagiarismConfig,
) -> Vec<(Span, f32)> {
    let n = config.shingle_words;
    let words = normalized_words(submission);
    let ours = shingle_hashes(&words, n);
    let theirs: HashSet<u64> = shingle_hashes(&normalized_words(candidate), n)
        .into_iter()
        .collect();
    if ours.is_empty() || theirs.is_empty() {
        return Vec::new();
    }

    let matched: Vec<usize> = ours
        .iter()
        .enumerate()
        .filter(|(_, h)| theirs.contains(h))
        .map(|(i, _)| i)
        .collect();

    // One differing word knocks out the `n` shingles that contain it.
    let reach = n + config.max_gap_words;
    let mut runs: Vec<(usize, usize, usize)> = Vec::new();
    for pos in matched {
        match runs.last_mut() {
            Some((_, last, hits)) if pos <= *last + reach => {
                *last = pos;
                *hits += 1;
            }
            _ => runs.push((pos, pos, 1)),
        }
    }

    runs.into_iter()
        .filter_map(|(first, last, hits)| {
            let last_word = last + n - 1;
            if last_word + 1 - first < config.min_verbatim_words {
                return None;
            }
            let span = Span::new(words[first].1.start, words[last_word].1.end);
            Some((span, hits as f32 / (last - first + 1) as f32))
        })
        .collect()
}

/// Union overlapping findings, keeping the kind and score of the stronger
/// one. Returns them longest first.
fn merge_findings(mut findings: Vec<Finding>) -> Vec<Finding> {
    findings.sort_by_key(|f| f.span);
    let mut merged: Vec<Finding> = Vec::with_capacity(findings.len());
    for finding in findings {
        match merged.last_mut() {
            Some(prev) if prev.span.overlaps(&finding.span) => {
                prev.span = prev.span.union(&finding.span);
                if finding.outranks(prev) {
                    prev.kind = finding.kind;
                    prev.score = finding.score;
                }
                for chunk in finding.source_chunks {
                    if !prev.source_chunks.contains(&chunk) {
                        prev.source_chunks.push(chunk);
                    }
                }
            }
            _ => merged.push(finding),
        }
    }
    merged.sort_by(|a, b| b.span.len().cmp(&a.span.len()).then(a.span.cmp(&b.span)));
    merged
}

/// Total length of the union of `spans`.
fn covered_len(mut spans: Vec<Span>) -> usize {
    spans.sort();
    let mut total = 0;
    let mut current: Option<Span> = None;
    for span in spans {
        current = match current {
            Some(c) if span.start <= c.end => Some(c.union(&span)),
            Some(c) => {
                total += c.len();
                Some(span)
            }
            None => Some(span),
        };
    }
    total + current.map_or(0, |c| c.len())
}

pub struct PlagiarismDetector {
    config: PlagiarismConfig,
}

impl PlagiarismDetector {
    pub fn new(config: PlagiarismConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PlagiarismConfig {
        &self.config
    }

    /// Findings for one submitted chunk, given its semantic neighbors from
    /// `generation`. Verbatim candidates are those neighbors plus the chunk's
    /// best lexical matches in the same generation; their text is the one the
    /// generation was built from.
    pub fn check_chunk(
        &self,
        chunk: &TextChunk,
        neighbors: &QueryResult,
        generation: &IndexGeneration,
    ) -> Result<Vec<SourceHit>, SearchError> {
        let mut hits = Vec::new();
        let mut candidates: Vec<String> = Vec::new();

        for m in neighbors.matches.iter().take(self.config.semantic_candidates) {
            candidates.push(m.chunk_id.clone());
            if m.score < self.config.semantic_threshold {
                continue;
            }
            let record = generation.record(&m.chunk_id);
            hits.push(SourceHit {
                paper_id: record
                    .map_or_else(|| paper_of(&m.chunk_id).to_string(), |r| r.paper_id.clone()),
                title: record.map(|r| r.title.clone()),
                finding: Finding {
                    span: chunk.span,
                    kind: MatchKind::Paraphrase,
                    score: m.score,
                    source_chunks: vec![m.chunk_id.clone()],
                },
            });
        }

        for (_, chunk_id, _) in generation.lexical_search(&chunk.text, self.config.lexical_candidates)? {
            if !candidates.iter().any(|c| c == chunk_id) {
                candidates.push(chunk_id.to_string());
            }
        }

        for chunk_id in candidates {
            let Some(record) = generation.record(&chunk_id) else { continue };
            for (span, score) in verbatim_runs(&chunk.text, &record.text, &self.config) {
                hits.push(SourceHit {
                    paper_id: record.paper_id.clone(),
                    title: Some(record.title.clone()),
                    finding: Finding {
                        span: span.offset(chunk.span.start),
                        kind: MatchKind::Verbatim,
                        score,
                        source_chunks: vec![chunk_id.clone()],
                    },
                });
            }
        }
        Ok(hits)
    }

    pub fn risk(&self, coverage: f32, has_findings: bool) -> RiskLevel {
        if coverage >= self.config.high_coverage {
            RiskLevel::High
        } else if coverage >= self.config.moderate_coverage || has_findings {
            RiskLevel::Moderate
        } else {
            RiskLevel::Low
        }
    }

    /// Group hits by source paper, merge overlaps, and score the submission
    /// of `submission_len` bytes.
    pub fn report(
        &self,
        hits: Vec<SourceHit>,
        submission_len: usize,
        checked_chunks: usize,
        failed_chunks: usize,
    ) -> PlagiarismReport {
        let mut grouped: BTreeMap<String, (Option<String>, Vec<Finding>)> = BTreeMap::new();
        for hit in hits {
            let entry = grouped.entry(hit.paper_id).or_insert((None, Vec::new()));
            if entry.0.is_none() {
                entry.0 = hit.title;
            }
            entry.1.push(hit.finding);
        }

        let mut sources: Vec<SourceFindings> = grouped
            .into_iter()
            .map(|(paper_id, (title, findings))| {
                let findings = merge_findings(findings);
                let total_overlap = findings.iter().map(|f| f.span.len()).sum();
                SourceFindings {
                    paper_id,
                    title,
                    findings,
                    total_overlap,
                }
            })
            .collect();
        sources.sort_by(|a, b| {
            b.total_overlap
                .cmp(&a.total_overlap)
                .then_with(|| a.paper_id.cmp(&b.paper_id))
        });

        let spans = sources
            .iter()
            .flat_map(|s| s.findings.iter().map(|f| f.span))
            .collect();
        let coverage = if submission_len == 0 {
            0.0
        } else {
            (covered_len(spans) as f32 / submission_len as f32).min(1.0)
        };

        PlagiarismReport {
            risk: self.risk(coverage, !sources.is_empty()),
            sources,
            coverage,
            checked_chunks,
            failed_chunks,
            degraded: failed_chunks > 0,
        }
    }
}
