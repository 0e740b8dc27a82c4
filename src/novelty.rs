//! Novelty: how far a submission's claims sit from everything in the corpus.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::chunking::{Span, TextChunk};
use crate::index::IndexGeneration;
use crate::similarity::{QueryResult, SearchError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoveltyConfig {
    /// A chunk whose best match scores at least this is not novel.
    pub novelty_threshold: f32,
    pub partial_threshold: f32,
    /// Matches within this distance of the best one count as equally prior.
    pub tie_epsilon: f32,
    /// Neighbors retrieved per chunk.
    pub top_k: usize,
    pub max_prior_papers: usize,
}

impl Default for NoveltyConfig {
    fn default() -> Self {
        Self {
            novelty_threshold: 0.85,
            partial_threshold: 0.5,
            tie_epsilon: 0.01,
            top_k: 5,
            max_prior_papers: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoveltyLabel {
    NotNovel,
    PartiallyNovel,
    HighlyNovel,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriorWork {
    pub chunk_id: String,
    pub paper_id: String,
    pub title: Option<String>,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkNovelty {
    pub ordinal: usize,
    pub span: Span,
    pub max_similarity: f32,
    pub label: NoveltyLabel,
    pub prior_works: Vec<PriorWork>,
    /// Set when this chunk's search failed; it is then left out of the score.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriorPaper {
    pub paper_id: String,
    pub title: Option<String>,
    pub best_score: f32,
    /// Submission chunks this paper showed up for.
    pub matched_chunks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct NoveltyVerdict {
    /// `1 - mean(max_similarity)` clipped to `[0, 1]`; `None` when no chunk
    /// could be scored.
    pub novelty_score: Option<f32>,
    pub flagged_chunks: usize,
    pub chunks: Vec<ChunkNovelty>,
    pub similar_papers: Vec<PriorPaper>,
    pub degraded: bool,
}

/// Paper id of a chunk id (`<paper_id>#<ordinal>`).
pub(crate) fn paper_of(chunk_id: &str) -> &str {
    chunk_id.rsplit_once('#').map_or(chunk_id, |(paper, _)| paper)
}

pub struct NoveltyScorer {
    config: NoveltyConfig,
}

impl NoveltyScorer {
    pub fn new(config: NoveltyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NoveltyConfig {
        &self.config
    }

    pub fn label(&self, max_similarity: f32) -> NoveltyLabel {
        if max_similarity >= self.config.novelty_threshold {
            NoveltyLabel::NotNovel
        } else if max_similarity >= self.config.partial_threshold {
            NoveltyLabel::PartiallyNovel
        } else {
            NoveltyLabel::HighlyNovel
        }
    }

    pub fn assess_chunk(
        &self,
        chunk: &TextChunk,
        result: Result<&QueryResult, &SearchError>,
        generation: &IndexGeneration,
    ) -> ChunkNovelty {
        let result = match result {
            Ok(result) => result,
            Err(e) => {
                return ChunkNovelty {
                    ordinal: chunk.ordinal,
                    span: chunk.span,
                    max_similarity: 0.0,
                    label: NoveltyLabel::HighlyNovel,
                    prior_works: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        };

        let top = result.max_similarity();
        let prior_works = result
            .matches
            .iter()
            .take_while(|m| m.score >= top - self.config.tie_epsilon)
            .map(|m| {
                let record = generation.record(&m.chunk_id);
                PriorWork {
                    chunk_id: m.chunk_id.clone(),
                    paper_id: record
                        .map_or_else(|| paper_of(&m.chunk_id).to_string(), |r| r.paper_id.clone()),
                    title: record.map(|r| r.title.clone()),
                    score: m.score,
                }
            })
            .collect();

        ChunkNovelty {
            ordinal: chunk.ordinal,
            span: chunk.span,
            max_similarity: top,
            label: self.label(top),
            prior_works,
            error: None,
        }
    }

    /// Combine per-chunk assessments. `results` are the neighbor sets behind
    /// them, used for the paper-level list of similar prior work.
    pub fn verdict(
        &self,
        chunks: Vec<ChunkNovelty>,
        results: &[Result<QueryResult, SearchError>],
        generation: &IndexGeneration,
    ) -> NoveltyVerdict {
        let scored: Vec<f32> = chunks
            .iter()
            .filter(|c| c.error.is_none())
            .map(|c| c.max_similarity)
            .collect();
        let novelty_score = (!scored.is_empty()).then(|| {
            let mean = scored.iter().sum::<f32>() / scored.len() as f32;
            (1.0 - mean).clamp(0.0, 1.0)
        });
        let flagged_chunks = chunks
            .iter()
            .filter(|c| c.error.is_none() && c.label == NoveltyLabel::NotNovel)
            .count();
        let degraded = chunks.iter().any(|c| c.error.is_some());

        let mut papers: HashMap<String, PriorPaper> = HashMap::new();
        for result in results.iter().flatten() {
            let mut seen_in_chunk = std::collections::HashSet::new();
            for m in &result.matches {
                let record = generation.record(&m.chunk_id);
                let paper_id = record
                    .map_or_else(|| paper_of(&m.chunk_id).to_string(), |r| r.paper_id.clone());
                let entry = papers.entry(paper_id.clone()).or_insert_with(|| PriorPaper {
                    paper_id: paper_id.clone(),
                    title: record.map(|r| r.title.clone()),
                    best_score: f32::NEG_INFINITY,
                    matched_chunks: 0,
                });
                entry.best_score = entry.best_score.max(m.score);
                if seen_in_chunk.insert(paper_id) {
                    entry.matched_chunks += 1;
                }
            }
        }
        let mut similar_papers: Vec<PriorPaper> = papers.into_values().collect();
        similar_papers.sort_by(|a, b| {
            b.best_score
                .total_cmp(&a.best_score)
                .then_with(|| a.paper_id.cmp(&b.paper_id))
        });
        similar_papers.truncate(self.config.max_prior_papers);

        NoveltyVerdict {
            novelty_score,
            flagged_chunks,
            chunks,
            similar_papers,
            degraded,
        }
    }

    /// Assess each chunk against its search result (same order) and combine.
    /// Papers and titles are resolved through `generation`, the one searched.
    pub fn score(
        &self,
        chunks: &[TextChunk],
        results: &[Result<QueryResult, SearchError>],
        generation: &IndexGeneration,
    ) -> NoveltyVerdict {
        let assessed = chunks
            .iter()
            .zip(results)
            .map(|(chunk, result)| self.assess_chunk(chunk, result.as_ref(), generation))
            .collect();
        self.verdict(assessed, results, generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::testing::record;
    use crate::index::testing::{generation, generation_with};
    use crate::similarity::ScoredChunk;

    fn chunk(ordinal: usize) -> TextChunk {
        TextChunk {
            ordinal,
            text: format!("claim {}", ordinal),
            span: Span::new(ordinal * 10, ordinal * 10 + 8),
        }
    }

    fn result(matches: &[(&str, f32)]) -> Result<QueryResult, SearchError> {
        Ok(QueryResult {
            query_chunk: String::new(),
            generation_id: 1,
            matches: matches
                .iter()
                .enumerate()
                .map(|(i, (chunk_id, score))| ScoredChunk {
                    chunk_id: chunk_id.to_string(),
                    vector_id: i as u64,
                    score: *score,
                })
                .collect(),
        })
    }

    #[test]
    fn test_worked_example() {
        let scorer = NoveltyScorer::new(NoveltyConfig::default());
        let gen = generation(1, 2, &[]);
        let chunks = vec![chunk(0), chunk(1), chunk(2)];
        let results = vec![
            result(&[("p1#0", 0.92)]),
            result(&[("p2#0", 0.40)]),
            result(&[("p3#0", 0.10)]),
        ];
        let verdict = scorer.score(&chunks, &results, &gen);
        assert_eq!(verdict.flagged_chunks, 1);
        assert!((verdict.novelty_score.unwrap() - 0.52667).abs() < 1e-4);
        assert!(!verdict.degraded);
        let labels: Vec<NoveltyLabel> = verdict.chunks.iter().map(|c| c.label).collect();
        assert_eq!(
            labels,
            vec![NoveltyLabel::NotNovel, NoveltyLabel::HighlyNovel, NoveltyLabel::HighlyNovel]
        );
        assert_eq!(verdict.similar_papers[0].paper_id, "p1");
    }

    #[test]
    fn test_near_ties_are_prior_works() {
        let scorer = NoveltyScorer::new(NoveltyConfig::default());
        let gen = generation_with(1, 2, &[(0, "known#0", vec![1.0, 0.0])], vec![record("known", 0, "text")]);

        let res = result(&[("known#0", 0.90), ("other#3", 0.895), ("third#0", 0.70)]);
        let assessed = scorer.assess_chunk(&chunk(0), res.as_ref(), &gen);
        assert_eq!(assessed.label, NoveltyLabel::NotNovel);
        assert_eq!(assessed.prior_works.len(), 2);
        assert_eq!(assessed.prior_works[0].title.as_deref(), Some("Paper known"));
        assert_eq!(assessed.prior_works[1].paper_id, "other");
        assert!(assessed.prior_works[1].title.is_none());
    }

    #[test]
    fn test_no_neighbors_is_fully_novel() {
        let scorer = NoveltyScorer::new(NoveltyConfig::default());
        let gen = generation(1, 2, &[]);
        let verdict = scorer.score(&[chunk(0)], &[result(&[])], &gen);
        assert_eq!(verdict.novelty_score, Some(1.0));
        assert_eq!(verdict.chunks[0].max_similarity, 0.0);
        assert!(verdict.similar_papers.is_empty());
    }

    #[test]
    fn test_failed_chunks_are_excluded() {
        let scorer = NoveltyScorer::new(NoveltyConfig::default());
        let gen = generation(1, 2, &[]);
        let results = vec![result(&[("p#0", 0.6)]), Err(SearchError::TimedOut)];
        let verdict = scorer.score(&[chunk(0), chunk(1)], &results, &gen);
        assert!(verdict.degraded);
        assert!((verdict.novelty_score.unwrap() - 0.4).abs() < 1e-6);
        assert_eq!(verdict.chunks[0].label, NoveltyLabel::PartiallyNovel);
        assert!(verdict.chunks[1].error.is_some());

        let all_failed = scorer.score(&[chunk(0)], &[Err(SearchError::TimedOut)], &gen);
        assert_eq!(all_failed.novelty_score, None);
    }

    #[test]
    fn test_similar_papers_take_best_score() {
        let scorer = NoveltyScorer::new(NoveltyConfig::default());
        let gen = generation(1, 2, &[]);
        let results = vec![
            result(&[("a#0", 0.7), ("a#1", 0.65), ("b#0", 0.3)]),
            result(&[("b#2", 0.8)]),
        ];
        let verdict = scorer.score(&[chunk(0), chunk(1)], &results, &gen);
        let papers: Vec<(&str, f32, usize)> = verdict
            .similar_papers
            .iter()
            .map(|p| (p.paper_id.as_str(), p.best_score, p.matched_chunks))
            .collect();
        assert_eq!(papers, vec![("b", 0.8, 2), ("a", 0.7, 1)]);
    }
}
