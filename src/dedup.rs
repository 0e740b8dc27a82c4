//! Deciding whether a fetched paper is one the corpus (or the current fetch)
//! already has.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::corpus::ChunkRecord;
use crate::fingerprint::{hamming_distance, simhash};
use crate::sources::PaperCandidate;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Normalized Levenshtein similarity at or above which two titles match.
    pub title_similarity: f64,
    /// Maximum SimHash Hamming distance for two abstracts to match.
    pub abstract_max_hamming: u32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            title_similarity: 0.9,
            abstract_max_hamming: 3,
        }
    }
}

pub fn normalize_doi(doi: &str) -> Option<String> {
    let lower = doi.trim().to_lowercase();
    let bare = ["https://doi.org/", "http://doi.org/", "https://dx.doi.org/", "doi:"]
        .iter()
        .find_map(|prefix| lower.strip_prefix(prefix))
        .unwrap_or(&lower)
        .trim();
    (!bare.is_empty()).then(|| bare.to_string())
}

/// `arXiv:2301.12345v2` and `2301.12345` name the same paper.
pub fn normalize_arxiv_id(id: &str) -> Option<String> {
    let lower = id.trim().to_lowercase();
    let bare = lower.strip_prefix("arxiv:").unwrap_or(&lower).trim();
    let unversioned = match bare.rfind('v') {
        Some(pos) if pos + 1 < bare.len() && bare[pos + 1..].chars().all(|c| c.is_ascii_digit()) => {
            &bare[..pos]
        }
        _ => bare,
    };
    (!unversioned.is_empty()).then(|| unversioned.to_string())
}

/// Lowercase, punctuation dropped, whitespace collapsed.
pub fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lowercased surname, taken as the last word of the name.
pub fn author_key(name: &str) -> Option<String> {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '-')
        .collect();
    cleaned.split_whitespace().last().map(|s| s.to_lowercase())
}

/// Normalized external identifiers (`doi:...`, `arxiv:...`) of a candidate.
pub fn identifiers(candidate: &PaperCandidate) -> Vec<String> {
    let mut ids = Vec::new();
    if let Some(doi) = candidate.doi.as_deref().and_then(normalize_doi) {
        ids.push(format!("doi:{}", doi));
    }
    if let Some(arxiv) = candidate.arxiv_id.as_deref().and_then(normalize_arxiv_id) {
        ids.push(format!("arxiv:{}", arxiv));
    }
    ids
}

/// The corpus-wide paper id: DOI first, then arXiv id, then the source id.
pub fn canonical_paper_id(candidate: &PaperCandidate) -> String {
    identifiers(candidate)
        .into_iter()
        .next()
        .unwrap_or_else(|| candidate.id.trim().to_lowercase())
}

pub fn abstract_fingerprint(candidate: &PaperCandidate) -> Option<u64> {
    simhash(candidate.abstract_text.as_deref()?)
}

#[derive(Debug, Clone)]
pub struct PaperFingerprint {
    pub identifiers: Vec<String>,
    pub title: String,
    pub authors: HashSet<String>,
    pub abstract_hash: Option<u64>,
}

impl PaperFingerprint {
    pub fn from_candidate(candidate: &PaperCandidate) -> Self {
        Self {
            identifiers: identifiers(candidate),
            title: normalize_title(&candidate.title),
            authors: candidate.authors.iter().filter_map(|a| author_key(a)).collect(),
            abstract_hash: abstract_fingerprint(candidate),
        }
    }

    pub fn from_record(record: &ChunkRecord) -> Self {
        Self {
            identifiers: record.identifiers.clone(),
            title: normalize_title(&record.title),
            authors: record.authors.iter().filter_map(|a| author_key(a)).collect(),
            abstract_hash: record.abstract_simhash,
        }
    }

    fn shares_author(&self, other: &PaperFingerprint) -> bool {
        !self.authors.is_disjoint(&other.authors)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DedupVerdict {
    Unique,
    SameIdentifier { existing: String, identifier: String },
    SimilarTitle { existing: String, similarity: f64 },
    SimilarAbstract { existing: String, distance: u32 },
}

impl DedupVerdict {
    pub fn is_duplicate(&self) -> bool {
        !matches!(self, DedupVerdict::Unique)
    }

    /// The known paper this one duplicates.
    pub fn existing(&self) -> Option<&str> {
        match self {
            DedupVerdict::Unique => None,
            DedupVerdict::SameIdentifier { existing, .. }
            | DedupVerdict::SimilarTitle { existing, .. }
            | DedupVerdict::SimilarAbstract { existing, .. } => Some(existing),
        }
    }
}

/// Fingerprints of every known paper, checked before a candidate is accepted.
#[derive(Debug, Default)]
pub struct DedupIndex {
    by_identifier: HashMap<String, String>,
    papers: Vec<(String, PaperFingerprint)>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from corpus records; one fingerprint per paper.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a ChunkRecord>) -> Self {
        let mut index = Self::new();
        let mut seen = HashSet::new();
        for record in records {
            if seen.insert(record.paper_id.clone()) {
                index.insert(&record.paper_id, PaperFingerprint::from_record(record));
            }
        }
        index
    }

    pub fn len(&self) -> usize {
        self.papers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.papers.is_empty()
    }

    pub fn check(&self, fp: &PaperFingerprint, config: &DedupConfig) -> DedupVerdict {
        for id in &fp.identifiers {
            if let Some(existing) = self.by_identifier.get(id) {
                return DedupVerdict::SameIdentifier {
                    existing: existing.clone(),
                    identifier: id.clone(),
                };
            }
        }

        for (paper_id, known) in &self.papers {
            if !fp.shares_author(known) {
                continue;
            }
            if !fp.title.is_empty() && !known.title.is_empty() {
                let similarity = strsim::normalized_levenshtein(&fp.title, &known.title);
                if similarity >= config.title_similarity {
                    return DedupVerdict::SimilarTitle {
                        existing: paper_id.clone(),
                        similarity,
                    };
                }
            }
            if let (Some(a), Some(b)) = (fp.abstract_hash, known.abstract_hash) {
                let distance = hamming_distance(a, b);
                if distance <= config.abstract_max_hamming {
                    return DedupVerdict::SimilarAbstract {
                        existing: paper_id.clone(),
                        distance,
                    };
                }
            }
        }
        DedupVerdict::Unique
    }

    pub fn insert(&mut self, paper_id: &str, fp: PaperFingerprint) {
        for id in &fp.identifiers {
            self.by_identifier
                .entry(id.clone())
                .or_insert_with(|| paper_id.to_string());
        }
        self.by_identifier
            .entry(paper_id.to_string())
            .or_insert_with(|| paper_id.to_string());
        self.papers.push((paper_id.to_string(), fp));
    }

    pub fn contains_paper(&self, paper_id: &str) -> bool {
        self.by_identifier.contains_key(paper_id)
    }
}
