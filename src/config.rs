use std::path::PathBuf;
use std::sync::Arc;

use crate::builder::BuildConfig;
use crate::deep_search::DeepSearchConfig;
use crate::embed::hashing::{self, HashingEmbedder};
use crate::embed::EmbeddingProvider;
use crate::review::ReviewConfig;
use crate::sources::{
    ArxivClient, CatalogSource, CrossRefClient, PaperSource, SemanticScholarClient,
};

const DEFAULT_SOURCES: &[&str] = &["arxiv", "semantic_scholar", "crossref"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedderKind {
    Hashing,
    Onnx,
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub semantic_scholar_api_key: Option<String>,
    pub crossref_mailto: Option<String>,
    pub catalog_path: Option<PathBuf>,
    /// Enabled sources, in the order Deep Search queries them.
    pub source_names: Vec<String>,
    pub embedder: EmbedderKind,
    pub embedding_dim: usize,
    pub model_dir: PathBuf,
    pub novelty_threshold: Option<f32>,
    pub plagiarism_threshold: Option<f32>,
    pub incremental_threshold: Option<usize>,
    pub review_timeout_secs: Option<u64>,
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: Option<String>) -> Option<T> {
    let raw = raw?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring {}={:?}: not a valid value", name, raw);
            None
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("PAPER_REVIEW_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| home_or_default(&var).join(".paper-review"));

        let source_names = var("PAPER_REVIEW_SOURCES")
            .map(|s| {
                s.split(',')
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|names| !names.is_empty())
            .unwrap_or_else(|| DEFAULT_SOURCES.iter().map(|s| s.to_string()).collect());

        let embedder = match var("PAPER_REVIEW_EMBEDDER").as_deref().map(str::trim) {
            Some("onnx") => EmbedderKind::Onnx,
            Some("hashing") | None => EmbedderKind::Hashing,
            Some(other) => {
                tracing::warn!("Unknown PAPER_REVIEW_EMBEDDER {:?}, using hashing", other);
                EmbedderKind::Hashing
            }
        };

        let model_dir = var("PAPER_REVIEW_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("models"));

        Self {
            semantic_scholar_api_key: var("SEMANTIC_SCHOLAR_API_KEY"),
            crossref_mailto: var("CROSSREF_MAILTO"),
            catalog_path: var("PAPER_REVIEW_CATALOG").map(PathBuf::from),
            source_names,
            embedder,
            embedding_dim: parse_var("PAPER_REVIEW_EMBEDDING_DIM", var("PAPER_REVIEW_EMBEDDING_DIM"))
                .unwrap_or(hashing::DEFAULT_DIMENSION),
            model_dir,
            novelty_threshold: parse_var(
                "PAPER_REVIEW_NOVELTY_THRESHOLD",
                var("PAPER_REVIEW_NOVELTY_THRESHOLD"),
            ),
            plagiarism_threshold: parse_var(
                "PAPER_REVIEW_PLAGIARISM_THRESHOLD",
                var("PAPER_REVIEW_PLAGIARISM_THRESHOLD"),
            ),
            incremental_threshold: parse_var(
                "PAPER_REVIEW_INCREMENTAL_THRESHOLD",
                var("PAPER_REVIEW_INCREMENTAL_THRESHOLD"),
            ),
            review_timeout_secs: parse_var(
                "PAPER_REVIEW_REVIEW_TIMEOUT_SECS",
                var("PAPER_REVIEW_REVIEW_TIMEOUT_SECS"),
            ),
            data_dir,
        }
    }

    pub fn corpus_dir(&self) -> PathBuf {
        self.data_dir.join("corpus")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join("index")
    }

    pub fn review_config(&self) -> ReviewConfig {
        let mut config = ReviewConfig::default();
        if let Some(threshold) = self.novelty_threshold {
            config.novelty.novelty_threshold = threshold;
        }
        if let Some(threshold) = self.plagiarism_threshold {
            config.plagiarism.semantic_threshold = threshold;
        }
        if let Some(secs) = self.review_timeout_secs {
            config.timeout_secs = secs;
        }
        config
    }

    pub fn build_config(&self) -> BuildConfig {
        let mut config = BuildConfig::default();
        if let Some(threshold) = self.incremental_threshold {
            config.incremental_threshold = threshold;
        }
        config
    }

    pub fn deep_search_config(&self) -> DeepSearchConfig {
        let review = self.review_config();
        DeepSearchConfig {
            chunking: review.chunking,
            dedup: review.dedup,
            ..Default::default()
        }
    }

    /// Build the enabled paper sources, in priority order.
    pub fn build_sources(&self) -> Vec<PaperSource> {
        let mut sources = Vec::new();
        for name in &self.source_names {
            let source = match name.as_str() {
                "arxiv" => ArxivClient::new().map(PaperSource::Arxiv),
                "semantic_scholar" => SemanticScholarClient::new(
                    self.semantic_scholar_api_key.clone(),
                )
                .map(PaperSource::SemanticScholar),
                "crossref" => CrossRefClient::new(self.crossref_mailto.as_deref())
                    .map(PaperSource::CrossRef),
                "catalog" => match &self.catalog_path {
                    Some(path) => Ok(PaperSource::Catalog(CatalogSource::open("catalog", path))),
                    None => {
                        tracing::warn!("Catalog source disabled: PAPER_REVIEW_CATALOG not set");
                        continue;
                    }
                },
                other => {
                    tracing::warn!("Unknown paper source {:?} in PAPER_REVIEW_SOURCES", other);
                    continue;
                }
            };
            match source {
                Ok(source) => sources.push(source),
                Err(e) => tracing::warn!("Failed to initialize source {}: {}", name, e),
            }
        }

        // A configured catalog is always consulted, after the network sources.
        if let Some(path) = &self.catalog_path {
            if !self.source_names.iter().any(|n| n == "catalog") {
                sources.push(PaperSource::Catalog(CatalogSource::open("catalog", path)));
            }
        }
        sources
    }

    pub async fn build_embedder(&self) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
        match self.embedder {
            EmbedderKind::Hashing => Ok(Arc::new(HashingEmbedder::new(self.embedding_dim))),
            EmbedderKind::Onnx => self.build_onnx().await,
        }
    }

    #[cfg(feature = "onnx")]
    async fn build_onnx(&self) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
        use crate::embed::onnx::{download_model, OnnxEmbedder};
        use anyhow::Context;

        download_model(&self.model_dir)
            .await
            .context("Failed to fetch the ONNX model")?;
        let embedder = OnnxEmbedder::new(&self.model_dir)
            .with_context(|| format!("Failed to load ONNX model from {:?}", self.model_dir))?;
        Ok(Arc::new(embedder))
    }

    #[cfg(not(feature = "onnx"))]
    async fn build_onnx(&self) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
        anyhow::bail!("PAPER_REVIEW_EMBEDDER=onnx needs a build with the `onnx` feature")
    }

    /// Return a list of source status descriptions.
    pub fn source_status(&self) -> Vec<SourceStatus> {
        let position = |name: &str| self.source_names.iter().position(|n| n == name);
        let catalog_priority = position("catalog").or(self
            .catalog_path
            .as_ref()
            .map(|_| self.source_names.len()));

        let mut statuses = vec![
            SourceStatus { name: "arxiv".into(), enabled: true, priority: position("arxiv"),
                note: "No API key required".into() },
            SourceStatus { name: "semantic_scholar".into(), enabled: true, priority: position("semantic_scholar"),
                note: if self.semantic_scholar_api_key.is_some() { "API key set".into() } else { "No API key (rate limited)".into() } },
            SourceStatus { name: "crossref".into(), enabled: true, priority: position("crossref"),
                note: if self.crossref_mailto.is_some() { "Polite pool email set".into() } else { "No mailto (public pool)".into() } },
            SourceStatus { name: "catalog".into(), enabled: self.catalog_path.is_some(), priority: catalog_priority,
                note: match &self.catalog_path {
                    Some(path) => format!("Local catalog at {}", path.display()),
                    None => "Disabled: PAPER_REVIEW_CATALOG not set".into(),
                } },
        ];

        for s in &mut statuses {
            if s.priority.is_none() && s.enabled {
                s.enabled = false;
                s.note = "Disabled by PAPER_REVIEW_SOURCES filter".into();
            }
        }
        statuses.sort_by_key(|s| s.priority.unwrap_or(usize::MAX));
        statuses
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub enabled: bool,
    /// Position in the Deep Search order, when enabled.
    pub priority: Option<usize>,
    pub note: String,
}

fn home_or_default(var: &impl Fn(&str) -> Option<String>) -> PathBuf {
    var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(move |key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[("HOME", "/home/reviewer")]);
        assert_eq!(config.data_dir, PathBuf::from("/home/reviewer/.paper-review"));
        assert_eq!(config.corpus_dir(), PathBuf::from("/home/reviewer/.paper-review/corpus"));
        assert_eq!(config.model_dir, PathBuf::from("/home/reviewer/.paper-review/models"));
        assert_eq!(config.source_names, vec!["arxiv", "semantic_scholar", "crossref"]);
        assert_eq!(config.embedder, EmbedderKind::Hashing);
        assert_eq!(config.embedding_dim, hashing::DEFAULT_DIMENSION);
        assert!(config.review_config().validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("PAPER_REVIEW_DATA_DIR", "/srv/review"),
            ("PAPER_REVIEW_SOURCES", "CrossRef, catalog ,arxiv"),
            ("PAPER_REVIEW_CATALOG", "/srv/catalog.json"),
            ("PAPER_REVIEW_EMBEDDING_DIM", "128"),
            ("PAPER_REVIEW_NOVELTY_THRESHOLD", "0.8"),
            ("PAPER_REVIEW_PLAGIARISM_THRESHOLD", "0.95"),
            ("PAPER_REVIEW_INCREMENTAL_THRESHOLD", "64"),
            ("PAPER_REVIEW_REVIEW_TIMEOUT_SECS", "not-a-number"),
        ]);
        assert_eq!(config.index_dir(), PathBuf::from("/srv/review/index"));
        assert_eq!(config.source_names, vec!["crossref", "catalog", "arxiv"]);
        assert_eq!(config.embedding_dim, 128);

        let review = config.review_config();
        assert_eq!(review.novelty.novelty_threshold, 0.8);
        assert_eq!(review.plagiarism.semantic_threshold, 0.95);
        assert_eq!(review.timeout_secs, ReviewConfig::default().timeout_secs);
        assert_eq!(config.build_config().incremental_threshold, 64);

        let sources = config.build_sources();
        let kinds: Vec<&str> = sources.iter().map(|s| s.name()).collect();
        assert_eq!(kinds, vec!["crossref", "catalog", "arxiv"]);
    }

    #[test]
    fn test_source_status_follows_priority() {
        let config = config(&[("PAPER_REVIEW_SOURCES", "crossref,arxiv")]);
        let statuses = config.source_status();
        let names: Vec<(&str, bool)> = statuses.iter().map(|s| (s.name.as_str(), s.enabled)).collect();
        assert_eq!(
            names,
            vec![("crossref", true), ("arxiv", true), ("semantic_scholar", false), ("catalog", false)]
        );
        assert_eq!(statuses[2].note, "Disabled by PAPER_REVIEW_SOURCES filter");
    }

    #[test]
    fn test_catalog_is_appended_when_not_listed() {
        let config = config(&[
            ("PAPER_REVIEW_SOURCES", "arxiv"),
            ("PAPER_REVIEW_CATALOG", "/tmp/catalog.json"),
        ]);
        let sources = config.build_sources();
        let kinds: Vec<&str> = sources.iter().map(|s| s.name()).collect();
        assert_eq!(kinds, vec!["arxiv", "catalog"]);
        let catalog = config.source_status().into_iter().find(|s| s.name == "catalog").unwrap();
        assert!(catalog.enabled);
        assert_eq!(catalog.priority, Some(1));
    }

    #[tokio::test]
    async fn test_hashing_embedder_uses_configured_dimension() {
        let config = config(&[("PAPER_REVIEW_EMBEDDING_DIM", "32")]);
        let embedder = config.build_embedder().await.unwrap();
        assert_eq!(embedder.dimension(), 32);
    }
}
