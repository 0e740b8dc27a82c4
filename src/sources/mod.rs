pub mod arxiv;
pub mod catalog;
pub mod crossref;
pub mod semantic_scholar;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use arxiv::ArxivClient;
pub use catalog::CatalogSource;
pub use crossref::CrossRefClient;
pub use semantic_scholar::SemanticScholarClient;

pub(crate) const USER_AGENT: &str = "paper-review/0.1";

/// Where a paper (and therefore every chunk derived from it) came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Arxiv,
    SemanticScholar,
    Crossref,
    Catalog,
    /// Ingested directly, not fetched.
    Local,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Arxiv => "arxiv",
            SourceKind::SemanticScholar => "semantic_scholar",
            SourceKind::Crossref => "crossref",
            SourceKind::Catalog => "catalog",
            SourceKind::Local => "local",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "arxiv" => Some(SourceKind::Arxiv),
            "semantic_scholar" => Some(SourceKind::SemanticScholar),
            "crossref" => Some(SourceKind::Crossref),
            "catalog" => Some(SourceKind::Catalog),
            "local" => Some(SourceKind::Local),
            _ => None,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Candidate paper metadata, the common shape every source returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperCandidate {
    /// Source-native id with prefix (`arxiv:2301.12345v1`, `s2:abc`, `doi:10.1/x`).
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub abstract_text: Option<String>,
    #[serde(default)]
    pub year: Option<u32>,
    pub source: SourceKind,
    #[serde(default)]
    pub doi: Option<String>,
    #[serde(default)]
    pub arxiv_id: Option<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub pdf_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("Source unavailable: {0}")]
    Unavailable(String),
}

impl SourceError {
    /// Failures worth retrying with backoff: transport errors, rate limiting
    /// and server-side errors. Parse errors and 4xx responses are not.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            SourceError::Api { status, .. } => *status == 429 || *status >= 500,
            SourceError::Unavailable(_) => true,
            SourceError::Parse(_) => false,
        }
    }
}

/// Turn a non-success HTTP status into [`SourceError::Api`].
pub(crate) async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, SourceError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(SourceError::Api {
        status: status.as_u16(),
        message: body.chars().take(200).collect(),
    })
}

pub(crate) fn http_client(user_agent: &str) -> Result<reqwest::Client, SourceError> {
    Ok(reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(std::time::Duration::from_secs(30))
        .build()?)
}

/// The fixed set of external paper sources. Adding a source means adding a
/// variant; every variant returns [`PaperCandidate`]s.
pub enum PaperSource {
    Arxiv(ArxivClient),
    SemanticScholar(SemanticScholarClient),
    CrossRef(CrossRefClient),
    Catalog(CatalogSource),
}

impl PaperSource {
    pub fn name(&self) -> &str {
        match self {
            PaperSource::Arxiv(_) => "arxiv",
            PaperSource::SemanticScholar(_) => "semantic_scholar",
            PaperSource::CrossRef(_) => "crossref",
            PaperSource::Catalog(c) => c.name(),
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            PaperSource::Arxiv(_) => SourceKind::Arxiv,
            PaperSource::SemanticScholar(_) => SourceKind::SemanticScholar,
            PaperSource::CrossRef(_) => SourceKind::Crossref,
            PaperSource::Catalog(_) => SourceKind::Catalog,
        }
    }

    pub async fn search(
        &self,
        topic: &str,
        max_results: u32,
    ) -> Result<Vec<PaperCandidate>, SourceError> {
        match self {
            PaperSource::Arxiv(c) => c.search(topic, max_results).await,
            PaperSource::SemanticScholar(c) => c.search(topic, max_results).await,
            PaperSource::CrossRef(c) => c.search(topic, max_results).await,
            PaperSource::Catalog(c) => c.search(topic, max_results).await,
        }
    }
}

impl fmt::Debug for PaperSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PaperSource").field(&self.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let rate_limited = SourceError::Api { status: 429, message: String::new() };
        let server = SourceError::Api { status: 503, message: String::new() };
        let not_found = SourceError::Api { status: 404, message: String::new() };
        assert!(rate_limited.is_transient());
        assert!(server.is_transient());
        assert!(!not_found.is_transient());
        assert!(!SourceError::Parse("bad".into()).is_transient());
    }

    #[test]
    fn test_source_kind_roundtrip_names() {
        for kind in [
            SourceKind::Arxiv,
            SourceKind::SemanticScholar,
            SourceKind::Crossref,
            SourceKind::Catalog,
            SourceKind::Local,
        ] {
            assert_eq!(SourceKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(SourceKind::parse("vixra"), None);
    }
}
