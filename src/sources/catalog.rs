use std::path::PathBuf;

use super::{PaperCandidate, SourceError};

enum Origin {
    File(PathBuf),
    Entries(Vec<PaperCandidate>),
}

/// Offline source backed by a JSON array of [`PaperCandidate`]s, such as a
/// cached earlier fetch or a curated reading list.
pub struct CatalogSource {
    name: String,
    origin: Origin,
}

impl CatalogSource {
    /// Catalog read from `path` on every search, so edits are picked up
    /// without a restart.
    pub fn open(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            origin: Origin::File(path.into()),
        }
    }

    pub fn in_memory(name: impl Into<String>, entries: Vec<PaperCandidate>) -> Self {
        Self {
            name: name.into(),
            origin: Origin::Entries(entries),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn entries(&self) -> Result<Vec<PaperCandidate>, SourceError> {
        match &self.origin {
            Origin::Entries(entries) => Ok(entries.clone()),
            Origin::File(path) => {
                let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
                    SourceError::Unavailable(format!("catalog {:?}: {}", path, e))
                })?;
                serde_json::from_str(&raw)
                    .map_err(|e| SourceError::Parse(format!("catalog {:?}: {}", path, e)))
            }
        }
    }

    /// Entries whose title or abstract contains any topic term of three or more
    /// characters. An empty topic matches everything.
    pub async fn search(
        &self,
        topic: &str,
        max_results: u32,
    ) -> Result<Vec<PaperCandidate>, SourceError> {
        let terms: Vec<String> = topic
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .filter(|t| t.chars().count() >= 3)
            .collect();

        let matches = self
            .entries()
            .await?
            .into_iter()
            .filter(|paper| {
                if terms.is_empty() {
                    return true;
                }
                let haystack = format!(
                    "{} {}",
                    paper.title,
                    paper.abstract_text.as_deref().unwrap_or("")
                )
                .to_lowercase();
                terms.iter().any(|t| haystack.contains(t.as_str()))
            })
            .take(max_results as usize)
            .collect();
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::SourceKind;
    use tempfile::TempDir;

    fn paper(id: &str, title: &str) -> PaperCandidate {
        PaperCandidate {
            id: id.to_string(),
            title: title.to_string(),
            authors: vec!["Test Author".to_string()],
            abstract_text: None,
            year: Some(2024),
            source: SourceKind::Catalog,
            doi: None,
            arxiv_id: None,
            url: String::new(),
            pdf_url: None,
        }
    }

    #[tokio::test]
    async fn test_in_memory_topic_filter() {
        let catalog = CatalogSource::in_memory(
            "local",
            vec![
                paper("c:1", "Sparse attention kernels"),
                paper("c:2", "Protein folding"),
                paper("c:3", "Attention is all you need"),
            ],
        );
        let hits = catalog.search("Attention of", 10).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["c:1", "c:3"]);

        assert_eq!(catalog.search("", 2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_file_catalog() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("catalog.json");
        let entries = vec![paper("c:1", "Graph neural networks")];
        std::fs::write(&path, serde_json::to_string(&entries).unwrap()).unwrap();

        let catalog = CatalogSource::open("cache", &path);
        assert_eq!(catalog.name(), "cache");
        assert_eq!(catalog.search("graph", 5).await.unwrap(), entries);

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            catalog.search("graph", 5).await,
            Err(SourceError::Parse(_))
        ));

        let missing = CatalogSource::open("gone", tmp.path().join("missing.json"));
        assert!(matches!(
            missing.search("graph", 5).await,
            Err(SourceError::Unavailable(_))
        ));
    }
}
