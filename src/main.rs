use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use rmcp::{
    handler::server::tool::ToolRouter, handler::server::wrapper::Parameters,
    model::*, tool, tool_handler, tool_router,
    transport::stdio, ErrorData as McpError, ServerHandler, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

mod builder;
mod chunking;
mod config;
mod corpus;
mod deep_search;
mod dedup;
mod embed;
mod fingerprint;
mod index;
mod novelty;
mod plagiarism;
mod review;
mod similarity;
mod sources;

use builder::IndexBuilder;
use config::Config;
use corpus::CorpusStore;
use deep_search::{DeepSearcher, PaperText};
use index::{GenerationRegistry, GenerationStore};
use review::{ReferenceEntry, Reviewer, Submission};
use similarity::SimilarityEngine;
use sources::SourceKind;

// ── Parameter structs ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct DeepSearchParams {
    #[schemars(description = "Topic to search external sources for")]
    topic: String,
    #[schemars(description = "Maximum new papers to add (default 10, max 50)")]
    max_papers: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct IngestPaperParams {
    #[schemars(description = "Paper ID; doi:ID and arxiv:ID are treated as external identifiers")]
    paper_id: String,
    #[schemars(description = "Paper title")]
    title: String,
    #[schemars(description = "Author names")]
    authors: Option<Vec<String>>,
    #[schemars(description = "Plain text of the paper")]
    text: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SearchSimilarParams {
    #[schemars(description = "Query text to find similar corpus passages")]
    query: String,
    #[schemars(description = "Maximum results (default 10, max 100)")]
    limit: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ReviewPaperParams {
    #[schemars(description = "Plain text of the submission")]
    text: String,
    #[schemars(description = "Submission title")]
    title: Option<String>,
    #[schemars(description = "References cited by the submission")]
    references: Option<Vec<ReferenceEntry>>,
    #[schemars(description = "Review deadline in seconds (default from PAPER_REVIEW_REVIEW_TIMEOUT_SECS)")]
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct PrunePaperParams {
    #[schemars(description = "Paper ID to remove from the corpus")]
    paper_id: String,
}

#[derive(Debug, Serialize)]
struct SimilarPassage {
    chunk_id: String,
    paper_id: String,
    title: Option<String>,
    score: f32,
    text: Option<String>,
}

fn to_json<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("Serialization error: {}", e), None))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

/// `doi:` and `arxiv:` ids map to the same normalized identifiers fetched
/// papers carry, so later Deep Searches recognise the paper.
fn local_paper_id(raw: &str) -> (String, Vec<String>) {
    let raw = raw.trim();
    let lower = raw.to_lowercase();
    let normalized = if let Some(doi) = lower.strip_prefix("doi:").and_then(dedup::normalize_doi) {
        Some(format!("doi:{}", doi))
    } else {
        lower
            .strip_prefix("arxiv:")
            .and_then(dedup::normalize_arxiv_id)
            .map(|id| format!("arxiv:{}", id))
    };
    match normalized {
        Some(id) => (id.clone(), vec![id]),
        None => (raw.to_string(), Vec::new()),
    }
}

// ── Server ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ReviewServer {
    tool_router: ToolRouter<Self>,
    config: Arc<Config>,
    corpus: Arc<CorpusStore>,
    builder: IndexBuilder,
    engine: SimilarityEngine,
    searcher: Arc<DeepSearcher>,
    reviewer: Arc<Reviewer>,
}

#[tool_router]
impl ReviewServer {
    pub async fn create() -> anyhow::Result<Self> {
        let config = Config::from_env();
        let embedder = config.build_embedder().await?;
        let sources = config.build_sources();

        tracing::info!(
            "Initialized {} paper sources, embedder={}, data_dir={}",
            sources.len(),
            embedder.model_id(),
            config.data_dir.display()
        );

        let corpus = Arc::new(
            CorpusStore::open(&config.corpus_dir())
                .await
                .context("Failed to open corpus store")?,
        );
        let registry = Arc::new(GenerationRegistry::new());
        let builder = IndexBuilder::new(
            corpus.clone(),
            embedder.clone(),
            registry.clone(),
            Some(GenerationStore::new(config.index_dir())),
            config.build_config(),
        );
        let restored = builder.restore().await.context("Failed to restore index")?;
        match &restored.fallback_reason {
            Some(reason) => tracing::warn!("Persisted index not reused: {}", reason),
            None => tracing::info!(
                "Index ready: generation {:?}, {} vectors",
                restored.build.generation_id,
                restored.build.vector_count
            ),
        }

        let engine = SimilarityEngine::new(embedder);
        let reviewer = Reviewer::new(
            engine.clone(),
            corpus.clone(),
            registry,
            config.review_config(),
        )
        .context("Invalid review configuration")?;
        let searcher = DeepSearcher::new(
            sources,
            corpus.clone(),
            Some(builder.clone()),
            config.deep_search_config(),
        );

        Ok(Self {
            tool_router: Self::tool_router(),
            config: Arc::new(config),
            corpus,
            builder,
            engine,
            searcher: Arc::new(searcher),
            reviewer: Arc::new(reviewer),
        })
    }

    #[tool(description = "List paper sources used by deep_search, in priority order, and their status")]
    async fn list_sources(&self) -> Result<CallToolResult, McpError> {
        to_json(&self.config.source_status())
    }

    #[tool(description = "Show the current index generation, corpus size and the last build report")]
    async fn index_status(&self) -> Result<CallToolResult, McpError> {
        let status = serde_json::json!({
            "generation": self.builder.registry().current().map(|g| g.info()),
            "corpus_chunks": self.corpus.len(),
            "corpus_papers": self.corpus.paper_count(),
            "building": self.builder.is_building(),
            "builds_completed": self.builder.builds_completed(),
            "last_build": self.builder.last_report(),
        });
        to_json(&status)
    }

    #[tool(description = "Fetch new papers on a topic from external sources, skip duplicates, add them to the corpus and schedule an index rebuild")]
    async fn deep_search(
        &self,
        Parameters(params): Parameters<DeepSearchParams>,
    ) -> Result<CallToolResult, McpError> {
        let max = params.max_papers.unwrap_or(10).min(50) as usize;
        let outcome = self
            .searcher
            .run(&params.topic, max)
            .await
            .map_err(|e| McpError::invalid_params(e.to_string(), None))?;
        to_json(&outcome)
    }

    #[tool(description = "Add a paper's plain text to the corpus and schedule an index rebuild")]
    async fn ingest_paper(
        &self,
        Parameters(params): Parameters<IngestPaperParams>,
    ) -> Result<CallToolResult, McpError> {
        let (paper_id, identifiers) = local_paper_id(&params.paper_id);
        if paper_id.is_empty() || params.text.trim().is_empty() {
            return Err(McpError::invalid_params(
                "paper_id and text must not be empty".to_string(),
                None,
            ));
        }
        if self.corpus.exists(&paper_id) {
            return Ok(CallToolResult::success(vec![Content::text(format!(
                "Already in corpus: {}",
                paper_id
            ))]));
        }

        let authors = params.authors.unwrap_or_default();
        let records = PaperText {
            paper_id: &paper_id,
            source: SourceKind::Local,
            title: params.title.trim(),
            authors: &authors,
            body: &params.text,
            identifiers,
            abstract_simhash: None,
        }
        .into_records(&self.searcher.config().chunking, Utc::now());

        let outcome = self
            .corpus
            .append(records)
            .await
            .map_err(|e| McpError::internal_error(format!("Ingest failed: {}", e), None))?;
        self.builder.request_rebuild();

        Ok(CallToolResult::success(vec![Content::text(format!(
            "Ingested: {} - {} ({} chunks, rebuild scheduled)",
            paper_id, params.title, outcome.accepted
        ))]))
    }

    #[tool(description = "Rebuild the index from the corpus now and report the build")]
    async fn rebuild_index(&self) -> Result<CallToolResult, McpError> {
        let report = self
            .builder
            .rebuild_now()
            .await
            .map_err(|e| McpError::internal_error(format!("Rebuild failed: {}", e), None))?;
        to_json(&report)
    }

    #[tool(description = "Find corpus passages semantically similar to the query text")]
    async fn search_similar(
        &self,
        Parameters(params): Parameters<SearchSimilarParams>,
    ) -> Result<CallToolResult, McpError> {
        let limit = params.limit.unwrap_or(10).min(100) as usize;
        let generation = self.builder.registry().current().ok_or_else(|| {
            McpError::internal_error("No index generation published yet".to_string(), None)
        })?;

        let result = self
            .engine
            .search(&params.query, limit, &generation)
            .await
            .map_err(|e| McpError::internal_error(format!("Similarity search failed: {}", e), None))?;

        let passages: Vec<SimilarPassage> = result
            .matches
            .into_iter()
            .map(|m| {
                let record = generation.record(&m.chunk_id);
                SimilarPassage {
                    paper_id: record
                        .map_or_else(|| novelty::paper_of(&m.chunk_id).to_string(), |r| r.paper_id.clone()),
                    title: record.map(|r| r.title.clone()),
                    text: record.map(|r| r.text.clone()),
                    chunk_id: m.chunk_id,
                    score: m.score,
                }
            })
            .collect();
        to_json(&serde_json::json!({
            "generation_id": result.generation_id,
            "results": passages,
        }))
    }

    #[tool(description = "Review a submission's plain text for novelty and plagiarism against the indexed corpus")]
    async fn review_paper(
        &self,
        Parameters(params): Parameters<ReviewPaperParams>,
    ) -> Result<CallToolResult, McpError> {
        let submission = Submission {
            title: params.title,
            text: params.text,
            references: params.references.unwrap_or_default(),
        };
        let timeout = params
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.reviewer.config().timeout());

        let report = self
            .reviewer
            .review_with_timeout(&submission, timeout)
            .await
            .map_err(|e| match e {
                review::ReviewError::EmptySubmission => McpError::invalid_params(e.to_string(), None),
                _ => McpError::internal_error(format!("Review failed: {}", e), None),
            })?;
        to_json(&report)
    }

    #[tool(description = "Remove a paper and all its chunks from the corpus and schedule an index rebuild")]
    async fn prune_paper(
        &self,
        Parameters(params): Parameters<PrunePaperParams>,
    ) -> Result<CallToolResult, McpError> {
        let (paper_id, _) = local_paper_id(&params.paper_id);
        let removed = self
            .corpus
            .prune_paper(&paper_id)
            .await
            .map_err(|e| McpError::internal_error(format!("Prune failed: {}", e), None))?;
        if removed > 0 {
            self.builder.request_rebuild();
        }
        Ok(CallToolResult::success(vec![Content::text(format!(
            "Removed {} chunks of {}",
            removed, paper_id
        ))]))
    }
}

#[tool_handler]
impl ServerHandler for ReviewServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Review paper submissions for novelty and plagiarism against a local \
                 corpus of prior work. Grow the corpus with deep_search (arXiv, \
                 Semantic Scholar, CrossRef) or ingest_paper; the vector index is \
                 rebuilt in the background and reviews always run against one \
                 consistent index generation."
                    .into(),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("Starting paper-review MCP server");

    let server = ReviewServer::create().await?;
    let service = server.serve(stdio()).await?;
    service.waiting().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_paper_id() {
        assert_eq!(
            local_paper_id(" DOI:https://doi.org/10.1000/XYZ "),
            ("doi:10.1000/xyz".to_string(), vec!["doi:10.1000/xyz".to_string()])
        );
        assert_eq!(
            local_paper_id("arXiv:2301.12345v2"),
            ("arxiv:2301.12345".to_string(), vec!["arxiv:2301.12345".to_string()])
        );
        assert_eq!(local_paper_id("Thesis-2024"), ("Thesis-2024".to_string(), Vec::new()));
    }
}
