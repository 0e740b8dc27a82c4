use serde::Deserialize;

use super::{check_status, http_client, PaperCandidate, SourceError, SourceKind, USER_AGENT};

const BASE_URL: &str = "https://api.semanticscholar.org/graph/v1";
const FIELDS: &str = "title,authors,abstract,year,externalIds,url,openAccessPdf";

pub struct SemanticScholarClient {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl SemanticScholarClient {
    pub fn new(api_key: Option<String>) -> Result<Self, SourceError> {
        Ok(Self {
            client: http_client(USER_AGENT)?,
            api_key,
        })
    }

    fn add_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("x-api-key", key),
            None => req,
        }
    }

    pub async fn search(
        &self,
        topic: &str,
        max_results: u32,
    ) -> Result<Vec<PaperCandidate>, SourceError> {
        let url = format!("{}/paper/search", BASE_URL);
        let limit = max_results.min(100).to_string();
        let resp = self
            .add_auth(self.client.get(&url).query(&[
                ("query", topic),
                ("limit", limit.as_str()),
                ("fields", FIELDS),
            ]))
            .send()
            .await?;
        let body: S2SearchResponse = check_status(resp).await?.json().await?;
        Ok(body.data.unwrap_or_default().iter().filter_map(s2_to_candidate).collect())
    }
}

#[derive(Deserialize)]
struct S2SearchResponse {
    data: Option<Vec<S2Paper>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct S2Paper {
    paper_id: Option<String>,
    title: Option<String>,
    authors: Option<Vec<S2Author>>,
    #[serde(rename = "abstract")]
    abstract_text: Option<String>,
    year: Option<u32>,
    external_ids: Option<S2ExternalIds>,
    url: Option<String>,
    open_access_pdf: Option<S2Pdf>,
}

#[derive(Deserialize)]
struct S2Author {
    name: Option<String>,
}

#[derive(Deserialize)]
struct S2ExternalIds {
    #[serde(rename = "DOI")]
    doi: Option<String>,
    #[serde(rename = "ArXiv")]
    arxiv: Option<String>,
}

#[derive(Deserialize)]
struct S2Pdf {
    url: Option<String>,
}

fn s2_to_candidate(p: &S2Paper) -> Option<PaperCandidate> {
    let paper_id = p.paper_id.as_deref().filter(|id| !id.is_empty())?;
    let title = p.title.as_deref().map(str::trim).filter(|t| !t.is_empty())?;
    Some(PaperCandidate {
        id: format!("s2:{}", paper_id),
        title: title.to_string(),
        authors: p
            .authors
            .as_ref()
            .map(|a| a.iter().filter_map(|a| a.name.clone()).collect())
            .unwrap_or_default(),
        abstract_text: p.abstract_text.clone().filter(|a| !a.trim().is_empty()),
        year: p.year,
        source: SourceKind::SemanticScholar,
        doi: p.external_ids.as_ref().and_then(|e| e.doi.clone()),
        arxiv_id: p.external_ids.as_ref().and_then(|e| e.arxiv.clone()),
        url: p.url.clone().unwrap_or_default(),
        pdf_url: p.open_access_pdf.as_ref().and_then(|pdf| pdf.url.clone()),
    })
}
