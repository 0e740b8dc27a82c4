use scraper::Html;
use serde::Deserialize;

use super::{check_status, http_client, PaperCandidate, SourceError, SourceKind, USER_AGENT};

const BASE_URL: &str = "https://api.crossref.org/works";
const SELECT: &str = "DOI,title,author,published,abstract,link,URL";

pub struct CrossRefClient {
    client: reqwest::Client,
}

impl CrossRefClient {
    /// `mailto` puts requests in CrossRef's polite pool.
    pub fn new(mailto: Option<&str>) -> Result<Self, SourceError> {
        let user_agent = match mailto {
            Some(email) => format!("{} (mailto:{})", USER_AGENT, email),
            None => USER_AGENT.to_string(),
        };
        Ok(Self {
            client: http_client(&user_agent)?,
        })
    }

    pub async fn search(
        &self,
        topic: &str,
        max_results: u32,
    ) -> Result<Vec<PaperCandidate>, SourceError> {
        let rows = max_results.min(100).to_string();
        let resp = self
            .client
            .get(BASE_URL)
            .query(&[("query", topic), ("rows", rows.as_str()), ("select", SELECT)])
            .send()
            .await?;
        let body: CRResponse = check_status(resp).await?.json().await?;
        Ok(body.message.items.unwrap_or_default().iter().filter_map(item_to_candidate).collect())
    }
}

#[derive(Deserialize)]
struct CRResponse {
    message: CRMessage,
}

#[derive(Deserialize)]
struct CRMessage {
    items: Option<Vec<CRItem>>,
}

#[derive(Deserialize)]
struct CRItem {
    #[serde(rename = "DOI")]
    doi: Option<String>,
    title: Option<Vec<String>>,
    author: Option<Vec<CRAuthor>>,
    published: Option<CRDate>,
    #[serde(rename = "abstract")]
    abstract_text: Option<String>,
    link: Option<Vec<CRLink>>,
    #[serde(rename = "URL")]
    url: Option<String>,
}

#[derive(Deserialize)]
struct CRAuthor {
    given: Option<String>,
    family: Option<String>,
}

#[derive(Deserialize)]
struct CRDate {
    #[serde(rename = "date-parts")]
    date_parts: Option<Vec<Vec<u32>>>,
}

#[derive(Deserialize)]
struct CRLink {
    #[serde(rename = "URL")]
    url: Option<String>,
    #[serde(rename = "content-type")]
    content_type: Option<String>,
}

/// CrossRef abstracts arrive as JATS XML (`<jats:p>...</jats:p>`); keep the text only.
fn strip_markup(fragment: &str) -> String {
    let html = Html::parse_fragment(fragment);
    let text: Vec<&str> = html.root_element().text().collect();
    text.join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn item_to_candidate(item: &CRItem) -> Option<PaperCandidate> {
    let doi = item.doi.as_deref().filter(|d| !d.is_empty())?;
    let title = item
        .title
        .as_ref()
        .and_then(|t| t.first())
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())?;
    let authors = item
        .author
        .as_ref()
        .map(|a| {
            a.iter()
                .map(|a| {
                    format!("{} {}", a.given.as_deref().unwrap_or(""), a.family.as_deref().unwrap_or(""))
                        .trim()
                        .to_string()
                })
                .filter(|name| !name.is_empty())
                .collect()
        })
        .unwrap_or_default();
    let year = item
        .published
        .as_ref()
        .and_then(|d| d.date_parts.as_ref())
        .and_then(|p| p.first())
        .and_then(|p| p.first())
        .copied();
    let pdf_url = item
        .link
        .as_ref()
        .and_then(|links| {
            links
                .iter()
                .find(|l| l.content_type.as_deref() == Some("application/pdf"))
        })
        .and_then(|l| l.url.clone());

    Some(PaperCandidate {
        id: format!("doi:{}", doi),
        title: title.to_string(),
        authors,
        abstract_text: item
            .abstract_text
            .as_deref()
            .map(strip_markup)
            .filter(|a| !a.is_empty()),
        year,
        source: SourceKind::Crossref,
        doi: Some(doi.to_string()),
        arxiv_id: None,
        url: item.url.clone().unwrap_or_else(|| format!("https://doi.org/{}", doi)),
        pdf_url,
    })
}
