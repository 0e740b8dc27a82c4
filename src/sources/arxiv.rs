use std::time::Duration;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::{check_status, http_client, PaperCandidate, SourceError, SourceKind, USER_AGENT};

const BASE_URL: &str = "https://export.arxiv.org/api/query";

pub struct ArxivClient {
    client: reqwest::Client,
    /// arXiv asks clients to leave ~3s between requests.
    politeness_delay: Duration,
}

impl ArxivClient {
    pub fn new() -> Result<Self, SourceError> {
        Ok(Self {
            client: http_client(USER_AGENT)?,
            politeness_delay: Duration::from_secs(3),
        })
    }

    pub async fn search(
        &self,
        topic: &str,
        max_results: u32,
    ) -> Result<Vec<PaperCandidate>, SourceError> {
        let search_query = format!("all:{}", topic);
        let max = max_results.to_string();
        let resp = self
            .client
            .get(BASE_URL)
            .query(&[
                ("search_query", search_query.as_str()),
                ("start", "0"),
                ("max_results", max.as_str()),
                ("sortBy", "relevance"),
                ("sortOrder", "descending"),
            ])
            .send()
            .await?;
        let body = check_status(resp).await?.text().await?;
        tokio::time::sleep(self.politeness_delay).await;
        parse_atom_feed(&body)
    }
}

/// Fields of one `<entry>` collected while streaming the feed.
#[derive(Default)]
struct EntryFields {
    id_url: String,
    title: String,
    summary: String,
    published: String,
    authors: Vec<String>,
    author_name: String,
    in_author: bool,
    doi: Option<String>,
    link_abs: String,
    link_pdf: String,
}

impl EntryFields {
    fn record_link(&mut self, e: &BytesStart<'_>) {
        let mut href = String::new();
        let mut title_attr = String::new();
        for attr in e.attributes().flatten() {
            let val = String::from_utf8_lossy(&attr.value).to_string();
            match attr.key.as_ref() {
                b"href" => href = val,
                b"title" => title_attr = val,
                _ => {}
            }
        }
        if title_attr == "pdf" {
            self.link_pdf = href;
        } else if self.link_abs.is_empty() && href.contains("/abs/") {
            self.link_abs = href;
        }
    }

    fn into_candidate(self) -> Option<PaperCandidate> {
        let versioned = self.id_url.rsplit("/abs/").next().unwrap_or(&self.id_url).trim();
        let title = collapse_whitespace(&self.title);
        if versioned.is_empty() || title.is_empty() {
            return None;
        }
        let summary = collapse_whitespace(&self.summary);
        Some(PaperCandidate {
            id: format!("arxiv:{}", versioned),
            title,
            authors: self.authors,
            abstract_text: (!summary.is_empty()).then_some(summary),
            year: self.published.get(..4).and_then(|y| y.parse().ok()),
            source: SourceKind::Arxiv,
            doi: self.doi,
            arxiv_id: Some(versioned.to_string()),
            url: if self.link_abs.is_empty() { self.id_url.clone() } else { self.link_abs },
            pdf_url: (!self.link_pdf.is_empty()).then_some(self.link_pdf),
        })
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub(crate) fn parse_atom_feed(xml: &str) -> Result<Vec<PaperCandidate>, SourceError> {
    let mut reader = Reader::from_str(xml);
    let mut papers = Vec::new();
    let mut entry: Option<EntryFields> = None;
    let mut current_tag = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if tag == "entry" {
                    entry = Some(EntryFields::default());
                } else if let Some(fields) = entry.as_mut() {
                    if tag == "author" {
                        fields.in_author = true;
                        fields.author_name.clear();
                    } else if tag == "link" {
                        fields.record_link(&e);
                    }
                    current_tag = tag;
                }
            }
            Ok(Event::Empty(e)) => {
                if let Some(fields) = entry.as_mut() {
                    if e.name().as_ref() == b"link" {
                        fields.record_link(&e);
                    }
                }
            }
            Ok(Event::Text(e)) => {
                if let Some(fields) = entry.as_mut() {
                    let text = e.unescape().unwrap_or_default().to_string();
                    match current_tag.as_str() {
                        "title" => fields.title.push_str(&text),
                        "summary" => fields.summary.push_str(&text),
                        "id" => fields.id_url.push_str(text.trim()),
                        "published" => fields.published.push_str(text.trim()),
                        "name" if fields.in_author => fields.author_name.push_str(&text),
                        tag if tag.ends_with("doi") => fields.doi = Some(text.trim().to_string()),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if tag == "entry" {
                    if let Some(candidate) = entry.take().and_then(EntryFields::into_candidate) {
                        papers.push(candidate);
                    }
                } else if tag == "author" {
                    if let Some(fields) = entry.as_mut() {
                        fields.in_author = false;
                        let name = fields.author_name.trim().to_string();
                        if !name.is_empty() {
                            fields.authors.push(name);
                        }
                    }
                }
                if tag == current_tag {
                    current_tag.clear();
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SourceError::Parse(format!("XML parse error: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(papers)
}
