use std::collections::HashSet;
use std::fmt;

use anyhow::{Context, Result};
use tantivy::{
    collector::TopDocs,
    doc,
    query::{BooleanQuery, Occur, Query, TermQuery},
    schema::*,
    Index, IndexReader, IndexWriter, ReloadPolicy, Term,
};

use crate::fingerprint::word_tokens;

/// Query terms beyond this many are dropped; a chunk's opening words are
/// enough to find verbatim sources.
const MAX_QUERY_TERMS: usize = 64;

/// In-memory BM25 index over the chunk texts of one generation. Built once,
/// never written to again.
pub struct LexicalIndex {
    reader: IndexReader,
    f_vector_id: Field,
    f_text: Field,
    doc_count: u64,
}

impl fmt::Debug for LexicalIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LexicalIndex").field("doc_count", &self.doc_count).finish()
    }
}

impl LexicalIndex {
    /// Index `(vector_id, text)` pairs.
    pub fn build<'a>(docs: impl IntoIterator<Item = (u64, &'a str)>) -> Result<Self> {
        let mut schema_builder = Schema::builder();
        let f_vector_id = schema_builder
            .add_u64_field("vector_id", NumericOptions::default().set_stored().set_indexed());
        let f_text = schema_builder.add_text_field("text", TEXT);
        let schema = schema_builder.build();

        let index = Index::create_in_ram(schema);
        let mut writer: IndexWriter = index
            .writer_with_num_threads(1, 20_000_000)
            .context("Failed to create lexical index writer")?;

        for (vector_id, text) in docs {
            writer
                .add_document(doc!(f_vector_id => vector_id, f_text => text))
                .context("Failed to add document")?;
        }
        writer.commit().context("Failed to commit lexical index")?;

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .context("Failed to create index reader")?;
        let doc_count = reader.searcher().num_docs();

        Ok(Self {
            reader,
            f_vector_id,
            f_text,
            doc_count,
        })
    }

    /// Vector ids of the chunks best matching `text` by BM25, with scores.
    pub fn search(&self, text: &str, limit: usize) -> Result<Vec<(u64, f32)>> {
        if limit == 0 || self.doc_count == 0 {
            return Ok(Vec::new());
        }
        let mut seen = HashSet::new();
        let clauses: Vec<(Occur, Box<dyn Query>)> = word_tokens(text)
            .filter(|t| seen.insert(t.clone()))
            .take(MAX_QUERY_TERMS)
            .map(|token| {
                let term = Term::from_field_text(self.f_text, &token);
                (
                    Occur::Should,
                    Box::new(TermQuery::new(term, IndexRecordOption::WithFreqs)) as Box<dyn Query>,
                )
            })
            .collect();
        if clauses.is_empty() {
            return Ok(Vec::new());
        }

        let searcher = self.reader.searcher();
        let top_docs = searcher
            .search(&BooleanQuery::new(clauses), &TopDocs::with_limit(limit))
            .context("Lexical search failed")?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher
                .doc(doc_address)
                .context("Failed to retrieve document")?;
            if let Some(id) = doc.get_first(self.f_vector_id).and_then(|v| v.as_u64()) {
                results.push((id, score));
            }
        }
        Ok(results)
    }

    pub fn len(&self) -> u64 {
        self.doc_count
    }

    pub fn is_empty(&self) -> bool {
        self.doc_count == 0
    }
}
