use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array, UInt64Array,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};

use super::{ChunkRecord, CorpusBackend};
use crate::sources::SourceKind;

const TABLE_NAME: &str = "chunks";

/// LanceDB table holding one row per corpus chunk.
pub struct LanceCorpus {
    db: lancedb::Connection,
    schema: Arc<Schema>,
}

fn make_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("seq", DataType::UInt64, false),
        Field::new("chunk_id", DataType::Utf8, false),
        Field::new("paper_id", DataType::Utf8, false),
        Field::new("source", DataType::Utf8, false),
        Field::new("title", DataType::Utf8, false),
        Field::new("authors_json", DataType::Utf8, true),
        Field::new("text", DataType::Utf8, false),
        Field::new("fetched_at", DataType::Utf8, false),
        Field::new("ordinal", DataType::UInt32, false),
        Field::new("identifiers_json", DataType::Utf8, true),
        Field::new("abstract_simhash", DataType::UInt64, true),
    ]))
}

pub(crate) fn escape(value: &str) -> String {
    value.replace('\'', "''")
}

impl LanceCorpus {
    /// Create or open the corpus database at the given path.
    pub async fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path).context("Failed to create corpus directory")?;
        let uri = path.to_str().context("Corpus path is not valid UTF-8")?;

        let db = lancedb::connect(uri)
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;

        let schema = make_schema();
        let tables = db.table_names().execute().await.context("Failed to list tables")?;
        if !tables.contains(&TABLE_NAME.to_string()) {
            db.create_empty_table(TABLE_NAME, schema.clone())
                .execute()
                .await
                .context("Failed to create chunks table")?;
        }

        Ok(Self { db, schema })
    }

    async fn table(&self) -> Result<lancedb::Table> {
        self.db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .context("Failed to open chunks table")
    }

    fn to_batch(&self, first_seq: u64, records: &[ChunkRecord]) -> Result<RecordBatch> {
        let seqs: Vec<u64> = (0..records.len() as u64).map(|i| first_seq + i).collect();
        let authors: Vec<String> = records
            .iter()
            .map(|r| serde_json::to_string(&r.authors))
            .collect::<serde_json::Result<_>>()?;
        let identifiers: Vec<String> = records
            .iter()
            .map(|r| serde_json::to_string(&r.identifiers))
            .collect::<serde_json::Result<_>>()?;
        let fetched: Vec<String> = records.iter().map(|r| r.fetched_at.to_rfc3339()).collect();

        RecordBatch::try_new(
            self.schema.clone(),
            vec![
                Arc::new(UInt64Array::from(seqs)),
                Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.chunk_id.as_str()))),
                Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.paper_id.as_str()))),
                Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.source.as_str()))),
                Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.title.as_str()))),
                Arc::new(StringArray::from_iter_values(authors.iter())),
                Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.text.as_str()))),
                Arc::new(StringArray::from_iter_values(fetched.iter())),
                Arc::new(UInt32Array::from_iter_values(records.iter().map(|r| r.ordinal))),
                Arc::new(StringArray::from_iter_values(identifiers.iter())),
                Arc::new(UInt64Array::from(
                    records.iter().map(|r| r.abstract_simhash).collect::<Vec<_>>(),
                )),
            ],
        )
        .context("Failed to create RecordBatch")
    }

    pub async fn count(&self) -> Result<usize> {
        let table = self.table().await?;
        table.count_rows(None).await.context("Failed to count rows")
    }
}

#[async_trait]
impl CorpusBackend for LanceCorpus {
    async fn append(&self, first_seq: u64, records: &[ChunkRecord]) -> Result<()> {
        let table = self.table().await?;
        let batch = self.to_batch(first_seq, records)?;
        let batches = RecordBatchIterator::new(vec![Ok(batch)], self.schema.clone());
        table
            .add(Box::new(batches))
            .execute()
            .await
            .context("Failed to append chunks")?;
        Ok(())
    }

    async fn load(&self) -> Result<Vec<(u64, ChunkRecord)>> {
        let table = self.table().await?;
        let total = table.count_rows(None).await.context("Failed to count rows")?;
        if total == 0 {
            return Ok(Vec::new());
        }

        let mut stream = table
            .query()
            .limit(total)
            .execute()
            .await
            .context("Failed to scan chunks table")?;

        let mut rows = Vec::with_capacity(total);
        while let Some(batch) = stream.next().await {
            let batch = batch.context("Failed to read chunk batch")?;
            for row in 0..batch.num_rows() {
                rows.push(batch_row_to_record(&batch, row)?);
            }
        }
        rows.sort_by_key(|(seq, _)| *seq);
        Ok(rows)
    }

    async fn delete_paper(&self, paper_id: &str) -> Result<()> {
        let table = self.table().await?;
        table
            .delete(&format!("paper_id = '{}'", escape(paper_id)))
            .await
            .context("Failed to delete paper chunks")?;
        Ok(())
    }
}

fn batch_row_to_record(batch: &RecordBatch, row: usize) -> Result<(u64, ChunkRecord)> {
    let get_str = |name: &str| -> Option<String> {
        batch
            .column_by_name(name)?
            .as_any()
            .downcast_ref::<StringArray>()
            .and_then(|a| if a.is_null(row) { None } else { Some(a.value(row).to_string()) })
    };
    let get_u64 = |name: &str| -> Option<u64> {
        batch
            .column_by_name(name)?
            .as_any()
            .downcast_ref::<UInt64Array>()
            .and_then(|a| if a.is_null(row) { None } else { Some(a.value(row)) })
    };
    let ordinal = batch
        .column_by_name("ordinal")
        .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
        .map(|a| a.value(row))
        .context("Missing ordinal column")?;

    let seq = get_u64("seq").context("Missing seq column")?;
    let chunk_id = get_str("chunk_id").context("Missing chunk_id column")?;
    let source = get_str("source").unwrap_or_default();
    let fetched_at = get_str("fetched_at")
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Bad fetched_at for chunk {}", chunk_id))?;

    Ok((
        seq,
        ChunkRecord {
            paper_id: get_str("paper_id").unwrap_or_default(),
            source: SourceKind::parse(&source).unwrap_or(SourceKind::Local),
            title: get_str("title").unwrap_or_default(),
            authors: get_str("authors_json")
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default(),
            text: get_str("text").unwrap_or_default(),
            fetched_at,
            vector_id: None,
            ordinal,
            identifiers: get_str("identifiers_json")
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default(),
            abstract_simhash: get_u64("abstract_simhash"),
            chunk_id,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::testing::record;
    use crate::corpus::CorpusStore;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_corpus_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let store = CorpusStore::open(tmp.path()).await.unwrap();
            let mut first = record("doi:10.1/o'brien", 0, "It's a quoted chunk.");
            first.identifiers = vec!["doi:10.1/o'brien".to_string()];
            first.abstract_simhash = Some(u64::MAX - 1);
            store
                .append(vec![first, record("p2", 0, "second"), record("p2", 1, "third")])
                .await
                .unwrap();
            store.append(vec![record("p3", 0, "fourth")]).await.unwrap();
            assert_eq!(store.prune_paper("p2").await.unwrap(), 2);
        }

        let reopened = CorpusStore::open(tmp.path()).await.unwrap();
        let ids: Vec<String> = reopened.snapshot().iter().map(|r| r.chunk_id.clone()).collect();
        assert_eq!(ids, vec!["doi:10.1/o'brien#0", "p3#0"]);

        let first = reopened.get("doi:10.1/o'brien#0").unwrap();
        assert_eq!(first.text, "It's a quoted chunk.");
        assert_eq!(first.identifiers, vec!["doi:10.1/o'brien"]);
        assert_eq!(first.abstract_simhash, Some(u64::MAX - 1));
        assert_eq!(first.authors, vec!["Test Author"]);
        assert_eq!(first.source, SourceKind::Local);
        assert!(first.vector_id.is_none());
    }

    #[tokio::test]
    async fn test_sequence_continues_after_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let store = CorpusStore::open(tmp.path()).await.unwrap();
            store
                .append(vec![record("a", 0, "x"), record("b", 0, "y"), record("c", 0, "z")])
                .await
                .unwrap();
            store.prune_paper("b").await.unwrap();
        }
        let store = CorpusStore::open(tmp.path()).await.unwrap();
        store.append(vec![record("d", 0, "w")]).await.unwrap();
        drop(store);

        let backend = LanceCorpus::open(tmp.path()).await.unwrap();
        assert_eq!(backend.count().await.unwrap(), 3);
        let rows = backend.load().await.unwrap();
        let seqs: Vec<u64> = rows.iter().map(|(seq, _)| *seq).collect();
        let ids: Vec<&str> = rows.iter().map(|(_, r)| r.chunk_id.as_str()).collect();
        assert_eq!(seqs, vec![0, 2, 3]);
        assert_eq!(ids, vec!["a#0", "c#0", "d#0"]);
    }
}
