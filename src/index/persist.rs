//! On-disk generations.
//!
//! ```text
//! <root>/CURRENT                         id of the published generation
//! <root>/generations/gen-00000007/
//!     manifest.json
//!     vectors.lance/                     vector_id, chunk_id, embedding
//! ```
//!
//! A generation directory is complete before `CURRENT` names it, and
//! `CURRENT` is replaced by rename, so a crash mid-persist leaves the previous
//! generation loadable.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    types::Float32Type, Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator,
    StringArray, UInt64Array,
};
use arrow_schema::{DataType, Field, Schema};
use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use serde::{Deserialize, Serialize};

use super::{FlatIndex, IndexError, IndexGeneration};
use crate::fingerprint::Fnv1a;

const CURRENT_FILE: &str = "CURRENT";
const GENERATIONS_DIR: &str = "generations";
const MANIFEST_FILE: &str = "manifest.json";
const TABLE_NAME: &str = "vectors";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub generation_id: u64,
    pub vector_count: usize,
    pub dimension: usize,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
    pub checksum: u64,
}

/// A generation read back from disk: vectors and mapping, verified against
/// the manifest. The lexical index is rebuilt by the caller from corpus text.
#[derive(Debug)]
pub struct LoadedGeneration {
    pub manifest: Manifest,
    pub vectors: FlatIndex,
    pub chunk_ids: HashMap<u64, String>,
}

/// FNV-1a over `(vector_id, chunk_id, vector)` rows in ascending id order.
pub fn checksum<'a>(
    vectors: &'a FlatIndex,
    chunk_id: impl Fn(u64) -> Option<&'a str>,
) -> u64 {
    let mut rows: Vec<(u64, &[f32])> = vectors.iter().collect();
    rows.sort_by_key(|(id, _)| *id);
    let mut hasher = Fnv1a::new();
    for (id, vector) in rows {
        hasher.write_u64(id);
        hasher.write(chunk_id(id).unwrap_or("").as_bytes());
        hasher.write(&[0xff]);
        for v in vector {
            hasher.write(&v.to_le_bytes());
        }
    }
    hasher.finish()
}

fn make_schema(dimension: usize) -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("vector_id", DataType::UInt64, false),
        Field::new("chunk_id", DataType::Utf8, false),
        Field::new(
            "embedding",
            DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, true)),
                dimension as i32,
            ),
            false,
        ),
    ]))
}

fn corrupt(message: impl std::fmt::Display) -> IndexError {
    IndexError::CorruptPersistedIndex(message.to_string())
}

pub struct GenerationStore {
    root: PathBuf,
}

impl GenerationStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn generation_dir(&self, id: u64) -> PathBuf {
        self.root.join(GENERATIONS_DIR).join(format!("gen-{:08}", id))
    }

    /// Write `generation` to its own directory, then point `CURRENT` at it.
    pub async fn persist(&self, generation: &IndexGeneration) -> Result<Manifest, IndexError> {
        self.write_generation(generation)
            .await
            .map_err(|e| IndexError::Storage(format!("{:#}", e)))
    }

    async fn write_generation(&self, generation: &IndexGeneration) -> Result<Manifest> {
        let dir = self.generation_dir(generation.id());
        if dir.exists() {
            // Left over from an interrupted persist of the same id.
            std::fs::remove_dir_all(&dir).context("Failed to clear stale generation directory")?;
        }
        std::fs::create_dir_all(&dir).context("Failed to create generation directory")?;

        let dimension = generation.dimension();
        let schema = make_schema(dimension);
        let uri = dir.to_str().context("Generation path is not valid UTF-8")?;
        let db = lancedb::connect(uri)
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;
        let table = db
            .create_empty_table(TABLE_NAME, schema.clone())
            .execute()
            .await
            .context("Failed to create vectors table")?;

        let mut rows: Vec<(u64, &[f32])> = generation.vectors().iter().collect();
        rows.sort_by_key(|(id, _)| *id);
        if !rows.is_empty() {
            let chunk_ids: Vec<&str> = rows
                .iter()
                .map(|(id, _)| generation.chunk_id(*id).unwrap_or(""))
                .collect();
            let batch = RecordBatch::try_new(
                schema.clone(),
                vec![
                    Arc::new(UInt64Array::from_iter_values(rows.iter().map(|(id, _)| *id))),
                    Arc::new(StringArray::from(chunk_ids)),
                    Arc::new(FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
                        rows.iter().map(|(_, v)| Some(v.iter().map(|&x| Some(x)))),
                        dimension as i32,
                    )),
                ],
            )
            .context("Failed to create RecordBatch")?;
            let batches = RecordBatchIterator::new(vec![Ok(batch)], schema.clone());
            table
                .add(Box::new(batches))
                .execute()
                .await
                .context("Failed to write vectors")?;
        }

        let manifest = Manifest {
            generation_id: generation.id(),
            vector_count: generation.vector_count(),
            dimension,
            model_id: generation.model_id().to_string(),
            created_at: generation.created_at(),
            checksum: checksum(generation.vectors(), |id| generation.chunk_id(id)),
        };
        std::fs::write(dir.join(MANIFEST_FILE), serde_json::to_vec_pretty(&manifest)?)
            .context("Failed to write manifest")?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)
            .context("Failed to create temporary CURRENT file")?;
        writeln!(tmp, "{}", generation.id()).context("Failed to write CURRENT")?;
        tmp.as_file().sync_all().context("Failed to sync CURRENT")?;
        tmp.persist(self.root.join(CURRENT_FILE))
            .map_err(|e| e.error)
            .context("Failed to replace CURRENT")?;

        tracing::info!("Persisted generation {} to {:?}", generation.id(), dir);
        Ok(manifest)
    }

    /// Id named by `CURRENT`, if any.
    pub fn current_id(&self) -> Result<Option<u64>, IndexError> {
        let path = self.root.join(CURRENT_FILE);
        match std::fs::read_to_string(&path) {
            Ok(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| corrupt(format!("CURRENT holds {:?}", raw.trim()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(IndexError::Storage(format!("reading {:?}: {}", path, e))),
        }
    }

    /// Load and verify the published generation. `Ok(None)` when nothing was
    /// ever persisted.
    pub async fn load_current(&self) -> Result<Option<LoadedGeneration>, IndexError> {
        let Some(id) = self.current_id()? else {
            return Ok(None);
        };
        let dir = self.generation_dir(id);

        let raw = std::fs::read(dir.join(MANIFEST_FILE))
            .map_err(|e| corrupt(format!("manifest of generation {}: {}", id, e)))?;
        let manifest: Manifest = serde_json::from_slice(&raw)
            .map_err(|e| corrupt(format!("manifest of generation {}: {}", id, e)))?;
        if manifest.generation_id != id {
            return Err(corrupt(format!(
                "CURRENT names generation {} but its manifest says {}",
                id, manifest.generation_id
            )));
        }

        let rows = read_rows(&dir, manifest.vector_count)
            .await
            .map_err(|e| corrupt(format!("{:#}", e)))?;
        if rows.len() != manifest.vector_count {
            return Err(corrupt(format!(
                "manifest lists {} vectors, table has {}",
                manifest.vector_count,
                rows.len()
            )));
        }

        let mut chunk_ids = HashMap::with_capacity(rows.len());
        let mut vectors = Vec::with_capacity(rows.len());
        for (vector_id, chunk_id, vector) in rows {
            if vector.len() != manifest.dimension {
                return Err(corrupt(format!(
                    "vector {} has dimension {}, manifest says {}",
                    vector_id,
                    vector.len(),
                    manifest.dimension
                )));
            }
            if chunk_ids.insert(vector_id, chunk_id).is_some() {
                return Err(corrupt(format!("vector id {} appears twice", vector_id)));
            }
            vectors.push((vector_id, vector));
        }
        let distinct_chunks: std::collections::HashSet<&String> = chunk_ids.values().collect();
        if distinct_chunks.len() != chunk_ids.len() {
            return Err(corrupt("a chunk is mapped by more than one vector"));
        }

        let vectors = FlatIndex::build(manifest.dimension, vectors)?;
        let actual = checksum(&vectors, |id| chunk_ids.get(&id).map(String::as_str));
        if actual != manifest.checksum {
            return Err(corrupt(format!(
                "checksum mismatch for generation {} ({:016x} != {:016x})",
                id, actual, manifest.checksum
            )));
        }

        Ok(Some(LoadedGeneration {
            manifest,
            vectors,
            chunk_ids,
        }))
    }

    /// Remove generation directories older than the newest `keep`, never
    /// touching `current`. Returns how many were removed.
    pub fn prune(&self, keep: usize, current: u64) -> Result<usize, IndexError> {
        let generations = self.root.join(GENERATIONS_DIR);
        let entries = match std::fs::read_dir(&generations) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(IndexError::Storage(format!("listing {:?}: {}", generations, e))),
        };

        let mut ids: Vec<u64> = entries
            .flatten()
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.strip_prefix("gen-"))
                    .and_then(|id| id.parse().ok())
            })
            .collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));

        let mut removed = 0;
        for id in ids.into_iter().skip(keep.max(1)) {
            if id == current {
                continue;
            }
            let dir = self.generation_dir(id);
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {
                    removed += 1;
                    tracing::debug!("Removed retired generation directory {:?}", dir);
                }
                Err(e) => tracing::warn!("Could not remove {:?}: {}", dir, e),
            }
        }
        Ok(removed)
    }
}

async fn read_rows(dir: &Path, expected: usize) -> Result<Vec<(u64, String, Vec<f32>)>> {
    let uri = dir.to_str().context("Generation path is not valid UTF-8")?;
    let db = lancedb::connect(uri)
        .execute()
        .await
        .context("Failed to connect to LanceDB")?;
    let table = db
        .open_table(TABLE_NAME)
        .execute()
        .await
        .context("Failed to open vectors table")?;

    let total = table.count_rows(None).await.context("Failed to count rows")?;
    if total == 0 {
        return Ok(Vec::new());
    }
    let mut stream = table
        .query()
        .limit(total.max(expected))
        .execute()
        .await
        .context("Failed to scan vectors table")?;

    let mut rows = Vec::with_capacity(total);
    while let Some(batch) = stream.next().await {
        let batch = batch.context("Failed to read vectors batch")?;
        let ids = batch
            .column_by_name("vector_id")
            .and_then(|c| c.as_any().downcast_ref::<UInt64Array>())
            .context("Missing vector_id column")?;
        let chunks = batch
            .column_by_name("chunk_id")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>())
            .context("Missing chunk_id column")?;
        let embeddings = batch
            .column_by_name("embedding")
            .and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>())
            .context("Missing embedding column")?;

        for row in 0..batch.num_rows() {
            let values = embeddings.value(row);
            let floats = values
                .as_any()
                .downcast_ref::<Float32Array>()
                .context("Embedding is not f32")?;
            rows.push((
                ids.value(row),
                chunks.value(row).to_string(),
                floats.values().to_vec(),
            ));
        }
    }
    Ok(rows)
}
