pub mod hashing;
#[cfg(feature = "onnx")]
pub mod onnx;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding model error: {0}")]
    Model(String),
    #[error("embedding provider unavailable: {0}")]
    Unavailable(String),
    #[error("embedding has dimension {actual}, provider declares {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Maps a text chunk to a fixed-length dense vector.
///
/// Implementations must be deterministic for a given `model_id`; the index
/// builder caches vectors per chunk and never re-encodes an unchanged chunk.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Identifies the model version. Persisted generations record it and are
    /// discarded on restart when it changes.
    fn model_id(&self) -> &str;
    fn dimension(&self) -> usize;
    async fn encode(&self, text: &str) -> Result<Vec<f32>, EmbedError>;
}

/// Scale `v` to unit length in place. Zero vectors are left untouched and
/// reported with `false`.
pub fn l2_normalize(v: &mut [f32]) -> bool {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return false;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    true
}

/// Encode and normalize, checking the vector against the declared dimension.
pub async fn encode_normalized(
    provider: &dyn EmbeddingProvider,
    text: &str,
) -> Result<Vec<f32>, EmbedError> {
    let mut vector = provider.encode(text).await?;
    if vector.len() != provider.dimension() {
        return Err(EmbedError::DimensionMismatch {
            expected: provider.dimension(),
            actual: vector.len(),
        });
    }
    l2_normalize(&mut vector);
    Ok(vector)
}
