use async_trait::async_trait;

use super::{EmbedError, EmbeddingProvider};
use crate::fingerprint::{fnv1a, word_tokens};

pub const DEFAULT_DIMENSION: usize = 384;

/// Feature-hashing embedder: unigrams and bigrams hashed into a signed bag of
/// words, then L2-normalized.
///
/// Needs no model files and gives identical vectors on every run, so texts
/// sharing vocabulary score high and verbatim copies score 1.0. Used when no
/// ONNX model is configured.
pub struct HashingEmbedder {
    dimension: usize,
    model_id: String,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(2);
        Self {
            dimension,
            model_id: format!("hashing-v1-{}", dimension),
        }
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let tokens: Vec<String> = word_tokens(text).collect();

        for token in &tokens {
            self.bump(&mut vector, token.as_bytes(), 1.0);
        }
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.bump(&mut vector, bigram.as_bytes(), 0.5);
        }

        super::l2_normalize(&mut vector);
        vector
    }

    fn bump(&self, vector: &mut [f32], feature: &[u8], weight: f32) {
        let hash = fnv1a(feature);
        let slot = (hash % self.dimension as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[slot] += sign * weight;
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSION)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn encode(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        Ok(self.embed(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_deterministic_and_normalized() {
        let e = HashingEmbedder::new(128);
        let a = e.embed("Sparse attention for long documents");
        let b = e.embed("Sparse attention for long documents");
        assert_eq!(a, b);
        assert_eq!(a.len(), 128);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_case_and_punctuation_insensitive() {
        let e = HashingEmbedder::default();
        let a = e.embed("Graph Neural Networks, revisited.");
        let b = e.embed("graph neural networks revisited");
        assert!((dot(&a, &b) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_shared_vocabulary_scores_higher() {
        let e = HashingEmbedder::default();
        let q = e.embed("protein folding with deep learning");
        let near = e.embed("deep learning approaches to protein folding");
        let far = e.embed("tax policy and municipal bond markets");
        assert!(dot(&q, &near) > dot(&q, &far));
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let e = HashingEmbedder::new(16);
        assert!(e.embed("").iter().all(|x| *x == 0.0));
        assert_eq!(e.model_id(), "hashing-v1-16");
    }
}
