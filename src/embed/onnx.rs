use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{EmbedError, EmbeddingProvider};

pub const MINILM_DIMENSION: usize = 384;
const MAX_SEQ_LEN: usize = 256;
const MODEL_FILE: &str = "minilm-l6-v2.onnx";
const MODEL_URL: &str =
    "https://huggingface.co/sentence-transformers/all-MiniLM-L6-v2/resolve/main/onnx/model.onnx";
const TOKENIZER_REPO: &str = "sentence-transformers/all-MiniLM-L6-v2";

/// Download the MiniLM ONNX model into `model_dir` unless already present.
pub async fn download_model(model_dir: &Path) -> Result<PathBuf> {
    let model_path = model_dir.join(MODEL_FILE);
    if model_path.exists() {
        tracing::info!("MiniLM model already present at {:?}", model_path);
        return Ok(model_path);
    }

    std::fs::create_dir_all(model_dir).context("Failed to create model directory")?;

    tracing::info!("Downloading MiniLM model from {}", MODEL_URL);
    let resp = reqwest::Client::new()
        .get(MODEL_URL)
        .send()
        .await
        .context("Failed to download MiniLM model")?;
    anyhow::ensure!(resp.status().is_success(), "Download failed with status: {}", resp.status());

    let bytes = resp.bytes().await.context("Failed to read model bytes")?;
    std::fs::write(&model_path, &bytes).context("Failed to write model file")?;

    tracing::info!("MiniLM model saved to {:?} ({} bytes)", model_path, bytes.len());
    Ok(model_path)
}

struct Session {
    session: ort::session::Session,
    tokenizer: tokenizers::Tokenizer,
}

impl Session {
    fn open(model_dir: &Path) -> Result<Self> {
        let model_path = model_dir.join(MODEL_FILE);
        anyhow::ensure!(
            model_path.exists(),
            "ONNX model not found at {:?}. Run download_model() first.",
            model_path
        );

        let session = ort::session::Session::builder()
            .context("Failed to create ONNX session builder")?
            .commit_from_file(&model_path)
            .context("Failed to load ONNX model")?;

        let tokenizer_path = model_dir.join("tokenizer.json");
        let tokenizer = if tokenizer_path.exists() {
            tokenizers::Tokenizer::from_file(&tokenizer_path)
                .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?
        } else {
            let tok = tokenizers::Tokenizer::from_pretrained(TOKENIZER_REPO, None)
                .map_err(|e| anyhow::anyhow!("Failed to download tokenizer: {}", e))?;
            if let Err(e) = tok.save(&tokenizer_path, false) {
                tracing::warn!("Could not cache tokenizer at {:?}: {}", tokenizer_path, e);
            }
            tok
        };

        Ok(Self { session, tokenizer })
    }

    /// Mean-pooled last hidden state over non-padding tokens.
    fn embed(&mut self, text: &str) -> Result<Vec<f32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?;

        let len = encoding.get_ids().len().min(MAX_SEQ_LEN);
        let to_i64 = |xs: &[u32]| xs[..len].iter().map(|&x| x as i64).collect::<Vec<i64>>();
        let token_ids = to_i64(encoding.get_ids());
        let attention = to_i64(encoding.get_attention_mask());
        let type_ids = to_i64(encoding.get_type_ids());

        let input_ids = ort::value::Tensor::from_array(([1, len], token_ids.into_boxed_slice()))
            .context("Failed to create input_ids tensor")?;
        let attn_mask =
            ort::value::Tensor::from_array(([1, len], attention.clone().into_boxed_slice()))
                .context("Failed to create attention_mask tensor")?;
        let token_types = ort::value::Tensor::from_array(([1, len], type_ids.into_boxed_slice()))
            .context("Failed to create token_type_ids tensor")?;

        let outputs = self
            .session
            .run(ort::inputs![
                "input_ids" => input_ids,
                "attention_mask" => attn_mask,
                "token_type_ids" => token_types
            ])
            .context("ONNX inference failed")?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .context("Failed to extract output tensor")?;
        anyhow::ensure!(shape.len() == 3, "Unexpected output shape: {:?}", shape);
        let hidden = shape[2] as usize;
        anyhow::ensure!(hidden == MINILM_DIMENSION, "Unexpected hidden size: {}", hidden);

        let mut pooled = vec![0.0f32; hidden];
        let mut counted = 0.0f32;
        for (token, mask) in attention.iter().enumerate() {
            if *mask == 0 {
                continue;
            }
            counted += 1.0;
            let row = &data[token * hidden..(token + 1) * hidden];
            for (acc, v) in pooled.iter_mut().zip(row) {
                *acc += v;
            }
        }
        if counted > 0.0 {
            for v in pooled.iter_mut() {
                *v /= counted;
            }
        }
        Ok(pooled)
    }
}

/// all-MiniLM-L6-v2 sentence embedder running on ONNX Runtime.
///
/// Inference is blocking, so each call runs on the blocking pool with the
/// session behind a mutex.
pub struct OnnxEmbedder {
    inner: Arc<Mutex<Session>>,
    model_id: String,
}

impl OnnxEmbedder {
    pub fn new(model_dir: &Path) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(Session::open(model_dir)?)),
            model_id: "onnx-all-MiniLM-L6-v2".to_string(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OnnxEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        MINILM_DIMENSION
    }

    async fn encode(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let inner = Arc::clone(&self.inner);
        let text = text.to_string();
        tokio::task::spawn_blocking(move || {
            let mut session = inner
                .lock()
                .map_err(|_| EmbedError::Model("ONNX session lock poisoned".to_string()))?;
            session.embed(&text).map_err(|e| EmbedError::Model(format!("{:#}", e)))
        })
        .await
        .map_err(|e| EmbedError::Unavailable(format!("embedding task failed: {}", e)))?
    }
}
