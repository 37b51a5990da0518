//! In-process ONNX embeddings through fastembed.

use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use tracing::info;

use super::Embedder;

pub struct LocalEmbedder {
    model: Arc<Mutex<TextEmbedding>>,
    name: String,
    batch_size: usize,
}

fn model_for(name: &str) -> Result<EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(EmbeddingModel::BGEBaseENV15),
        "nomic-embed-text-v1.5" => Ok(EmbeddingModel::NomicEmbedTextV15),
        other => bail!(
            "Unknown local embedding model '{other}' \
             (all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, nomic-embed-text-v1.5)"
        ),
    }
}

impl LocalEmbedder {
    /// Loads (downloading on first use) the named model. Blocking; call once
    /// at startup.
    pub async fn load(name: &str, batch_size: usize) -> Result<Self> {
        let model = model_for(name)?;
        let loaded = tokio::task::spawn_blocking(move || {
            TextEmbedding::try_new(InitOptions::new(model).with_show_download_progress(false))
                .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {e}"))
        })
        .await??;

        info!(model = name, "local embedding model ready");
        Ok(Self {
            model: Arc::new(Mutex::new(loaded)),
            name: name.to_string(),
            batch_size: batch_size.max(1),
        })
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = Arc::clone(&self.model);
        let texts = texts.to_vec();
        let batch_size = self.batch_size;

        tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| anyhow::anyhow!("local embedding model lock poisoned"))?;
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| anyhow::anyhow!("Local embedding failed: {e}"))
        })
        .await?
    }

    fn name(&self) -> &str {
        &self.name
    }
}
