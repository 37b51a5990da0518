//! Embedding and generation backends.
//!
//! The pipeline only sees the [`Embedder`] and [`Generator`] traits. A
//! generation is a stream of [`GenerationEvent`]s on an mpsc channel fed by a
//! spawned task, terminated by `Done` (or preceded by an `Error`).

pub mod gemini;
#[cfg(feature = "local-embeddings")]
pub mod local;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use gemini::{GeminiEmbedder, GeminiGenerator};

#[async_trait]
pub trait Embedder: Send + Sync {
    /// One vector per input text, in input order.
    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationEvent {
    Token(String),
    Error(String),
    Done,
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Start a streamed generation. Errors returned here mean nothing was
    /// started; failures after the first token arrive as `GenerationEvent::Error`.
    async fn stream(
        &self,
        request: GenerationRequest,
    ) -> anyhow::Result<mpsc::Receiver<GenerationEvent>>;

    fn name(&self) -> &str;
}

/// Offline embedder: lowercase word tokens hashed into a fixed number of
/// buckets, then L2-normalised. Texts sharing words score higher under
/// cosine similarity; nothing more.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            word.to_lowercase().hash(&mut hasher);
            v[(hasher.finish() % self.dims as u64) as usize] += 1.0;
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn name(&self) -> &str {
        "hash"
    }
}
