//! Retrieval pipeline: split → embed → rank → stream.
//!
//! Documents are split on blank lines into passages, embedded in batches and
//! kept as a [`PassageSet`] per identity. A question is embedded, scored
//! against every passage by cosine similarity, and the top passages become
//! the context of a streamed generation.

pub mod prompt;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::extract::ExtractError;
use crate::providers::{Embedder, GenerationEvent, GenerationRequest, Generator};

static PARAGRAPH_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n[ \t\r\f\v]*\n").expect("valid regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("Could not extract any usable text from the document.")]
    EmptyDocument,

    #[error("No PDF has been processed yet.")]
    NoDocument,

    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Text extraction failed: {0}")]
    Extraction(String),

    #[error("Embedding count {embeddings} does not match passage count {passages}")]
    Misaligned { passages: usize, embeddings: usize },
}

impl From<ExtractError> for PipelineError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::Empty => PipelineError::EmptyDocument,
            other => PipelineError::Extraction(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub top_k: usize,
    pub min_passage_chars: usize,
    pub embed_batch_size: usize,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_passage_chars: 20,
            embed_batch_size: 50,
            temperature: prompt::DEFAULT_TEMPERATURE,
            max_output_tokens: prompt::DEFAULT_MAX_OUTPUT_TOKENS,
        }
    }
}

/// Passages of one document with index-aligned embeddings.
#[derive(Debug, Clone)]
pub struct PassageSet {
    filename: String,
    passages: Vec<String>,
    embeddings: Vec<Vec<f32>>,
    ingested_at: DateTime<Utc>,
}

impl PassageSet {
    pub fn new(
        filename: impl Into<String>,
        passages: Vec<String>,
        embeddings: Vec<Vec<f32>>,
    ) -> Result<Self, PipelineError> {
        if passages.len() != embeddings.len() {
            return Err(PipelineError::Misaligned {
                passages: passages.len(),
                embeddings: embeddings.len(),
            });
        }
        if passages.is_empty() {
            return Err(PipelineError::EmptyDocument);
        }
        Ok(Self {
            filename: filename.into(),
            passages,
            embeddings,
            ingested_at: Utc::now(),
        })
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn passages(&self) -> &[String] {
        &self.passages
    }

    pub fn embeddings(&self) -> &[Vec<f32>] {
        &self.embeddings
    }

    pub fn ingested_at(&self) -> DateTime<Utc> {
        self.ingested_at
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }
}

/// Split on blank lines, collapse internal whitespace, drop short fragments.
pub fn split_passages(text: &str, min_chars: usize) -> Vec<String> {
    PARAGRAPH_BREAK
        .split(text)
        .map(|p| WHITESPACE.replace_all(p.trim(), " ").into_owned())
        .filter(|p| p.chars().count() >= min_chars)
        .collect()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Indices of the `k` highest scores, best first. Ties keep index order.
pub fn top_k(scores: &[f32], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    // sort_by is stable; NaN sorts as lowest.
    order.sort_by(|&a, &b| {
        let (sa, sb) = (scores[a], scores[b]);
        sb.partial_cmp(&sa).unwrap_or_else(|| sa.is_nan().cmp(&sb.is_nan()))
    });
    order.truncate(k);
    order
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedPassage {
    pub index: usize,
    pub score: f32,
}

pub type TokenStream = mpsc::Receiver<GenerationEvent>;

pub struct Pipeline {
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            embedder,
            generator,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Build the passage set for one document.
    pub async fn ingest(&self, filename: &str, raw_text: &str) -> Result<PassageSet, PipelineError> {
        let passages = split_passages(raw_text, self.settings.min_passage_chars);
        if passages.is_empty() {
            return Err(PipelineError::EmptyDocument);
        }

        let batch = self.settings.embed_batch_size.max(1);
        let mut embeddings = Vec::with_capacity(passages.len());
        for chunk in passages.chunks(batch) {
            let vectors = self
                .embedder
                .embed_batch(chunk)
                .await
                .map_err(|e| PipelineError::Embedding(e.to_string()))?;
            if vectors.len() != chunk.len() {
                return Err(PipelineError::Misaligned {
                    passages: chunk.len(),
                    embeddings: vectors.len(),
                });
            }
            embeddings.extend(vectors);
        }

        let set = PassageSet::new(filename, passages, embeddings)?;
        info!(
            filename,
            passages = set.len(),
            embedder = self.embedder.name(),
            "document ingested"
        );
        Ok(set)
    }

    /// Rank every passage against `query`, best first, at most `top_k`.
    pub async fn retrieve(
        &self,
        query: &str,
        set: &PassageSet,
    ) -> Result<Vec<RankedPassage>, PipelineError> {
        let mut vectors = self
            .embedder
            .embed_batch(&[query.to_string()])
            .await
            .map_err(|e| PipelineError::Embedding(e.to_string()))?;
        let query_vec = vectors.pop().ok_or(PipelineError::Misaligned {
            passages: 1,
            embeddings: 0,
        })?;

        let scores: Vec<f32> = set
            .embeddings()
            .iter()
            .map(|e| cosine_similarity(&query_vec, e))
            .collect();

        Ok(top_k(&scores, self.settings.top_k)
            .into_iter()
            .map(|index| RankedPassage {
                index,
                score: scores[index],
            })
            .collect())
    }

    /// Stream an answer grounded in the best-matching passages.
    pub async fn answer(&self, query: &str, set: &PassageSet) -> Result<TokenStream, PipelineError> {
        let ranked = self.retrieve(query, set).await?;
        debug!(
            filename = set.filename(),
            picked = ?ranked.iter().map(|r| r.index).collect::<Vec<_>>(),
            "retrieved passages"
        );

        let context: Vec<&str> = ranked
            .iter()
            .map(|r| set.passages()[r.index].as_str())
            .collect();
        self.generate(prompt::document_answer(&context, query)).await
    }

    /// Stream a conversational reply with no document context.
    pub async fn general_chat(&self, text: &str) -> Result<TokenStream, PipelineError> {
        self.generate(prompt::general_chat(text)).await
    }

    async fn generate(&self, prompt: String) -> Result<TokenStream, PipelineError> {
        self.generator
            .stream(GenerationRequest {
                prompt,
                temperature: self.settings.temperature,
                max_output_tokens: self.settings.max_output_tokens,
            })
            .await
            .map_err(|e| PipelineError::Generation(e.to_string()))
    }
}
