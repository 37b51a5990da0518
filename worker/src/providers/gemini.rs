//! Google Gemini: `batchEmbedContents` for embeddings and
//! `streamGenerateContent?alt=sse` for token-streamed generation.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Embedder, GenerationEvent, GenerationRequest, Generator};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const DEFAULT_TIMEOUT_SECS: u64 = 120;
/// Hard cap of the batch endpoint
const MAX_BATCH_SIZE: usize = 100;
/// Longer inputs are truncated before embedding.
const MAX_TEXT_CHARS: usize = 8000;

pub struct GeminiEmbedder {
    client: HttpClient,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiEmbedder {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: HttpClient::new(),
            api_key,
            model,
            base_url: API_BASE.to_string(),
        }
    }

    /// Point at a different API root (proxies, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn embed_chunk(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!(
            "{}/{}:batchEmbedContents?key={}",
            self.base_url, self.model, self.api_key
        );

        let requests: Vec<_> = texts
            .iter()
            .map(|text| {
                serde_json::json!({
                    "model": format!("models/{}", self.model),
                    "content": { "parts": [{ "text": truncate_chars(text, MAX_TEXT_CHARS) }] },
                })
            })
            .collect();

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "requests": requests }))
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .send()
            .await
            .context("Batch embed request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Gemini embedding error {status}: {text}");
        }

        let body: BatchEmbedResponse = response.json().await.context("Invalid batch response")?;
        if body.embeddings.len() != texts.len() {
            anyhow::bail!(
                "Gemini returned {} embeddings for {} inputs",
                body.embeddings.len(),
                texts.len()
            );
        }
        Ok(body.embeddings.into_iter().map(|e| e.values).collect())
    }
}

#[async_trait]
impl Embedder for GeminiEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(MAX_BATCH_SIZE) {
            out.extend(self.embed_chunk(chunk).await?);
        }
        Ok(out)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<EmbeddingValues>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

// ─── Generation ──────────────────────────────────────────────────────────────

pub struct GeminiGenerator {
    client: HttpClient,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiGenerator {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: HttpClient::new(),
            api_key,
            model,
            base_url: API_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    role: String,
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

/// Text deltas carried by one SSE line, if it is a `data:` line.
pub(crate) fn parse_sse_line(line: &str) -> Vec<String> {
    let Some(data) = line.trim_end_matches('\r').strip_prefix("data:") else {
        return Vec::new();
    };
    match serde_json::from_str::<StreamChunk>(data.trim()) {
        Ok(chunk) => chunk
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .filter_map(|p| p.text)
            .filter(|t| !t.is_empty())
            .collect(),
        Err(e) => {
            debug!(error = %e, "skipping unparseable SSE payload");
            Vec::new()
        }
    }
}

#[async_trait]
impl Generator for GeminiGenerator {
    async fn stream(&self, request: GenerationRequest) -> Result<mpsc::Receiver<GenerationEvent>> {
        let (tx, rx) = mpsc::channel(100);

        let body = StreamRequest {
            contents: vec![Content {
                role: "user".to_string(),
                parts: vec![TextPart {
                    text: request.prompt,
                }],
            }],
            generation_config: GenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_output_tokens,
            },
        };

        let url = format!(
            "{}/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, self.model, self.api_key
        );
        let client = self.client.clone();

        tokio::spawn(async move {
            let response = match client
                .post(&url)
                .json(&body)
                .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    let _ = tx.send(GenerationEvent::Error(e.to_string())).await;
                    return;
                }
            };

            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                let _ = tx
                    .send(GenerationEvent::Error(format!(
                        "Gemini API error: {status} - {text}"
                    )))
                    .await;
                return;
            }

            let mut stream = response.bytes_stream();
            // Bytes, not text: a network chunk may end inside a UTF-8 sequence.
            let mut buffer: Vec<u8> = Vec::new();

            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        buffer.extend_from_slice(&bytes);
                        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                            let line: Vec<u8> = buffer.drain(..=pos).collect();
                            let line = String::from_utf8_lossy(&line);
                            for token in parse_sse_line(line.trim_end_matches('\n')) {
                                if tx.send(GenerationEvent::Token(token)).await.is_err() {
                                    // Receiver dropped; nobody is listening.
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Gemini stream interrupted");
                        let _ = tx.send(GenerationEvent::Error(e.to_string())).await;
                        return;
                    }
                }
            }

            for token in parse_sse_line(String::from_utf8_lossy(&buffer).trim()) {
                let _ = tx.send(GenerationEvent::Token(token)).await;
            }
            let _ = tx.send(GenerationEvent::Done).await;
        });

        Ok(rx)
    }

    fn name(&self) -> &str {
        &self.model
    }
}
