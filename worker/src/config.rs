use std::time::Duration;

use crate::extract::OcrSettings;
use crate::pipeline::PipelineSettings;

/// Which backend turns passages into vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingProvider {
    /// Gemini `batchEmbedContents`
    Gemini,
    /// fastembed ONNX model (requires the `local-embeddings` feature)
    Local,
    /// Deterministic bag-of-words hashing; offline development only
    Hash,
}

impl std::str::FromStr for EmbeddingProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(Self::Gemini),
            "local" => Ok(Self::Local),
            "hash" => Ok(Self::Hash),
            other => Err(format!("unknown embedding provider '{other}' (gemini|local|hash)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Gateway worker endpoint, e.g. `ws://127.0.0.1:8000/ws/worker`
    pub gateway_ws_url: String,
    /// Shared secret presented in the `auth` handshake
    pub worker_secret: String,
    pub google_api_key: String,
    pub chat_model: String,
    pub embed_model: String,
    pub embedding_provider: EmbeddingProvider,
    /// Model name for the local provider
    pub local_embed_model: String,
    /// Fixed delay between reconnect attempts
    pub reconnect_backoff: Duration,
    pub pipeline: PipelineSettings,
    /// Maximum number of identities with a live passage set
    pub session_cache_capacity: usize,
    pub ocr: OcrSettings,
    /// Decoded size cap for one reassembled upload
    pub max_upload_bytes: usize,
    /// Upload buffers open longer than this are reclaimed
    pub upload_idle_timeout: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let google_api_key = env_var("GOOGLE_API_KEY")
            .ok_or_else(|| anyhow::anyhow!("GOOGLE_API_KEY must be set"))?;

        let defaults = PipelineSettings::default();
        let pipeline = PipelineSettings {
            top_k: env_parse("RETRIEVAL_TOP_K", defaults.top_k)?,
            min_passage_chars: env_parse("MIN_PASSAGE_CHARS", defaults.min_passage_chars)?,
            embed_batch_size: env_parse("EMBED_BATCH_SIZE", defaults.embed_batch_size)?,
            temperature: env_parse("GENERATION_TEMPERATURE", defaults.temperature)?,
            max_output_tokens: env_parse("GENERATION_MAX_TOKENS", defaults.max_output_tokens)?,
        };

        let ocr_defaults = OcrSettings::default();
        let ocr = OcrSettings {
            min_text_chars: env_parse("OCR_MIN_TEXT_CHARS", ocr_defaults.min_text_chars)?,
            dpi: env_parse("OCR_DPI", ocr_defaults.dpi)?,
            language: env_str("OCR_LANGUAGE", &ocr_defaults.language),
        };

        Ok(Self {
            gateway_ws_url: env_str("GATEWAY_WS_URL", "ws://127.0.0.1:8000/ws/worker"),
            worker_secret: env_str("WORKER_SECRET", ""),
            google_api_key,
            chat_model: env_str("GEMINI_CHAT_MODEL", "gemini-1.5-flash-latest"),
            embed_model: env_str("GEMINI_EMBED_MODEL", "text-embedding-004"),
            embedding_provider: env_parse("EMBEDDING_PROVIDER", EmbeddingProvider::Gemini)?,
            local_embed_model: env_str("LOCAL_EMBED_MODEL", "all-minilm-l6-v2"),
            reconnect_backoff: Duration::from_secs(env_parse("RECONNECT_BACKOFF_SECS", 5)?),
            pipeline,
            session_cache_capacity: env_parse("SESSION_CACHE_CAPACITY", 64)?,
            ocr,
            max_upload_bytes: env_parse("MAX_UPLOAD_BYTES", 50 * 1024 * 1024)?,
            upload_idle_timeout: Duration::from_secs(env_parse("UPLOAD_IDLE_TIMEOUT_SECS", 300)?),
        })
    }
}

/// Value of `key`; empty or whitespace-only counts as unset.
fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_str(key: &str, default: &str) -> String {
    env_var(key).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    let Some(raw) = env_var(key) else {
        return Ok(default);
    };
    raw.trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("{key}: cannot parse {raw:?}: {e}"))
}
