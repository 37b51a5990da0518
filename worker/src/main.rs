use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use worker::{
    config::{Config, EmbeddingProvider},
    extract::DocumentExtractor,
    link,
    pipeline::Pipeline,
    providers::{Embedder, GeminiEmbedder, GeminiGenerator, HashEmbedder},
    store::DocumentStore,
    WorkerService,
};

async fn build_embedder(config: &Config) -> anyhow::Result<Arc<dyn Embedder>> {
    match config.embedding_provider {
        EmbeddingProvider::Gemini => Ok(Arc::new(GeminiEmbedder::new(
            config.google_api_key.clone(),
            config.embed_model.clone(),
        ))),
        #[cfg(feature = "local-embeddings")]
        EmbeddingProvider::Local => Ok(Arc::new(
            worker::providers::local::LocalEmbedder::load(
                &config.local_embed_model,
                config.pipeline.embed_batch_size,
            )
            .await?,
        )),
        #[cfg(not(feature = "local-embeddings"))]
        EmbeddingProvider::Local => {
            anyhow::bail!("EMBEDDING_PROVIDER=local requires the `local-embeddings` feature")
        }
        EmbeddingProvider::Hash => {
            warn!("using hash embeddings; retrieval quality is for development only");
            Ok(Arc::new(HashEmbedder::default()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "worker=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        gateway = %config.gateway_ws_url,
        chat_model = %config.chat_model,
        embeddings = ?config.embedding_provider,
        "worker starting"
    );
    if config.worker_secret.is_empty() {
        warn!("WORKER_SECRET is empty; the gateway must be running without one");
    }

    let embedder = build_embedder(&config).await?;
    let generator = Arc::new(GeminiGenerator::new(
        config.google_api_key.clone(),
        config.chat_model.clone(),
    ));
    let pipeline = Pipeline::new(embedder, generator, config.pipeline.clone());
    let extractor = DocumentExtractor::with_tesseract(config.ocr.clone());
    let store = DocumentStore::spawn(config.session_cache_capacity).await?;

    let service = Arc::new(
        WorkerService::new(extractor, pipeline, store)
            .with_upload_limits(config.max_upload_bytes, config.upload_idle_timeout),
    );
    link::run(
        &config.gateway_ws_url,
        &config.worker_secret,
        config.reconnect_backoff,
        service,
    )
    .await;
    Ok(())
}
