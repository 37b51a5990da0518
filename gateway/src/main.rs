use std::sync::Arc;

use gateway::{
    auth::JwtVerifier,
    config::Config,
    db,
    transcripts::SqliteTranscriptStore,
    AppState,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gateway=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(port = config.port, "gateway starting");
    if config.worker_secret.is_none() {
        warn!("WORKER_SECRET is not set; any worker will be accepted");
    }

    // Collaborators must come up before we accept traffic.
    let verifier = JwtVerifier::new(&config.jwt_secret)?;
    let pool = db::connect(&config.transcript_database_url).await?;
    let transcripts = SqliteTranscriptStore::new(pool);

    let addr = format!("0.0.0.0:{}", config.port);
    let state = Arc::new(AppState::new(
        config,
        Arc::new(verifier),
        Arc::new(transcripts),
    ));
    let app = gateway::router(state);

    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
