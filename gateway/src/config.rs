use std::time::Duration;

use shared_types::DEFAULT_FRAGMENT_BYTES;

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the gateway listens on
    pub port: u16,
    /// Shared secret the worker must present. `None` accepts any worker.
    pub worker_secret: Option<String>,
    /// HMAC secret used to verify session bearer tokens
    pub jwt_secret: String,
    /// How long a new connection may take to complete its handshake
    pub handshake_timeout: Duration,
    /// Size of one relayed upload fragment (base64 characters)
    pub upload_fragment_bytes: usize,
    /// Largest multipart body accepted by the upload endpoint
    pub max_upload_bytes: usize,
    /// SQLite database holding chat transcripts
    pub transcript_database_url: String,
    /// Browser origins allowed by CORS
    pub cors_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let jwt_secret = env_var("JWT_SECRET")
            .ok_or_else(|| anyhow::anyhow!("JWT_SECRET must be set for session token verification"))?;

        Ok(Self {
            port: env_parse("GATEWAY_PORT", 8000)?,
            worker_secret: env_var("WORKER_SECRET"),
            jwt_secret,
            handshake_timeout: Duration::from_secs(env_parse("HANDSHAKE_TIMEOUT_SECS", 10)?),
            upload_fragment_bytes: env_parse("UPLOAD_FRAGMENT_BYTES", DEFAULT_FRAGMENT_BYTES)?,
            max_upload_bytes: env_parse("MAX_UPLOAD_BYTES", 50 * 1024 * 1024)?,
            transcript_database_url: env_str(
                "TRANSCRIPT_DATABASE_URL",
                "sqlite:./data/transcripts.db",
            ),
            cors_origins: env_list(
                "CORS_ALLOWED_ORIGINS",
                &["http://localhost:3000", "http://127.0.0.1:3000"],
            ),
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

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    let Some(raw) = env_var(key) else {
        return default.iter().map(|s| s.to_string()).collect();
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
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
