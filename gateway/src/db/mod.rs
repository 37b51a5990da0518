//! Transcript database: URL resolution, pool tuning and migrations.
//!
//! `TRANSCRIPT_DATABASE_URL` accepts `sqlite:<path>`, `sqlite://<path>`, a
//! bare path, or `sqlite::memory:` / `:memory:` for a throwaway store.
//! Relative paths resolve against the working directory.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

/// Writers wait this long on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Memory,
    File(PathBuf),
}

impl Location {
    pub fn parse(database_url: &str) -> Location {
        let trimmed = database_url.trim();
        if matches!(trimmed, ":memory:" | "sqlite::memory:" | "sqlite://:memory:") {
            return Location::Memory;
        }
        let path = trimmed
            .strip_prefix("sqlite://")
            .or_else(|| trimmed.strip_prefix("sqlite:"))
            .unwrap_or(trimmed);
        Location::File(PathBuf::from(path))
    }
}

/// Open (creating if needed) the transcript database and apply migrations.
pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    let pool = match Location::parse(database_url) {
        Location::Memory => open_memory().await?,
        Location::File(path) => open_file(&path).await?,
    };
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

// Every connection to `:memory:` is a separate database, so the pool is
// pinned to one connection that never expires.
async fn open_memory() -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None::<Duration>)
        .max_lifetime(None::<Duration>)
        .connect_with(options)
        .await?;
    info!("transcript database in memory; transcripts are lost on exit");
    Ok(pool)
}

async fn open_file(path: &Path) -> anyhow::Result<SqlitePool> {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let options = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    info!(path = %path.display(), "transcript database opened");
    Ok(pool)
}
