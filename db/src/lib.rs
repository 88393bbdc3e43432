use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

mod bookmarks;
mod configs;
mod sessions;
mod settings;

pub use bookmarks::*;
pub use configs::*;
pub use sessions::*;
pub use settings::*;

/// Path used as the in-memory marker.
pub const MEMORY_DB_PATH: &str = ":memory:";

/// Default on-disk location of the capture database.
pub fn default_db_path() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(".proxy").join("proxy_logs.db"),
        None => PathBuf::from(".proxy.db"),
    }
}

/// Open the database and apply the bootstrap schema.
///
/// On-disk databases get WAL journaling and a pool of readers; the in-memory
/// database is pinned to a single connection so that every caller sees the
/// same store and concurrent writers are serialized by the pool itself.
pub async fn init_pool(db_path: &str) -> anyhow::Result<SqlitePool> {
    let in_memory = db_path == MEMORY_DB_PATH;

    let (url, max_connections) = if in_memory {
        ("sqlite::memory:".to_string(), 1)
    } else {
        if let Some(dir) = Path::new(db_path).parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        (format!("sqlite:{}", db_path), 5)
    };

    let mut options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    for stmt in include_str!("../../migrations/init.sql").split(';') {
        let stmt = stmt.trim();
        if !stmt.is_empty() {
            sqlx::query(stmt).execute(&pool).await?;
        }
    }

    log::debug!("database ready at {}", db_path);
    Ok(pool)
}

/// Size in bytes of the database file, for the sysconfig endpoint.
pub fn db_file_size(db_path: &str) -> i64 {
    if db_path == MEMORY_DB_PATH {
        return 0;
    }
    std::fs::metadata(db_path).map(|m| m.len() as i64).unwrap_or(0)
}

#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    init_pool(MEMORY_DB_PATH).await.unwrap()
}
