//! SQLite pool construction.

use crate::errors::GridFsResult;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{path::Path, str::FromStr};
use tokio::fs;

const MAX_CONNECTIONS: u32 = 5;

/// Open a pool for `database_url`, creating the database file and its
/// parent directory when missing.
pub async fn connect(database_url: &str) -> GridFsResult<SqlitePool> {
    tracing::debug!("Connecting using raw URL => {}", database_url);

    if let Some(db_path) = local_path(database_url) {
        tracing::debug!("Interpreted SQLite path => {}", db_path);
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// File path a `sqlite:` URL points at, or `None` for in-memory databases.
fn local_path(database_url: &str) -> Option<&str> {
    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_path_strips_scheme_and_query() {
        assert_eq!(local_path("sqlite://./data/meta/gridfs.db"), Some("./data/meta/gridfs.db"));
        assert_eq!(local_path("sqlite:gridfs.db?mode=rwc"), Some("gridfs.db"));
        assert_eq!(local_path("sqlite::memory:"), None);
    }
}
