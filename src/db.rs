//! Single shared SQL connection with an explicit process-wide writer lock.
//!
//! The sidecar's concurrency model (§5) calls for one connection, not a
//! pool: the underlying SQLite connection is not safe for concurrent use,
//! so every operation — reads included — acquires [`Db::lock`] before
//! touching `pool`. The pool itself is capped at one connection so sqlx
//! cannot silently hand out a second one.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::Config;

#[derive(Clone)]
pub struct Db {
    pub pool: SqlitePool,
    lock: Arc<Mutex<()>>,
}

impl Db {
    /// Acquire the process-wide writer lock. Hold the returned guard only
    /// for the duration of the DB operation.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

pub async fn connect(config: &Config) -> Result<Db> {
    let db_path = &config.db.path;

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    Ok(Db {
        pool,
        lock: Arc::new(Mutex::new(())),
    })
}

/// Directory holding per-run log files and the portfile, derived from the
/// DB path's parent.
pub fn db_parent(config: &Config) -> std::path::PathBuf {
    config
        .db
        .path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| std::path::PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AlignmentConfig, DbConfig, MigrationsConfig, SegmentationConfig, ServerConfig};

    fn config_for(path: std::path::PathBuf) -> Config {
        Config {
            db: DbConfig { path },
            migrations: MigrationsConfig::default(),
            server: ServerConfig::default(),
            segmentation: SegmentationConfig::default(),
            alignment: AlignmentConfig::default(),
        }
    }

    #[tokio::test]
    async fn connect_creates_parent_directory_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("corpus.db");
        let config = config_for(db_path.clone());
        let _db = connect(&config).await.unwrap();
        assert!(db_path.exists());
    }

    #[test]
    fn db_parent_is_the_path_directory() {
        let config = config_for(std::path::PathBuf::from("/tmp/agrafes/corpus.db"));
        assert_eq!(db_parent(&config), std::path::PathBuf::from("/tmp/agrafes"));
    }

    #[test]
    fn db_parent_falls_back_to_current_dir_for_bare_filenames() {
        let config = config_for(std::path::PathBuf::from("corpus.db"));
        assert_eq!(db_parent(&config), std::path::PathBuf::from("."));
    }
}
