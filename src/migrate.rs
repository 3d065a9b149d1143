//! Forward-only versioned migration runner.
//!
//! Migrations are SQL files in the configured migrations directory, named
//! `NNN_description.sql` where `NNN` is a zero-padded version number.
//! Applied versions are tracked in `schema_migrations`; each file is
//! applied at most once, in version order.

use anyhow::{Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};

use crate::db::Db;

fn find_migrations(dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let re = Regex::new(r"^(\d+)_").unwrap();
    let mut found = Vec::new();

    if !dir.is_dir() {
        return Ok(found);
    }

    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("sql") {
            continue;
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if let Some(caps) = re.captures(name) {
            let version: u32 = caps[1].parse()?;
            found.push((version, path));
        }
    }

    found.sort_by_key(|(version, _)| *version);
    Ok(found)
}

/// Apply any pending migrations and return the count applied.
pub async fn apply_migrations(db: &Db, migrations_dir: &Path) -> Result<usize> {
    let migrations = find_migrations(migrations_dir)?;
    if migrations.is_empty() {
        return Ok(0);
    }

    let _guard = db.lock().await;

    sqlx::raw_sql(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        )",
    )
    .execute(&db.pool)
    .await?;

    let applied: Vec<i64> = sqlx::query_scalar("SELECT version FROM schema_migrations")
        .fetch_all(&db.pool)
        .await?;

    let mut count = 0;
    for (version, path) in migrations {
        if applied.contains(&(version as i64)) {
            continue;
        }
        let sql = std::fs::read_to_string(&path)
            .with_context(|| format!("reading migration {}", path.display()))?;
        sqlx::raw_sql(&sql)
            .execute(&db.pool)
            .await
            .with_context(|| format!("applying migration {}", path.display()))?;

        sqlx::query(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?, datetime('now'))",
        )
        .bind(version as i64)
        .execute(&db.pool)
        .await?;

        tracing::info!(version, file = %path.display(), "applied migration");
        count += 1;
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_and_sorts_versioned_migrations() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("002_second.sql"), "").unwrap();
        std::fs::write(dir.path().join("001_first.sql"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();

        let found = find_migrations(dir.path()).unwrap();
        let versions: Vec<u32> = found.iter().map(|(v, _)| *v).collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[test]
    fn missing_dir_yields_empty() {
        let found = find_migrations(Path::new("/does/not/exist")).unwrap();
        assert!(found.is_empty());
    }
}
