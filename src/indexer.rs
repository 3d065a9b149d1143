//! FTS5 index management.
//!
//! Builds or rebuilds the `fts_units` FTS5 index from `units`. Only
//! `unit_type = 'line'` units are indexed. `fts_units` is a regular
//! (non-contentless) FTS5 table whose `rowid` equals `unit_id`, enabling
//! efficient joins back to `units`/`documents`.

use anyhow::Result;

use crate::db::Db;

/// Rebuild the FTS5 index from scratch. Returns the count of units indexed.
pub async fn build_index(db: &Db) -> Result<i64> {
    let _guard = db.lock().await;

    sqlx::query("DELETE FROM fts_units").execute(&db.pool).await?;

    sqlx::query(
        "INSERT INTO fts_units(rowid, text_norm)
         SELECT unit_id, text_norm FROM units WHERE unit_type = 'line'",
    )
    .execute(&db.pool)
    .await?;

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM units WHERE unit_type = 'line'")
        .fetch_one(&db.pool)
        .await?;

    tracing::info!(count, "rebuilt FTS5 index");
    Ok(count)
}

/// Update the FTS index for units not yet indexed. Equivalent to a full
/// rebuild for now — no incremental "last indexed" tracking yet.
pub async fn update_index(db: &Db) -> Result<i64> {
    build_index(db).await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> (Db, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::Config {
            db: crate::config::DbConfig { path: dir.path().join("corpus.db") },
            migrations: Default::default(),
            server: Default::default(),
            segmentation: Default::default(),
            alignment: Default::default(),
        };
        let db = crate::db::connect(&config).await.unwrap();
        sqlx::raw_sql(include_str!("../migrations/001_init.sql"))
            .execute(&db.pool)
            .await
            .unwrap();
        (db, dir)
    }

    #[tokio::test]
    async fn build_index_indexes_only_line_units() {
        let (db, _dir) = test_db().await;
        sqlx::query(
            "INSERT INTO documents (title, language, created_at) VALUES ('t', 'en', '2026-01-01T00:00:00Z')",
        )
        .execute(&db.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO units (doc_id, unit_type, n, text_raw, text_norm) VALUES (1, 'line', 1, 'a whale', 'a whale')",
        )
        .execute(&db.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO units (doc_id, unit_type, n, text_raw, text_norm) VALUES (1, 'structure', 1, 'chapter one', 'chapter one')",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let count = build_index(&db).await.unwrap();
        assert_eq!(count, 1);

        let fts_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM fts_units")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(fts_rows, 1);
    }

    #[tokio::test]
    async fn build_index_is_idempotent() {
        let (db, _dir) = test_db().await;
        sqlx::query(
            "INSERT INTO documents (title, language, created_at) VALUES ('t', 'en', '2026-01-01T00:00:00Z')",
        )
        .execute(&db.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO units (doc_id, unit_type, n, text_raw, text_norm) VALUES (1, 'line', 1, 'a whale', 'a whale')",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        build_index(&db).await.unwrap();
        let second = update_index(&db).await.unwrap();
        assert_eq!(second, 1);
        let fts_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM fts_units")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(fts_rows, 1);
    }
}
