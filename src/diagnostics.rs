//! Whole-database health report: integrity check, schema version, row
//! counts, FTS staleness, alignment integrity, and metadata completeness.

use anyhow::Result;
use serde::Serialize;

use crate::db::Db;

#[derive(Debug, Serialize)]
pub struct CountSummary {
    pub documents: i64,
    pub units_total: i64,
    pub line_units: i64,
    pub structure_units: i64,
    pub runs: i64,
    pub alignment_links: i64,
    pub fts_rows: i64,
}

#[derive(Debug, Serialize)]
pub struct FtsStaleness {
    pub row_delta_vs_line_units: i64,
    pub missing_line_units: i64,
    pub orphan_rows: i64,
}

#[derive(Debug, Serialize)]
pub struct RunStats {
    pub by_kind: Vec<(String, i64)>,
    pub without_stats: i64,
}

#[derive(Debug, Serialize)]
pub struct AlignmentIntegrity {
    pub dangling_pivot_units: i64,
    pub dangling_target_units: i64,
    pub doc_mismatch: i64,
    pub self_links: i64,
}

#[derive(Debug, Serialize)]
pub struct MetadataSummary {
    pub missing_required_fields: i64,
    pub docs_without_line_units: i64,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub enum DbStatus {
    Ok,
    Warning,
    Error,
}

#[derive(Debug, Serialize)]
pub struct DiagnosticsReport {
    pub integrity_check: String,
    pub schema_versions: Vec<i64>,
    pub counts: CountSummary,
    pub fts: FtsStaleness,
    pub runs: RunStats,
    pub alignment: AlignmentIntegrity,
    pub metadata: MetadataSummary,
    pub status: DbStatus,
}

pub async fn collect_diagnostics(db: &Db) -> Result<DiagnosticsReport> {
    let _guard = db.lock().await;

    let integrity_check: String = sqlx::query_scalar("PRAGMA integrity_check")
        .fetch_one(&db.pool)
        .await?;

    let schema_versions: Vec<i64> =
        sqlx::query_scalar("SELECT version FROM schema_migrations ORDER BY version")
            .fetch_all(&db.pool)
            .await?;

    let counts = CountSummary {
        documents: scalar(db, "SELECT COUNT(*) FROM documents").await?,
        units_total: scalar(db, "SELECT COUNT(*) FROM units").await?,
        line_units: scalar(db, "SELECT COUNT(*) FROM units WHERE unit_type = 'line'").await?,
        structure_units: scalar(db, "SELECT COUNT(*) FROM units WHERE unit_type = 'structure'")
            .await?,
        runs: scalar(db, "SELECT COUNT(*) FROM runs").await?,
        alignment_links: scalar(db, "SELECT COUNT(*) FROM alignment_links").await?,
        fts_rows: scalar(db, "SELECT COUNT(*) FROM fts_units").await?,
    };

    let missing_line_units: i64 = scalar(
        db,
        "SELECT COUNT(*) FROM units u
         WHERE u.unit_type = 'line'
         AND NOT EXISTS (SELECT 1 FROM fts_units f WHERE f.rowid = u.unit_id)",
    )
    .await?;
    let orphan_rows: i64 = scalar(
        db,
        "SELECT COUNT(*) FROM fts_units f
         WHERE NOT EXISTS (SELECT 1 FROM units u WHERE u.unit_id = f.rowid)",
    )
    .await?;

    let fts = FtsStaleness {
        row_delta_vs_line_units: counts.fts_rows - counts.line_units,
        missing_line_units,
        orphan_rows,
    };

    let by_kind: Vec<(String, i64)> = sqlx::query_as(
        "SELECT kind, COUNT(*) FROM runs GROUP BY kind ORDER BY kind",
    )
    .fetch_all(&db.pool)
    .await?;
    let without_stats: i64 = scalar(db, "SELECT COUNT(*) FROM runs WHERE stats_json IS NULL").await?;
    let runs = RunStats { by_kind, without_stats };

    let dangling_pivot_units: i64 = scalar(
        db,
        "SELECT COUNT(*) FROM alignment_links al
         WHERE NOT EXISTS (SELECT 1 FROM units u WHERE u.unit_id = al.pivot_unit_id)",
    )
    .await?;
    let dangling_target_units: i64 = scalar(
        db,
        "SELECT COUNT(*) FROM alignment_links al
         WHERE NOT EXISTS (SELECT 1 FROM units u WHERE u.unit_id = al.target_unit_id)",
    )
    .await?;
    let doc_mismatch: i64 = scalar(
        db,
        "SELECT COUNT(*) FROM alignment_links al
         JOIN units up ON up.unit_id = al.pivot_unit_id
         JOIN units ut ON ut.unit_id = al.target_unit_id
         WHERE up.doc_id != al.pivot_doc_id OR ut.doc_id != al.target_doc_id",
    )
    .await?;
    let self_links: i64 = scalar(
        db,
        "SELECT COUNT(*) FROM alignment_links WHERE pivot_doc_id = target_doc_id",
    )
    .await?;

    let alignment = AlignmentIntegrity {
        dangling_pivot_units,
        dangling_target_units,
        doc_mismatch,
        self_links,
    };

    let missing_required_fields: i64 = scalar(
        db,
        "SELECT COUNT(*) FROM documents
         WHERE title IS NULL OR trim(title) = '' OR language IS NULL OR trim(language) = ''",
    )
    .await?;
    let docs_without_line_units: i64 = scalar(
        db,
        "SELECT COUNT(*) FROM documents d
         WHERE NOT EXISTS (
             SELECT 1 FROM units u WHERE u.doc_id = d.doc_id AND u.unit_type = 'line'
         )",
    )
    .await?;

    let metadata = MetadataSummary {
        missing_required_fields,
        docs_without_line_units,
    };

    let status = if integrity_check != "ok"
        || dangling_pivot_units > 0
        || dangling_target_units > 0
        || doc_mismatch > 0
    {
        DbStatus::Error
    } else if fts.missing_line_units > 0
        || fts.orphan_rows > 0
        || self_links > 0
        || missing_required_fields > 0
        || docs_without_line_units > 0
    {
        DbStatus::Warning
    } else {
        DbStatus::Ok
    };

    Ok(DiagnosticsReport {
        integrity_check,
        schema_versions,
        counts,
        fts,
        runs,
        alignment,
        metadata,
        status,
    })
}

async fn scalar(db: &Db, sql: &str) -> Result<i64> {
    Ok(sqlx::query_scalar(sql).fetch_one(&db.pool).await?)
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
    async fn fresh_database_is_ok() {
        let (db, _dir) = test_db().await;
        let report = collect_diagnostics(&db).await.unwrap();
        assert_eq!(report.status, DbStatus::Ok);
        assert_eq!(report.counts.documents, 0);
        assert_eq!(report.integrity_check, "ok");
    }

    #[tokio::test]
    async fn document_without_line_units_is_a_warning() {
        let (db, _dir) = test_db().await;
        sqlx::query(
            "INSERT INTO documents (title, language, created_at) VALUES ('t', 'en', '2026-01-01T00:00:00Z')",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let report = collect_diagnostics(&db).await.unwrap();
        assert_eq!(report.status, DbStatus::Warning);
        assert_eq!(report.metadata.docs_without_line_units, 1);
    }

    #[tokio::test]
    async fn self_link_is_a_warning_not_an_error() {
        let (db, _dir) = test_db().await;
        sqlx::query(
            "INSERT INTO documents (title, language, created_at) VALUES ('t', 'en', '2026-01-01T00:00:00Z')",
        )
        .execute(&db.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO units (doc_id, unit_type, n, text_raw, text_norm) VALUES (1, 'line', 1, 'a', 'a')",
        )
        .execute(&db.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO units (doc_id, unit_type, n, text_raw, text_norm) VALUES (1, 'line', 2, 'b', 'b')",
        )
        .execute(&db.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO alignment_links
             (run_id, pivot_unit_id, target_unit_id, pivot_doc_id, target_doc_id, created_at)
             VALUES ('run-1', 1, 2, 1, 1, '2026-01-01T00:00:00Z')",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let report = collect_diagnostics(&db).await.unwrap();
        assert_eq!(report.alignment.self_links, 1);
        assert_eq!(report.status, DbStatus::Warning);
    }
}
