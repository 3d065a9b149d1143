//! Document listing and metadata editing.
//!
//! Documents are created once by import and never deleted; these functions
//! only touch the metadata fields import leaves mutable (title, language,
//! doc_role, resource_type, metadata_json).

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::db::Db;
use crate::models::{Document, DOC_ROLE_VALUES};

/// List every document, ordered by id.
pub async fn list_documents(db: &Db) -> Result<Vec<Document>> {
    let _guard = db.lock().await;
    let rows: Vec<(
        i64,
        String,
        String,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        String,
    )> = sqlx::query_as(
        "SELECT doc_id, title, language, doc_role, resource_type, metadata_json,
                source_hash, source_path, created_at
         FROM documents ORDER BY doc_id",
    )
    .fetch_all(&db.pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(
            |(
                doc_id,
                title,
                language,
                doc_role,
                resource_type,
                metadata_json,
                source_hash,
                source_path,
                created_at,
            )| Document {
                doc_id,
                title,
                language,
                doc_role,
                resource_type,
                metadata_json,
                source_hash,
                source_path,
                created_at,
            },
        )
        .collect())
}

#[derive(Debug, Deserialize, Default)]
pub struct DocumentUpdate {
    pub title: Option<String>,
    pub language: Option<String>,
    pub doc_role: Option<String>,
    pub resource_type: Option<String>,
    pub metadata_json: Option<String>,
}

/// Update the mutable metadata fields of one document. Errors if the
/// document does not exist or `doc_role` is outside the closed enum.
pub async fn update_document(db: &Db, doc_id: i64, update: &DocumentUpdate) -> Result<()> {
    if let Some(role) = &update.doc_role {
        if !DOC_ROLE_VALUES.contains(&role.as_str()) {
            anyhow::bail!(
                "doc_role must be one of {:?}, got {:?}",
                DOC_ROLE_VALUES,
                role
            );
        }
    }

    let _guard = db.lock().await;

    let exists: Option<i64> = sqlx::query_scalar("SELECT doc_id FROM documents WHERE doc_id = ?")
        .bind(doc_id)
        .fetch_optional(&db.pool)
        .await?;
    if exists.is_none() {
        anyhow::bail!("document not found: {}", doc_id);
    }

    if let Some(v) = &update.title {
        sqlx::query("UPDATE documents SET title = ? WHERE doc_id = ?")
            .bind(v)
            .bind(doc_id)
            .execute(&db.pool)
            .await?;
    }
    if let Some(v) = &update.language {
        sqlx::query("UPDATE documents SET language = ? WHERE doc_id = ?")
            .bind(v)
            .bind(doc_id)
            .execute(&db.pool)
            .await?;
    }
    if let Some(v) = &update.doc_role {
        sqlx::query("UPDATE documents SET doc_role = ? WHERE doc_id = ?")
            .bind(v)
            .bind(doc_id)
            .execute(&db.pool)
            .await?;
    }
    if let Some(v) = &update.resource_type {
        sqlx::query("UPDATE documents SET resource_type = ? WHERE doc_id = ?")
            .bind(v)
            .bind(doc_id)
            .execute(&db.pool)
            .await?;
    }
    if let Some(v) = &update.metadata_json {
        sqlx::query("UPDATE documents SET metadata_json = ? WHERE doc_id = ?")
            .bind(v)
            .bind(doc_id)
            .execute(&db.pool)
            .await?;
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct BulkDocumentUpdate {
    pub doc_id: i64,
    #[serde(flatten)]
    pub update: DocumentUpdate,
}

#[derive(Debug, Serialize)]
pub struct BulkUpdateReport {
    pub updated: Vec<i64>,
    pub failed: Vec<(i64, String)>,
}

/// Apply each update independently; a failure on one doc_id does not abort
/// the rest of the batch.
pub async fn bulk_update_documents(
    db: &Db,
    updates: &[BulkDocumentUpdate],
) -> Result<BulkUpdateReport> {
    let mut updated = Vec::new();
    let mut failed = Vec::new();
    for item in updates {
        match update_document(db, item.doc_id, &item.update).await {
            Ok(()) => updated.push(item.doc_id),
            Err(err) => failed.push((item.doc_id, err.to_string())),
        }
    }
    Ok(BulkUpdateReport { updated, failed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DbConfig};

    async fn test_db() -> (Db, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("corpus.db");
        let config = Config {
            db: DbConfig { path: db_path },
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
    async fn update_rejects_unknown_document() {
        let (db, _dir) = test_db().await;
        let update = DocumentUpdate {
            title: Some("New title".to_string()),
            ..Default::default()
        };
        assert!(update_document(&db, 999, &update).await.is_err());
    }

    #[tokio::test]
    async fn update_rejects_invalid_doc_role() {
        let (db, _dir) = test_db().await;
        sqlx::query(
            "INSERT INTO documents (title, language, created_at) VALUES ('t', 'en', '2026-01-01T00:00:00Z')",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let update = DocumentUpdate {
            doc_role: Some("bogus".to_string()),
            ..Default::default()
        };
        assert!(update_document(&db, 1, &update).await.is_err());
    }

    #[tokio::test]
    async fn bulk_update_isolates_failures() {
        let (db, _dir) = test_db().await;
        sqlx::query(
            "INSERT INTO documents (title, language, created_at) VALUES ('t', 'en', '2026-01-01T00:00:00Z')",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let updates = vec![
            BulkDocumentUpdate {
                doc_id: 1,
                update: DocumentUpdate {
                    title: Some("Updated".to_string()),
                    ..Default::default()
                },
            },
            BulkDocumentUpdate {
                doc_id: 42,
                update: DocumentUpdate::default(),
            },
        ];
        let report = bulk_update_documents(&db, &updates).await.unwrap();
        assert_eq!(report.updated, vec![1]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, 42);

        let docs = list_documents(&db).await.unwrap();
        assert_eq!(docs[0].title, "Updated");
    }
}
