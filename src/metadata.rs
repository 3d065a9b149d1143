//! Advisory metadata validation. Never rejects a document outright; it
//! reports missing required fields, missing recommended fields, and
//! structural oddities as warnings for the caller to act on.

use anyhow::Result;
use serde::Serialize;

use crate::db::Db;
use crate::models::DOC_ROLE_VALUES;

const REQUIRED_FIELDS: &[&str] = &["title", "language"];
const RECOMMENDED_FIELDS: &[&str] = &["source_path", "source_hash", "doc_role", "resource_type"];

#[derive(Debug, Serialize)]
pub struct MetadataReport {
    pub doc_id: i64,
    pub is_valid: bool,
    pub missing_required: Vec<String>,
    pub missing_recommended: Vec<String>,
    pub warnings: Vec<String>,
}

struct DocRow {
    title: String,
    language: String,
    doc_role: Option<String>,
    resource_type: Option<String>,
    source_path: Option<String>,
    source_hash: Option<String>,
}

/// Validate a single document's metadata completeness and line-unit sanity.
pub async fn validate_document(db: &Db, doc_id: i64) -> Result<MetadataReport> {
    let _guard = db.lock().await;

    let row: Option<(String, String, Option<String>, Option<String>, Option<String>, Option<String>)> =
        sqlx::query_as(
            "SELECT title, language, doc_role, resource_type, source_path, source_hash
             FROM documents WHERE doc_id = ?",
        )
        .bind(doc_id)
        .fetch_optional(&db.pool)
        .await?;
    let row = row.ok_or_else(|| anyhow::anyhow!("document not found: {}", doc_id))?;

    let doc = DocRow {
        title: row.0,
        language: row.1,
        doc_role: row.2,
        resource_type: row.3,
        source_path: row.4,
        source_hash: row.5,
    };

    let line_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM units WHERE doc_id = ? AND unit_type = 'line'",
    )
    .bind(doc_id)
    .fetch_one(&db.pool)
    .await?;

    Ok(validate_fields(doc_id, &doc, line_count))
}

fn field_present(doc: &DocRow, field: &str) -> bool {
    match field {
        "title" => !doc.title.trim().is_empty(),
        "language" => !doc.language.trim().is_empty(),
        "source_path" => doc.source_path.is_some(),
        "source_hash" => doc.source_hash.is_some(),
        "doc_role" => doc.doc_role.is_some(),
        "resource_type" => doc.resource_type.is_some(),
        _ => true,
    }
}

fn validate_fields(doc_id: i64, doc: &DocRow, line_count: i64) -> MetadataReport {
    let missing_required: Vec<String> = REQUIRED_FIELDS
        .iter()
        .filter(|f| !field_present(doc, f))
        .map(|f| f.to_string())
        .collect();

    let missing_recommended: Vec<String> = RECOMMENDED_FIELDS
        .iter()
        .filter(|f| !field_present(doc, f))
        .map(|f| f.to_string())
        .collect();

    let mut warnings = Vec::new();
    if let Some(role) = &doc.doc_role {
        if !DOC_ROLE_VALUES.contains(&role.as_str()) {
            warnings.push(format!(
                "doc_role {:?} is not one of {:?}",
                role, DOC_ROLE_VALUES
            ));
        }
    }
    if line_count == 0 {
        warnings.push("document has no line units".to_string());
    }

    MetadataReport {
        doc_id,
        is_valid: missing_required.is_empty(),
        missing_required,
        missing_recommended,
        warnings,
    }
}

/// Validate every document in the corpus.
pub async fn validate_all_documents(db: &Db) -> Result<Vec<MetadataReport>> {
    let doc_ids: Vec<i64> = {
        let _guard = db.lock().await;
        sqlx::query_scalar("SELECT doc_id FROM documents").fetch_all(&db.pool).await?
    };

    let mut reports = Vec::with_capacity(doc_ids.len());
    for doc_id in doc_ids {
        reports.push(validate_document(db, doc_id).await?);
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(title: &str, language: &str) -> DocRow {
        DocRow {
            title: title.to_string(),
            language: language.to_string(),
            doc_role: None,
            resource_type: None,
            source_path: None,
            source_hash: None,
        }
    }

    #[test]
    fn missing_title_is_invalid() {
        let report = validate_fields(1, &doc("", "en"), 3);
        assert!(!report.is_valid);
        assert_eq!(report.missing_required, vec!["title".to_string()]);
    }

    #[test]
    fn missing_recommended_is_only_a_warning() {
        let report = validate_fields(1, &doc("Title", "en"), 3);
        assert!(report.is_valid);
        assert!(report.missing_recommended.contains(&"source_path".to_string()));
    }

    #[test]
    fn zero_line_units_warns() {
        let report = validate_fields(1, &doc("Title", "en"), 0);
        assert!(report.warnings.iter().any(|w| w.contains("no line units")));
    }

    #[test]
    fn invalid_doc_role_warns() {
        let mut d = doc("Title", "en");
        d.doc_role = Some("bogus".to_string());
        let report = validate_fields(1, &d, 1);
        assert!(report.warnings.iter().any(|w| w.contains("bogus")));
    }

    #[tokio::test]
    async fn validate_document_for_missing_doc_id_errors_not_found() {
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

        let err = validate_document(&db, 404).await.unwrap_err();
        assert!(err.to_string().contains("document not found"));
    }
}
