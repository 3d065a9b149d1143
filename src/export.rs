//! Export corpus data for downstream tooling: TEI-ish XML per document,
//! aligned pairs as CSV, and a run's ledger entry as a report. Writes to a
//! file path when given one, otherwise to stdout for piping.

use std::io::Write;
use std::path::Path;

use anyhow::Result;
use quick_xml::writer::Writer;
use serde::Serialize;
use sqlx::Row;

use crate::db::Db;

fn write_output(output: Option<&Path>, contents: &str) -> Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, contents)?;
        }
        None => {
            std::io::stdout().write_all(contents.as_bytes())?;
        }
    }
    Ok(())
}

/// Export a document's line units as a minimal TEI `<body>` of `<p>`
/// elements, one per unit, in position order.
pub async fn export_tei(db: &Db, doc_id: i64, output: Option<&Path>) -> Result<()> {
    let _guard = db.lock().await;

    let title: Option<String> = sqlx::query_scalar("SELECT title FROM documents WHERE doc_id = ?")
        .bind(doc_id)
        .fetch_optional(&db.pool)
        .await?;
    let title = title.ok_or_else(|| anyhow::anyhow!("document not found: {}", doc_id))?;

    let rows = sqlx::query(
        "SELECT n, text_norm FROM units WHERE doc_id = ? AND unit_type = 'line' ORDER BY n",
    )
    .bind(doc_id)
    .fetch_all(&db.pool)
    .await?;

    let mut buf = Vec::new();
    {
        let mut writer = Writer::new_with_indent(&mut buf, b' ', 2);
        writer
            .create_element("TEI")
            .write_inner_content::<_, quick_xml::Error>(|w| {
                w.create_element("teiHeader")
                    .write_inner_content::<_, quick_xml::Error>(|w| {
                        w.create_element("title").write_text_content(
                            quick_xml::events::BytesText::new(&title),
                        )?;
                        Ok(())
                    })?;
                w.create_element("text")
                    .write_inner_content::<_, quick_xml::Error>(|w| {
                        w.create_element("body")
                            .write_inner_content::<_, quick_xml::Error>(|w| {
                                for row in &rows {
                                    let n: i64 = row.get("n");
                                    let text: String = row.get("text_norm");
                                    w.create_element("p")
                                        .with_attribute(("n", n.to_string().as_str()))
                                        .write_text_content(quick_xml::events::BytesText::new(
                                            &text,
                                        ))?;
                                }
                                Ok(())
                            })?;
                        Ok(())
                    })?;
                Ok(())
            })?;
    }

    let xml = String::from_utf8(buf)?;
    write_output(output, &xml)
}

#[derive(Debug, Serialize)]
struct AlignCsvRow {
    pivot_unit_id: i64,
    pivot_n: i64,
    pivot_text: String,
    target_unit_id: i64,
    target_n: i64,
    target_text: String,
}

/// Export alignment links for a run as CSV: pivot unit, target unit, and
/// their texts, one row per link.
pub async fn export_align_csv(db: &Db, run_id: &str, output: Option<&Path>) -> Result<()> {
    let _guard = db.lock().await;

    let rows = sqlx::query(
        "SELECT pu.unit_id AS pivot_unit_id, pu.n AS pivot_n, pu.text_norm AS pivot_text,
                tu.unit_id AS target_unit_id, tu.n AS target_n, tu.text_norm AS target_text
         FROM alignment_links al
         JOIN units pu ON pu.unit_id = al.pivot_unit_id
         JOIN units tu ON tu.unit_id = al.target_unit_id
         WHERE al.run_id = ?
         ORDER BY pu.n",
    )
    .bind(run_id)
    .fetch_all(&db.pool)
    .await?;

    let mut wtr = csv::WriterBuilder::new().from_writer(Vec::new());
    wtr.write_record([
        "pivot_unit_id",
        "pivot_n",
        "pivot_text",
        "target_unit_id",
        "target_n",
        "target_text",
    ])?;
    for row in &rows {
        wtr.write_record(&[
            row.get::<i64, _>("pivot_unit_id").to_string(),
            row.get::<i64, _>("pivot_n").to_string(),
            row.get::<String, _>("pivot_text"),
            row.get::<i64, _>("target_unit_id").to_string(),
            row.get::<i64, _>("target_n").to_string(),
            row.get::<String, _>("target_text"),
        ])?;
    }
    let csv_bytes = wtr.into_inner()?;
    let csv_text = String::from_utf8(csv_bytes)?;

    write_output(output, &csv_text)
}

/// Export a single run's ledger entry (params + stats) as pretty JSON.
pub async fn export_run_report(db: &Db, run_id: &str, output: Option<&Path>) -> Result<()> {
    let _guard = db.lock().await;

    let row = sqlx::query(
        "SELECT run_id, kind, params_json, stats_json, created_at FROM runs WHERE run_id = ?",
    )
    .bind(run_id)
    .fetch_optional(&db.pool)
    .await?
    .ok_or_else(|| anyhow::anyhow!("run not found: {}", run_id))?;

    let report = serde_json::json!({
        "run_id": row.get::<String, _>("run_id"),
        "kind": row.get::<String, _>("kind"),
        "params": serde_json::from_str::<serde_json::Value>(&row.get::<String, _>("params_json"))?,
        "stats": row.get::<Option<String>, _>("stats_json")
            .map(|s| serde_json::from_str::<serde_json::Value>(&s))
            .transpose()?,
        "created_at": row.get::<String, _>("created_at"),
    });

    write_output(output, &serde_json::to_string_pretty(&report)?)
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
    async fn export_tei_writes_one_p_per_line_unit() {
        let (db, dir) = test_db().await;
        sqlx::query(
            "INSERT INTO documents (title, language, created_at) VALUES ('Moby Dick', 'en', '2026-01-01T00:00:00Z')",
        )
        .execute(&db.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO units (doc_id, unit_type, n, text_raw, text_norm) VALUES (1, 'line', 1, 'Call me Ishmael.', 'Call me Ishmael.')",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let out_path = dir.path().join("out.xml");
        export_tei(&db, 1, Some(&out_path)).await.unwrap();
        let xml = std::fs::read_to_string(&out_path).unwrap();
        assert!(xml.contains("Moby Dick"));
        assert!(xml.contains("Call me Ishmael."));
        assert!(xml.contains("<p"));
    }

    #[tokio::test]
    async fn export_align_csv_has_header_and_one_row_per_link() {
        let (db, dir) = test_db().await;
        sqlx::query(
            "INSERT INTO documents (title, language, created_at) VALUES ('FR', 'fr', '2026-01-01T00:00:00Z')",
        )
        .execute(&db.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO documents (title, language, created_at) VALUES ('EN', 'en', '2026-01-01T00:00:00Z')",
        )
        .execute(&db.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO units (doc_id, unit_type, n, text_raw, text_norm) VALUES (1, 'line', 1, 'Bonjour', 'Bonjour')",
        )
        .execute(&db.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO units (doc_id, unit_type, n, text_raw, text_norm) VALUES (2, 'line', 1, 'Hello', 'Hello')",
        )
        .execute(&db.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO alignment_links
             (run_id, pivot_unit_id, target_unit_id, pivot_doc_id, target_doc_id, created_at)
             VALUES ('run-1', 1, 2, 1, 2, '2026-01-01T00:00:00Z')",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let out_path = dir.path().join("out.csv");
        export_align_csv(&db, "run-1", Some(&out_path)).await.unwrap();
        let csv_text = std::fs::read_to_string(&out_path).unwrap();
        let mut lines = csv_text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "pivot_unit_id,pivot_n,pivot_text,target_unit_id,target_n,target_text"
        );
        assert_eq!(lines.next().unwrap(), "1,1,Bonjour,2,1,Hello");
        assert!(lines.next().is_none());
    }

    #[tokio::test]
    async fn export_run_report_includes_params_and_stats() {
        let (db, dir) = test_db().await;
        sqlx::query(
            "INSERT INTO runs (run_id, kind, params_json, stats_json, created_at)
             VALUES ('run-1', 'index', '{\"a\":1}', '{\"units_indexed\":3}', '2026-01-01T00:00:00Z')",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let out_path = dir.path().join("report.json");
        export_run_report(&db, "run-1", Some(&out_path)).await.unwrap();
        let report_text = std::fs::read_to_string(&out_path).unwrap();
        let report: serde_json::Value = serde_json::from_str(&report_text).unwrap();
        assert_eq!(report["run_id"], "run-1");
        assert_eq!(report["params"]["a"], 1);
        assert_eq!(report["stats"]["units_indexed"], 3);
    }

    #[tokio::test]
    async fn export_tei_for_missing_document_errors_not_found() {
        let (db, dir) = test_db().await;
        let out_path = dir.path().join("out.xml");
        let err = export_tei(&db, 404, Some(&out_path)).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn export_run_report_for_missing_run_errors_not_found() {
        let (db, dir) = test_db().await;
        let out_path = dir.path().join("report.json");
        let err = export_run_report(&db, "nope", Some(&out_path)).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
