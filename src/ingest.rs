//! Unit ingestion contract.
//!
//! A [`DocumentReader`] turns a byte stream into a list of [`ReadUnit`]s; the
//! concrete DOCX/TEI readers are external collaborators (out of scope) and
//! are represented here only by their shared trait plus two plain-text
//! implementations, enough to exercise the ingestion contract end to end.
//! Ingestion inserts one `documents` row and one `units` row per paragraph,
//! then runs [`diagnose_document`] over the freshly inserted units.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::sync::OnceLock;

use crate::db::Db;
use crate::unicode_policy;

/// One paragraph or numbered line read from a source document, with an
/// optional external id carried over from the source's own numbering.
pub struct ReadUnit {
    pub text: String,
    pub external_id: Option<i64>,
}

/// Produces a unit list from raw document bytes.
pub trait DocumentReader {
    fn read_units(&self, bytes: &[u8]) -> Result<Vec<ReadUnit>>;
}

/// Splits on blank lines; trims surrounding whitespace per paragraph. No
/// paragraph carries an external id.
pub struct PlainTextReader;

impl DocumentReader for PlainTextReader {
    fn read_units(&self, bytes: &[u8]) -> Result<Vec<ReadUnit>> {
        let text = String::from_utf8(bytes.to_vec()).context("document is not valid UTF-8")?;
        let units: Vec<ReadUnit> = text
            .split("\n\n")
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .map(|text| ReadUnit { text, external_id: None })
            .collect();
        Ok(units)
    }
}

fn numbered_line_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^\[(\d+)\]\s*(.*)$").unwrap())
}

/// Splits on newlines; a leading `[n]` marker on a line is read as that
/// line's external id and stripped from its text. Lines without a marker
/// carry no external id. Blank lines are dropped.
pub struct NumberedLineReader;

impl DocumentReader for NumberedLineReader {
    fn read_units(&self, bytes: &[u8]) -> Result<Vec<ReadUnit>> {
        let text = String::from_utf8(bytes.to_vec()).context("document is not valid UTF-8")?;
        let re = numbered_line_re();
        let units: Vec<ReadUnit> = text
            .lines()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty())
            .map(|line| match re.captures(line) {
                Some(caps) => ReadUnit {
                    text: caps[2].trim().to_string(),
                    external_id: caps[1].parse::<i64>().ok(),
                },
                None => ReadUnit { text: line.to_string(), external_id: None },
            })
            .collect();
        Ok(units)
    }
}

/// Detect whether `bytes` uses the `[n]` numbered-line convention: true if
/// at least one non-empty line matches it.
fn looks_numbered(bytes: &[u8]) -> bool {
    match std::str::from_utf8(bytes) {
        Ok(text) => text
            .lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .any(|l| numbered_line_re().is_match(l)),
        Err(_) => false,
    }
}

/// Resolve a reader for a `resource_type` tag. DOCX/TEI are out-of-scope
/// external collaborators; until a concrete reader is wired in, they fall
/// back to plain-text splitting, auto-detecting the `[n]`-numbered-line
/// convention so external-id-based alignment has real input to work with.
pub fn reader_for(_resource_type: Option<&str>, bytes: &[u8]) -> Box<dyn DocumentReader> {
    if looks_numbered(bytes) {
        Box::new(NumberedLineReader)
    } else {
        Box::new(PlainTextReader)
    }
}

pub struct ImportParams<'a> {
    pub title: &'a str,
    pub language: &'a str,
    pub doc_role: Option<&'a str>,
    pub resource_type: Option<&'a str>,
    pub source_path: Option<&'a str>,
}

#[derive(Debug, Serialize)]
pub struct ImportReport {
    pub doc_id: i64,
    pub units_inserted: usize,
    pub diagnostics: IngestDiagnostics,
}

/// Import one document: insert the `documents` row, split it into
/// paragraphs via the resolved reader, insert one line unit per paragraph,
/// and run ingestion diagnostics.
pub async fn import_document(db: &Db, bytes: &[u8], params: ImportParams<'_>) -> Result<ImportReport> {
    if params.doc_role.is_some_and(|r| !crate::models::DOC_ROLE_VALUES.contains(&r)) {
        anyhow::bail!(
            "doc_role must be one of {:?}, got {:?}",
            crate::models::DOC_ROLE_VALUES,
            params.doc_role
        );
    }

    let reader = reader_for(params.resource_type, bytes);
    let units = reader.read_units(bytes)?;
    let source_hash = unicode_policy::sha256_of_bytes(bytes);
    let created_at = Utc::now().to_rfc3339();

    let _guard = db.lock().await;

    let doc_id = sqlx::query(
        "INSERT INTO documents (title, language, doc_role, resource_type, source_hash, source_path, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(params.title)
    .bind(params.language)
    .bind(params.doc_role)
    .bind(params.resource_type)
    .bind(&source_hash)
    .bind(params.source_path)
    .bind(&created_at)
    .execute(&db.pool)
    .await?
    .last_insert_rowid();

    for (idx, unit) in units.iter().enumerate() {
        let n = (idx + 1) as i64;
        let text_norm = unicode_policy::normalize(&unit.text);
        sqlx::query(
            "INSERT INTO units (doc_id, unit_type, n, external_id, text_raw, text_norm, meta_json)
             VALUES (?, 'line', ?, ?, ?, ?, NULL)",
        )
        .bind(doc_id)
        .bind(n)
        .bind(unit.external_id)
        .bind(&unit.text)
        .bind(&text_norm)
        .execute(&db.pool)
        .await?;
    }

    let diagnostics = diagnose_document_locked(db, doc_id).await?;

    tracing::info!(doc_id, units = units.len(), "imported document");

    Ok(ImportReport {
        doc_id,
        units_inserted: units.len(),
        diagnostics,
    })
}

#[derive(Debug, Default, Serialize)]
pub struct IngestDiagnostics {
    pub position_holes: Vec<i64>,
    pub duplicate_positions: Vec<i64>,
    pub non_monotonic: bool,
    pub duplicate_external_ids: Vec<i64>,
}

/// Detect holes, duplicates, and non-monotonic ordering among a document's
/// present `external_id` values; `n` itself is always dense and monotone by
/// construction, so these diagnostics are only meaningful over the source's
/// own numbering.
pub async fn diagnose_document(db: &Db, doc_id: i64) -> Result<IngestDiagnostics> {
    let _guard = db.lock().await;
    diagnose_document_locked(db, doc_id).await
}

async fn diagnose_document_locked(db: &Db, doc_id: i64) -> Result<IngestDiagnostics> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT external_id FROM units
         WHERE doc_id = ? AND unit_type = 'line' AND external_id IS NOT NULL
         ORDER BY unit_id",
    )
    .bind(doc_id)
    .fetch_all(&db.pool)
    .await?;

    let external_ids: Vec<i64> = rows.into_iter().map(|(eid,)| eid).collect();

    let non_monotonic = external_ids
        .windows(2)
        .any(|pair| pair[1] <= pair[0]);

    let mut sorted_ids = external_ids.clone();
    sorted_ids.sort_unstable();

    let mut duplicate_positions = Vec::new();
    {
        let mut seen = std::collections::HashSet::new();
        for eid in &sorted_ids {
            if !seen.insert(*eid) {
                duplicate_positions.push(*eid);
            }
        }
    }

    let mut position_holes = Vec::new();
    if let (Some(&min_id), Some(&max_id)) = (sorted_ids.first(), sorted_ids.last()) {
        let present: std::collections::HashSet<i64> = sorted_ids.iter().copied().collect();
        for eid in min_id..=max_id {
            if !present.contains(&eid) {
                position_holes.push(eid);
            }
        }
    }

    Ok(IngestDiagnostics {
        position_holes,
        duplicate_positions: duplicate_positions.clone(),
        non_monotonic,
        duplicate_external_ids: duplicate_positions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_reader_splits_on_blank_lines() {
        let reader = PlainTextReader;
        let units = reader
            .read_units(b"Para one.\n\nPara two.\n\n\nPara three.")
            .unwrap();
        let texts: Vec<&str> = units.iter().map(|u| u.text.as_str()).collect();
        assert_eq!(texts, vec!["Para one.", "Para two.", "Para three."]);
        assert!(units.iter().all(|u| u.external_id.is_none()));
    }

    #[test]
    fn plain_text_reader_rejects_invalid_utf8() {
        let reader = PlainTextReader;
        assert!(reader.read_units(&[0xff, 0xfe, 0xfd]).is_err());
    }

    #[test]
    fn numbered_line_reader_extracts_external_ids() {
        let reader = NumberedLineReader;
        let units = reader
            .read_units(b"[1] Bonjour le monde.\n[2] Au revoir.\nNo marker here.")
            .unwrap();
        assert_eq!(units.len(), 3);
        assert_eq!(units[0].external_id, Some(1));
        assert_eq!(units[0].text, "Bonjour le monde.");
        assert_eq!(units[1].external_id, Some(2));
        assert_eq!(units[2].external_id, None);
        assert_eq!(units[2].text, "No marker here.");
    }

    #[test]
    fn reader_for_detects_numbered_convention() {
        let numbered = reader_for(None, b"[1] one\n[2] two");
        assert_eq!(numbered.read_units(b"[1] one\n[2] two").unwrap().len(), 2);

        let plain = reader_for(None, b"one paragraph\n\nanother paragraph");
        let units = plain.read_units(b"one paragraph\n\nanother paragraph").unwrap();
        assert_eq!(units.len(), 2);
        assert!(units[0].external_id.is_none());
    }

    #[test]
    fn diagnostics_over_external_ids_detect_holes_and_duplicates() {
        let rows = vec![(1i64,), (1i64,), (3i64,)];
        let external_ids: Vec<i64> = rows.into_iter().map(|(eid,)| eid).collect();
        let mut sorted_ids = external_ids.clone();
        sorted_ids.sort_unstable();
        let mut seen = std::collections::HashSet::new();
        let duplicates: Vec<i64> = sorted_ids
            .iter()
            .filter(|eid| !seen.insert(**eid))
            .copied()
            .collect();
        assert_eq!(duplicates, vec![1]);
    }
}
