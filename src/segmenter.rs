//! Rule-based sentence segmenter.
//!
//! Splits a document's stored line units into sentence-level units using
//! regex rules. Protects known abbreviations and decimal numbers from
//! false boundary detection. Resegmentation is destructive: it replaces the
//! document's line units and deletes any alignment links that referenced
//! the document. FTS is left stale; the caller reindexes afterwards.

use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;
use serde::Serialize;

use crate::db::Db;

const BASE_ABBREV_PATTERN: &str = concat!(
    r"\b(?:M|Mme|Mmes|Dr|Prof|St|Sgt|Cdt|Lt|Cpt|Mlle|Mlles|No|Nos|Mr|Mrs|Ms)\.",
    r"|\b(?:Jan|Feb|Mar|Apr|Jun|Jul|Aug|Sep|Sept|Oct|Nov|Dec)\.",
    r"|\b(?:p|pp|vol|ed|eds|fig|tab|art|sect|cf|vs|ibid|loc|op|cit)\.",
    r"|\d+\.\d+",
);

fn split_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?:[.!?])\s+(?=[A-ZÀ-Ÿ"\x{2018}\x{2019}\x{201C}\x{201D}(])"#).unwrap()
    })
}

fn pack_extra_abbreviations(pack: &str) -> Option<&'static [&'static str]> {
    match pack {
        "default" => Some(&[]),
        "fr_strict" => Some(&["ann", "chap", "env", "etc", "par"]),
        "en_strict" => Some(&["approx", "dept", "misc", "chap"]),
        _ => None,
    }
}

fn compile_abbrev_regex(pack: &str) -> Result<Regex> {
    let extras = pack_extra_abbreviations(pack)
        .ok_or_else(|| anyhow::anyhow!("unknown segmentation pack: {}", pack))?;
    if extras.is_empty() {
        return Ok(Regex::new(&format!("(?i){}", BASE_ABBREV_PATTERN))?);
    }
    let escaped = extras
        .iter()
        .map(|t| regex::escape(t))
        .collect::<Vec<_>>()
        .join("|");
    let pattern = format!("(?i){}|\\b(?:{})\\.", BASE_ABBREV_PATTERN, escaped);
    Ok(Regex::new(&pattern)?)
}

/// Resolve a user-facing pack name to an internal segmentation pack key.
pub fn resolve_segment_pack(pack: Option<&str>, lang: &str) -> Result<String> {
    let raw = pack.unwrap_or("").trim().to_lowercase();
    if raw.is_empty() || raw == "auto" {
        let norm_lang = lang.trim().to_lowercase();
        if norm_lang.starts_with("fr") {
            return Ok("fr_strict".to_string());
        }
        if norm_lang.starts_with("en") {
            return Ok("en_strict".to_string());
        }
        return Ok("default".to_string());
    }
    if pack_extra_abbreviations(&raw).is_none() {
        anyhow::bail!(
            "unknown segmentation pack: {:?}. Use auto, default, fr_strict, or en_strict",
            raw
        );
    }
    Ok(raw)
}

/// Split `text` into sentence strings.
///
/// 1. Replace known abbreviations with placeholders so their terminal
///    periods are invisible to the sentence-split regex.
/// 2. Split on end punctuation followed by whitespace then a capital
///    letter or opening quote/parenthesis.
/// 3. Restore placeholders.
pub fn segment_text(text: &str, lang: &str, pack: Option<&str>) -> Result<Vec<String>> {
    if text.trim().is_empty() {
        return Ok(if text.is_empty() {
            vec![]
        } else {
            vec![text.to_string()]
        });
    }

    let resolved_pack = resolve_segment_pack(pack, lang)?;
    let abbrev_re = compile_abbrev_regex(&resolved_pack)?;

    let mut placeholders = Vec::new();
    let protected = abbrev_re.replace_all(text, |caps: &regex::Captures| {
        let idx = placeholders.len();
        placeholders.push(caps[0].to_string());
        format!("\u{0}A{}\u{0}", idx)
    });

    let raw_sentences = split_on_boundaries(&protected);

    let mut result = Vec::new();
    for fragment in raw_sentences {
        let mut restored = fragment;
        for (idx, original) in placeholders.iter().enumerate() {
            let ph = format!("\u{0}A{}\u{0}", idx);
            restored = restored.replace(&ph, original);
        }
        let trimmed = restored.trim().to_string();
        if !trimmed.is_empty() {
            result.push(trimmed);
        }
    }

    if result.is_empty() {
        result.push(text.trim().to_string());
    }
    Ok(result)
}

fn split_on_boundaries(text: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut last = 0;
    for m in split_re().find_iter(text) {
        // The match covers the terminal punctuation plus the whitespace run
        // that follows it; the next sentence's first character is only
        // checked via lookahead, so it stays unconsumed at m.end().
        let punct_end = m.start() + 1;
        pieces.push(text[last..punct_end].to_string());
        last = m.end();
    }
    pieces.push(text[last..].to_string());
    pieces
}

#[derive(Debug, Serialize)]
pub struct SegmentationReport {
    pub doc_id: i64,
    pub units_input: i64,
    pub units_output: i64,
    pub segment_pack: String,
    pub warnings: Vec<String>,
}

/// Replace the line units of `doc_id` with sentence-segmented units.
pub async fn resegment_document(
    db: &Db,
    doc_id: i64,
    lang: &str,
    pack: Option<&str>,
) -> Result<SegmentationReport> {
    let resolved_pack = resolve_segment_pack(pack, lang)?;

    let _guard = db.lock().await;

    let rows: Vec<(i64, i64, String, String)> = sqlx::query_as(
        "SELECT unit_id, n, text_raw, text_norm FROM units
         WHERE doc_id = ? AND unit_type = 'line' ORDER BY n",
    )
    .bind(doc_id)
    .fetch_all(&db.pool)
    .await?;

    if rows.is_empty() {
        return Ok(SegmentationReport {
            doc_id,
            units_input: 0,
            units_output: 0,
            segment_pack: resolved_pack,
            warnings: vec![format!("No line units found for doc_id={}", doc_id)],
        });
    }

    let mut new_units = Vec::new();
    let mut global_n: i64 = 1;
    for (_, _, _, text_norm) in &rows {
        let sentences = segment_text(text_norm, lang, Some(&resolved_pack))?;
        for sentence in sentences {
            new_units.push((global_n, sentence));
            global_n += 1;
        }
    }

    let deleted_links = sqlx::query(
        "DELETE FROM alignment_links WHERE pivot_doc_id = ? OR target_doc_id = ?",
    )
    .bind(doc_id)
    .bind(doc_id)
    .execute(&db.pool)
    .await?
    .rows_affected();

    sqlx::query("DELETE FROM units WHERE doc_id = ? AND unit_type = 'line'")
        .bind(doc_id)
        .execute(&db.pool)
        .await?;

    for (n, sentence) in &new_units {
        sqlx::query(
            "INSERT INTO units (doc_id, unit_type, n, external_id, text_raw, text_norm, meta_json)
             VALUES (?, 'line', ?, NULL, ?, ?, NULL)",
        )
        .bind(doc_id)
        .bind(n)
        .bind(sentence)
        .bind(sentence)
        .execute(&db.pool)
        .await?;
    }

    let mut warnings = Vec::new();
    if deleted_links > 0 {
        let warn = format!(
            "Deleted {} alignment_link(s) for doc_id={} (stale after resegmentation)",
            deleted_links, doc_id
        );
        tracing::warn!("{}", warn);
        warnings.push(warn);
    }

    tracing::info!(
        doc_id,
        units_input = rows.len(),
        units_output = new_units.len(),
        "resegmented document"
    );

    Ok(SegmentationReport {
        doc_id,
        units_input: rows.len() as i64,
        units_output: new_units.len() as i64,
        segment_pack: resolved_pack,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_simple_sentences() {
        let sentences = segment_text("Hello world. This is a test.", "en", None).unwrap();
        assert_eq!(sentences, vec!["Hello world.", "This is a test."]);
    }

    #[test]
    fn protects_titles_and_decimals() {
        let sentences =
            segment_text("Dr. Smith paid 3.14 dollars. He left.", "en", None).unwrap();
        assert_eq!(sentences, vec!["Dr. Smith paid 3.14 dollars.", "He left."]);
    }

    #[test]
    fn auto_resolves_pack_from_language_prefix() {
        assert_eq!(resolve_segment_pack(None, "fr-FR").unwrap(), "fr_strict");
        assert_eq!(resolve_segment_pack(Some("auto"), "en-US").unwrap(), "en_strict");
        assert_eq!(resolve_segment_pack(None, "de").unwrap(), "default");
    }

    #[test]
    fn unknown_pack_is_rejected() {
        assert!(resolve_segment_pack(Some("klingon"), "en").is_err());
    }

    #[test]
    fn empty_text_returns_empty_list() {
        assert_eq!(segment_text("", "en", None).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn no_boundary_returns_single_sentence() {
        assert_eq!(
            segment_text("no terminal punctuation here", "en", None).unwrap(),
            vec!["no terminal punctuation here"]
        );
    }
}
