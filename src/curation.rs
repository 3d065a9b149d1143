//! Regex-based text curation rules applied over stored units.
//!
//! All rules in a batch are compiled and validated before any unit is
//! touched, so an invalid pattern aborts the whole batch rather than
//! leaving a document half-curated. Rules are applied sequentially to
//! `text_norm`; only units whose text actually changes are written back.
//! FTS is left stale after curation; callers reindex afterward.

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::db::Db;

#[derive(Debug, Deserialize)]
pub struct CurationRuleSpec {
    pub pattern: String,
    pub replacement: String,
    /// Any of `i` (case-insensitive), `m` (multi-line `^`/`$`), `s` (`.`
    /// matches newlines), in any combination/order, e.g. `"im"`.
    #[serde(default)]
    pub flags: String,
    #[serde(default)]
    pub description: Option<String>,
}

pub struct CurationRule {
    pub regex: Regex,
    pub replacement: String,
    pub description: String,
}

/// Compile and validate every rule spec up front. Fails on the first
/// invalid pattern (or unknown flag), before any unit is read or modified.
pub fn rules_from_list(specs: &[CurationRuleSpec]) -> Result<Vec<CurationRule>> {
    let mut rules = Vec::with_capacity(specs.len());
    for spec in specs {
        let mut builder = RegexBuilder::new(&spec.pattern);
        for flag in spec.flags.chars() {
            match flag {
                'i' => {
                    builder.case_insensitive(true);
                }
                'm' => {
                    builder.multi_line(true);
                }
                's' => {
                    builder.dot_matches_new_line(true);
                }
                other => anyhow::bail!(
                    "unknown curation flag {:?} (expected one of i, m, s)",
                    other
                ),
            }
        }
        let regex = builder
            .build()
            .with_context(|| format!("invalid curation pattern: {:?}", spec.pattern))?;
        let description = spec
            .description
            .clone()
            .unwrap_or_else(|| spec.pattern.clone());
        rules.push(CurationRule {
            regex,
            replacement: spec.replacement.clone(),
            description,
        });
    }
    Ok(rules)
}

/// Apply every rule in sequence to `text`, returning the final text and the
/// descriptions of rules that matched at the point they ran (i.e. against
/// the output of any earlier rules in the batch, not the original input).
pub fn apply_rules(text: &str, rules: &[CurationRule]) -> (String, Vec<String>) {
    let mut current = text.to_string();
    let mut fired = Vec::new();
    for rule in rules {
        if rule.regex.is_match(&current) {
            fired.push(rule.description.clone());
        }
        current = rule.regex.replace_all(&current, rule.replacement.as_str()).to_string();
    }
    (current, fired)
}

#[derive(Debug, Serialize)]
pub struct CurationReport {
    pub doc_id: i64,
    pub units_examined: usize,
    pub units_changed: usize,
    pub rules_fired: Vec<String>,
}

/// Apply `rules` to every line unit of `doc_id`, writing back only units
/// whose text changed.
pub async fn curate_document(db: &Db, doc_id: i64, rules: &[CurationRule]) -> Result<CurationReport> {
    let _guard = db.lock().await;

    let rows: Vec<(i64, String)> = sqlx::query_as(
        "SELECT unit_id, text_norm FROM units WHERE doc_id = ? AND unit_type = 'line'",
    )
    .bind(doc_id)
    .fetch_all(&db.pool)
    .await?;

    let mut units_changed = 0;
    let mut fired_descriptions = std::collections::BTreeSet::new();

    for (unit_id, text_norm) in &rows {
        let (new_text, fired) = apply_rules(text_norm, rules);
        if &new_text != text_norm {
            for f in &fired {
                fired_descriptions.insert(f.clone());
            }
            sqlx::query("UPDATE units SET text_norm = ? WHERE unit_id = ?")
                .bind(&new_text)
                .bind(unit_id)
                .execute(&db.pool)
                .await?;
            units_changed += 1;
        }
    }

    tracing::info!(doc_id, units_changed, "curated document");

    Ok(CurationReport {
        doc_id,
        units_examined: rows.len(),
        units_changed,
        rules_fired: fired_descriptions.into_iter().collect(),
    })
}

#[derive(Debug, Serialize)]
pub struct CurationExample {
    pub unit_id: i64,
    pub before: String,
    pub after: String,
}

#[derive(Debug, Serialize)]
pub struct CurationPreview {
    pub doc_id: i64,
    pub units_total: usize,
    pub units_changed: usize,
    pub replacements_total: usize,
    pub examples: Vec<CurationExample>,
}

/// Evaluate `rules` over `doc_id` without writing anything back. Returns up
/// to `max_examples` before/after pairs for units that would change.
pub async fn preview_curation(
    db: &Db,
    doc_id: i64,
    rules: &[CurationRule],
    max_examples: usize,
) -> Result<CurationPreview> {
    let _guard = db.lock().await;

    let rows: Vec<(i64, String)> = sqlx::query_as(
        "SELECT unit_id, text_norm FROM units WHERE doc_id = ? AND unit_type = 'line'",
    )
    .bind(doc_id)
    .fetch_all(&db.pool)
    .await?;

    let mut units_changed = 0;
    let mut replacements_total = 0;
    let mut examples = Vec::new();

    for (unit_id, text_norm) in &rows {
        let (new_text, fired) = apply_rules(text_norm, rules);
        if &new_text != text_norm {
            units_changed += 1;
            replacements_total += fired.len();
            if examples.len() < max_examples {
                examples.push(CurationExample {
                    unit_id: *unit_id,
                    before: text_norm.clone(),
                    after: new_text,
                });
            }
        }
    }

    Ok(CurationPreview {
        doc_id,
        units_total: rows.len(),
        units_changed,
        replacements_total,
        examples,
    })
}

/// Apply `rules` to every document in the corpus.
pub async fn curate_all_documents(db: &Db, rules: &[CurationRule]) -> Result<Vec<CurationReport>> {
    let doc_ids: Vec<i64> = {
        let _guard = db.lock().await;
        sqlx::query_scalar("SELECT doc_id FROM documents")
            .fetch_all(&db.pool)
            .await?
    };

    let mut reports = Vec::with_capacity(doc_ids.len());
    for doc_id in doc_ids {
        reports.push(curate_document(db, doc_id, rules).await?);
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, replacement: &str) -> CurationRuleSpec {
        CurationRuleSpec {
            pattern: pattern.to_string(),
            replacement: replacement.to_string(),
            flags: String::new(),
            description: None,
        }
    }

    fn rule_with_flags(pattern: &str, replacement: &str, flags: &str) -> CurationRuleSpec {
        CurationRuleSpec {
            pattern: pattern.to_string(),
            replacement: replacement.to_string(),
            flags: flags.to_string(),
            description: None,
        }
    }

    #[test]
    fn invalid_pattern_aborts_whole_batch() {
        let specs = vec![rule("valid.*", "x"), rule("(unclosed", "y")];
        assert!(rules_from_list(&specs).is_err());
    }

    #[test]
    fn unknown_flag_is_rejected() {
        let specs = vec![rule_with_flags("foo", "bar", "z")];
        assert!(rules_from_list(&specs).is_err());
    }

    #[test]
    fn case_insensitive_flag_matches_mixed_case() {
        let specs = vec![rule_with_flags("foo", "bar", "i")];
        let rules = rules_from_list(&specs).unwrap();
        let (text, fired) = apply_rules("FOO baz", &rules);
        assert_eq!(text, "bar baz");
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn dotall_flag_lets_dot_span_newlines() {
        let specs = vec![rule_with_flags("a.b", "X", "s")];
        let rules = rules_from_list(&specs).unwrap();
        let (text, _) = apply_rules("a\nb", &rules);
        assert_eq!(text, "X");
    }

    #[test]
    fn apply_rules_runs_sequentially() {
        let specs = vec![rule("foo", "bar"), rule("bar", "baz")];
        let rules = rules_from_list(&specs).unwrap();
        let (text, fired) = apply_rules("foo", &rules);
        assert_eq!(text, "baz");
        assert_eq!(fired, vec!["foo".to_string(), "bar".to_string()]);
    }

    #[test]
    fn apply_rules_no_match_fires_nothing() {
        let specs = vec![rule("zzz", "y")];
        let rules = rules_from_list(&specs).unwrap();
        let (text, fired) = apply_rules("abc", &rules);
        assert_eq!(text, "abc");
        assert!(fired.is_empty());
    }

    async fn test_db() -> (Db, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::Config {
            db: crate::config::DbConfig {
                path: dir.path().join("corpus.db"),
            },
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
    async fn preview_curation_does_not_write() {
        let (db, _dir) = test_db().await;
        sqlx::query(
            "INSERT INTO documents (title, language, created_at) VALUES ('t', 'en', '2026-01-01T00:00:00Z')",
        )
        .execute(&db.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO units (doc_id, unit_type, n, text_raw, text_norm) VALUES (1, 'line', 1, 'foo bar', 'foo bar')",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let rules = rules_from_list(&[rule("foo", "baz")]).unwrap();
        let preview = preview_curation(&db, 1, &rules, 10).await.unwrap();
        assert_eq!(preview.units_total, 1);
        assert_eq!(preview.units_changed, 1);
        assert_eq!(preview.examples[0].after, "baz bar");

        let stored: String = sqlx::query_scalar("SELECT text_norm FROM units WHERE unit_id = 1")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(stored, "foo bar");
    }

    // Two rules that net back to the original text must not be reported as
    // fired: the unit itself never changed.
    #[tokio::test]
    async fn curate_document_does_not_report_rules_that_net_no_change() {
        let (db, _dir) = test_db().await;
        sqlx::query(
            "INSERT INTO documents (title, language, created_at) VALUES ('t', 'en', '2026-01-01T00:00:00Z')",
        )
        .execute(&db.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO units (doc_id, unit_type, n, text_raw, text_norm) VALUES (1, 'line', 1, 'foo', 'foo')",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let rules = rules_from_list(&[rule("foo", "bar"), rule("bar", "foo")]).unwrap();
        let report = curate_document(&db, 1, &rules).await.unwrap();
        assert_eq!(report.units_changed, 0);
        assert!(report.rules_fired.is_empty());
    }
}
