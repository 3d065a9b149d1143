//! Full-text query engine over `fts_units`.
//!
//! Two render modes: `segment` returns the full normalized text with
//! `<<...>>` match markers; `kwic` returns left/match/right token windows.
//! Pagination (`limit`/`offset`/`has_more`/`next_offset`) is not present in
//! the system this engine is modeled on; it is added here to make the
//! sidecar usable against large corpora.

use anyhow::Result;
use regex::Regex;
use serde::Serialize;

use crate::db::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Segment,
    Kwic,
}

pub struct QueryParams<'a> {
    pub fts_query: &'a str,
    pub language: Option<&'a str>,
    pub doc_id: Option<i64>,
    pub resource_type: Option<&'a str>,
    pub doc_role: Option<&'a str>,
    pub mode: QueryMode,
    pub kwic_window: usize,
    pub all_occurrences: bool,
    pub include_aligned: bool,
    pub aligned_cap: Option<usize>,
    pub limit: i64,
    pub offset: i64,
}

impl<'a> Default for QueryParams<'a> {
    fn default() -> Self {
        QueryParams {
            fts_query: "",
            language: None,
            doc_id: None,
            resource_type: None,
            doc_role: None,
            mode: QueryMode::Segment,
            kwic_window: 10,
            all_occurrences: false,
            include_aligned: false,
            aligned_cap: None,
            limit: 50,
            offset: 0,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AlignedUnit {
    pub unit_id: i64,
    pub doc_id: i64,
    pub title: String,
    pub language: String,
    pub external_id: Option<i64>,
    pub text_norm: String,
}

#[derive(Debug, Serialize)]
pub struct QueryHit {
    pub unit_id: i64,
    pub doc_id: i64,
    pub title: String,
    pub language: String,
    pub n: i64,
    pub segment: Option<String>,
    pub kwic: Option<Vec<KwicWindow>>,
    pub aligned: Vec<AlignedUnit>,
}

#[derive(Debug, Serialize)]
pub struct KwicWindow {
    pub left: String,
    pub matched: String,
    pub right: String,
}

#[derive(Debug, Serialize)]
pub struct QueryResult {
    pub hits: Vec<QueryHit>,
    /// Deliberately not computed (§4.5): an extra row is fetched instead
    /// of running a separate COUNT(*) query.
    pub total: Option<i64>,
    pub limit: i64,
    pub offset: i64,
    pub has_more: bool,
    pub next_offset: Option<i64>,
}

/// Run an FTS5 query, filtered by optional language/doc_id/resource_type/
/// doc_role, and rendered according to `params.mode`.
///
/// Fetches `limit + 1` rows to determine `has_more` without a COUNT(*)
/// query; the engine never reports a total match count.
pub async fn run_query(db: &Db, params: QueryParams<'_>) -> Result<QueryResult> {
    if params.fts_query.trim().is_empty() {
        anyhow::bail!("fts_query must not be empty");
    }
    if !(1..=200).contains(&params.limit) {
        anyhow::bail!("limit must be in 1..=200, got {}", params.limit);
    }
    if params.offset < 0 {
        anyhow::bail!("offset must be >= 0, got {}", params.offset);
    }

    let guard = db.lock().await;

    let mut sql = String::from(
        "SELECT u.unit_id, u.doc_id, d.title, d.language, u.n, u.text_norm
         FROM fts_units f
         JOIN units u ON u.unit_id = f.rowid
         JOIN documents d ON d.doc_id = u.doc_id
         WHERE f.text_norm MATCH ? AND u.unit_type = 'line'",
    );
    if params.language.is_some() {
        sql.push_str(" AND d.language = ?");
    }
    if params.doc_id.is_some() {
        sql.push_str(" AND u.doc_id = ?");
    }
    if params.resource_type.is_some() {
        sql.push_str(" AND d.resource_type = ?");
    }
    if params.doc_role.is_some() {
        sql.push_str(" AND d.doc_role = ?");
    }
    sql.push_str(" ORDER BY u.doc_id, u.n LIMIT ? OFFSET ?");

    let mut row_query = sqlx::query_as::<_, (i64, i64, String, String, i64, String)>(&sql);
    row_query = row_query.bind(params.fts_query);
    if let Some(lang) = params.language {
        row_query = row_query.bind(lang);
    }
    if let Some(doc_id) = params.doc_id {
        row_query = row_query.bind(doc_id);
    }
    if let Some(rt) = params.resource_type {
        row_query = row_query.bind(rt);
    }
    if let Some(role) = params.doc_role {
        row_query = row_query.bind(role);
    }
    row_query = row_query.bind(params.limit + 1).bind(params.offset);

    let mut rows = row_query.fetch_all(&db.pool).await?;

    let has_more = rows.len() as i64 > params.limit;
    if has_more {
        rows.truncate(params.limit as usize);
    }

    let terms = extract_terms(params.fts_query);

    let mut hits = Vec::with_capacity(rows.len());
    for (unit_id, doc_id, title, language, n, text_norm) in rows {
        let (segment, kwic) = match params.mode {
            QueryMode::Segment => (Some(highlight_segment(&text_norm, &terms)), None),
            QueryMode::Kwic => {
                let windows = if params.all_occurrences {
                    all_kwic_windows(&text_norm, &terms, params.kwic_window)
                } else {
                    kwic_windows(&text_norm, &terms, params.kwic_window)
                };
                (None, Some(windows))
            }
        };

        let aligned = if params.include_aligned {
            let mut units = fetch_aligned_units(db, &guard, unit_id).await?;
            if let Some(cap) = params.aligned_cap {
                units.truncate(cap);
            }
            units
        } else {
            Vec::new()
        };

        hits.push(QueryHit {
            unit_id,
            doc_id,
            title,
            language,
            n,
            segment,
            kwic,
            aligned,
        });
    }

    drop(guard);

    let next_offset = if has_more {
        Some(params.offset + params.limit)
    } else {
        None
    };

    Ok(QueryResult {
        hits,
        total: None,
        limit: params.limit,
        offset: params.offset,
        has_more,
        next_offset,
    })
}

async fn fetch_aligned_units(
    db: &Db,
    _guard: &tokio::sync::MutexGuard<'_, ()>,
    pivot_unit_id: i64,
) -> Result<Vec<AlignedUnit>> {
    let rows: Vec<(i64, i64, String, String, Option<i64>, String)> = sqlx::query_as(
        "SELECT u.unit_id, u.doc_id, d.title, d.language, u.external_id, u.text_norm
         FROM alignment_links al
         JOIN units u ON u.unit_id = al.target_unit_id
         JOIN documents d ON d.doc_id = u.doc_id
         WHERE al.pivot_unit_id = ?
         ORDER BY d.language, u.doc_id",
    )
    .bind(pivot_unit_id)
    .fetch_all(&db.pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(unit_id, doc_id, title, language, external_id, text_norm)| AlignedUnit {
            unit_id,
            doc_id,
            title,
            language,
            external_id,
            text_norm,
        })
        .collect())
}

fn extract_terms(fts_query: &str) -> Vec<String> {
    fts_query
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| c == '"' || c == '*').to_string())
        .filter(|t| !t.is_empty() && !is_fts_operator(t))
        .collect()
}

fn is_fts_operator(term: &str) -> bool {
    matches!(term.to_uppercase().as_str(), "AND" | "OR" | "NOT" | "NEAR")
}

/// Wrap every case-insensitive occurrence of any query term with `<<...>>`.
pub fn highlight_segment(text: &str, terms: &[String]) -> String {
    if terms.is_empty() {
        return text.to_string();
    }
    let pattern = terms
        .iter()
        .map(|t| regex::escape(t))
        .collect::<Vec<_>>()
        .join("|");
    let re = match Regex::new(&format!("(?i){}", pattern)) {
        Ok(re) => re,
        Err(_) => return text.to_string(),
    };
    re.replace_all(text, |caps: &regex::Captures| format!("<<{}>>", &caps[0]))
        .to_string()
}

fn tokenize_with_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;
    for (idx, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if let Some(s) = start.take() {
                spans.push((s, idx));
            }
        } else if start.is_none() {
            start = Some(idx);
        }
    }
    if let Some(s) = start {
        spans.push((s, text.len()));
    }
    spans
}

fn token_matches(token: &str, terms: &[String]) -> bool {
    terms
        .iter()
        .any(|t| token.to_lowercase().contains(&t.to_lowercase()))
}

/// First-occurrence KWIC window: `kwic_window` tokens of context either
/// side of the first matching token.
pub fn kwic_windows(text: &str, terms: &[String], window: usize) -> Vec<KwicWindow> {
    let spans = tokenize_with_spans(text);
    for (idx, (s, e)) in spans.iter().enumerate() {
        let token = &text[*s..*e];
        if token_matches(token, terms) {
            return vec![build_window(text, &spans, idx, window)];
        }
    }
    Vec::new()
}

/// KWIC windows around every matching token.
pub fn all_kwic_windows(text: &str, terms: &[String], window: usize) -> Vec<KwicWindow> {
    let spans = tokenize_with_spans(text);
    let mut windows = Vec::new();
    for (idx, (s, e)) in spans.iter().enumerate() {
        let token = &text[*s..*e];
        if token_matches(token, terms) {
            windows.push(build_window(text, &spans, idx, window));
        }
    }
    windows
}

fn build_window(text: &str, spans: &[(usize, usize)], match_idx: usize, window: usize) -> KwicWindow {
    let left_start = match_idx.saturating_sub(window);
    let right_end = (match_idx + window + 1).min(spans.len());

    let left = spans[left_start..match_idx]
        .iter()
        .map(|(s, e)| &text[*s..*e])
        .collect::<Vec<_>>()
        .join(" ");
    let matched = text[spans[match_idx].0..spans[match_idx].1].to_string();
    let right = spans[match_idx + 1..right_end]
        .iter()
        .map(|(s, e)| &text[*s..*e])
        .collect::<Vec<_>>()
        .join(" ");

    KwicWindow { left, matched, right }
}

/// Build an FTS5 `NEAR(t1 t2 ..., N)` helper string. Requires >= 2 terms.
pub fn proximity_query(terms: &[&str], distance: u32) -> Result<String> {
    if terms.len() < 2 {
        anyhow::bail!("proximity_query requires at least 2 terms");
    }
    Ok(format!("NEAR({}, {})", terms.join(" "), distance))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highlight_wraps_matches_case_insensitively() {
        let terms = vec!["chat".to_string()];
        assert_eq!(
            highlight_segment("Le Chat noir dort.", &terms),
            "Le <<Chat>> noir dort."
        );
    }

    #[test]
    fn kwic_windows_first_occurrence_only() {
        let terms = vec!["chat".to_string()];
        let windows = kwic_windows("le petit chat noir dort sur le tapis", &terms, 2);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].left, "le petit");
        assert_eq!(windows[0].matched, "chat");
        assert_eq!(windows[0].right, "noir dort");
    }

    #[test]
    fn all_kwic_windows_returns_every_match() {
        let terms = vec!["chat".to_string()];
        let windows = all_kwic_windows("chat noir, chat blanc", &terms, 1);
        assert_eq!(windows.len(), 2);
    }

    #[test]
    fn proximity_query_requires_two_terms() {
        assert!(proximity_query(&["alone"], 5).is_err());
        assert_eq!(
            proximity_query(&["chat", "noir"], 5).unwrap(),
            "NEAR(chat noir, 5)"
        );
    }
}
