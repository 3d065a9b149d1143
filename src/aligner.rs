//! Alignment between a pivot document and a target document.
//!
//! Four strategies, all producing the same [`AlignmentReport`] shape:
//! `external_id` (join on shared `external_id`), `position` (join on shared
//! `n`), `similarity` (greedy nearest-neighbor match via edit distance,
//! threshold-gated), and `external_id_then_position` (external_id anchors
//! first, position fallback among the leftovers).

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use crate::db::Db;
use crate::models::RELATION_TYPES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignStrategy {
    ExternalId,
    Position,
    Similarity,
    ExternalIdThenPosition,
}

impl AlignStrategy {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "external_id" => Ok(AlignStrategy::ExternalId),
            "position" => Ok(AlignStrategy::Position),
            "similarity" => Ok(AlignStrategy::Similarity),
            "external_id_then_position" => Ok(AlignStrategy::ExternalIdThenPosition),
            other => anyhow::bail!("unknown alignment strategy: {:?}", other),
        }
    }
}

struct UnitRow {
    unit_id: i64,
    n: i64,
    external_id: Option<i64>,
    text_norm: String,
}

#[derive(Debug, Serialize)]
pub struct AlignmentReport {
    pub run_id: String,
    pub pivot_doc_id: i64,
    pub target_doc_id: i64,
    pub pivot_title: String,
    pub target_title: String,
    pub pivot_line_count: usize,
    pub target_line_count: usize,
    pub links_created: usize,
    /// Keyed by the strategy's natural key: `external_id` for
    /// `external_id`/`external_id_then_position`, `n` for `position`, and
    /// pivot `unit_id` for `similarity` (which has no shared key to report).
    pub matched: Vec<i64>,
    pub missing_in_target: Vec<i64>,
    pub missing_in_pivot: Vec<i64>,
    pub duplicates_pivot: Vec<i64>,
    pub duplicates_target: Vec<i64>,
    pub warnings: Vec<String>,
    pub debug: Option<Value>,
    pub coverage_pct: f64,
}

fn coverage_pct(links_created: usize, pivot_line_count: usize) -> f64 {
    if pivot_line_count == 0 {
        return 0.0;
    }
    100.0 * links_created as f64 / pivot_line_count as f64
}

async fn fetch_units(db: &Db, doc_id: i64) -> Result<Vec<UnitRow>> {
    let rows: Vec<(i64, i64, Option<i64>, String)> = sqlx::query_as(
        "SELECT unit_id, n, external_id, text_norm FROM units
         WHERE doc_id = ? AND unit_type = 'line' ORDER BY n",
    )
    .bind(doc_id)
    .fetch_all(&db.pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(unit_id, n, external_id, text_norm)| UnitRow {
            unit_id,
            n,
            external_id,
            text_norm,
        })
        .collect())
}

fn duplicate_keys<T: std::hash::Hash + Eq + Copy>(keys: impl Iterator<Item = T>) -> Vec<T> {
    let mut counts: HashMap<T, usize> = HashMap::new();
    for k in keys {
        *counts.entry(k).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .filter(|(_, c)| *c > 1)
        .map(|(k, _)| k)
        .collect()
}

/// Run `strategy` between `pivot_doc_id` and `target_doc_id`, insert the
/// resulting `alignment_links` rows under a fresh run id, and return the
/// report.
pub async fn align_pair(
    db: &Db,
    pivot_doc_id: i64,
    target_doc_id: i64,
    strategy: AlignStrategy,
    similarity_threshold: f64,
    debug: bool,
) -> Result<AlignmentReport> {
    let _guard = db.lock().await;

    let pivot_title: Option<String> =
        sqlx::query_scalar("SELECT title FROM documents WHERE doc_id = ?")
            .bind(pivot_doc_id)
            .fetch_optional(&db.pool)
            .await?;
    let pivot_title = pivot_title.ok_or_else(|| anyhow::anyhow!("document not found: {}", pivot_doc_id))?;
    let target_title: Option<String> =
        sqlx::query_scalar("SELECT title FROM documents WHERE doc_id = ?")
            .bind(target_doc_id)
            .fetch_optional(&db.pool)
            .await?;
    let target_title = target_title.ok_or_else(|| anyhow::anyhow!("document not found: {}", target_doc_id))?;

    let pivot_units = fetch_units(db, pivot_doc_id).await?;
    let target_units = fetch_units(db, target_doc_id).await?;

    let mut warnings = Vec::new();
    let mut phase_counts: Option<(usize, usize)> = None;

    // `links` is the unit_id pairs actually inserted into alignment_links.
    // `matched`/`missing_in_target`/`missing_in_pivot` instead carry the
    // strategy's natural key (external_id, position, or pivot unit_id for
    // similarity, which has no shared key) so the report mirrors what the
    // original implementation surfaces, not an internal id.
    let links: Vec<(i64, i64)>;
    let mut debug_sources: Vec<String>;
    let matched: Vec<i64>;
    let missing_in_target: Vec<i64>;
    let missing_in_pivot: Vec<i64>;
    let mut duplicates_pivot: Vec<i64> = Vec::new();
    let mut duplicates_target: Vec<i64> = Vec::new();

    fn external_id_sets(pivot: &[UnitRow], target: &[UnitRow]) -> (HashSet<i64>, HashSet<i64>) {
        let pivot_ext: HashSet<i64> = pivot.iter().filter_map(|u| u.external_id).collect();
        let target_ext: HashSet<i64> = target.iter().filter_map(|u| u.external_id).collect();
        (pivot_ext, target_ext)
    }

    fn set_diff_sorted(common: &HashSet<i64>, other: &HashSet<i64>) -> Vec<i64> {
        let mut out: Vec<i64> = common.difference(other).copied().collect();
        out.sort_unstable();
        out
    }

    fn set_intersect_sorted(a: &HashSet<i64>, b: &HashSet<i64>) -> Vec<i64> {
        let mut out: Vec<i64> = a.intersection(b).copied().collect();
        out.sort_unstable();
        out
    }

    match strategy {
        AlignStrategy::ExternalId => {
            let (m, s) = match_by_external_id(&pivot_units, &target_units);
            let (pivot_ext, target_ext) = external_id_sets(&pivot_units, &target_units);
            matched = set_intersect_sorted(&pivot_ext, &target_ext);
            missing_in_target = set_diff_sorted(&pivot_ext, &target_ext);
            missing_in_pivot = set_diff_sorted(&target_ext, &pivot_ext);
            duplicates_pivot = duplicate_keys(pivot_units.iter().filter_map(|u| u.external_id));
            duplicates_target = duplicate_keys(target_units.iter().filter_map(|u| u.external_id));
            links = m;
            debug_sources = s;
        }
        AlignStrategy::Position => {
            let (m, s) = match_by_position(&pivot_units, &target_units);
            let pivot_n: HashSet<i64> = pivot_units.iter().map(|u| u.n).collect();
            let target_n: HashSet<i64> = target_units.iter().map(|u| u.n).collect();
            matched = set_intersect_sorted(&pivot_n, &target_n);
            missing_in_target = set_diff_sorted(&pivot_n, &target_n);
            missing_in_pivot = set_diff_sorted(&target_n, &pivot_n);
            links = m;
            debug_sources = s;
        }
        AlignStrategy::Similarity => {
            let (m, s) = match_by_similarity(&pivot_units, &target_units, similarity_threshold);
            let matched_pivot_ids: HashSet<i64> = m.iter().map(|(p, _)| *p).collect();
            matched = m.iter().map(|(p, _)| *p).collect();
            missing_in_target = pivot_units
                .iter()
                .map(|u| u.unit_id)
                .filter(|id| !matched_pivot_ids.contains(id))
                .collect();
            missing_in_pivot = Vec::new();
            links = m;
            debug_sources = s;
        }
        AlignStrategy::ExternalIdThenPosition => {
            let (pivot_ext, target_ext) = external_id_sets(&pivot_units, &target_units);
            matched = set_intersect_sorted(&pivot_ext, &target_ext);
            missing_in_target = set_diff_sorted(&pivot_ext, &target_ext);
            missing_in_pivot = set_diff_sorted(&target_ext, &pivot_ext);
            duplicates_pivot = duplicate_keys(pivot_units.iter().filter_map(|u| u.external_id));
            duplicates_target = duplicate_keys(target_units.iter().filter_map(|u| u.external_id));

            let (mut m1, mut s1) = match_by_external_id(&pivot_units, &target_units);
            let phase1_count = m1.len();
            let matched_pivot_ids: HashSet<i64> = m1.iter().map(|(p, _)| *p).collect();
            let matched_target_ids: HashSet<i64> = m1.iter().map(|(_, t)| *t).collect();
            let leftover_pivot: Vec<&UnitRow> = pivot_units
                .iter()
                .filter(|u| !matched_pivot_ids.contains(&u.unit_id))
                .collect();
            let leftover_target: Vec<&UnitRow> = target_units
                .iter()
                .filter(|u| !matched_target_ids.contains(&u.unit_id))
                .collect();
            let leftover_pivot_owned: Vec<UnitRow> = leftover_pivot
                .into_iter()
                .map(|u| UnitRow {
                    unit_id: u.unit_id,
                    n: u.n,
                    external_id: u.external_id,
                    text_norm: u.text_norm.clone(),
                })
                .collect();
            let leftover_target_owned: Vec<UnitRow> = leftover_target
                .into_iter()
                .map(|u| UnitRow {
                    unit_id: u.unit_id,
                    n: u.n,
                    external_id: u.external_id,
                    text_norm: u.text_norm.clone(),
                })
                .collect();
            let (m2, s2) = match_by_position(&leftover_pivot_owned, &leftover_target_owned);
            phase_counts = Some((phase1_count, m2.len()));
            m1.extend(m2);
            s1.extend(s2);
            links = m1;
            debug_sources = s1;
        }
    };

    if links.is_empty() {
        warnings.push("no units matched by the selected strategy".to_string());
    }

    let run_id = uuid::Uuid::new_v4().to_string();
    let created_at = Utc::now().to_rfc3339();

    for (pivot_unit_id, target_unit_id) in &links {
        let external_id = pivot_units
            .iter()
            .find(|u| u.unit_id == *pivot_unit_id)
            .and_then(|u| u.external_id);

        sqlx::query(
            "INSERT INTO alignment_links
                (run_id, pivot_unit_id, target_unit_id, external_id, pivot_doc_id, target_doc_id, created_at, status)
             VALUES (?, ?, ?, ?, ?, ?, ?, 'unreviewed')",
        )
        .bind(&run_id)
        .bind(pivot_unit_id)
        .bind(target_unit_id)
        .bind(external_id)
        .bind(pivot_doc_id)
        .bind(target_doc_id)
        .bind(&created_at)
        .execute(&db.pool)
        .await?;
    }

    let debug_payload = if debug {
        debug_sources.truncate(20);
        let mut payload = serde_json::json!({
            "strategy": format!("{:?}", strategy),
            "link_sources": &debug_sources,
        });
        match strategy {
            AlignStrategy::Similarity => {
                let scores: Vec<f64> = debug_sources
                    .iter()
                    .filter_map(|s| s.strip_prefix("similarity:"))
                    .filter_map(|s| s.parse::<f64>().ok())
                    .collect();
                if !scores.is_empty() {
                    let min = scores.iter().cloned().fold(f64::INFINITY, f64::min);
                    let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
                    payload["score_min"] = serde_json::json!(min);
                    payload["score_max"] = serde_json::json!(max);
                    payload["score_mean"] = serde_json::json!(mean);
                }
            }
            AlignStrategy::ExternalIdThenPosition => {
                if let Some((phase1, phase2)) = phase_counts {
                    payload["phase1_external_id_links"] = serde_json::json!(phase1);
                    payload["phase2_position_links"] = serde_json::json!(phase2);
                }
            }
            _ => {}
        }
        Some(payload)
    } else {
        None
    };

    tracing::info!(
        pivot_doc_id,
        target_doc_id,
        links_created = links.len(),
        "aligned documents"
    );

    let links_created = links.len();
    let pivot_line_count = pivot_units.len();

    Ok(AlignmentReport {
        run_id,
        pivot_doc_id,
        target_doc_id,
        pivot_title,
        target_title,
        pivot_line_count,
        target_line_count: target_units.len(),
        links_created,
        matched,
        missing_in_target,
        missing_in_pivot,
        duplicates_pivot,
        duplicates_target,
        warnings,
        debug: debug_payload,
        coverage_pct: coverage_pct(links_created, pivot_line_count),
    })
}

fn match_by_external_id(pivot: &[UnitRow], target: &[UnitRow]) -> (Vec<(i64, i64)>, Vec<String>) {
    let mut pivot_by_ext: HashMap<i64, i64> = HashMap::new();
    for u in pivot {
        if let Some(eid) = u.external_id {
            pivot_by_ext.entry(eid).or_insert(u.unit_id);
        }
    }
    let mut target_by_ext: HashMap<i64, i64> = HashMap::new();
    for u in target {
        if let Some(eid) = u.external_id {
            target_by_ext.entry(eid).or_insert(u.unit_id);
        }
    }
    let mut common: Vec<i64> = pivot_by_ext
        .keys()
        .filter(|eid| target_by_ext.contains_key(*eid))
        .copied()
        .collect();
    common.sort_unstable();

    let mut matched = Vec::new();
    let mut sources = Vec::new();
    for eid in common {
        matched.push((pivot_by_ext[&eid], target_by_ext[&eid]));
        sources.push(format!("external_id:{}", eid));
    }
    (matched, sources)
}

fn match_by_position(pivot: &[UnitRow], target: &[UnitRow]) -> (Vec<(i64, i64)>, Vec<String>) {
    let mut target_by_n: HashMap<i64, i64> = HashMap::new();
    for u in target {
        target_by_n.entry(u.n).or_insert(u.unit_id);
    }
    let mut matched = Vec::new();
    let mut sources = Vec::new();
    for u in pivot {
        if let Some(&target_unit_id) = target_by_n.get(&u.n) {
            matched.push((u.unit_id, target_unit_id));
            sources.push(format!("position:{}", u.n));
        }
    }
    (matched, sources)
}

fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (strsim::levenshtein(a, b) as f64 / max_len as f64)
}

/// Greedy O(pivot * target) nearest-neighbor match, first-come-first-served
/// on target consumption, gated by `threshold`.
fn match_by_similarity(
    pivot: &[UnitRow],
    target: &[UnitRow],
    threshold: f64,
) -> (Vec<(i64, i64)>, Vec<String>) {
    let mut consumed = vec![false; target.len()];
    let mut matched = Vec::new();
    let mut sources = Vec::new();

    for p in pivot {
        let mut best_idx: Option<usize> = None;
        let mut best_score = -1.0f64;
        for (idx, t) in target.iter().enumerate() {
            if consumed[idx] {
                continue;
            }
            let score = similarity(&p.text_norm, &t.text_norm);
            if score > best_score {
                best_score = score;
                best_idx = Some(idx);
            }
        }
        if let Some(idx) = best_idx {
            if best_score >= threshold {
                consumed[idx] = true;
                matched.push((p.unit_id, target[idx].unit_id));
                sources.push(format!("similarity:{:.3}", best_score));
            }
        }
    }

    (matched, sources)
}

/// Upsert a `doc_relations` row keyed on `(doc_id, relation_type,
/// target_doc_id)`. `relation_type` must be one of [`RELATION_TYPES`].
pub async fn add_doc_relation(
    db: &Db,
    doc_id: i64,
    relation_type: &str,
    target_doc_id: i64,
    note: Option<&str>,
) -> Result<i64> {
    if !RELATION_TYPES.contains(&relation_type) {
        anyhow::bail!(
            "relation_type must be one of {:?}, got {:?}",
            RELATION_TYPES,
            relation_type
        );
    }

    let _guard = db.lock().await;
    let created_at = Utc::now().to_rfc3339();

    let relation_id = sqlx::query(
        "INSERT INTO doc_relations (doc_id, relation_type, target_doc_id, note, created_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(doc_id, relation_type, target_doc_id)
         DO UPDATE SET note = excluded.note, created_at = excluded.created_at",
    )
    .bind(doc_id)
    .bind(relation_type)
    .bind(target_doc_id)
    .bind(note)
    .bind(&created_at)
    .execute(&db.pool)
    .await?
    .last_insert_rowid();

    Ok(relation_id)
}

/// List every `doc_relations` row for `doc_id`, as either pivot or target.
pub async fn list_doc_relations(db: &Db, doc_id: i64) -> Result<Vec<crate::models::DocRelation>> {
    let _guard = db.lock().await;
    let rows: Vec<(i64, i64, String, i64, Option<String>, String)> = sqlx::query_as(
        "SELECT relation_id, doc_id, relation_type, target_doc_id, note, created_at
         FROM doc_relations WHERE doc_id = ? ORDER BY relation_id",
    )
    .bind(doc_id)
    .fetch_all(&db.pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(
            |(relation_id, doc_id, relation_type, target_doc_id, note, created_at)| {
                crate::models::DocRelation {
                    relation_id,
                    doc_id,
                    relation_type,
                    target_doc_id,
                    note,
                    created_at,
                }
            },
        )
        .collect())
}

/// Delete a `doc_relations` row by id. Errors with a "not found" message if
/// no row matched.
pub async fn delete_doc_relation(db: &Db, relation_id: i64) -> Result<()> {
    let _guard = db.lock().await;
    let affected = sqlx::query("DELETE FROM doc_relations WHERE relation_id = ?")
        .bind(relation_id)
        .execute(&db.pool)
        .await?
        .rows_affected();
    if affected == 0 {
        anyhow::bail!("doc_relation not found: {}", relation_id);
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct AuditFilter {
    pub external_id: Option<i64>,
    pub status: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub struct AuditLink {
    pub link_id: i64,
    pub pivot_unit_id: i64,
    pub target_unit_id: i64,
    pub pivot_text_norm: String,
    pub target_text_norm: String,
    pub external_id: Option<i64>,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct AuditResult {
    pub links: Vec<AuditLink>,
    pub limit: i64,
    pub offset: i64,
    pub has_more: bool,
    pub next_offset: Option<i64>,
}

/// Paginated listing of `alignment_links` for a pivot/target document pair,
/// joining in each side's `text_norm`, optionally filtered by external_id
/// or review status.
pub async fn audit_links(
    db: &Db,
    pivot_doc_id: i64,
    target_doc_id: i64,
    filter: &AuditFilter,
) -> Result<AuditResult> {
    if !(1..=200).contains(&filter.limit) {
        anyhow::bail!("limit must be in 1..=200, got {}", filter.limit);
    }
    if filter.offset < 0 {
        anyhow::bail!("offset must be >= 0, got {}", filter.offset);
    }
    if let Some(status) = &filter.status {
        if !["unreviewed", "accepted", "rejected"].contains(&status.as_str()) {
            anyhow::bail!("status must be one of unreviewed/accepted/rejected, got {:?}", status);
        }
    }

    let _guard = db.lock().await;

    let mut sql = String::from(
        "SELECT al.link_id, al.pivot_unit_id, al.target_unit_id,
                pu.text_norm, tu.text_norm, al.external_id, al.status, al.created_at
         FROM alignment_links al
         JOIN units pu ON pu.unit_id = al.pivot_unit_id
         JOIN units tu ON tu.unit_id = al.target_unit_id
         WHERE al.pivot_doc_id = ? AND al.target_doc_id = ?",
    );
    if filter.external_id.is_some() {
        sql.push_str(" AND al.external_id = ?");
    }
    if filter.status.is_some() {
        sql.push_str(" AND al.status = ?");
    }
    sql.push_str(" ORDER BY al.link_id LIMIT ? OFFSET ?");

    let mut q = sqlx::query_as::<_, (i64, i64, i64, String, String, Option<i64>, String, String)>(
        &sql,
    )
    .bind(pivot_doc_id)
    .bind(target_doc_id);
    if let Some(eid) = filter.external_id {
        q = q.bind(eid);
    }
    if let Some(status) = &filter.status {
        q = q.bind(status);
    }
    q = q.bind(filter.limit + 1).bind(filter.offset);

    let mut rows = q.fetch_all(&db.pool).await?;
    let has_more = rows.len() as i64 > filter.limit;
    if has_more {
        rows.truncate(filter.limit as usize);
    }

    let links = rows
        .into_iter()
        .map(
            |(link_id, pivot_unit_id, target_unit_id, pivot_text_norm, target_text_norm, external_id, status, created_at)| {
                AuditLink {
                    link_id,
                    pivot_unit_id,
                    target_unit_id,
                    pivot_text_norm,
                    target_text_norm,
                    external_id,
                    status,
                    created_at,
                }
            },
        )
        .collect();

    let next_offset = if has_more {
        Some(filter.offset + filter.limit)
    } else {
        None
    };

    Ok(AuditResult {
        links,
        limit: filter.limit,
        offset: filter.offset,
        has_more,
        next_offset,
    })
}

#[derive(Debug, Serialize)]
pub struct ReviewStatusCounts {
    pub unreviewed: i64,
    pub accepted: i64,
    pub rejected: i64,
}

#[derive(Debug, Serialize)]
pub struct QualityReport {
    pub pivot_doc_id: i64,
    pub target_doc_id: i64,
    pub run_id: Option<String>,
    pub pivot_total_units: i64,
    pub target_total_units: i64,
    pub pivot_covered: i64,
    pub target_covered: i64,
    pub coverage_pct: f64,
    pub orphans_pivot_sample: Vec<i64>,
    pub orphans_target_sample: Vec<i64>,
    pub collision_count: i64,
    pub review_status: ReviewStatusCounts,
}

const ORPHAN_SAMPLE_SIZE: i64 = 20;

/// Aggregate coverage/orphan/collision/review-status metrics for a
/// pivot/target pair, optionally restricted to a single run.
pub async fn quality_report(
    db: &Db,
    pivot_doc_id: i64,
    target_doc_id: i64,
    run_id: Option<&str>,
) -> Result<QualityReport> {
    let _guard = db.lock().await;

    let pivot_total_units: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM units WHERE doc_id = ? AND unit_type = 'line'",
    )
    .bind(pivot_doc_id)
    .fetch_one(&db.pool)
    .await?;
    let target_total_units: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM units WHERE doc_id = ? AND unit_type = 'line'",
    )
    .bind(target_doc_id)
    .fetch_one(&db.pool)
    .await?;

    let mut link_filter = String::from(
        "FROM alignment_links WHERE pivot_doc_id = ? AND target_doc_id = ?",
    );
    if run_id.is_some() {
        link_filter.push_str(" AND run_id = ?");
    }

    macro_rules! bind_pair {
        ($q:expr) => {{
            let mut q = $q.bind(pivot_doc_id).bind(target_doc_id);
            if let Some(r) = run_id {
                q = q.bind(r);
            }
            q
        }};
    }

    let pivot_covered: i64 = bind_pair!(sqlx::query_scalar::<_, i64>(&format!(
        "SELECT COUNT(DISTINCT pivot_unit_id) {}",
        link_filter
    )))
    .fetch_one(&db.pool)
    .await?;
    let target_covered: i64 = bind_pair!(sqlx::query_scalar::<_, i64>(&format!(
        "SELECT COUNT(DISTINCT target_unit_id) {}",
        link_filter
    )))
    .fetch_one(&db.pool)
    .await?;

    let collision_count: i64 = bind_pair!(sqlx::query_scalar::<_, i64>(&format!(
        "SELECT COUNT(*) FROM (
             SELECT pivot_unit_id {} GROUP BY pivot_unit_id HAVING COUNT(*) > 1
         )",
        link_filter
    )))
    .fetch_one(&db.pool)
    .await?;

    let unreviewed: i64 = bind_pair!(sqlx::query_scalar::<_, i64>(&format!(
        "SELECT COUNT(*) {} AND status = 'unreviewed'",
        link_filter
    )))
    .fetch_one(&db.pool)
    .await?;
    let accepted: i64 = bind_pair!(sqlx::query_scalar::<_, i64>(&format!(
        "SELECT COUNT(*) {} AND status = 'accepted'",
        link_filter
    )))
    .fetch_one(&db.pool)
    .await?;
    let rejected: i64 = bind_pair!(sqlx::query_scalar::<_, i64>(&format!(
        "SELECT COUNT(*) {} AND status = 'rejected'",
        link_filter
    )))
    .fetch_one(&db.pool)
    .await?;

    let orphans_pivot_sample: Vec<i64> = sqlx::query_scalar(
        "SELECT unit_id FROM units
         WHERE doc_id = ? AND unit_type = 'line'
         AND unit_id NOT IN (
             SELECT pivot_unit_id FROM alignment_links
             WHERE pivot_doc_id = ? AND target_doc_id = ?
         )
         ORDER BY n LIMIT ?",
    )
    .bind(pivot_doc_id)
    .bind(pivot_doc_id)
    .bind(target_doc_id)
    .bind(ORPHAN_SAMPLE_SIZE)
    .fetch_all(&db.pool)
    .await?;

    let orphans_target_sample: Vec<i64> = sqlx::query_scalar(
        "SELECT unit_id FROM units
         WHERE doc_id = ? AND unit_type = 'line'
         AND unit_id NOT IN (
             SELECT target_unit_id FROM alignment_links
             WHERE pivot_doc_id = ? AND target_doc_id = ?
         )
         ORDER BY n LIMIT ?",
    )
    .bind(target_doc_id)
    .bind(pivot_doc_id)
    .bind(target_doc_id)
    .bind(ORPHAN_SAMPLE_SIZE)
    .fetch_all(&db.pool)
    .await?;

    let coverage_pct = if pivot_total_units == 0 {
        0.0
    } else {
        100.0 * pivot_covered as f64 / pivot_total_units as f64
    };

    Ok(QualityReport {
        pivot_doc_id,
        target_doc_id,
        run_id: run_id.map(str::to_string),
        pivot_total_units,
        target_total_units,
        pivot_covered,
        target_covered,
        coverage_pct,
        orphans_pivot_sample,
        orphans_target_sample,
        collision_count,
        review_status: ReviewStatusCounts {
            unreviewed,
            accepted,
            rejected,
        },
    })
}

/// Set a link's review status. `status = None` resets it to `unreviewed`.
pub async fn update_link_status(db: &Db, link_id: i64, status: Option<&str>) -> Result<()> {
    let resolved = status.unwrap_or("unreviewed");
    if !["unreviewed", "accepted", "rejected"].contains(&resolved) {
        anyhow::bail!("status must be one of accepted/rejected/null, got {:?}", status);
    }

    let _guard = db.lock().await;
    let affected = sqlx::query("UPDATE alignment_links SET status = ? WHERE link_id = ?")
        .bind(resolved)
        .bind(link_id)
        .execute(&db.pool)
        .await?
        .rows_affected();
    if affected == 0 {
        anyhow::bail!("alignment_link not found: {}", link_id);
    }
    Ok(())
}

/// Delete a link by id.
pub async fn delete_link(db: &Db, link_id: i64) -> Result<()> {
    let _guard = db.lock().await;
    let affected = sqlx::query("DELETE FROM alignment_links WHERE link_id = ?")
        .bind(link_id)
        .execute(&db.pool)
        .await?
        .rows_affected();
    if affected == 0 {
        anyhow::bail!("alignment_link not found: {}", link_id);
    }
    Ok(())
}

/// Retarget a link to a new target unit, after verifying the new target
/// exists. Also updates the denormalized `target_doc_id`.
pub async fn retarget_link(db: &Db, link_id: i64, new_target_unit_id: i64) -> Result<()> {
    let _guard = db.lock().await;

    let new_target_doc_id: Option<i64> =
        sqlx::query_scalar("SELECT doc_id FROM units WHERE unit_id = ?")
            .bind(new_target_unit_id)
            .fetch_optional(&db.pool)
            .await?;
    let Some(new_target_doc_id) = new_target_doc_id else {
        anyhow::bail!("target unit not found: {}", new_target_unit_id);
    };

    let affected = sqlx::query(
        "UPDATE alignment_links SET target_unit_id = ?, target_doc_id = ? WHERE link_id = ?",
    )
    .bind(new_target_unit_id)
    .bind(new_target_doc_id)
    .bind(link_id)
    .execute(&db.pool)
    .await?
    .rows_affected();
    if affected == 0 {
        anyhow::bail!("alignment_link not found: {}", link_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(unit_id: i64, n: i64, external_id: Option<i64>, text: &str) -> UnitRow {
        UnitRow {
            unit_id,
            n,
            external_id,
            text_norm: text.to_string(),
        }
    }

    #[test]
    fn external_id_match_uses_first_match_on_duplicate() {
        let pivot = vec![unit(1, 1, Some(10), "a")];
        let target = vec![unit(100, 1, Some(10), "x"), unit(101, 2, Some(10), "y")];
        let (matched, _) = match_by_external_id(&pivot, &target);
        assert_eq!(matched, vec![(1, 100)]);
    }

    #[test]
    fn external_id_match_dedupes_duplicate_external_id_on_pivot_side_too() {
        let pivot = vec![unit(1, 1, Some(7), "first"), unit(2, 2, Some(7), "second")];
        let target = vec![unit(100, 1, Some(7), "only")];
        let (matched, _) = match_by_external_id(&pivot, &target);
        assert_eq!(matched, vec![(1, 100)]);
    }

    #[test]
    fn position_match_joins_on_shared_n() {
        let pivot = vec![unit(1, 1, None, "a"), unit(2, 2, None, "b")];
        let target = vec![unit(100, 2, None, "x"), unit(101, 1, None, "y")];
        let (matched, _) = match_by_position(&pivot, &target);
        assert_eq!(matched, vec![(1, 101), (2, 100)]);
    }

    #[test]
    fn similarity_match_respects_threshold() {
        let pivot = vec![unit(1, 1, None, "hello world")];
        let target = vec![unit(100, 1, None, "completely different text")];
        let (matched, _) = match_by_similarity(&pivot, &target, 0.8);
        assert!(matched.is_empty());
    }

    #[test]
    fn similarity_match_finds_close_text() {
        let pivot = vec![unit(1, 1, None, "hello world")];
        let target = vec![unit(100, 1, None, "hello world!")];
        let (matched, _) = match_by_similarity(&pivot, &target, 0.8);
        assert_eq!(matched, vec![(1, 100)]);
    }

    // Two targets tie for the best score; the first-encountered one wins.
    #[test]
    fn similarity_match_breaks_ties_on_first_candidate() {
        let pivot = vec![unit(1, 1, None, "hello world")];
        let target = vec![unit(100, 1, None, "hello world"), unit(101, 2, None, "hello world")];
        let (matched, _) = match_by_similarity(&pivot, &target, 0.8);
        assert_eq!(matched, vec![(1, 100)]);
    }

    #[test]
    fn strategy_parse_rejects_unknown() {
        assert!(AlignStrategy::parse("magic").is_err());
        assert_eq!(
            AlignStrategy::parse("external_id").unwrap(),
            AlignStrategy::ExternalId
        );
    }

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

    async fn insert_doc(db: &Db, title: &str, language: &str) -> i64 {
        sqlx::query("INSERT INTO documents (title, language, created_at) VALUES (?, ?, '2026-01-01T00:00:00Z')")
            .bind(title)
            .bind(language)
            .execute(&db.pool)
            .await
            .unwrap()
            .last_insert_rowid()
    }

    async fn insert_unit(db: &Db, doc_id: i64, n: i64, external_id: Option<i64>, text: &str) {
        sqlx::query(
            "INSERT INTO units (doc_id, unit_type, n, external_id, text_raw, text_norm) VALUES (?, 'line', ?, ?, ?, ?)",
        )
        .bind(doc_id)
        .bind(n)
        .bind(external_id)
        .bind(text)
        .bind(text)
        .execute(&db.pool)
        .await
        .unwrap();
    }

    // Mirrors the spec's S3 scenario: FR has external_ids 1-4, EN has 1,2,3,5.
    #[tokio::test]
    async fn external_id_alignment_reports_coverage_and_missing_sets() {
        let (db, _dir) = test_db().await;
        let fr = insert_doc(&db, "FR", "fr").await;
        let en = insert_doc(&db, "EN", "en").await;
        insert_unit(&db, fr, 1, Some(1), "Bonjour le monde.").await;
        insert_unit(&db, fr, 2, Some(2), "Il fait beau.").await;
        insert_unit(&db, fr, 3, Some(3), "Le chat joue.").await;
        insert_unit(&db, fr, 4, Some(4), "Seulement FR.").await;
        insert_unit(&db, en, 1, Some(1), "Hello world.").await;
        insert_unit(&db, en, 2, Some(2), "The weather is nice.").await;
        insert_unit(&db, en, 3, Some(3), "The cat plays.").await;
        insert_unit(&db, en, 4, Some(5), "Only EN.").await;

        let report = align_pair(&db, fr, en, AlignStrategy::ExternalId, 0.8, false)
            .await
            .unwrap();

        assert_eq!(report.links_created, 3);
        assert_eq!(report.coverage_pct, 75.0);
        assert_eq!(report.matched, vec![1, 2, 3]);
        assert_eq!(report.missing_in_target, vec![4]);
        assert_eq!(report.missing_in_pivot, vec![5]);
    }

    #[tokio::test]
    async fn external_id_alignment_with_no_overlap_yields_zero_links() {
        let (db, _dir) = test_db().await;
        let pivot = insert_doc(&db, "A", "fr").await;
        let target = insert_doc(&db, "B", "en").await;
        insert_unit(&db, pivot, 1, Some(1), "a").await;
        insert_unit(&db, target, 1, Some(2), "b").await;

        let report = align_pair(&db, pivot, target, AlignStrategy::ExternalId, 0.8, false)
            .await
            .unwrap();

        assert_eq!(report.links_created, 0);
        assert_eq!(report.coverage_pct, 0.0);
        assert_eq!(report.missing_in_target, vec![1]);
        assert_eq!(report.missing_in_pivot, vec![2]);
        assert!(!report.warnings.is_empty());
    }

    // A pivot document with a duplicate external_id must still produce only
    // one alignment_links row for that id, using the lowest-n unit.
    #[tokio::test]
    async fn external_id_alignment_dedupes_duplicate_pivot_external_id() {
        let (db, _dir) = test_db().await;
        let pivot = insert_doc(&db, "A", "fr").await;
        let target = insert_doc(&db, "B", "en").await;
        insert_unit(&db, pivot, 1, Some(7), "first").await;
        insert_unit(&db, pivot, 2, Some(7), "second").await;
        insert_unit(&db, target, 1, Some(7), "only").await;

        let report = align_pair(&db, pivot, target, AlignStrategy::ExternalId, 0.8, false)
            .await
            .unwrap();

        assert_eq!(report.links_created, 1);
        assert_eq!(report.matched, vec![7]);
        assert_eq!(report.duplicates_pivot, vec![7]);

        let links = audit_links(
            &db,
            pivot,
            target,
            &AuditFilter {
                limit: 50,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(links.links.len(), 1);
    }

    #[tokio::test]
    async fn aligning_a_missing_document_errors_not_found() {
        let (db, _dir) = test_db().await;
        let fr = insert_doc(&db, "FR", "fr").await;

        let err = align_pair(&db, fr, 999, AlignStrategy::ExternalId, 0.8, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("document not found"));
    }
}
