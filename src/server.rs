//! The localhost sidecar: a persistent axum/tokio HTTP server wrapping
//! every component in this crate behind a versioned JSON contract.
//!
//! One [`Db`] connection is shared by the whole process; every handler that
//! touches it goes through the domain functions in `db`/`query`/`aligner`/
//! etc., which themselves acquire [`Db::lock`]. The job manager dispatches
//! long-running operations onto their own `tokio::task`s, reusing the same
//! connection and lock to approximate "dedicated worker thread" semantics.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::config::{Config, TokenMode};
use crate::db::Db;
use crate::error::ApiError;
use crate::jobs::JobManager;
use crate::models::RELATION_TYPES;
use crate::{aligner, curation, documents, export, ingest, indexer, jobs, metadata, portfile, query, runs, segmenter};

pub const API_VERSION: &str = "1.1.0";

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub config: Arc<Config>,
    pub jobs: JobManager,
    pub db_parent: std::path::PathBuf,
    pub token: Option<String>,
    pub started_at: String,
    pub shutdown: Arc<tokio::sync::Notify>,
}

fn resolve_token(config: &Config) -> Option<String> {
    match config.server.token_mode {
        TokenMode::Off => None,
        TokenMode::Explicit => config.server.token.clone(),
        TokenMode::Auto => {
            let mut bytes = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut bytes);
            Some(hex::encode(bytes))
        }
    }
}

/// Assemble the success envelope: `{ok, api_version, status, run_id?, ...data}`.
fn ok_json<T: Serialize>(status: &str, run_id: Option<&str>, data: &T) -> Json<Value> {
    let mut value = serde_json::to_value(data).unwrap_or(Value::Null);
    if !value.is_object() {
        value = json!({ "result": value });
    }
    let obj = value.as_object_mut().expect("checked above");
    obj.insert("ok".to_string(), json!(true));
    obj.insert("api_version".to_string(), json!(API_VERSION));
    obj.insert("status".to_string(), json!(status));
    if let Some(id) = run_id {
        obj.insert("run_id".to_string(), json!(id));
    }
    Json(value)
}

/// Run a component operation under a fresh run-ledger entry: insert the
/// `runs` row before calling `fut`, then fill in `stats_json` with either
/// the serialized success result or the error message.
async fn run_and_record<T: Serialize>(
    state: &AppState,
    kind: &str,
    params: Value,
    fut: impl std::future::Future<Output = anyhow::Result<T>>,
) -> Result<(String, T), ApiError> {
    let run_id = runs::new_run_id();
    runs::create_run(&state.db, &run_id, kind, &params)
        .await
        .map_err(ApiError::from)?;

    let mut log = runs::setup_run_logger(&state.db_parent, &run_id).ok();
    if let Some((writer, _guard)) = log.as_mut() {
        runs::log_run_line(writer, &run_id, kind, "started", &params);
    }

    match fut.await {
        Ok(result) => {
            let stats = serde_json::to_value(&result).unwrap_or_else(|_| json!({}));
            let _ = runs::update_run_stats(&state.db, &run_id, &stats).await;
            if let Some((writer, _guard)) = log.as_mut() {
                runs::log_run_line(writer, &run_id, kind, "finished ok", &stats);
            }
            Ok((run_id, result))
        }
        Err(err) => {
            let stats = json!({ "error": err.to_string() });
            let _ = runs::update_run_stats(&state.db, &run_id, &stats).await;
            if let Some((writer, _guard)) = log.as_mut() {
                runs::log_run_line(writer, &run_id, kind, "finished error", &stats);
            }
            Err(ApiError::from(err))
        }
    }
}

/// Same as [`run_and_record`] but for operations that return `()` (the
/// exporters): the caller supplies the stats payload explicitly.
async fn run_with_stats(
    state: &AppState,
    kind: &str,
    params: Value,
    fut: impl std::future::Future<Output = anyhow::Result<()>>,
    stats: Value,
) -> Result<String, ApiError> {
    let run_id = runs::new_run_id();
    runs::create_run(&state.db, &run_id, kind, &params)
        .await
        .map_err(ApiError::from)?;

    let mut log = runs::setup_run_logger(&state.db_parent, &run_id).ok();
    if let Some((writer, _guard)) = log.as_mut() {
        runs::log_run_line(writer, &run_id, kind, "started", &params);
    }

    match fut.await {
        Ok(()) => {
            let _ = runs::update_run_stats(&state.db, &run_id, &stats).await;
            if let Some((writer, _guard)) = log.as_mut() {
                runs::log_run_line(writer, &run_id, kind, "finished ok", &stats);
            }
            Ok(run_id)
        }
        Err(err) => {
            let error_stats = json!({ "error": err.to_string() });
            let _ = runs::update_run_stats(&state.db, &run_id, &error_stats).await;
            if let Some((writer, _guard)) = log.as_mut() {
                runs::log_run_line(writer, &run_id, kind, "finished error", &error_stats);
            }
            Err(ApiError::from(err))
        }
    }
}

async fn auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.token {
        let got = headers.get("X-Agrafes-Token").and_then(|v| v.to_str().ok());
        if got != Some(expected.as_str()) {
            return ApiError::Unauthorized("missing or invalid X-Agrafes-Token header".to_string())
                .into_response();
        }
    }
    next.run(request).await
}

fn default_limit() -> i64 {
    50
}
fn default_kwic_window() -> usize {
    10
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    fts_query: String,
    language: Option<String>,
    doc_id: Option<i64>,
    resource_type: Option<String>,
    doc_role: Option<String>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default = "default_kwic_window")]
    kwic_window: usize,
    #[serde(default)]
    all_occurrences: bool,
    #[serde(default)]
    include_aligned: bool,
    #[serde(default)]
    aligned_cap: Option<usize>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

async fn query_handler(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<Value>, ApiError> {
    let mode = match req.mode.as_deref() {
        Some("kwic") => query::QueryMode::Kwic,
        Some("segment") | None => query::QueryMode::Segment,
        Some(other) => {
            return Err(ApiError::Validation(format!("unknown query mode: {:?}", other)))
        }
    };

    let params_json = json!({
        "fts_query": req.fts_query,
        "mode": req.mode,
        "limit": req.limit,
        "offset": req.offset,
    });

    let params = query::QueryParams {
        fts_query: &req.fts_query,
        language: req.language.as_deref(),
        doc_id: req.doc_id,
        resource_type: req.resource_type.as_deref(),
        doc_role: req.doc_role.as_deref(),
        mode,
        kwic_window: req.kwic_window,
        all_occurrences: req.all_occurrences,
        include_aligned: req.include_aligned,
        aligned_cap: req.aligned_cap,
        limit: req.limit,
        offset: req.offset,
    };

    let (run_id, result) =
        run_and_record(&state, "query", params_json, query::run_query(&state.db, params)).await?;
    Ok(ok_json("ok", Some(&run_id), &result))
}

async fn index_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let (run_id, units_indexed) =
        run_and_record(&state, "index", json!({}), indexer::build_index(&state.db)).await?;
    Ok(ok_json("ok", Some(&run_id), &json!({ "units_indexed": units_indexed })))
}

#[derive(Debug, Deserialize)]
struct ImportRequest {
    title: String,
    language: String,
    doc_role: Option<String>,
    resource_type: Option<String>,
    source_path: Option<String>,
    #[serde(default)]
    content_base64: Option<String>,
}

fn read_import_bytes(
    content_base64: &Option<String>,
    source_path: &Option<String>,
) -> Result<Vec<u8>, ApiError> {
    use base64::Engine;
    if let Some(b64) = content_base64 {
        base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| ApiError::BadRequest(format!("invalid base64 content: {}", e)))
    } else if let Some(path) = source_path {
        std::fs::read(path).map_err(|e| ApiError::BadRequest(format!("reading {}: {}", path, e)))
    } else {
        Err(ApiError::BadRequest(
            "either content_base64 or source_path must be provided".to_string(),
        ))
    }
}

async fn import_handler(
    State(state): State<AppState>,
    Json(req): Json<ImportRequest>,
) -> Result<Json<Value>, ApiError> {
    let bytes = read_import_bytes(&req.content_base64, &req.source_path)?;

    let import_params = ingest::ImportParams {
        title: &req.title,
        language: &req.language,
        doc_role: req.doc_role.as_deref(),
        resource_type: req.resource_type.as_deref(),
        source_path: req.source_path.as_deref(),
    };
    let params_json = json!({
        "title": req.title,
        "language": req.language,
        "doc_role": req.doc_role,
        "resource_type": req.resource_type,
        "source_path": req.source_path,
    });

    let (run_id, report) = run_and_record(
        &state,
        "import",
        params_json,
        ingest::import_document(&state.db, &bytes, import_params),
    )
    .await?;
    Ok(ok_json("ok", Some(&run_id), &report))
}

#[derive(Debug, Deserialize)]
struct CurateRequest {
    doc_id: Option<i64>,
    rules: Vec<curation::CurationRuleSpec>,
}

async fn curate_handler(
    State(state): State<AppState>,
    Json(req): Json<CurateRequest>,
) -> Result<Json<Value>, ApiError> {
    let rules = curation::rules_from_list(&req.rules).map_err(|e| ApiError::Validation(e.to_string()))?;
    let params_json = json!({ "doc_id": req.doc_id, "rule_count": rules.len() });

    if let Some(doc_id) = req.doc_id {
        let (run_id, report) = run_and_record(
            &state,
            "curate",
            params_json,
            curation::curate_document(&state.db, doc_id, &rules),
        )
        .await?;
        let status = if report.units_changed > 0 { "warnings" } else { "ok" };
        Ok(ok_json(status, Some(&run_id), &json!({ "fts_stale": report.units_changed > 0, "report": report })))
    } else {
        let (run_id, reports) = run_and_record(
            &state,
            "curate",
            params_json,
            curation::curate_all_documents(&state.db, &rules),
        )
        .await?;
        let fts_stale = reports.iter().any(|r| r.units_changed > 0);
        Ok(ok_json(
            if fts_stale { "warnings" } else { "ok" },
            Some(&run_id),
            &json!({ "fts_stale": fts_stale, "reports": reports }),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct CuratePreviewRequest {
    doc_id: i64,
    rules: Vec<curation::CurationRuleSpec>,
    #[serde(default = "default_preview_examples")]
    max_examples: usize,
}

fn default_preview_examples() -> usize {
    10
}

async fn curate_preview_handler(
    State(state): State<AppState>,
    Json(req): Json<CuratePreviewRequest>,
) -> Result<Json<Value>, ApiError> {
    let max_examples = req.max_examples.clamp(1, 50);
    let rules = curation::rules_from_list(&req.rules).map_err(|e| ApiError::Validation(e.to_string()))?;
    let preview = curation::preview_curation(&state.db, req.doc_id, &rules, max_examples)
        .await
        .map_err(ApiError::from)?;
    Ok(ok_json("ok", None, &preview))
}

#[derive(Debug, Deserialize)]
struct ValidateMetaRequest {
    doc_id: Option<i64>,
}

async fn validate_meta_handler(
    State(state): State<AppState>,
    Json(req): Json<ValidateMetaRequest>,
) -> Result<Json<Value>, ApiError> {
    let params_json = json!({ "doc_id": req.doc_id });
    if let Some(doc_id) = req.doc_id {
        let (run_id, report) = run_and_record(
            &state,
            "validate-meta",
            params_json,
            metadata::validate_document(&state.db, doc_id),
        )
        .await?;
        Ok(ok_json("ok", Some(&run_id), &report))
    } else {
        let (run_id, reports) = run_and_record(
            &state,
            "validate-meta",
            params_json,
            metadata::validate_all_documents(&state.db),
        )
        .await?;
        Ok(ok_json("ok", Some(&run_id), &json!({ "reports": reports })))
    }
}

#[derive(Debug, Deserialize)]
struct SegmentRequest {
    doc_id: i64,
    language: String,
    pack: Option<String>,
}

async fn segment_handler(
    State(state): State<AppState>,
    Json(req): Json<SegmentRequest>,
) -> Result<Json<Value>, ApiError> {
    let params_json = json!({ "doc_id": req.doc_id, "language": req.language, "pack": req.pack });
    let (run_id, report) = run_and_record(
        &state,
        "segment",
        params_json,
        segmenter::resegment_document(&state.db, req.doc_id, &req.language, req.pack.as_deref()),
    )
    .await?;
    let status = if report.warnings.is_empty() { "ok" } else { "warnings" };
    Ok(ok_json(status, Some(&run_id), &json!({ "fts_stale": true, "report": report })))
}

#[derive(Debug, Deserialize)]
struct AlignRequest {
    pivot_doc_id: i64,
    target_doc_id: i64,
    strategy: String,
    similarity_threshold: Option<f64>,
    #[serde(default)]
    debug: bool,
}

async fn align_handler(
    State(state): State<AppState>,
    Json(req): Json<AlignRequest>,
) -> Result<Json<Value>, ApiError> {
    let strategy =
        aligner::AlignStrategy::parse(&req.strategy).map_err(|e| ApiError::Validation(e.to_string()))?;
    let threshold = req
        .similarity_threshold
        .unwrap_or(state.config.alignment.similarity_threshold);
    if !(0.0..=1.0).contains(&threshold) {
        return Err(ApiError::Validation(format!(
            "similarity_threshold must be in [0,1], got {}",
            threshold
        )));
    }

    let params_json = json!({
        "pivot_doc_id": req.pivot_doc_id,
        "target_doc_id": req.target_doc_id,
        "strategy": req.strategy,
    });
    let (run_id, report) = run_and_record(
        &state,
        "align",
        params_json,
        aligner::align_pair(&state.db, req.pivot_doc_id, req.target_doc_id, strategy, threshold, req.debug),
    )
    .await?;
    let status = if report.warnings.is_empty() { "ok" } else { "warnings" };
    Ok(ok_json(status, Some(&run_id), &report))
}

#[derive(Debug, Deserialize)]
struct AlignAuditRequest {
    pivot_doc_id: i64,
    target_doc_id: i64,
    external_id: Option<i64>,
    status: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

async fn align_audit_handler(
    State(state): State<AppState>,
    Json(req): Json<AlignAuditRequest>,
) -> Result<Json<Value>, ApiError> {
    let filter = aligner::AuditFilter {
        external_id: req.external_id,
        status: req.status,
        limit: req.limit,
        offset: req.offset,
    };
    let result = aligner::audit_links(&state.db, req.pivot_doc_id, req.target_doc_id, &filter)
        .await
        .map_err(ApiError::from)?;
    Ok(ok_json("ok", None, &result))
}

#[derive(Debug, Deserialize)]
struct AlignQualityRequest {
    pivot_doc_id: i64,
    target_doc_id: i64,
    run_id: Option<String>,
}

async fn align_quality_handler(
    State(state): State<AppState>,
    Json(req): Json<AlignQualityRequest>,
) -> Result<Json<Value>, ApiError> {
    let report = aligner::quality_report(&state.db, req.pivot_doc_id, req.target_doc_id, req.run_id.as_deref())
        .await
        .map_err(ApiError::from)?;
    Ok(ok_json("ok", None, &report))
}

#[derive(Debug, Deserialize)]
struct LinkStatusRequest {
    link_id: i64,
    status: Option<String>,
}

async fn link_update_status_handler(
    State(state): State<AppState>,
    Json(req): Json<LinkStatusRequest>,
) -> Result<Json<Value>, ApiError> {
    aligner::update_link_status(&state.db, req.link_id, req.status.as_deref())
        .await
        .map_err(ApiError::from)?;
    Ok(ok_json("ok", None, &json!({ "link_id": req.link_id })))
}

#[derive(Debug, Deserialize)]
struct LinkIdRequest {
    link_id: i64,
}

async fn link_delete_handler(
    State(state): State<AppState>,
    Json(req): Json<LinkIdRequest>,
) -> Result<Json<Value>, ApiError> {
    aligner::delete_link(&state.db, req.link_id).await.map_err(ApiError::from)?;
    Ok(ok_json("ok", None, &json!({ "link_id": req.link_id, "deleted": true })))
}

#[derive(Debug, Deserialize)]
struct LinkRetargetRequest {
    link_id: i64,
    new_target_unit_id: i64,
}

async fn link_retarget_handler(
    State(state): State<AppState>,
    Json(req): Json<LinkRetargetRequest>,
) -> Result<Json<Value>, ApiError> {
    aligner::retarget_link(&state.db, req.link_id, req.new_target_unit_id)
        .await
        .map_err(ApiError::from)?;
    Ok(ok_json(
        "ok",
        None,
        &json!({ "link_id": req.link_id, "new_target_unit_id": req.new_target_unit_id }),
    ))
}

async fn list_documents_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let docs = documents::list_documents(&state.db).await.map_err(ApiError::from)?;
    Ok(ok_json("ok", None, &json!({ "documents": docs })))
}

#[derive(Debug, Deserialize)]
struct DocumentUpdateRequest {
    doc_id: i64,
    #[serde(flatten)]
    update: documents::DocumentUpdate,
}

async fn documents_update_handler(
    State(state): State<AppState>,
    Json(req): Json<DocumentUpdateRequest>,
) -> Result<Json<Value>, ApiError> {
    documents::update_document(&state.db, req.doc_id, &req.update)
        .await
        .map_err(ApiError::from)?;
    Ok(ok_json("ok", None, &json!({ "doc_id": req.doc_id })))
}

#[derive(Debug, Deserialize)]
struct BulkUpdateRequest {
    updates: Vec<documents::BulkDocumentUpdate>,
}

async fn documents_bulk_update_handler(
    State(state): State<AppState>,
    Json(req): Json<BulkUpdateRequest>,
) -> Result<Json<Value>, ApiError> {
    let report = documents::bulk_update_documents(&state.db, &req.updates)
        .await
        .map_err(ApiError::from)?;
    Ok(ok_json("ok", None, &report))
}

#[derive(Debug, Deserialize)]
struct DocRelationsQuery {
    doc_id: i64,
}

async fn list_doc_relations_handler(
    State(state): State<AppState>,
    Query(q): Query<DocRelationsQuery>,
) -> Result<Json<Value>, ApiError> {
    let relations = aligner::list_doc_relations(&state.db, q.doc_id).await.map_err(ApiError::from)?;
    Ok(ok_json("ok", None, &json!({ "relations": relations })))
}

#[derive(Debug, Deserialize)]
struct DocRelationSetRequest {
    doc_id: i64,
    relation_type: String,
    target_doc_id: i64,
    note: Option<String>,
}

async fn doc_relations_set_handler(
    State(state): State<AppState>,
    Json(req): Json<DocRelationSetRequest>,
) -> Result<Json<Value>, ApiError> {
    if !RELATION_TYPES.contains(&req.relation_type.as_str()) {
        return Err(ApiError::Validation(format!(
            "relation_type must be one of {:?}, got {:?}",
            RELATION_TYPES, req.relation_type
        )));
    }
    let relation_id = aligner::add_doc_relation(
        &state.db,
        req.doc_id,
        &req.relation_type,
        req.target_doc_id,
        req.note.as_deref(),
    )
    .await
    .map_err(ApiError::from)?;
    Ok(ok_json("ok", None, &json!({ "relation_id": relation_id })))
}

#[derive(Debug, Deserialize)]
struct DocRelationDeleteRequest {
    relation_id: i64,
}

async fn doc_relations_delete_handler(
    State(state): State<AppState>,
    Json(req): Json<DocRelationDeleteRequest>,
) -> Result<Json<Value>, ApiError> {
    aligner::delete_doc_relation(&state.db, req.relation_id).await.map_err(ApiError::from)?;
    Ok(ok_json("ok", None, &json!({ "relation_id": req.relation_id, "deleted": true })))
}

#[derive(Debug, Deserialize)]
struct ExportTeiRequest {
    doc_id: i64,
    output: Option<String>,
}

async fn export_tei_handler(
    State(state): State<AppState>,
    Json(req): Json<ExportTeiRequest>,
) -> Result<Json<Value>, ApiError> {
    let output_path = req.output.as_deref().map(Path::new);
    let params_json = json!({ "doc_id": req.doc_id, "output": req.output });
    let run_id = run_with_stats(
        &state,
        "export",
        params_json.clone(),
        export::export_tei(&state.db, req.doc_id, output_path),
        params_json.clone(),
    )
    .await?;
    Ok(ok_json("ok", Some(&run_id), &params_json))
}

#[derive(Debug, Deserialize)]
struct ExportAlignCsvRequest {
    align_run_id: String,
    output: Option<String>,
}

async fn export_align_csv_handler(
    State(state): State<AppState>,
    Json(req): Json<ExportAlignCsvRequest>,
) -> Result<Json<Value>, ApiError> {
    let output_path = req.output.as_deref().map(Path::new);
    let params_json = json!({ "align_run_id": req.align_run_id, "output": req.output });
    let run_id = run_with_stats(
        &state,
        "export",
        params_json.clone(),
        export::export_align_csv(&state.db, &req.align_run_id, output_path),
        params_json.clone(),
    )
    .await?;
    Ok(ok_json("ok", Some(&run_id), &params_json))
}

#[derive(Debug, Deserialize)]
struct ExportRunReportRequest {
    target_run_id: String,
    output: Option<String>,
}

async fn export_run_report_handler(
    State(state): State<AppState>,
    Json(req): Json<ExportRunReportRequest>,
) -> Result<Json<Value>, ApiError> {
    let output_path = req.output.as_deref().map(Path::new);
    let params_json = json!({ "target_run_id": req.target_run_id, "output": req.output });
    let run_id = run_with_stats(
        &state,
        "export",
        params_json.clone(),
        export::export_run_report(&state.db, &req.target_run_id, output_path),
        params_json.clone(),
    )
    .await?;
    Ok(ok_json("ok", Some(&run_id), &params_json))
}

#[derive(Debug, Deserialize)]
struct JobsListQuery {
    status: Option<jobs::JobStatus>,
    #[serde(default = "default_jobs_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_jobs_limit() -> i64 {
    50
}

async fn list_jobs_handler(
    State(state): State<AppState>,
    Query(q): Query<JobsListQuery>,
) -> Json<Value> {
    let filter = jobs::JobListFilter::new(q.status, q.limit, q.offset);
    let result = state.jobs.list(&filter).await;
    ok_json("ok", None, &serde_json::to_value(&result).unwrap_or(json!({})))
}

async fn get_job_handler(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .jobs
        .get(&job_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("job not found: {}", job_id)))?;
    Ok(ok_json("ok", None, &json!({ "job": record })))
}

async fn job_cancel_handler(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<String>,
) -> Result<Json<Value>, ApiError> {
    let status = state
        .jobs
        .cancel(&job_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("job not found: {}", job_id)))?;
    Ok(ok_json(
        "ok",
        None,
        &json!({ "job": { "job_id": job_id, "status": status } }),
    ))
}

#[derive(Debug, Deserialize)]
struct JobEnqueueRequest {
    kind: String,
    #[serde(default)]
    params: Value,
}

/// Build the runner closure for one job kind, validating its params eagerly
/// (shape, mandatory fields, enum values) before the job is ever queued.
fn build_job_runner(state: &AppState, kind: &str, params: &Value) -> Result<jobs::JobRunner, ApiError> {
    let get_str = |key: &str| params.get(key).and_then(Value::as_str).map(str::to_string);
    let get_i64 = |key: &str| params.get(key).and_then(Value::as_i64);

    match kind {
        "index" => {
            let db = state.db.clone();
            Ok(Box::new(move |_progress| {
                Box::pin(async move {
                    let count = indexer::build_index(&db).await?;
                    Ok(json!({ "units_indexed": count }))
                })
            }))
        }
        "curate" => {
            let specs: Vec<curation::CurationRuleSpec> =
                serde_json::from_value(params.get("rules").cloned().unwrap_or(json!([])))
                    .map_err(|e| ApiError::BadRequest(format!("invalid rules: {}", e)))?;
            let rules =
                curation::rules_from_list(&specs).map_err(|e| ApiError::Validation(e.to_string()))?;
            let doc_id = get_i64("doc_id");
            let db = state.db.clone();
            Ok(Box::new(move |_progress| {
                Box::pin(async move {
                    if let Some(doc_id) = doc_id {
                        Ok(serde_json::to_value(curation::curate_document(&db, doc_id, &rules).await?)?)
                    } else {
                        Ok(serde_json::to_value(curation::curate_all_documents(&db, &rules).await?)?)
                    }
                })
            }))
        }
        "validate-meta" => {
            let doc_id = get_i64("doc_id");
            let db = state.db.clone();
            Ok(Box::new(move |_progress| {
                Box::pin(async move {
                    if let Some(doc_id) = doc_id {
                        Ok(serde_json::to_value(metadata::validate_document(&db, doc_id).await?)?)
                    } else {
                        Ok(serde_json::to_value(metadata::validate_all_documents(&db).await?)?)
                    }
                })
            }))
        }
        "segment" => {
            let doc_id = get_i64("doc_id")
                .ok_or_else(|| ApiError::BadRequest("segment job requires doc_id".to_string()))?;
            let language = get_str("language")
                .ok_or_else(|| ApiError::BadRequest("segment job requires language".to_string()))?;
            let pack = get_str("pack");
            let db = state.db.clone();
            Ok(Box::new(move |_progress| {
                Box::pin(async move {
                    Ok(serde_json::to_value(
                        segmenter::resegment_document(&db, doc_id, &language, pack.as_deref()).await?,
                    )?)
                })
            }))
        }
        "import" => {
            let title = get_str("title")
                .ok_or_else(|| ApiError::BadRequest("import job requires title".to_string()))?;
            let language = get_str("language")
                .ok_or_else(|| ApiError::BadRequest("import job requires language".to_string()))?;
            let doc_role = get_str("doc_role");
            let resource_type = get_str("resource_type");
            let source_path = get_str("source_path");
            let content_base64 = get_str("content_base64");
            let bytes = read_import_bytes(&content_base64, &source_path)?;
            let db = state.db.clone();
            Ok(Box::new(move |_progress| {
                Box::pin(async move {
                    let import_params = ingest::ImportParams {
                        title: &title,
                        language: &language,
                        doc_role: doc_role.as_deref(),
                        resource_type: resource_type.as_deref(),
                        source_path: source_path.as_deref(),
                    };
                    Ok(serde_json::to_value(
                        ingest::import_document(&db, &bytes, import_params).await?,
                    )?)
                })
            }))
        }
        "align" => {
            let pivot_doc_id = get_i64("pivot_doc_id")
                .ok_or_else(|| ApiError::BadRequest("align job requires pivot_doc_id".to_string()))?;
            let target_doc_id = get_i64("target_doc_id")
                .ok_or_else(|| ApiError::BadRequest("align job requires target_doc_id".to_string()))?;
            let strategy_str = get_str("strategy").unwrap_or_else(|| "external_id".to_string());
            let strategy = aligner::AlignStrategy::parse(&strategy_str)
                .map_err(|e| ApiError::Validation(e.to_string()))?;
            let threshold = params
                .get("similarity_threshold")
                .and_then(Value::as_f64)
                .unwrap_or(state.config.alignment.similarity_threshold);
            let debug = params.get("debug").and_then(Value::as_bool).unwrap_or(false);
            let db = state.db.clone();
            Ok(Box::new(move |_progress| {
                Box::pin(async move {
                    Ok(serde_json::to_value(
                        aligner::align_pair(&db, pivot_doc_id, target_doc_id, strategy, threshold, debug)
                            .await?,
                    )?)
                })
            }))
        }
        "export_tei" => {
            let doc_id = get_i64("doc_id")
                .ok_or_else(|| ApiError::BadRequest("export_tei job requires doc_id".to_string()))?;
            let output = get_str("output");
            let db = state.db.clone();
            Ok(Box::new(move |_progress| {
                Box::pin(async move {
                    export::export_tei(&db, doc_id, output.as_deref().map(Path::new)).await?;
                    Ok(json!({ "doc_id": doc_id, "output": output }))
                })
            }))
        }
        "export_align_csv" => {
            let align_run_id = get_str("align_run_id").ok_or_else(|| {
                ApiError::BadRequest("export_align_csv job requires align_run_id".to_string())
            })?;
            let output = get_str("output");
            let db = state.db.clone();
            Ok(Box::new(move |_progress| {
                Box::pin(async move {
                    export::export_align_csv(&db, &align_run_id, output.as_deref().map(Path::new)).await?;
                    Ok(json!({ "align_run_id": align_run_id, "output": output }))
                })
            }))
        }
        "export_run_report" => {
            let target_run_id = get_str("target_run_id").ok_or_else(|| {
                ApiError::BadRequest("export_run_report job requires target_run_id".to_string())
            })?;
            let output = get_str("output");
            let db = state.db.clone();
            Ok(Box::new(move |_progress| {
                Box::pin(async move {
                    export::export_run_report(&db, &target_run_id, output.as_deref().map(Path::new))
                        .await?;
                    Ok(json!({ "target_run_id": target_run_id, "output": output }))
                })
            }))
        }
        other => Err(ApiError::Validation(format!("unsupported job kind: {:?}", other))),
    }
}

async fn jobs_enqueue_handler(
    State(state): State<AppState>,
    Json(req): Json<JobEnqueueRequest>,
) -> Result<Json<Value>, ApiError> {
    let runner = build_job_runner(&state, &req.kind, &req.params)?;
    let job_id = state.jobs.submit(req.kind.clone(), req.params.clone(), runner).await;
    let record = state.jobs.get(&job_id).await;
    Ok(ok_json("accepted", None, &json!({ "job": record })))
}

async fn shutdown_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    portfile::remove(&state.db_parent).map_err(ApiError::from)?;
    state.shutdown.notify_one();
    Ok(ok_json("ok", None, &json!({ "shutting_down": true })))
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    ok_json(
        "ok",
        None,
        &json!({
            "pid": std::process::id(),
            "started_at": state.started_at,
            "db_path": state.config.db.path.display().to_string(),
        }),
    )
}

async fn openapi_handler() -> Json<Value> {
    Json(json!({
        "openapi": "3.0.0",
        "info": { "title": "agrafes-corpus-engine sidecar", "version": API_VERSION },
        "paths": {
            "/health": { "get": { "auth": false } },
            "/openapi.json": { "get": { "auth": false } },
            "/query": { "post": { "auth": false } },
            "/index": { "post": { "auth": true } },
            "/import": { "post": { "auth": true } },
            "/curate": { "post": { "auth": true } },
            "/curate/preview": { "post": { "auth": false } },
            "/validate-meta": { "post": { "auth": false } },
            "/segment": { "post": { "auth": true } },
            "/align": { "post": { "auth": true } },
            "/align/audit": { "post": { "auth": false } },
            "/align/quality": { "post": { "auth": false } },
            "/align/link/update_status": { "post": { "auth": true } },
            "/align/link/delete": { "post": { "auth": true } },
            "/align/link/retarget": { "post": { "auth": true } },
            "/documents": { "get": { "auth": false } },
            "/documents/update": { "post": { "auth": true } },
            "/documents/bulk_update": { "post": { "auth": true } },
            "/doc_relations": { "get": { "auth": false } },
            "/doc_relations/set": { "post": { "auth": true } },
            "/doc_relations/delete": { "post": { "auth": true } },
            "/export/tei": { "post": { "auth": true } },
            "/export/align_csv": { "post": { "auth": true } },
            "/export/run_report": { "post": { "auth": true } },
            "/jobs": { "get": { "auth": false } },
            "/jobs/enqueue": { "post": { "auth": true } },
            "/jobs/{id}": { "get": { "auth": false } },
            "/jobs/{id}/cancel": { "post": { "auth": true } },
            "/shutdown": { "post": { "auth": true } },
        },
    }))
}

fn build_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health_handler))
        .route("/openapi.json", get(openapi_handler))
        .route("/query", post(query_handler))
        .route("/curate/preview", post(curate_preview_handler))
        .route("/validate-meta", post(validate_meta_handler))
        .route("/align/audit", post(align_audit_handler))
        .route("/align/quality", post(align_quality_handler))
        .route("/documents", get(list_documents_handler))
        .route("/doc_relations", get(list_doc_relations_handler))
        .route("/jobs", get(list_jobs_handler))
        .route("/jobs/{id}", get(get_job_handler));

    let protected = Router::new()
        .route("/index", post(index_handler))
        .route("/import", post(import_handler))
        .route("/curate", post(curate_handler))
        .route("/segment", post(segment_handler))
        .route("/align", post(align_handler))
        .route("/align/link/update_status", post(link_update_status_handler))
        .route("/align/link/delete", post(link_delete_handler))
        .route("/align/link/retarget", post(link_retarget_handler))
        .route("/documents/update", post(documents_update_handler))
        .route("/documents/bulk_update", post(documents_bulk_update_handler))
        .route("/doc_relations/set", post(doc_relations_set_handler))
        .route("/doc_relations/delete", post(doc_relations_delete_handler))
        .route("/export/tei", post(export_tei_handler))
        .route("/export/align_csv", post(export_align_csv_handler))
        .route("/export/run_report", post(export_run_report_handler))
        .route("/jobs/enqueue", post(jobs_enqueue_handler))
        .route("/jobs/{id}/cancel", post(job_cancel_handler))
        .route("/shutdown", post(shutdown_handler))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the sidecar: bind the listener, write the portfile, serve until
/// `/shutdown` is called, then remove the portfile.
pub async fn run_server(config: Config, db: Db) -> Result<()> {
    let db_parent = crate::db::db_parent(&config);
    let token = resolve_token(&config);
    let started_at = runs::utcnow_iso();

    let state = AppState {
        db,
        config: Arc::new(config.clone()),
        jobs: JobManager::new(),
        db_parent: db_parent.clone(),
        token: token.clone(),
        started_at: started_at.clone(),
        shutdown: Arc::new(tokio::sync::Notify::new()),
    };

    let listener =
        tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    let actual_addr = listener.local_addr()?;

    let portfile_record = portfile::Portfile {
        host: config.server.host.clone(),
        port: actual_addr.port(),
        pid: std::process::id(),
        started_at: started_at.clone(),
        db_path: config.db.path.display().to_string(),
        token: token.clone(),
    };
    portfile::write(&db_parent, &portfile_record)?;

    tracing::info!(
        host = %config.server.host,
        port = actual_addr.port(),
        token_mode = ?config.server.token_mode,
        "sidecar listening"
    );

    let shutdown = state.shutdown.clone();
    let app = build_router(state);

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await;

    let _ = portfile::remove(&db_parent);
    result.map_err(anyhow::Error::from)
}

/// Outcome of checking for a pre-existing sidecar before `serve` binds a
/// listener of its own.
pub struct StartOutcome {
    pub already_running: bool,
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
}

/// Inspect the portfile before binding: if a sidecar is already running for
/// this DB, report that instead of racing a second listener onto the port.
/// A stale portfile is removed so the caller can proceed to bind fresh.
pub async fn check_existing(db_parent: &Path) -> Result<Option<StartOutcome>> {
    match portfile::inspect_state(db_parent).await? {
        portfile::SidecarState::Running => {
            let existing = portfile::read(db_parent)?.expect("Running implies a portfile");
            Ok(Some(StartOutcome {
                already_running: true,
                host: existing.host,
                port: existing.port,
                token: existing.token,
            }))
        }
        portfile::SidecarState::Stale => {
            portfile::remove(db_parent)?;
            Ok(None)
        }
        portfile::SidecarState::Missing => Ok(None),
    }
}
