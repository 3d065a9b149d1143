//! The run ledger: every index/align/segment/curate operation gets a row
//! in `runs` with its parameters and, once finished, its stats. Each run
//! also gets a dedicated log file under `<db_parent>/runs/<run_id>/run.log`.

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};

use crate::db::Db;

pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn utcnow_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Insert a `runs` row with `stats_json` left NULL until
/// [`update_run_stats`] is called.
pub async fn create_run(db: &Db, run_id: &str, kind: &str, params: &Value) -> Result<()> {
    let _guard = db.lock().await;
    sqlx::query(
        "INSERT INTO runs (run_id, kind, params_json, stats_json, created_at)
         VALUES (?, ?, ?, NULL, ?)",
    )
    .bind(run_id)
    .bind(kind)
    .bind(params.to_string())
    .bind(utcnow_iso())
    .execute(&db.pool)
    .await?;
    Ok(())
}

pub async fn update_run_stats(db: &Db, run_id: &str, stats: &Value) -> Result<()> {
    let _guard = db.lock().await;
    sqlx::query("UPDATE runs SET stats_json = ? WHERE run_id = ?")
        .bind(stats.to_string())
        .bind(run_id)
        .execute(&db.pool)
        .await?;
    Ok(())
}

/// Set up a non-blocking file appender at `<db_parent>/runs/<run_id>/run.log`.
/// The returned [`WorkerGuard`] must be held for the duration of the run;
/// dropping it flushes and stops the background writer.
pub fn setup_run_logger(
    db_parent: &std::path::Path,
    run_id: &str,
) -> Result<(NonBlocking, WorkerGuard)> {
    let dir: PathBuf = db_parent.join("runs").join(run_id);
    std::fs::create_dir_all(&dir)?;
    let file_appender = tracing_appender::rolling::never(&dir, "run.log");
    Ok(tracing_appender::non_blocking(file_appender))
}

/// Write one line to a run's log file. The writer is a plain
/// [`std::io::Write`] handle rather than a `tracing` subscriber: a per-run
/// `tracing::Dispatch` would have to live across the run's `.await` points,
/// and its thread-local scoping doesn't survive a task hopping workers on
/// the multi-threaded runtime, so callers log the run's lifecycle directly
/// instead of trying to capture every `tracing` event emitted during it.
pub fn log_run_line(writer: &mut NonBlocking, run_id: &str, kind: &str, phase: &str, payload: &Value) {
    let line = format!("{} run_id={} kind={} {} {}\n", utcnow_iso(), run_id, kind, phase, payload);
    let _ = writer.write_all(line.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_is_a_uuid() {
        let id = new_run_id();
        assert_eq!(id.len(), 36);
        assert_eq!(id.chars().filter(|c| *c == '-').count(), 4);
    }

    #[test]
    fn utcnow_iso_matches_expected_format() {
        let ts = utcnow_iso();
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), 20);
    }

    #[test]
    fn setup_run_logger_creates_run_directory() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = "test-run";
        let (_writer, _guard) = setup_run_logger(dir.path(), run_id).unwrap();
        assert!(dir.path().join("runs").join(run_id).is_dir());
    }
}
