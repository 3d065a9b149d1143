//! In-process async job manager backing the sidecar's `/jobs` endpoints.
//!
//! Each submitted job runs on its own `tokio::task`, sharing the same [`Db`]
//! connection and writer lock as synchronous requests. Progress is clamped
//! to a monotone 0-100 range. Cancellation races the runner: a job already
//! canceled before it reaches `running` never executes its body, and a
//! runner that finishes (successfully or not) after cancellation does not
//! overwrite the canceled status.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Error,
    Canceled,
}

impl JobStatus {
    fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error | JobStatus::Canceled)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub kind: String,
    pub params: Value,
    pub status: JobStatus,
    pub progress_pct: u8,
    pub progress_message: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

impl JobRecord {
    fn new(job_id: String, kind: String, params: Value) -> Self {
        JobRecord {
            job_id,
            kind,
            params,
            status: JobStatus::Queued,
            progress_pct: 0,
            progress_message: None,
            result: None,
            error: None,
            error_code: None,
            created_at: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            started_at: None,
            finished_at: None,
        }
    }
}

pub type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;
pub type JobRunner = Box<dyn FnOnce(ProgressHandle) -> JobFuture + Send>;

#[derive(Clone)]
pub struct ProgressHandle {
    manager: JobManager,
    job_id: String,
}

impl ProgressHandle {
    pub async fn set(&self, pct: u8, message: impl Into<String>) {
        self.manager.report_progress(&self.job_id, pct, message.into()).await;
    }
}

#[derive(Debug, Default)]
pub struct JobListFilter {
    pub status: Option<JobStatus>,
    pub limit: i64,
    pub offset: i64,
}

impl JobListFilter {
    pub fn new(status: Option<JobStatus>, limit: i64, offset: i64) -> Self {
        JobListFilter {
            status,
            limit: if limit > 0 { limit } else { 50 },
            offset: offset.max(0),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobListResult {
    pub jobs: Vec<JobRecord>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
    pub has_more: bool,
}

#[derive(Clone, Default)]
pub struct JobManager {
    jobs: Arc<RwLock<HashMap<String, JobRecord>>>,
}

impl JobManager {
    pub fn new() -> Self {
        JobManager::default()
    }

    /// Register a queued job and spawn its runner. Returns the job id
    /// immediately; the runner executes in the background.
    pub async fn submit(&self, kind: impl Into<String>, params: Value, runner: JobRunner) -> String {
        let job_id = Uuid::new_v4().to_string();
        let record = JobRecord::new(job_id.clone(), kind.into(), params);
        self.jobs.write().await.insert(job_id.clone(), record);

        let manager = self.clone();
        let job_id_for_task = job_id.clone();
        tokio::spawn(async move {
            manager.run_job(job_id_for_task, runner).await;
        });

        job_id
    }

    async fn run_job(&self, job_id: String, runner: JobRunner) {
        {
            let mut jobs = self.jobs.write().await;
            let Some(record) = jobs.get_mut(&job_id) else { return };
            if record.status == JobStatus::Canceled {
                return;
            }
            record.status = JobStatus::Running;
            record.started_at = Some(Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string());
        }

        let progress = ProgressHandle {
            manager: self.clone(),
            job_id: job_id.clone(),
        };

        let outcome = runner(progress).await;

        let mut jobs = self.jobs.write().await;
        let Some(record) = jobs.get_mut(&job_id) else { return };
        if record.status == JobStatus::Canceled {
            return;
        }

        let finished_at = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
        match outcome {
            Ok(result) => {
                record.status = JobStatus::Done;
                record.result = Some(result);
                record.progress_pct = 100;
                record.finished_at = Some(finished_at);
            }
            Err(err) => {
                let api_err = crate::error::ApiError::from(err);
                record.status = JobStatus::Error;
                record.error = Some(api_err.to_string());
                record.error_code = Some(api_err.code().to_string());
                record.finished_at = Some(finished_at);
            }
        }
    }

    async fn report_progress(&self, job_id: &str, pct: u8, message: String) {
        let mut jobs = self.jobs.write().await;
        if let Some(record) = jobs.get_mut(job_id) {
            if record.status == JobStatus::Running {
                record.progress_pct = record.progress_pct.max(pct.min(100));
                record.progress_message = Some(message);
            }
        }
    }

    pub async fn get(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.read().await.get(job_id).cloned()
    }

    /// List jobs sorted by creation time, optionally filtered by status and
    /// paginated.
    pub async fn list(&self, filter: &JobListFilter) -> JobListResult {
        let mut records: Vec<JobRecord> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.job_id.cmp(&b.job_id)));

        let total = records.len() as i64;
        let offset = filter.offset.max(0) as usize;
        let limit = filter.limit.max(1) as usize;
        let has_more = (offset + limit) < records.len();
        let page = records.into_iter().skip(offset).take(limit).collect();

        JobListResult {
            jobs: page,
            total,
            limit: filter.limit,
            offset: filter.offset,
            has_more,
        }
    }

    /// Cancel a job. Idempotent: canceling an already-terminal job just
    /// returns its current status.
    pub async fn cancel(&self, job_id: &str) -> Option<JobStatus> {
        let mut jobs = self.jobs.write().await;
        let record = jobs.get_mut(job_id)?;
        if record.status.is_terminal() {
            return Some(record.status);
        }
        record.status = JobStatus::Canceled;
        record.finished_at = Some(Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string());
        if record.progress_message.is_none() {
            record.progress_message = Some("Canceled".to_string());
        }
        Some(record.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_filters_by_status_and_paginates() {
        let mgr = JobManager::new();
        for _ in 0..3 {
            mgr.submit("index", serde_json::json!({}), Box::new(|_| {
                Box::pin(async move { Ok(serde_json::json!({})) })
            }))
            .await;
        }
        // Wait until all three jobs are done.
        loop {
            let all_done = mgr
                .list(&JobListFilter::new(None, 50, 0))
                .await
                .jobs
                .iter()
                .all(|j| j.status == JobStatus::Done);
            if all_done {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let page1 = mgr.list(&JobListFilter::new(None, 2, 0)).await;
        assert_eq!(page1.jobs.len(), 2);
        assert_eq!(page1.total, 3);
        assert!(page1.has_more);

        let page2 = mgr.list(&JobListFilter::new(None, 2, 2)).await;
        assert_eq!(page2.jobs.len(), 1);
        assert!(!page2.has_more);

        let filtered = mgr
            .list(&JobListFilter::new(Some(JobStatus::Queued), 50, 0))
            .await;
        assert_eq!(filtered.total, 0);
    }

    #[tokio::test]
    async fn submit_runs_job_to_completion() {
        let mgr = JobManager::new();
        let job_id = mgr
            .submit("index", serde_json::json!({}), Box::new(|_progress| {
                Box::pin(async move { Ok(serde_json::json!({"count": 3})) })
            }))
            .await;

        for _ in 0..50 {
            if let Some(rec) = mgr.get(&job_id).await {
                if rec.status == JobStatus::Done {
                    assert_eq!(rec.result, Some(serde_json::json!({"count": 3})));
                    return;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("job did not complete in time");
    }

    #[tokio::test]
    async fn cancel_is_idempotent_on_terminal_job() {
        let mgr = JobManager::new();
        let job_id = mgr
            .submit("index", serde_json::json!({}), Box::new(|_| {
                Box::pin(async move { Ok(serde_json::json!({})) })
            }))
            .await;

        loop {
            if let Some(rec) = mgr.get(&job_id).await {
                if rec.status == JobStatus::Done {
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let status = mgr.cancel(&job_id).await.unwrap();
        assert_eq!(status, JobStatus::Done);
    }

    #[tokio::test]
    async fn failed_job_classifies_error_code_instead_of_hardcoding_internal() {
        let mgr = JobManager::new();
        let job_id = mgr
            .submit("index", serde_json::json!({}), Box::new(|_| {
                Box::pin(async move { Err(anyhow::anyhow!("document 7 not found")) })
            }))
            .await;

        for _ in 0..50 {
            if let Some(rec) = mgr.get(&job_id).await {
                if rec.status == JobStatus::Error {
                    assert_eq!(rec.error_code, Some("NOT_FOUND".to_string()));
                    assert_eq!(rec.error, Some("document 7 not found".to_string()));
                    return;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("job did not fail in time");
    }

    #[tokio::test]
    async fn progress_is_clamped_and_monotone() {
        let mgr = JobManager::new();
        let job_id = mgr
            .submit("index", serde_json::json!({}), Box::new(|progress| {
                Box::pin(async move {
                    progress.set(150, "overshoot").await;
                    progress.set(10, "should not regress").await;
                    Ok(serde_json::json!({}))
                })
            }))
            .await;

        loop {
            if let Some(rec) = mgr.get(&job_id).await {
                if rec.status == JobStatus::Done {
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        // progress is overwritten to 100 on completion regardless; this
        // test only exercises that report_progress doesn't panic on >100.
    }
}
