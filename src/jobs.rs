//! Per-root index job state.
//!
//! One [`JobRegistry`] is built at startup and shared by every caller. The
//! in-memory map is the source of truth for "is a run active on this root";
//! each transition is also written to `index_jobs` so the last outcome
//! survives a restart. Rows left `running` by a crashed process are marked
//! `failed` by [`JobRegistry::recover`].

use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ApiError, ApiResult};
use crate::models::IndexReport;

/// Lifecycle of the indexing job for one root.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum JobState {
    Idle,
    Running { run_id: String, started_at: i64 },
    Completed { run_id: String, finished_at: i64, indexed: u64, skipped: u64, removed: u64 },
    Failed { run_id: String, finished_at: i64, message: String },
}

impl JobState {
    pub fn label(&self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::Running { .. } => "running",
            JobState::Completed { .. } => "completed",
            JobState::Failed { .. } => "failed",
        }
    }
}

/// In-memory job state per root, mirrored to `index_jobs`.
///
/// At most one run per root is `Running`. The slot is released when the
/// [`RunningJob`] guard finishes or is dropped.
pub struct JobRegistry {
    pool: SqlitePool,
    states: Mutex<HashMap<String, JobState>>,
}

impl JobRegistry {
    pub fn new(pool: SqlitePool) -> Arc<Self> {
        Arc::new(Self {
            pool,
            states: Mutex::new(HashMap::new()),
        })
    }

    /// Mark rows a previous process left `running` as failed. Returns how
    /// many were fixed up.
    pub async fn recover(&self) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();
        let fixed = sqlx::query(
            "UPDATE index_jobs SET state = 'failed', finished_at = ?, message = 'interrupted' WHERE state = 'running'",
        )
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if fixed > 0 {
            tracing::warn!(jobs = fixed, "marked interrupted index jobs as failed");
        }
        Ok(fixed)
    }

    /// Current state; `Idle` for a root never indexed.
    pub fn state(&self, root: &str) -> JobState {
        self.states
            .lock()
            .get(root)
            .cloned()
            .unwrap_or(JobState::Idle)
    }

    /// Idle/Completed/Failed → Running, or `Conflict` if a run is active.
    pub async fn start(self: &Arc<Self>, root: &str) -> ApiResult<RunningJob> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = chrono::Utc::now().timestamp();
        {
            let mut states = self.states.lock();
            if let Some(JobState::Running { .. }) = states.get(root) {
                return Err(ApiError::Conflict(format!(
                    "an index job is already running for {}",
                    root
                )));
            }
            states.insert(
                root.to_string(),
                JobState::Running {
                    run_id: run_id.clone(),
                    started_at,
                },
            );
        }

        let job = RunningJob {
            registry: Arc::clone(self),
            root: root.to_string(),
            run_id: run_id.clone(),
            finished: false,
        };

        persist(
            &self.pool,
            root,
            &JobState::Running {
                run_id,
                started_at,
            },
            None,
        )
        .await?;
        Ok(job)
    }

    /// Last persisted state of every root, for `stats`.
    pub async fn persisted(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT root, state FROM index_jobs ORDER BY root")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| (r.get("root"), r.get("state"))).collect())
    }
}

/// Handle for an active run. Dropping it without finishing (a cancelled
/// request, a panic) moves the root to `Failed`.
pub struct RunningJob {
    registry: Arc<JobRegistry>,
    root: String,
    run_id: String,
    finished: bool,
}

impl RunningJob {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Record the run as finished. A partial report ends the job `failed`.
    pub async fn complete(mut self, report: &IndexReport) -> Result<()> {
        let finished_at = chrono::Utc::now().timestamp();
        let state = if report.state == "completed" {
            JobState::Completed {
                run_id: self.run_id.clone(),
                finished_at,
                indexed: report.indexed,
                skipped: report.skipped,
                removed: report.removed,
            }
        } else {
            JobState::Failed {
                run_id: self.run_id.clone(),
                finished_at,
                message: "partial run".to_string(),
            }
        };
        self.finished = true;
        self.registry.states.lock().insert(self.root.clone(), state.clone());
        persist(&self.registry.pool, &self.root, &state, Some(report)).await
    }

    /// Record an aborted run with its error message.
    pub async fn fail(mut self, message: &str) -> Result<()> {
        let state = JobState::Failed {
            run_id: self.run_id.clone(),
            finished_at: chrono::Utc::now().timestamp(),
            message: message.to_string(),
        };
        self.finished = true;
        self.registry.states.lock().insert(self.root.clone(), state.clone());
        persist(&self.registry.pool, &self.root, &state, None).await
    }
}

impl Drop for RunningJob {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let state = JobState::Failed {
            run_id: self.run_id.clone(),
            finished_at: chrono::Utc::now().timestamp(),
            message: "cancelled".to_string(),
        };
        self.registry.states.lock().insert(self.root.clone(), state.clone());
        tracing::warn!(root = %self.root, run_id = %self.run_id, "index job dropped before finishing");

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let pool = self.registry.pool.clone();
            let root = self.root.clone();
            handle.spawn(async move {
                if let Err(e) = persist(&pool, &root, &state, None).await {
                    tracing::error!(root = %root, error = %e, "failed to persist cancelled job");
                }
            });
        }
    }
}

async fn persist(
    pool: &SqlitePool,
    root: &str,
    state: &JobState,
    report: Option<&IndexReport>,
) -> Result<()> {
    let (run_id, started_at, finished_at, message) = match state {
        JobState::Idle => (None, None, None, None),
        JobState::Running { run_id, started_at } => (Some(run_id.as_str()), Some(*started_at), None, None),
        JobState::Completed { run_id, finished_at, .. } => (Some(run_id.as_str()), None, Some(*finished_at), None),
        JobState::Failed {
            run_id,
            finished_at,
            message,
        } => (Some(run_id.as_str()), None, Some(*finished_at), Some(message.as_str())),
    };
    let counts = report
        .map(|r| (r.indexed, r.skipped, r.removed, r.errors))
        .unwrap_or_default();

    sqlx::query(
        r#"
        INSERT INTO index_jobs (root, state, run_id, started_at, finished_at, indexed, skipped, removed, errors, message)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(root) DO UPDATE SET
            state = excluded.state,
            run_id = excluded.run_id,
            started_at = COALESCE(excluded.started_at, index_jobs.started_at),
            finished_at = excluded.finished_at,
            indexed = excluded.indexed,
            skipped = excluded.skipped,
            removed = excluded.removed,
            errors = excluded.errors,
            message = excluded.message
        "#,
    )
    .bind(root)
    .bind(state.label())
    .bind(run_id)
    .bind(started_at)
    .bind(finished_at)
    .bind(counts.0 as i64)
    .bind(counts.1 as i64)
    .bind(counts.2 as i64)
    .bind(counts.3 as i64)
    .bind(message)
    .execute(pool)
    .await?;
    Ok(())
}
