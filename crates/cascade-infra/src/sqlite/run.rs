//! SQLite run repository implementation.
//!
//! Implements `RunRepository` from `cascade-core` using sqlx with split
//! read/write pools. Multi-record writes (`create_run`, `commit_transition`)
//! run in a single transaction on the writer connection.
//!
//! Execution leases live in the `owner` / `lease_expires_at` columns of
//! `runs` and are taken with a single conditional `UPDATE`.

use std::time::Duration;

use cascade_core::repository::run::RunRepository;
use cascade_types::error::RepositoryError;
use cascade_types::workflow::{
    ContextSnapshot, RunStatus, TaskAttempt, TaskState, TaskStatus, TaskTransition, WorkflowRun,
    lease_deadline,
};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `RunRepository`.
#[derive(Clone)]
pub struct SqliteRunRepository {
    pool: DatabasePool,
}

impl SqliteRunRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    id: String,
    workflow_name: String,
    workflow_version: String,
    status: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    error: Option<String>,
}

impl RunRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_name: row.try_get("workflow_name")?,
            workflow_version: row.try_get("workflow_version")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error: row.try_get("error")?,
        })
    }

    fn into_run(self) -> Result<WorkflowRun, RepositoryError> {
        Ok(WorkflowRun {
            id: parse_uuid(&self.id)?,
            workflow_name: self.workflow_name,
            workflow_version: self.workflow_version,
            status: parse_run_status(&self.status)?,
            created_at: parse_datetime(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            error: self.error,
        })
    }
}

struct TaskStateRow {
    run_id: String,
    task_id: String,
    status: String,
    attempts: i64,
    updated_at: String,
}

impl TaskStateRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            task_id: row.try_get("task_id")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_state(self) -> Result<TaskState, RepositoryError> {
        Ok(TaskState {
            run_id: parse_uuid(&self.run_id)?,
            task_id: self.task_id,
            status: parse_task_status(&self.status)?,
            attempts: parse_count(self.attempts)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct AttemptRow {
    id: String,
    run_id: String,
    task_id: String,
    attempt: i64,
    status: String,
    started_at: String,
    completed_at: Option<String>,
    error: Option<String>,
}

impl AttemptRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            task_id: row.try_get("task_id")?,
            attempt: row.try_get("attempt")?,
            status: row.try_get("status")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error: row.try_get("error")?,
        })
    }

    fn into_attempt(self) -> Result<TaskAttempt, RepositoryError> {
        Ok(TaskAttempt {
            id: parse_uuid(&self.id)?,
            run_id: parse_uuid(&self.run_id)?,
            task_id: self.task_id,
            attempt: parse_count(self.attempt)?,
            status: parse_task_status(&self.status)?,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            error: self.error,
        })
    }
}

struct SnapshotRow {
    run_id: String,
    sequence: i64,
    checkpoint: String,
    context: String,
    created_at: String,
}

impl SnapshotRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            sequence: row.try_get("sequence")?,
            checkpoint: row.try_get("checkpoint")?,
            context: row.try_get("context")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_snapshot(self) -> Result<ContextSnapshot, RepositoryError> {
        Ok(ContextSnapshot {
            run_id: parse_uuid(&self.run_id)?,
            sequence: u64::try_from(self.sequence)
                .map_err(|_| RepositoryError::Query(format!("invalid snapshot sequence: {}", self.sequence)))?,
            checkpoint: self.checkpoint,
            context: self.context,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width RFC 3339 so stored timestamps sort lexically.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_run_status(s: &str) -> Result<RunStatus, RepositoryError> {
    s.parse()
        .map_err(|_| RepositoryError::Query(format!("invalid run status: {s}")))
}

fn parse_task_status(s: &str) -> Result<TaskStatus, RepositoryError> {
    s.parse()
        .map_err(|_| RepositoryError::Query(format!("invalid task status: {s}")))
}

fn parse_count(n: i64) -> Result<u32, RepositoryError> {
    u32::try_from(n).map_err(|_| RepositoryError::Query(format!("invalid attempt count: {n}")))
}

/// Map driver errors onto the port's error vocabulary.
fn map_sqlx(e: sqlx::Error) -> RepositoryError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RepositoryError::Conflict(db.message().to_string())
        }
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => RepositoryError::NotFound,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            RepositoryError::Connection
        }
        _ => RepositoryError::Query(e.to_string()),
    }
}

async fn insert_attempt(conn: &mut SqliteConnection, attempt: &TaskAttempt) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"INSERT INTO task_attempts
           (id, run_id, task_id, attempt, status, started_at, completed_at, error)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(attempt.id.to_string())
    .bind(attempt.run_id.to_string())
    .bind(&attempt.task_id)
    .bind(i64::from(attempt.attempt))
    .bind(attempt.status.as_str())
    .bind(format_datetime(&attempt.started_at))
    .bind(attempt.completed_at.as_ref().map(format_datetime))
    .bind(&attempt.error)
    .execute(&mut *conn)
    .await
    .map_err(map_sqlx)?;
    Ok(())
}

async fn upsert_state(conn: &mut SqliteConnection, state: &TaskState) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"INSERT INTO task_states (run_id, task_id, status, attempts, updated_at)
           VALUES (?, ?, ?, ?, ?)
           ON CONFLICT(run_id, task_id) DO UPDATE SET
             status = excluded.status,
             attempts = excluded.attempts,
             updated_at = excluded.updated_at"#,
    )
    .bind(state.run_id.to_string())
    .bind(&state.task_id)
    .bind(state.status.as_str())
    .bind(i64::from(state.attempts))
    .bind(format_datetime(&state.updated_at))
    .execute(&mut *conn)
    .await
    .map_err(map_sqlx)?;
    Ok(())
}

async fn insert_snapshot(conn: &mut SqliteConnection, snapshot: &ContextSnapshot) -> Result<(), RepositoryError> {
    let sequence = i64::try_from(snapshot.sequence)
        .map_err(|_| RepositoryError::Query(format!("snapshot sequence out of range: {}", snapshot.sequence)))?;
    sqlx::query(
        r#"INSERT INTO context_snapshots (run_id, sequence, checkpoint, context, created_at)
           VALUES (?, ?, ?, ?, ?)"#,
    )
    .bind(snapshot.run_id.to_string())
    .bind(sequence)
    .bind(&snapshot.checkpoint)
    .bind(&snapshot.context)
    .bind(format_datetime(&snapshot.created_at))
    .execute(&mut *conn)
    .await
    .map_err(map_sqlx)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// RunRepository impl
// ---------------------------------------------------------------------------

impl RunRepository for SqliteRunRepository {
    async fn create_run(
        &self,
        run: &WorkflowRun,
        tasks: &[TaskState],
        snapshot: &ContextSnapshot,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(map_sqlx)?;

        sqlx::query(
            r#"INSERT INTO runs
               (id, workflow_name, workflow_version, status, created_at, started_at, completed_at, error)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(&run.workflow_name)
        .bind(&run.workflow_version)
        .bind(run.status.as_str())
        .bind(format_datetime(&run.created_at))
        .bind(run.started_at.as_ref().map(format_datetime))
        .bind(run.completed_at.as_ref().map(format_datetime))
        .bind(&run.error)
        .execute(&mut *tx)
        .await
        .map_err(|e| match map_sqlx(e) {
            RepositoryError::Conflict(_) => RepositoryError::Conflict(format!("run {} already exists", run.id)),
            other => other,
        })?;

        for state in tasks {
            upsert_state(&mut tx, state).await?;
        }
        insert_snapshot(&mut tx, snapshot).await?;

        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;

        match row {
            Some(row) => {
                let r = RunRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_run()?))
            }
            None => Ok(None),
        }
    }

    async fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let now = format_datetime(&Utc::now());
        let started_at = (status == RunStatus::Running).then(|| now.clone());
        let completed_at = status.is_terminal().then_some(now);

        let result = sqlx::query(
            r#"UPDATE runs SET
                 status = ?,
                 error = ?,
                 started_at = COALESCE(started_at, ?),
                 completed_at = COALESCE(?, completed_at)
               WHERE id = ? AND status NOT IN ('completed', 'failed', 'cancelled')"#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(&started_at)
        .bind(&completed_at)
        .bind(run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let current: Option<(String,)> = sqlx::query_as("SELECT status FROM runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(map_sqlx)?;
        match current {
            Some((current,)) => Err(RepositoryError::Conflict(format!(
                "run {run_id} is already {current}"
            ))),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn list_runs(
        &self,
        workflow_name: Option<&str>,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM runs WHERE (? IS NULL OR workflow_name = ?) ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(workflow_name)
        .bind(workflow_name)
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = RunRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            runs.push(r.into_run()?);
        }
        Ok(runs)
    }

    async fn list_unfinished_runs(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM runs WHERE status IN ('pending', 'running') ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = RunRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            runs.push(r.into_run()?);
        }
        Ok(runs)
    }

    async fn claim_run(&self, run_id: &Uuid, owner: &Uuid, ttl: Duration) -> Result<bool, RepositoryError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"UPDATE runs SET owner = ?, lease_expires_at = ?
               WHERE id = ?
                 AND (owner IS NULL OR owner = ? OR lease_expires_at IS NULL OR lease_expires_at <= ?)"#,
        )
        .bind(owner.to_string())
        .bind(format_datetime(&lease_deadline(now, ttl)))
        .bind(run_id.to_string())
        .bind(owner.to_string())
        .bind(format_datetime(&now))
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(map_sqlx)?;
        match exists {
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn release_run(&self, run_id: &Uuid, owner: &Uuid) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE runs SET owner = NULL, lease_expires_at = NULL WHERE id = ? AND owner = ?")
            .bind(run_id.to_string())
            .bind(owner.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn append_attempt(&self, attempt: &TaskAttempt) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(map_sqlx)?;

        let status: Option<(String,)> = sqlx::query_as("SELECT status FROM runs WHERE id = ?")
            .bind(attempt.run_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        let status = match status {
            Some((status,)) => parse_run_status(&status)?,
            None => return Err(RepositoryError::NotFound),
        };
        if status.is_terminal() {
            return Err(RepositoryError::Conflict(format!(
                "run {} is already {status}",
                attempt.run_id
            )));
        }

        insert_attempt(&mut tx, attempt).await?;
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn update_task_status(&self, state: &TaskState) -> Result<(), RepositoryError> {
        let mut conn = self.pool.writer.acquire().await.map_err(map_sqlx)?;
        upsert_state(&mut conn, state).await
    }

    async fn commit_transition(&self, transition: &TaskTransition) -> Result<(), RepositoryError> {
        let attempt = &transition.attempt;
        let mut tx = self.pool.writer.begin().await.map_err(map_sqlx)?;

        // Finalize in place when the attempt is still open.
        let updated = sqlx::query(
            "UPDATE task_attempts SET status = ?, completed_at = ?, error = ? WHERE id = ? AND completed_at IS NULL",
        )
        .bind(attempt.status.as_str())
        .bind(attempt.completed_at.as_ref().map(format_datetime))
        .bind(&attempt.error)
        .bind(attempt.id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        if updated.rows_affected() == 0 {
            let existing: Option<(i64,)> = sqlx::query_as("SELECT attempt FROM task_attempts WHERE id = ?")
                .bind(attempt.id.to_string())
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx)?;
            if existing.is_some() {
                return Err(RepositoryError::Conflict(format!(
                    "attempt {} of task '{}' is already finalized",
                    attempt.attempt, attempt.task_id
                )));
            }
            insert_attempt(&mut tx, attempt).await?;
        }

        upsert_state(&mut tx, &transition.state).await?;
        if let Some(snapshot) = &transition.snapshot {
            insert_snapshot(&mut tx, snapshot).await?;
        }

        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn save_snapshot(&self, snapshot: &ContextSnapshot) -> Result<(), RepositoryError> {
        let mut conn = self.pool.writer.acquire().await.map_err(map_sqlx)?;
        insert_snapshot(&mut conn, snapshot).await
    }

    async fn list_task_states(&self, run_id: &Uuid) -> Result<Vec<TaskState>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM task_states WHERE run_id = ? ORDER BY task_id ASC")
            .bind(run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;

        let mut states = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = TaskStateRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            states.push(r.into_state()?);
        }
        Ok(states)
    }

    async fn list_attempts(&self, run_id: &Uuid) -> Result<Vec<TaskAttempt>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM task_attempts WHERE run_id = ? ORDER BY seq ASC")
            .bind(run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;

        let mut attempts = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = AttemptRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            attempts.push(r.into_attempt()?);
        }
        Ok(attempts)
    }

    async fn latest_snapshot(&self, run_id: &Uuid) -> Result<Option<ContextSnapshot>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM context_snapshots WHERE run_id = ? ORDER BY sequence DESC LIMIT 1",
        )
        .bind(run_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;

        match row {
            Some(row) => {
                let r = SnapshotRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_snapshot()?))
            }
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::pool::database_url_in;
    use cascade_core::registry::TaskRegistry;
    use cascade_core::runner::{Runner, RunnerConfig, RunnerError};
    use cascade_core::task::{TaskError, task_fn};
    use cascade_core::Context;
    use cascade_types::workflow::{TaskSpec, TriggerRule};
    use serde_json::json;
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let url = database_url_in(dir.path());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    fn make_run(name: &str) -> WorkflowRun {
        WorkflowRun {
            id: Uuid::now_v7(),
            workflow_name: name.to_string(),
            workflow_version: "0123456789abcdef".to_string(),
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    fn pending(run_id: Uuid, task_id: &str) -> TaskState {
        TaskState {
            run_id,
            task_id: task_id.to_string(),
            status: TaskStatus::Pending,
            attempts: 0,
            updated_at: Utc::now(),
        }
    }

    fn snapshot(run_id: Uuid, sequence: u64, context: &str) -> ContextSnapshot {
        ContextSnapshot {
            run_id,
            sequence,
            checkpoint: format!("test:{sequence}"),
            context: context.to_string(),
            created_at: Utc::now(),
        }
    }

    async fn seeded(repo: &SqliteRunRepository, name: &str, tasks: &[&str]) -> WorkflowRun {
        let run = make_run(name);
        let states: Vec<TaskState> = tasks.iter().map(|t| pending(run.id, t)).collect();
        repo.create_run(&run, &states, &snapshot(run.id, 0, "{}"))
            .await
            .unwrap();
        run
    }

    #[tokio::test]
    async fn test_create_and_get_run() {
        let repo = SqliteRunRepository::new(test_pool().await);
        let run = seeded(&repo, "etl", &["load", "extract"]).await;

        let fetched = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(fetched.workflow_name, "etl");
        assert_eq!(fetched.status, RunStatus::Pending);
        assert!(fetched.started_at.is_none());

        let states = repo.list_task_states(&run.id).await.unwrap();
        let ids: Vec<&str> = states.iter().map(|s| s.task_id.as_str()).collect();
        assert_eq!(ids, vec!["extract", "load"]);

        let err = repo
            .create_run(&run, &[], &snapshot(run.id, 0, "{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert!(repo.get_run(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_status_transitions() {
        let repo = SqliteRunRepository::new(test_pool().await);
        let run = seeded(&repo, "etl", &[]).await;

        repo.update_run_status(&run.id, RunStatus::Running, None).await.unwrap();
        let running = repo.get_run(&run.id).await.unwrap().unwrap();
        assert!(running.started_at.is_some());
        assert!(running.completed_at.is_none());

        repo.update_run_status(&run.id, RunStatus::Failed, Some("boom"))
            .await
            .unwrap();
        let failed = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert_eq!(failed.started_at, running.started_at);
        assert!(failed.completed_at.is_some());

        let err = repo
            .update_run_status(&run.id, RunStatus::Completed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        let err = repo
            .update_run_status(&Uuid::now_v7(), RunStatus::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_list_runs_and_unfinished() {
        let repo = SqliteRunRepository::new(test_pool().await);
        let first = seeded(&repo, "etl", &[]).await;
        let second = seeded(&repo, "report", &[]).await;
        let third = seeded(&repo, "etl", &[]).await;
        repo.update_run_status(&second.id, RunStatus::Completed, None)
            .await
            .unwrap();

        let all = repo.list_runs(None, 10).await.unwrap();
        let ids: Vec<Uuid> = all.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![third.id, second.id, first.id]);

        let etl = repo.list_runs(Some("etl"), 1).await.unwrap();
        assert_eq!(etl.len(), 1);
        assert_eq!(etl[0].id, third.id);

        let unfinished: Vec<Uuid> = repo
            .list_unfinished_runs()
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(unfinished, vec![first.id, third.id]);
    }

    #[tokio::test]
    async fn test_commit_transition_finalizes_once() {
        let repo = SqliteRunRepository::new(test_pool().await);
        let run = seeded(&repo, "etl", &["extract"]).await;

        let attempt = TaskAttempt::running(run.id, "extract", 1);
        repo.append_attempt(&attempt).await.unwrap();

        let done = attempt.clone().finish(TaskStatus::Succeeded, None);
        let transition = TaskTransition {
            state: TaskState {
                status: TaskStatus::Succeeded,
                attempts: 1,
                ..pending(run.id, "extract")
            },
            attempt: done.clone(),
            snapshot: Some(snapshot(run.id, 1, r#"{"rows":3}"#)),
        };
        repo.commit_transition(&transition).await.unwrap();

        let attempts = repo.list_attempts(&run.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, TaskStatus::Succeeded);
        assert!(attempts[0].is_final());
        let latest = repo.latest_snapshot(&run.id).await.unwrap().unwrap();
        assert_eq!(latest.sequence, 1);
        assert_eq!(latest.context, r#"{"rows":3}"#);

        // A second finalization is rejected and writes nothing.
        let again = TaskTransition {
            state: TaskState {
                status: TaskStatus::Failed,
                ..transition.state.clone()
            },
            attempt: attempt.finish(TaskStatus::Failed, Some("late".to_string())),
            snapshot: Some(snapshot(run.id, 2, "{}")),
        };
        let err = repo.commit_transition(&again).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert_eq!(repo.latest_snapshot(&run.id).await.unwrap().unwrap().sequence, 1);
        let states = repo.list_task_states(&run.id).await.unwrap();
        assert_eq!(states[0].status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_attempt_numbers_unique_except_skips() {
        let repo = SqliteRunRepository::new(test_pool().await);
        let run = seeded(&repo, "etl", &["a", "b"]).await;

        repo.append_attempt(&TaskAttempt::running(run.id, "a", 1)).await.unwrap();
        let err = repo
            .append_attempt(&TaskAttempt::running(run.id, "a", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        repo.append_attempt(&TaskAttempt::skipped(run.id, "a", None)).await.unwrap();
        repo.append_attempt(&TaskAttempt::skipped(run.id, "b", Some("upstream failed".into())))
            .await
            .unwrap();

        let order: Vec<(String, u32)> = repo
            .list_attempts(&run.id)
            .await
            .unwrap()
            .into_iter()
            .map(|a| (a.task_id, a.attempt))
            .collect();
        assert_eq!(
            order,
            vec![("a".to_string(), 1), ("a".to_string(), 0), ("b".to_string(), 0)]
        );
    }

    #[tokio::test]
    async fn test_writes_for_missing_run_are_not_found() {
        let repo = SqliteRunRepository::new(test_pool().await);
        let ghost = Uuid::now_v7();
        assert!(matches!(
            repo.append_attempt(&TaskAttempt::running(ghost, "a", 1)).await,
            Err(RepositoryError::NotFound)
        ));
        assert!(matches!(
            repo.save_snapshot(&snapshot(ghost, 1, "{}")).await,
            Err(RepositoryError::NotFound)
        ));
        assert!(repo.load_run(&ghost).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_run_aggregates_records() {
        let repo = SqliteRunRepository::new(test_pool().await);
        let run = seeded(&repo, "etl", &["extract"]).await;
        repo.save_snapshot(&snapshot(run.id, 1, r#"{"x":1}"#)).await.unwrap();
        let err = repo.save_snapshot(&snapshot(run.id, 1, "{}")).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        let record = repo.load_run(&run.id).await.unwrap().unwrap();
        assert_eq!(record.run.id, run.id);
        assert_eq!(record.tasks.len(), 1);
        assert!(record.attempts.is_empty());
        assert_eq!(record.latest_snapshot.unwrap().context, r#"{"x":1}"#);
    }

    #[tokio::test]
    async fn test_claim_run_is_exclusive_until_released_or_expired() {
        let repo = SqliteRunRepository::new(test_pool().await);
        let run = seeded(&repo, "etl", &[]).await;
        let (owner, other) = (Uuid::now_v7(), Uuid::now_v7());
        let ttl = Duration::from_secs(60);

        assert!(repo.claim_run(&run.id, &owner, ttl).await.unwrap());
        assert!(!repo.claim_run(&run.id, &other, ttl).await.unwrap());
        // Renewal by the holder.
        assert!(repo.claim_run(&run.id, &owner, ttl).await.unwrap());

        repo.release_run(&run.id, &other).await.unwrap();
        assert!(!repo.claim_run(&run.id, &other, ttl).await.unwrap());
        repo.release_run(&run.id, &owner).await.unwrap();
        assert!(repo.claim_run(&run.id, &other, Duration::ZERO).await.unwrap());

        // A zero ttl lapses immediately.
        assert!(repo.claim_run(&run.id, &owner, ttl).await.unwrap());

        assert!(matches!(
            repo.claim_run(&Uuid::now_v7(), &owner, ttl).await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_append_attempt_rejected_on_terminal_run() {
        let repo = SqliteRunRepository::new(test_pool().await);
        let run = seeded(&repo, "etl", &["a", "b"]).await;
        repo.update_run_status(&run.id, RunStatus::Running, None).await.unwrap();
        let in_flight = TaskAttempt::running(run.id, "a", 1);
        repo.append_attempt(&in_flight).await.unwrap();
        repo.update_run_status(&run.id, RunStatus::Cancelled, Some("cancelled"))
            .await
            .unwrap();

        let err = repo
            .append_attempt(&TaskAttempt::running(run.id, "b", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        // The in-flight attempt can still be finalized.
        let transition = TaskTransition {
            state: TaskState {
                status: TaskStatus::Succeeded,
                attempts: 1,
                ..pending(run.id, "a")
            },
            attempt: in_flight.finish(TaskStatus::Succeeded, None),
            snapshot: None,
        };
        repo.commit_transition(&transition).await.unwrap();
        assert_eq!(repo.list_attempts(&run.id).await.unwrap().len(), 1);
        assert!(repo.list_attempts(&run.id).await.unwrap()[0].is_final());
    }

    // -----------------------------------------------------------------------
    // Runner on SQLite
    // -----------------------------------------------------------------------

    async fn open(dir: &Path) -> SqliteRunRepository {
        SqliteRunRepository::new(DatabasePool::new(&database_url_in(dir)).await.unwrap())
    }

    #[tokio::test]
    async fn test_runner_diamond_persists_history() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(TaskRegistry::new());
        let pass = |key: &'static str| {
            task_fn(move |mut ctx: Context| async move {
                ctx.set(key, true);
                Ok(ctx)
            })
        };
        registry.register(TaskSpec::new("a"), pass("a")).unwrap();
        registry.register(TaskSpec::new("b").depends_on(["a"]), pass("b")).unwrap();
        registry
            .register(
                TaskSpec::new("c").depends_on(["a"]),
                task_fn(|_ctx: Context| async move { Err(TaskError::failed("c exploded")) }),
            )
            .unwrap();
        registry
            .register(
                TaskSpec::new("d").depends_on(["b", "c"]).trigger_rule(TriggerRule::AllSuccess),
                pass("d"),
            )
            .unwrap();
        registry
            .build_workflow("diamond")
            .add_tasks(["a", "b", "c", "d"])
            .finalize()
            .unwrap();

        let runner = Runner::new(open(dir.path()).await, Arc::clone(&registry), RunnerConfig::default());
        let result = runner.execute("diamond", Context::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.status_of("d"), Some(TaskStatus::Skipped));

        // Reopen the database and read the run back.
        let repo = open(dir.path()).await;
        let record = repo.load_run(&result.run_id).await.unwrap().unwrap();
        assert_eq!(record.run.status, RunStatus::Failed);
        assert_eq!(record.task_status("c"), Some(TaskStatus::Failed));
        assert_eq!(record.task_status("d"), Some(TaskStatus::Skipped));
        assert_eq!(record.attempts.len(), result.task_history.len());
        let context = Context::from_json_str(&record.latest_snapshot.unwrap().context).unwrap();
        assert_eq!(context.get("b"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_runner_resumes_after_process_crash() {
        let dir = tempfile::tempdir().unwrap();
        let a_calls = Arc::new(AtomicUsize::new(0));
        let b_calls = Arc::new(AtomicUsize::new(0));

        let registry = Arc::new(TaskRegistry::new());
        let counter = Arc::clone(&a_calls);
        registry
            .register(
                TaskSpec::new("a"),
                task_fn(move |mut ctx: Context| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        ctx.set("a", 1);
                        Ok(ctx)
                    }
                }),
            )
            .unwrap();
        let counter = Arc::clone(&b_calls);
        registry
            .register(
                TaskSpec::new("b").depends_on(["a"]),
                task_fn(move |mut ctx: Context| {
                    let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
                    async move {
                        if first {
                            // Hangs until the process "dies".
                            std::future::pending::<()>().await;
                        }
                        ctx.set("b", 2);
                        Ok(ctx)
                    }
                }),
            )
            .unwrap();
        registry
            .build_workflow("crashy")
            .add_tasks(["a", "b"])
            .finalize()
            .unwrap();

        let run_id = Uuid::now_v7();
        let config = RunnerConfig {
            lease_ttl: Duration::from_secs(1),
            ..RunnerConfig::default()
        };
        let first = Arc::new(Runner::new(open(dir.path()).await, Arc::clone(&registry), config.clone()));
        let handle = tokio::spawn({
            let first = Arc::clone(&first);
            async move { first.execute_with_id(run_id, "crashy", None, Context::new()).await }
        });

        // Wait until B is running, then kill the execution.
        while b_calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        let second = Runner::new(open(dir.path()).await, Arc::clone(&registry), config);
        let unfinished = second.repository().list_unfinished_runs().await.unwrap();
        assert_eq!(unfinished.iter().map(|r| r.id).collect::<Vec<_>>(), vec![run_id]);

        // The dead runner's lease is still live.
        assert!(matches!(second.resume(run_id).await, Err(RunnerError::RunConflict(_))));
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let result = second.resume(run_id).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.context.get("a"), Some(&json!(1)));
        assert_eq!(result.context.get("b"), Some(&json!(2)));
        let b_attempts: Vec<u32> = result.attempts_of("b").map(|a| a.attempt).collect();
        assert_eq!(b_attempts, vec![1, 2]);
    }
}
