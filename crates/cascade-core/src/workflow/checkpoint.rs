//! Durable checkpoint manager for workflow execution state.
//!
//! Wraps `RunRepository` with the scheduler's vocabulary. Each task
//! transition (pending -> running -> succeeded/failed/skipped) is persisted
//! before the scheduler moves forward, so an interrupted run can be resumed
//! from its last committed state.

use cascade_types::error::RepositoryError;
use cascade_types::workflow::{
    ContextSnapshot, RunRecord, RunStatus, TaskAttempt, TaskState, TaskStatus, TaskTransition,
    WorkflowRun,
};
use chrono::Utc;
use uuid::Uuid;

use crate::context::Context;
use crate::repository::run::RunRepository;

/// Error detail recorded on attempts that were running when a run was interrupted.
pub const INTERRUPTED: &str = "interrupted";

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages durable execution checkpoints for workflow runs.
///
/// Generic over `R: RunRepository` so it works with any storage backend
/// (SQLite, in-memory, etc.).
pub struct CheckpointManager<R: RunRepository> {
    repo: R,
}

impl<R: RunRepository> CheckpointManager<R> {
    /// Create a new checkpoint manager backed by the given repository.
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    // -----------------------------------------------------------------------
    // Run-level checkpoints
    // -----------------------------------------------------------------------

    /// Persist a new run with every task pending and the initial context as
    /// snapshot 0.
    pub async fn start_run<'a>(
        &self,
        run: &WorkflowRun,
        task_ids: impl IntoIterator<Item = &'a str>,
        ctx: &Context,
    ) -> Result<(), PersistenceError> {
        let now = Utc::now();
        let tasks: Vec<TaskState> = task_ids
            .into_iter()
            .map(|task_id| TaskState {
                run_id: run.id,
                task_id: task_id.to_string(),
                status: TaskStatus::Pending,
                attempts: 0,
                updated_at: now,
            })
            .collect();
        let snapshot = snapshot(run.id, 0, "run:start", ctx)?;

        self.repo.create_run(run, &tasks, &snapshot).await?;

        tracing::debug!(run_id = %run.id, tasks = tasks.len(), "checkpointed run start");
        Ok(())
    }

    /// Update the overall run status.
    pub async fn run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), PersistenceError> {
        self.repo.update_run_status(&run_id, status, error).await?;
        tracing::debug!(run_id = %run_id, status = %status, "checkpointed run status");
        Ok(())
    }

    /// Store a context snapshot that is not tied to a task transition.
    pub async fn save_context(
        &self,
        run_id: Uuid,
        sequence: u64,
        checkpoint: &str,
        ctx: &Context,
    ) -> Result<(), PersistenceError> {
        let snapshot = snapshot(run_id, sequence, checkpoint, ctx)?;
        self.repo.save_snapshot(&snapshot).await?;
        tracing::debug!(run_id = %run_id, sequence, checkpoint, "checkpointed context");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Task-level checkpoints
    // -----------------------------------------------------------------------

    /// Checkpoint a task as starting attempt `attempt` (Pending -> Running).
    ///
    /// The attempt record is appended before the task state flips to
    /// `Running`; recovery treats any running attempt as interrupted, so a
    /// crash between the two writes is harmless.
    pub async fn task_running(
        &self,
        run_id: Uuid,
        task_id: &str,
        attempt: u32,
    ) -> Result<TaskAttempt, PersistenceError> {
        let record = TaskAttempt::running(run_id, task_id, attempt);
        self.repo.append_attempt(&record).await?;
        self.repo
            .update_task_status(&task_state(run_id, task_id, TaskStatus::Running, attempt))
            .await?;

        tracing::debug!(run_id = %run_id, task_id, attempt, "checkpointed task start");
        Ok(record)
    }

    /// Checkpoint a successful attempt together with the merged run context.
    pub async fn task_succeeded(
        &self,
        attempt: TaskAttempt,
        sequence: u64,
        ctx: &Context,
    ) -> Result<(), PersistenceError> {
        let checkpoint = format!("task:{}:{}", attempt.task_id, attempt.attempt);
        let transition = TaskTransition {
            state: task_state(attempt.run_id, &attempt.task_id, TaskStatus::Succeeded, attempt.attempt),
            snapshot: Some(snapshot(attempt.run_id, sequence, &checkpoint, ctx)?),
            attempt: attempt.finish(TaskStatus::Succeeded, None),
        };
        self.repo.commit_transition(&transition).await?;

        tracing::debug!(
            run_id = %transition.attempt.run_id,
            task_id = %transition.attempt.task_id,
            attempt = transition.attempt.attempt,
            sequence,
            "checkpointed task success"
        );
        Ok(())
    }

    /// Checkpoint a failed attempt.
    ///
    /// With `terminal = Some((sequence, ctx))` the task is marked `Failed` and
    /// a snapshot is stored. With `None` a retry is pending and the task goes
    /// back to `Pending`.
    pub async fn task_failed(
        &self,
        attempt: TaskAttempt,
        error: &str,
        terminal: Option<(u64, &Context)>,
    ) -> Result<(), PersistenceError> {
        let (status, snapshot) = match terminal {
            Some((sequence, ctx)) => {
                let checkpoint = format!("task:{}:{}", attempt.task_id, attempt.attempt);
                (
                    TaskStatus::Failed,
                    Some(snapshot(attempt.run_id, sequence, &checkpoint, ctx)?),
                )
            }
            None => (TaskStatus::Pending, None),
        };
        let transition = TaskTransition {
            state: task_state(attempt.run_id, &attempt.task_id, status, attempt.attempt),
            snapshot,
            attempt: attempt.finish(TaskStatus::Failed, Some(error.to_string())),
        };
        self.repo.commit_transition(&transition).await?;

        tracing::debug!(
            run_id = %transition.attempt.run_id,
            task_id = %transition.attempt.task_id,
            attempt = transition.attempt.attempt,
            error,
            terminal = (status == TaskStatus::Failed),
            "checkpointed task failure"
        );
        Ok(())
    }

    /// Checkpoint a task as skipped (trigger rule not met, or run cancelled).
    pub async fn task_skipped(
        &self,
        run_id: Uuid,
        task_id: &str,
        attempts: u32,
        reason: &str,
        sequence: u64,
        ctx: &Context,
    ) -> Result<(), PersistenceError> {
        let transition = TaskTransition {
            state: task_state(run_id, task_id, TaskStatus::Skipped, attempts),
            attempt: TaskAttempt::skipped(run_id, task_id, Some(reason.to_string())),
            snapshot: Some(snapshot(run_id, sequence, &format!("task:{task_id}:skipped"), ctx)?),
        };
        self.repo.commit_transition(&transition).await?;

        tracing::debug!(run_id = %run_id, task_id, reason, "checkpointed task skipped");
        Ok(())
    }

    /// Finalize an attempt left running by an interrupted process and return
    /// its task to `Pending`.
    pub async fn task_interrupted(&self, attempt: TaskAttempt) -> Result<(), PersistenceError> {
        let transition = TaskTransition {
            state: task_state(attempt.run_id, &attempt.task_id, TaskStatus::Pending, attempt.attempt),
            snapshot: None,
            attempt: attempt.finish(TaskStatus::Failed, Some(INTERRUPTED.to_string())),
        };
        self.repo.commit_transition(&transition).await?;

        tracing::debug!(
            run_id = %transition.attempt.run_id,
            task_id = %transition.attempt.task_id,
            attempt = transition.attempt.attempt,
            "finalized interrupted attempt"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Recovery helpers
    // -----------------------------------------------------------------------

    /// Load everything persisted about a run.
    pub async fn restore(&self, run_id: Uuid) -> Result<RunRecord, PersistenceError> {
        self.repo
            .load_run(&run_id)
            .await?
            .ok_or(PersistenceError::RunNotFound(run_id))
    }

    /// Rebuild the run context from the latest snapshot of a record.
    pub fn restore_context(record: &RunRecord) -> Result<Context, PersistenceError> {
        match &record.latest_snapshot {
            Some(snapshot) => Context::from_json_str(&snapshot.context)
                .map_err(|e| PersistenceError::Corrupt(e.to_string())),
            None => Ok(Context::new()),
        }
    }
}

fn task_state(run_id: Uuid, task_id: &str, status: TaskStatus, attempts: u32) -> TaskState {
    TaskState {
        run_id,
        task_id: task_id.to_string(),
        status,
        attempts,
        updated_at: Utc::now(),
    }
}

fn snapshot(
    run_id: Uuid,
    sequence: u64,
    checkpoint: &str,
    ctx: &Context,
) -> Result<ContextSnapshot, PersistenceError> {
    Ok(ContextSnapshot {
        run_id,
        sequence,
        checkpoint: checkpoint.to_string(),
        context: ctx
            .to_json_string()
            .map_err(|e| PersistenceError::Corrupt(e.to_string()))?,
        created_at: Utc::now(),
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
///
/// Never retried: the run is left in its last durably committed state.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Underlying repository operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Workflow run not found (for restore operations).
    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),

    /// Stored data could not be decoded, or the context could not be encoded.
    #[error("corrupt checkpoint data: {0}")]
    Corrupt(String),
}

impl PersistenceError {
    /// Whether the repository rejected the write because of a state conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, PersistenceError::Repository(RepositoryError::Conflict(_)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
