//! Run repository trait definition.
//!
//! Defines the storage interface for workflow runs, per-task state, attempt
//! history and context snapshots.

use std::future::Future;
use std::time::Duration;

use cascade_types::error::RepositoryError;
use cascade_types::workflow::{
    ContextSnapshot, RunRecord, RunStatus, TaskAttempt, TaskState, TaskTransition, WorkflowRun,
};
use uuid::Uuid;

/// Repository trait for run persistence.
///
/// Covers four record families:
/// - **Runs:** create, status updates, execution leases, queries.
/// - **Task states:** current status per (run, task).
/// - **Attempts:** append-only history; each record is finalized once.
/// - **Snapshots:** serialized context at checkpoints, keyed by sequence.
///
/// Terminal task progress goes through [`RunRepository::commit_transition`],
/// which applies the attempt, task state and snapshot as one unit.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RunRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Create a run together with its initial task states and the
    /// sequence-0 context snapshot.
    ///
    /// Fails with `Conflict` if the run ID already exists.
    fn create_run(
        &self,
        run: &WorkflowRun,
        tasks: &[TaskState],
        snapshot: &ContextSnapshot,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a run by its UUID.
    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// Update a run's status and error summary.
    ///
    /// Sets `started_at` on the first transition to `Running` and
    /// `completed_at` when the status is terminal. Fails with `Conflict` if
    /// the run is already terminal and `NotFound` if it does not exist.
    fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// List runs, newest first, optionally filtered by workflow name.
    fn list_runs(
        &self,
        workflow_name: Option<&str>,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// Runs in `Pending` or `Running` status, oldest first.
    fn list_unfinished_runs(&self) -> impl Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// Take or renew the execution lease on a run for `ttl`.
    ///
    /// Compare-and-set: succeeds when the run has no owner, is already owned
    /// by `owner`, or the current lease has expired. Returns `false` while
    /// another owner holds a live lease and `NotFound` if the run does not
    /// exist.
    fn claim_run(
        &self,
        run_id: &Uuid,
        owner: &Uuid,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Drop the execution lease if `owner` holds it. A no-op otherwise.
    fn release_run(
        &self,
        run_id: &Uuid,
        owner: &Uuid,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Tasks and attempts
    // -----------------------------------------------------------------------

    /// Append a new attempt record.
    ///
    /// Fails with `Conflict` if the run is already terminal, or if the attempt
    /// ID or (run, task, attempt number) already exists.
    fn append_attempt(
        &self,
        attempt: &TaskAttempt,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Insert or replace the current state of a task.
    fn update_task_status(
        &self,
        state: &TaskState,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Atomically finalize (or append) an attempt, upsert the task state and
    /// store the optional snapshot.
    ///
    /// An attempt that already exists must still be running; finalizing it a
    /// second time fails with `Conflict` and nothing is written.
    fn commit_transition(
        &self,
        transition: &TaskTransition,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Store a context snapshot outside of a task transition.
    fn save_snapshot(
        &self,
        snapshot: &ContextSnapshot,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Current task states for a run, ordered by task ID.
    fn list_task_states(
        &self,
        run_id: &Uuid,
    ) -> impl Future<Output = Result<Vec<TaskState>, RepositoryError>> + Send;

    /// Attempt history for a run, in the order attempts were appended.
    fn list_attempts(
        &self,
        run_id: &Uuid,
    ) -> impl Future<Output = Result<Vec<TaskAttempt>, RepositoryError>> + Send;

    /// Snapshot with the highest sequence number for a run.
    fn latest_snapshot(
        &self,
        run_id: &Uuid,
    ) -> impl Future<Output = Result<Option<ContextSnapshot>, RepositoryError>> + Send;

    /// Load everything persisted about a run.
    fn load_run(
        &self,
        run_id: &Uuid,
    ) -> impl Future<Output = Result<Option<RunRecord>, RepositoryError>> + Send {
        async move {
            let Some(run) = self.get_run(run_id).await? else {
                return Ok(None);
            };
            let tasks = self.list_task_states(run_id).await?;
            let attempts = self.list_attempts(run_id).await?;
            let latest_snapshot = self.latest_snapshot(run_id).await?;
            Ok(Some(RunRecord {
                run,
                tasks,
                attempts,
                latest_snapshot,
            }))
        }
    }
}
