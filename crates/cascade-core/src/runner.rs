//! Runner: the orchestration facade.
//!
//! Owns the storage backend (through a `CheckpointManager`), a task registry
//! and a `Scheduler`, and exposes "execute workflow X with context Y".
//!
//! # Run lifecycle
//!
//! 1. Resolve the workflow definition (latest version unless pinned) and the
//!    logic of every task in it.
//! 2. Persist the run with all tasks pending and the initial context.
//! 3. Drive the scheduler to a terminal status.
//! 4. Return the final status, context and attempt history.
//!
//! Executing a run ID that already exists resumes it when unfinished and
//! returns the stored result when terminal.
//!
//! # Ownership
//!
//! A runner drives a run only while it holds the run's execution lease in
//! the repository. The lease is renewed during execution and released at the
//! end. A second execution of the same run ID, from this runner or any other
//! runner on the same storage, fails with `RunConflict` until the lease is
//! released or lapses. A lease left behind by a crashed process lapses after
//! `lease_ttl`, after which the run can be resumed.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cascade_types::config::EngineConfig;
use cascade_types::error::RepositoryError;
use cascade_types::workflow::{RunRecord, RunStatus, TaskAttempt, TaskStatus, WorkflowRun};
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::context::Context;
use crate::registry::{RegistryError, TaskRegistry};
use crate::repository::run::RunRepository;
use crate::task::SharedTask;
use crate::workflow::checkpoint::{CheckpointManager, PersistenceError};
use crate::workflow::definition::{GraphError, WorkflowDefinition};
use crate::workflow::executor::{
    CANCELLED_REASON, ExecutorError, RunPlan, Scheduler, SchedulerConfig, SchedulerOutcome,
    TaskFailure,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Default lifetime of a run's execution lease.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

/// Runner limits. Defaults to unbounded concurrency, no task timeout and a
/// 30 second execution lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    pub max_concurrency: Option<usize>,
    pub default_task_timeout: Option<Duration>,
    /// Lifetime of the execution lease; renewed every third of it.
    pub lease_ttl: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            default_task_timeout: None,
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }
}

impl From<&EngineConfig> for RunnerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency,
            default_task_timeout: config.default_task_timeout_secs.map(Duration::from_secs),
            lease_ttl: Duration::from_secs(config.run_lease_secs),
        }
    }
}

impl From<&RunnerConfig> for SchedulerConfig {
    fn from(config: &RunnerConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency,
            default_task_timeout: config.default_task_timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// RunResult
// ---------------------------------------------------------------------------

/// Final state of a run as returned to the caller.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub workflow_version: String,
    pub status: RunStatus,
    /// Final run context.
    pub context: Context,
    /// Terminal status of every task.
    pub task_status: BTreeMap<String, TaskStatus>,
    /// Every attempt record, in the order attempts were made.
    pub task_history: Vec<TaskAttempt>,
    /// First task failure that was not retried.
    pub error: Option<TaskFailure>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn status_of(&self, task_id: &str) -> Option<TaskStatus> {
        self.task_status.get(task_id).copied()
    }

    /// Attempts made for one task.
    pub fn attempts_of<'a>(&'a self, task_id: &'a str) -> impl Iterator<Item = &'a TaskAttempt> + 'a {
        self.task_history.iter().filter(move |a| a.task_id == task_id)
    }
}

// ---------------------------------------------------------------------------
// RunnerError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The run is already being executed (here or by another runner holding
    /// its lease), or the ID belongs to a different workflow.
    #[error("run {0} is already in progress")]
    RunConflict(Uuid),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Removes the run from the active set when execution ends, however it ends.
struct ActiveRun<'a> {
    runs: &'a DashMap<Uuid, CancellationToken>,
    run_id: Uuid,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.runs.remove(&self.run_id);
    }
}

/// Orchestration facade over a storage backend.
///
/// Generic over `R: RunRepository` for storage flexibility.
pub struct Runner<R: RunRepository> {
    checkpoint: Arc<CheckpointManager<R>>,
    registry: Arc<TaskRegistry>,
    scheduler: Scheduler<R>,
    /// Cancellation tokens of runs currently executing, keyed by run ID.
    active_runs: DashMap<Uuid, CancellationToken>,
    /// Lease owner identity of this runner.
    owner: Uuid,
    lease_ttl: Duration,
}

impl<R: RunRepository + 'static> Runner<R> {
    pub fn new(repository: R, registry: Arc<TaskRegistry>, config: RunnerConfig) -> Self {
        let checkpoint = Arc::new(CheckpointManager::new(repository));
        let scheduler = Scheduler::new(Arc::clone(&checkpoint), SchedulerConfig::from(&config));
        Self {
            checkpoint,
            registry,
            scheduler,
            active_runs: DashMap::new(),
            owner: Uuid::now_v7(),
            lease_ttl: config.lease_ttl,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn repository(&self) -> &R {
        self.checkpoint.repo()
    }

    /// Identity this runner records as the owner of the runs it executes.
    pub fn owner_id(&self) -> Uuid {
        self.owner
    }

    /// IDs of runs currently executing in this runner.
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.active_runs.iter().map(|entry| *entry.key()).collect()
    }

    /// Execute the latest version of a workflow under a fresh run ID.
    pub async fn execute(&self, workflow_name: &str, context: Context) -> Result<RunResult, RunnerError> {
        self.execute_with_id(Uuid::now_v7(), workflow_name, None, context)
            .await
    }

    /// Execute a specific version of a workflow under a fresh run ID.
    pub async fn execute_version(
        &self,
        workflow_name: &str,
        version: &str,
        context: Context,
    ) -> Result<RunResult, RunnerError> {
        self.execute_with_id(Uuid::now_v7(), workflow_name, Some(version), context)
            .await
    }

    /// Execute under a caller-chosen run ID.
    ///
    /// If the run already exists it is resumed (unfinished) or its stored
    /// result is returned (terminal); `context` is ignored in both cases.
    pub async fn execute_with_id(
        &self,
        run_id: Uuid,
        workflow_name: &str,
        version: Option<&str>,
        context: Context,
    ) -> Result<RunResult, RunnerError> {
        self.registry.freeze();
        let (_guard, token) = self.claim(run_id)?;

        if let Some(record) = self.checkpoint.repo().load_run(&run_id).await.map_err(PersistenceError::from)? {
            if record.run.workflow_name != workflow_name {
                tracing::warn!(
                    run_id = %run_id,
                    requested = workflow_name,
                    stored = %record.run.workflow_name,
                    "Run ID belongs to a different workflow"
                );
                return Err(RunnerError::RunConflict(run_id));
            }
            return self.continue_run(record, &token).await;
        }

        let definition = self.registry.workflow(workflow_name, version)?;
        let logic = self.resolve_logic(&definition)?;
        let run = WorkflowRun {
            id: run_id,
            workflow_name: definition.name().to_string(),
            workflow_version: definition.version().to_string(),
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        };
        match self
            .checkpoint
            .start_run(&run, definition.task_ids(), &context)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                tracing::warn!(run_id = %run_id, "Run ID was created concurrently");
                return Err(RunnerError::RunConflict(run_id));
            }
            Err(e) => return Err(e.into()),
        }

        self.with_lease(run_id, self.start_new(run, definition, logic, context, &token))
            .await
    }

    /// Continue an unfinished run from its last committed state.
    ///
    /// Succeeded, failed and skipped tasks are kept. Attempts that were
    /// running when the run was interrupted are finalized as failed and
    /// their tasks run again.
    pub async fn resume(&self, run_id: Uuid) -> Result<RunResult, RunnerError> {
        self.registry.freeze();
        let (_guard, token) = self.claim(run_id)?;
        let record = self.restore(run_id).await?;
        self.continue_run(record, &token).await
    }

    /// Request cancellation of a run.
    ///
    /// Signals the run if it is executing here, then persists `Cancelled`.
    /// A run executing in another runner stops launching tasks as soon as it
    /// sees the persisted status. Returns `false` if the run had already
    /// reached a terminal status.
    pub async fn cancel(&self, run_id: Uuid) -> Result<bool, RunnerError> {
        if let Some(token) = self.active_runs.get(&run_id) {
            token.cancel();
        }
        match self
            .checkpoint
            .run_status(run_id, RunStatus::Cancelled, Some(CANCELLED_REASON))
            .await
        {
            Ok(()) => {
                tracing::info!(run_id = %run_id, "Run cancelled");
                Ok(true)
            }
            Err(e) if e.is_conflict() => Ok(false),
            Err(PersistenceError::Repository(RepositoryError::NotFound)) => {
                Err(RunnerError::RunNotFound(run_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load everything persisted about a run.
    pub async fn load_run(&self, run_id: Uuid) -> Result<RunRecord, RunnerError> {
        self.restore(run_id).await
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn claim(&self, run_id: Uuid) -> Result<(ActiveRun<'_>, CancellationToken), RunnerError> {
        let token = CancellationToken::new();
        match self.active_runs.entry(run_id) {
            Entry::Occupied(_) => return Err(RunnerError::RunConflict(run_id)),
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
            }
        }
        let guard = ActiveRun {
            runs: &self.active_runs,
            run_id,
        };
        Ok((guard, token))
    }

    /// Run `work` while holding the execution lease on `run_id`.
    async fn with_lease<T>(
        &self,
        run_id: Uuid,
        work: impl Future<Output = Result<T, RunnerError>>,
    ) -> Result<T, RunnerError> {
        let claimed = self
            .checkpoint
            .repo()
            .claim_run(&run_id, &self.owner, self.lease_ttl)
            .await
            .map_err(PersistenceError::from)?;
        if !claimed {
            tracing::warn!(run_id = %run_id, "Run is leased by another runner");
            return Err(RunnerError::RunConflict(run_id));
        }

        let result = work.await;

        if let Err(e) = self.checkpoint.repo().release_run(&run_id, &self.owner).await {
            tracing::warn!(run_id = %run_id, error = %e, "Failed to release run lease");
        }
        result
    }

    /// Drive the scheduler, renewing the lease until it returns.
    async fn drive_leased(&self, plan: RunPlan, token: &CancellationToken) -> Result<SchedulerOutcome, RunnerError> {
        let run_id = plan.run_id;
        let period = (self.lease_ttl / 3).max(Duration::from_millis(10));
        let mut renew = tokio::time::interval_at(Instant::now() + period, period);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let drive = self.scheduler.drive(plan, token);
        tokio::pin!(drive);
        loop {
            tokio::select! {
                outcome = &mut drive => return Ok(outcome?),
                _ = renew.tick() => self.renew_lease(run_id).await,
            }
        }
    }

    async fn renew_lease(&self, run_id: Uuid) {
        match self
            .checkpoint
            .repo()
            .claim_run(&run_id, &self.owner, self.lease_ttl)
            .await
        {
            Ok(true) => tracing::trace!(run_id = %run_id, "Run lease renewed"),
            Ok(false) => tracing::warn!(run_id = %run_id, "Run lease taken over by another runner"),
            Err(e) => tracing::warn!(run_id = %run_id, error = %e, "Failed to renew run lease"),
        }
    }

    /// Stored result of a run that turned terminal before it could start.
    async fn stored_result(&self, run_id: Uuid) -> Result<RunResult, RunnerError> {
        let record = self.restore(run_id).await?;
        tracing::info!(run_id = %run_id, status = %record.run.status, "Run finished before it started");
        result_from_record(record)
    }

    async fn start_new(
        &self,
        run: WorkflowRun,
        definition: Arc<WorkflowDefinition>,
        logic: HashMap<String, SharedTask>,
        context: Context,
        token: &CancellationToken,
    ) -> Result<RunResult, RunnerError> {
        let run_id = run.id;
        match self
            .checkpoint
            .run_status(run_id, RunStatus::Running, None)
            .await
        {
            Ok(()) => {}
            // Cancelled between creation and start.
            Err(e) if e.is_conflict() => return self.stored_result(run_id).await,
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            run_id = %run_id,
            workflow = %run.workflow_name,
            version = %run.workflow_version,
            tasks = definition.len(),
            "Run started"
        );

        let plan = RunPlan {
            run_id,
            definition,
            logic,
            context,
            task_status: HashMap::new(),
            attempts: HashMap::new(),
            next_sequence: 1,
            first_failure: None,
        };
        let outcome = self.drive_leased(plan, token).await?;
        self.build_result(&run, outcome).await
    }

    async fn restore(&self, run_id: Uuid) -> Result<RunRecord, RunnerError> {
        match self.checkpoint.restore(run_id).await {
            Ok(record) => Ok(record),
            Err(PersistenceError::RunNotFound(id)) => Err(RunnerError::RunNotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    fn resolve_logic(&self, definition: &WorkflowDefinition) -> Result<HashMap<String, SharedTask>, RunnerError> {
        definition
            .task_ids()
            .map(|id| Ok::<_, RunnerError>((id.to_string(), self.registry.lookup(id)?)))
            .collect()
    }

    async fn continue_run(&self, record: RunRecord, token: &CancellationToken) -> Result<RunResult, RunnerError> {
        if record.run.status.is_terminal() {
            tracing::debug!(run_id = %record.run.id, status = %record.run.status, "Run already finished");
            return result_from_record(record);
        }

        let run_id = record.run.id;
        self.with_lease(run_id, async {
            // Reload under the lease; the previous owner may have moved on.
            let record = self.restore(run_id).await?;
            if record.run.status.is_terminal() {
                return result_from_record(record);
            }
            self.resume_record(record, token).await
        })
        .await
    }

    async fn resume_record(&self, record: RunRecord, token: &CancellationToken) -> Result<RunResult, RunnerError> {
        let run_id = record.run.id;
        let definition = self
            .registry
            .workflow(&record.run.workflow_name, Some(&record.run.workflow_version))?;
        let logic = self.resolve_logic(&definition)?;

        let mut attempts: HashMap<String, u32> = record
            .tasks
            .iter()
            .map(|t| (t.task_id.clone(), t.attempts))
            .collect();
        let mut interrupted = 0usize;
        for attempt in &record.attempts {
            let started = attempts.entry(attempt.task_id.clone()).or_insert(0);
            *started = (*started).max(attempt.attempt);
            if !attempt.is_final() {
                self.checkpoint.task_interrupted(attempt.clone()).await?;
                interrupted += 1;
            }
        }

        let task_status: HashMap<String, TaskStatus> = record
            .tasks
            .iter()
            .filter(|t| t.status.is_terminal())
            .map(|t| (t.task_id.clone(), t.status))
            .collect();
        let context = CheckpointManager::<R>::restore_context(&record)?;
        let next_sequence = record
            .latest_snapshot
            .as_ref()
            .map(|s| s.sequence + 1)
            .unwrap_or(1);

        if record.run.status == RunStatus::Pending {
            match self
                .checkpoint
                .run_status(run_id, RunStatus::Running, None)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_conflict() => return self.stored_result(run_id).await,
                Err(e) => return Err(e.into()),
            }
        }

        tracing::info!(
            run_id = %run_id,
            workflow = %record.run.workflow_name,
            completed = task_status.len(),
            interrupted,
            "Run resumed"
        );

        let plan = RunPlan {
            run_id,
            definition,
            logic,
            context,
            task_status,
            attempts,
            next_sequence,
            first_failure: first_failure(&record),
        };
        let outcome = self.drive_leased(plan, token).await?;
        self.build_result(&record.run, outcome).await
    }

    async fn build_result(&self, run: &WorkflowRun, outcome: SchedulerOutcome) -> Result<RunResult, RunnerError> {
        let task_history = self
            .checkpoint
            .repo()
            .list_attempts(&run.id)
            .await
            .map_err(PersistenceError::from)?;
        Ok(RunResult {
            run_id: run.id,
            workflow_name: run.workflow_name.clone(),
            workflow_version: run.workflow_version.clone(),
            status: outcome.status,
            context: outcome.context,
            task_status: outcome.task_status,
            task_history,
            error: outcome.failure,
        })
    }
}

/// First failed task in attempt order, using its final attempt.
fn first_failure(record: &RunRecord) -> Option<TaskFailure> {
    record
        .attempts
        .iter()
        .filter(|a| a.status == TaskStatus::Failed)
        .find(|a| {
            record
                .tasks
                .iter()
                .any(|t| t.task_id == a.task_id && t.status == TaskStatus::Failed && t.attempts == a.attempt)
        })
        .map(|a| TaskFailure {
            task_id: a.task_id.clone(),
            attempt: a.attempt,
            message: a.error.clone().unwrap_or_default(),
        })
}

fn result_from_record(record: RunRecord) -> Result<RunResult, RunnerError> {
    let context = match &record.latest_snapshot {
        Some(snapshot) => Context::from_json_str(&snapshot.context)
            .map_err(|e| PersistenceError::Corrupt(e.to_string()))?,
        None => Context::new(),
    };
    let error = first_failure(&record);
    Ok(RunResult {
        run_id: record.run.id,
        workflow_name: record.run.workflow_name,
        workflow_version: record.run.workflow_version,
        status: record.run.status,
        context,
        task_status: record
            .tasks
            .into_iter()
            .map(|t| (t.task_id, t.status))
            .collect(),
        task_history: record.attempts,
        error,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
