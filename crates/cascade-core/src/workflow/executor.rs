//! Event-driven DAG scheduler with durable checkpointing.
//!
//! The `Scheduler` drives a single run to a terminal status. Rather than
//! executing fixed waves, it reacts to task completions: whenever a task
//! reaches a terminal state, every waiting task whose dependencies are now
//! all terminal has its trigger rule evaluated and is either made ready or
//! skipped. Ready tasks run concurrently on a `tokio::task::JoinSet`.
//!
//! # Execution flow
//!
//! 1. Resolve waiting tasks (eligible -> ready, rule not met -> skipped).
//! 2. Launch ready tasks in task-ID order, up to the concurrency limit:
//!    checkpoint the attempt as running, then invoke with a private context view.
//! 3. Await the next completion, backoff expiry or cancellation.
//! 4. Success: merge the task's context delta and checkpoint it atomically.
//!    Failure: consult the retry manager, then back off or mark failed.
//! 5. When nothing is running or backing off, write the final run status.
//!
//! Cancellation arrives either through the `CancellationToken` or as a
//! terminal run status persisted by someone else. The repository refuses new
//! attempts on a terminal run, and the scheduler treats that refusal like a
//! cancellation signal.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use cascade_types::workflow::{RunStatus, TaskAttempt, TaskStatus};
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::context::Context;
use crate::repository::run::RunRepository;
use crate::task::{SharedTask, TaskError, invoke_guarded};

use super::checkpoint::{CheckpointManager, PersistenceError};
use super::definition::WorkflowDefinition;
use super::retry::{RetryDecision, RetryManager};
use super::trigger;

/// Error detail stored on runs and skip records when a run is cancelled.
pub const CANCELLED_REASON: &str = "run cancelled";

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// Limits applied to every run driven by a scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Upper bound on concurrently running tasks. `None` is unbounded.
    pub max_concurrency: Option<usize>,
    /// Timeout for tasks that declare none.
    pub default_task_timeout: Option<Duration>,
}

/// The first task failure that was not retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub task_id: String,
    pub attempt: u32,
    pub message: String,
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "task '{}' failed on attempt {}: {}",
            self.task_id, self.attempt, self.message
        )
    }
}

/// Everything the scheduler needs to drive one run.
///
/// For a fresh run every task is pending. For a resumed run, `task_status`
/// and `attempts` carry the committed progress; tasks absent from
/// `task_status`, or present with a non-terminal status, start out waiting.
pub struct RunPlan {
    pub run_id: Uuid,
    pub definition: Arc<WorkflowDefinition>,
    pub logic: HashMap<String, SharedTask>,
    pub context: Context,
    pub task_status: HashMap<String, TaskStatus>,
    pub attempts: HashMap<String, u32>,
    pub next_sequence: u64,
    pub first_failure: Option<TaskFailure>,
}

/// Final state of a driven run.
#[derive(Debug, Clone)]
pub struct SchedulerOutcome {
    pub status: RunStatus,
    pub context: Context,
    pub task_status: BTreeMap<String, TaskStatus>,
    pub failure: Option<TaskFailure>,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Waiting,
    Ready,
    Running,
    BackingOff,
    Finished(TaskStatus),
}

impl Slot {
    fn as_status(self) -> TaskStatus {
        match self {
            Slot::Waiting | Slot::Ready | Slot::BackingOff => TaskStatus::Pending,
            Slot::Running => TaskStatus::Running,
            Slot::Finished(status) => status,
        }
    }
}

enum Event {
    Finished {
        task_id: String,
        attempt: TaskAttempt,
        base: Context,
        result: Result<Context, TaskError>,
    },
    BackoffElapsed {
        task_id: String,
    },
}

enum Wake {
    Cancelled,
    Joined(Option<Result<Event, JoinError>>),
}

struct DriveState {
    run_id: Uuid,
    slots: BTreeMap<String, Slot>,
    attempts: HashMap<String, u32>,
    /// Context view captured when a task became ready.
    views: HashMap<String, Context>,
    context: Context,
    sequence: u64,
    running: usize,
    backoffs: HashMap<String, AbortHandle>,
    first_failure: Option<TaskFailure>,
    cancelled: bool,
}

impl DriveState {
    fn mark_ready(&mut self, task_id: &str) {
        self.views.insert(task_id.to_string(), self.context.clone());
        self.slots.insert(task_id.to_string(), Slot::Ready);
    }

    fn next_ready(&self) -> Option<String> {
        self.slots
            .iter()
            .find(|(_, slot)| **slot == Slot::Ready)
            .map(|(id, _)| id.clone())
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Drives workflow runs against a checkpointed repository.
///
/// Generic over `R: RunRepository` for storage flexibility.
pub struct Scheduler<R: RunRepository> {
    checkpoint: Arc<CheckpointManager<R>>,
    config: SchedulerConfig,
}

impl<R: RunRepository + 'static> Scheduler<R> {
    pub fn new(checkpoint: Arc<CheckpointManager<R>>, config: SchedulerConfig) -> Self {
        Self { checkpoint, config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Drive a run until every task is terminal or the run is cancelled.
    ///
    /// Persistence errors abort the drive immediately and leave the run in
    /// its last committed state.
    pub async fn drive(
        &self,
        plan: RunPlan,
        cancel: &CancellationToken,
    ) -> Result<SchedulerOutcome, ExecutorError> {
        let RunPlan {
            run_id,
            definition,
            logic,
            context,
            task_status,
            attempts,
            next_sequence,
            first_failure,
        } = plan;

        let slots = definition
            .task_ids()
            .map(|id| {
                let slot = match task_status.get(id) {
                    Some(status) if status.is_terminal() => Slot::Finished(*status),
                    _ => Slot::Waiting,
                };
                (id.to_string(), slot)
            })
            .collect();

        let mut st = DriveState {
            run_id,
            slots,
            attempts,
            views: HashMap::new(),
            context,
            sequence: next_sequence,
            running: 0,
            backoffs: HashMap::new(),
            first_failure,
            cancelled: false,
        };
        let mut join_set: JoinSet<Event> = JoinSet::new();

        loop {
            if !st.cancelled && cancel.is_cancelled() {
                self.cancel_pending(&mut st).await?;
            }
            if !st.cancelled {
                self.resolve(&definition, &mut st).await?;
                self.launch_ready(&definition, &logic, &mut st, &mut join_set)
                    .await?;
            }
            if join_set.is_empty() {
                break;
            }

            let wake = tokio::select! {
                _ = cancel.cancelled(), if !st.cancelled => Wake::Cancelled,
                joined = join_set.join_next() => Wake::Joined(joined),
            };

            match wake {
                Wake::Cancelled => continue,
                Wake::Joined(None) => break,
                Wake::Joined(Some(Err(e))) if e.is_cancelled() => continue,
                Wake::Joined(Some(Err(e))) => return Err(ExecutorError::Join(e.to_string())),
                Wake::Joined(Some(Ok(event))) => {
                    self.handle_event(&definition, &mut st, &mut join_set, event)
                        .await?;
                }
            }
        }

        self.finish(st).await
    }

    // -----------------------------------------------------------------------
    // Resolution and launch
    // -----------------------------------------------------------------------

    /// Evaluate every waiting task whose dependencies are all terminal.
    ///
    /// A single pass in topological order suffices: a skip made earlier in
    /// the pass is already visible to its dependents later in the pass.
    async fn resolve(
        &self,
        definition: &WorkflowDefinition,
        st: &mut DriveState,
    ) -> Result<(), ExecutorError> {
        for task_id in definition.topological_order() {
            if st.slots.get(task_id) != Some(&Slot::Waiting) {
                continue;
            }
            let Some(spec) = definition.task(task_id) else {
                continue;
            };
            if spec.dependencies.is_empty() {
                st.mark_ready(task_id);
                continue;
            }

            let statuses: Option<Vec<TaskStatus>> = spec
                .dependencies
                .iter()
                .map(|dep| match st.slots.get(dep) {
                    Some(Slot::Finished(status)) => Some(*status),
                    _ => None,
                })
                .collect();
            let Some(statuses) = statuses else {
                continue;
            };

            if trigger::evaluate(spec.trigger_rule, statuses) {
                st.mark_ready(task_id);
            } else {
                let reason = format!("trigger rule {} not met", spec.trigger_rule);
                self.skip(st, task_id, &reason).await?;
            }
        }
        Ok(())
    }

    async fn launch_ready(
        &self,
        definition: &WorkflowDefinition,
        logic: &HashMap<String, SharedTask>,
        st: &mut DriveState,
        join_set: &mut JoinSet<Event>,
    ) -> Result<(), ExecutorError> {
        let limit = self.config.max_concurrency.unwrap_or(usize::MAX).max(1);
        while st.running < limit {
            let Some(task_id) = st.next_ready() else {
                break;
            };
            let task = logic
                .get(&task_id)
                .cloned()
                .ok_or_else(|| ExecutorError::MissingLogic(task_id.clone()))?;
            let timeout = definition
                .task(&task_id)
                .and_then(|spec| spec.timeout())
                .or(self.config.default_task_timeout);

            let attempt_no = st.attempts.get(&task_id).copied().unwrap_or(0) + 1;
            let attempt = match self
                .checkpoint
                .task_running(st.run_id, &task_id, attempt_no)
                .await
            {
                Ok(attempt) => attempt,
                Err(e) => {
                    if e.is_conflict() && self.run_is_terminal(st.run_id).await? {
                        tracing::info!(
                            run_id = %st.run_id,
                            task_id = %task_id,
                            "Run finalized elsewhere, not starting task"
                        );
                        return self.cancel_pending(st).await;
                    }
                    return Err(e.into());
                }
            };
            st.attempts.insert(task_id.clone(), attempt_no);
            st.slots.insert(task_id.clone(), Slot::Running);
            st.running += 1;

            tracing::info!(run_id = %st.run_id, task_id = %task_id, attempt = attempt_no, "Task started");

            let base = st
                .views
                .remove(&task_id)
                .unwrap_or_else(|| st.context.clone());
            join_set.spawn(async move {
                let result = invoke_guarded(task, base.clone(), timeout).await;
                Event::Finished {
                    task_id,
                    attempt,
                    base,
                    result,
                }
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    async fn handle_event(
        &self,
        definition: &WorkflowDefinition,
        st: &mut DriveState,
        join_set: &mut JoinSet<Event>,
        event: Event,
    ) -> Result<(), ExecutorError> {
        match event {
            Event::BackoffElapsed { task_id } => {
                st.backoffs.remove(&task_id);
                if !st.cancelled && st.slots.get(&task_id) == Some(&Slot::BackingOff) {
                    st.mark_ready(&task_id);
                }
                Ok(())
            }
            Event::Finished {
                task_id,
                attempt,
                base,
                result,
            } => {
                st.running = st.running.saturating_sub(1);
                match result {
                    Ok(output) => self.on_success(st, task_id, attempt, &base, output).await,
                    Err(err) => {
                        self.on_failure(definition, st, join_set, task_id, attempt, err)
                            .await
                    }
                }
            }
        }
    }

    async fn on_success(
        &self,
        st: &mut DriveState,
        task_id: String,
        attempt: TaskAttempt,
        base: &Context,
        output: Context,
    ) -> Result<(), ExecutorError> {
        let delta = output.diff(base);
        st.context.apply(&delta);
        let attempt_no = attempt.attempt;
        self.checkpoint
            .task_succeeded(attempt, st.sequence, &st.context)
            .await?;
        st.sequence += 1;
        st.slots.insert(task_id.clone(), Slot::Finished(TaskStatus::Succeeded));

        tracing::info!(
            run_id = %st.run_id,
            task_id = %task_id,
            attempt = attempt_no,
            written = delta.upserts.len(),
            removed = delta.removals.len(),
            "Task succeeded"
        );
        Ok(())
    }

    async fn on_failure(
        &self,
        definition: &WorkflowDefinition,
        st: &mut DriveState,
        join_set: &mut JoinSet<Event>,
        task_id: String,
        attempt: TaskAttempt,
        err: TaskError,
    ) -> Result<(), ExecutorError> {
        let message = err.to_string();
        let attempt_no = attempt.attempt;
        let decision = match definition.task(&task_id) {
            Some(spec) if !st.cancelled => RetryManager::decide(&spec.retry_policy, attempt_no),
            _ => RetryDecision::GiveUp,
        };

        match decision {
            RetryDecision::Retry(delay) => {
                self.checkpoint.task_failed(attempt, &message, None).await?;
                st.slots.insert(task_id.clone(), Slot::BackingOff);

                tracing::warn!(
                    run_id = %st.run_id,
                    task_id = %task_id,
                    attempt = attempt_no,
                    error = %message,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Task failed, retrying"
                );

                let elapsed_id = task_id.clone();
                let handle = join_set.spawn(async move {
                    tokio::time::sleep(delay).await;
                    Event::BackoffElapsed { task_id: elapsed_id }
                });
                st.backoffs.insert(task_id, handle);
            }
            RetryDecision::GiveUp => {
                self.checkpoint
                    .task_failed(attempt, &message, Some((st.sequence, &st.context)))
                    .await?;
                st.sequence += 1;
                st.slots.insert(task_id.clone(), Slot::Finished(TaskStatus::Failed));

                tracing::warn!(
                    run_id = %st.run_id,
                    task_id = %task_id,
                    attempt = attempt_no,
                    error = %message,
                    "Task failed"
                );

                st.first_failure.get_or_insert(TaskFailure {
                    task_id,
                    attempt: attempt_no,
                    message,
                });
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Skips, cancellation and completion
    // -----------------------------------------------------------------------

    async fn run_is_terminal(&self, run_id: Uuid) -> Result<bool, ExecutorError> {
        let run = self
            .checkpoint
            .repo()
            .get_run(&run_id)
            .await
            .map_err(PersistenceError::from)?;
        Ok(run.is_some_and(|r| r.status.is_terminal()))
    }

    async fn skip(&self, st: &mut DriveState, task_id: &str, reason: &str) -> Result<(), ExecutorError> {
        let attempts = st.attempts.get(task_id).copied().unwrap_or(0);
        self.checkpoint
            .task_skipped(st.run_id, task_id, attempts, reason, st.sequence, &st.context)
            .await?;
        st.sequence += 1;
        st.views.remove(task_id);
        st.slots
            .insert(task_id.to_string(), Slot::Finished(TaskStatus::Skipped));

        tracing::info!(run_id = %st.run_id, task_id, reason, "Task skipped");
        Ok(())
    }

    /// Skip everything not yet running. In-flight tasks are left to finish.
    async fn cancel_pending(&self, st: &mut DriveState) -> Result<(), ExecutorError> {
        st.cancelled = true;
        for (_, handle) in st.backoffs.drain() {
            handle.abort();
        }

        let pending: Vec<String> = st
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Waiting | Slot::Ready | Slot::BackingOff))
            .map(|(id, _)| id.clone())
            .collect();
        for task_id in &pending {
            self.skip(st, task_id, CANCELLED_REASON).await?;
        }

        tracing::info!(
            run_id = %st.run_id,
            skipped = pending.len(),
            in_flight = st.running,
            "Run cancelled, draining in-flight tasks"
        );
        Ok(())
    }

    async fn finish(&self, st: DriveState) -> Result<SchedulerOutcome, ExecutorError> {
        let any_failed = st
            .slots
            .values()
            .any(|slot| *slot == Slot::Finished(TaskStatus::Failed));
        let status = if st.cancelled {
            RunStatus::Cancelled
        } else if any_failed {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        let error = match status {
            RunStatus::Failed => st.first_failure.as_ref().map(ToString::to_string),
            RunStatus::Cancelled => Some(CANCELLED_REASON.to_string()),
            _ => None,
        };

        self.checkpoint
            .save_context(st.run_id, st.sequence, &format!("run:{status}"), &st.context)
            .await?;

        let status = match self
            .checkpoint
            .run_status(st.run_id, status, error.as_deref())
            .await
        {
            Ok(()) => status,
            // Already finalized elsewhere, e.g. by `Runner::cancel`.
            Err(e) if e.is_conflict() => self
                .checkpoint
                .repo()
                .get_run(&st.run_id)
                .await
                .map_err(PersistenceError::from)?
                .map(|run| run.status)
                .unwrap_or(status),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(run_id = %st.run_id, status = %status, "Run finished");

        Ok(SchedulerOutcome {
            status,
            context: st.context,
            task_status: st
                .slots
                .into_iter()
                .map(|(id, slot)| (id, slot.as_status()))
                .collect(),
            failure: st.first_failure,
        })
    }
}

// ---------------------------------------------------------------------------
// ExecutorError
// ---------------------------------------------------------------------------

/// Errors that abort a drive.
///
/// Task failures are not errors here; they are retried or recorded as
/// failed tasks and reflected in the run status.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Checkpoint persistence error.
    #[error("checkpoint error: {0}")]
    Persistence(#[from] PersistenceError),

    /// A task in the plan has no executable logic.
    #[error("no logic registered for task '{0}'")]
    MissingLogic(String),

    /// A spawned task could not be joined.
    #[error("task join error: {0}")]
    Join(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRunRepository;
    use crate::task::task_fn;
    use crate::workflow::definition::WorkflowBuilder;
    use cascade_types::workflow::{TaskSpec, WorkflowRun};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn executor_error_display() {
        let err = ExecutorError::MissingLogic("load".to_string());
        assert!(err.to_string().contains("load"));

        let failure = TaskFailure {
            task_id: "extract".to_string(),
            attempt: 3,
            message: "boom".to_string(),
        };
        assert_eq!(failure.to_string(), "task 'extract' failed on attempt 3: boom");
    }

    /// Drive a fan-out of independent tasks with a concurrency limit of one
    /// and record the order they ran in.
    #[tokio::test]
    async fn test_ready_tasks_launch_in_id_order() {
        let definition = Arc::new(
            WorkflowBuilder::new("fanout")
                .task(TaskSpec::new("c"))
                .task(TaskSpec::new("a"))
                .task(TaskSpec::new("b"))
                .finalize()
                .unwrap(),
        );
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut logic: HashMap<String, SharedTask> = HashMap::new();
        for id in ["a", "b", "c"] {
            let order = Arc::clone(&order);
            logic.insert(
                id.to_string(),
                Arc::new(task_fn(move |mut ctx: Context| {
                    let order = Arc::clone(&order);
                    async move {
                        order.lock().unwrap().push(id);
                        ctx.set(id, true);
                        Ok(ctx)
                    }
                })),
            );
        }

        let checkpoint = Arc::new(CheckpointManager::new(InMemoryRunRepository::new()));
        let run = WorkflowRun {
            id: Uuid::now_v7(),
            workflow_name: definition.name().to_string(),
            workflow_version: definition.version().to_string(),
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        };
        checkpoint
            .start_run(&run, definition.task_ids(), &Context::new())
            .await
            .unwrap();
        checkpoint.run_status(run.id, RunStatus::Running, None).await.unwrap();

        let scheduler = Scheduler::new(
            Arc::clone(&checkpoint),
            SchedulerConfig {
                max_concurrency: Some(1),
                default_task_timeout: None,
            },
        );
        let plan = RunPlan {
            run_id: run.id,
            definition,
            logic,
            context: Context::new(),
            task_status: HashMap::new(),
            attempts: HashMap::new(),
            next_sequence: 1,
            first_failure: None,
        };
        let outcome = scheduler.drive(plan, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(outcome.context.get("c"), Some(&json!(true)));
        let stored = checkpoint.repo().get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
    }
}
