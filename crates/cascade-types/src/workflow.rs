//! Workflow domain types for Cascade.
//!
//! Defines the declarative pieces of a workflow (task specs, trigger rules,
//! retry policies) and the execution tracking records that storage backends
//! persist (`WorkflowRun`, `TaskAttempt`, `TaskState`, `ContextSnapshot`).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Trigger rules
// ---------------------------------------------------------------------------

/// Predicate over the terminal states of a task's dependencies.
///
/// Decides whether a task whose dependencies have all finished runs or is
/// skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerRule {
    /// Every dependency succeeded.
    #[default]
    AllSuccess,
    /// Every dependency failed.
    AllFailed,
    /// At least one dependency succeeded.
    OneSuccess,
    /// At least one dependency failed.
    OneFailed,
    /// No dependency failed (skipped dependencies are permitted).
    NoneFailed,
}

impl TriggerRule {
    /// Stable snake_case name, as used in serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerRule::AllSuccess => "all_success",
            TriggerRule::AllFailed => "all_failed",
            TriggerRule::OneSuccess => "one_success",
            TriggerRule::OneFailed => "one_failed",
            TriggerRule::NoneFailed => "none_failed",
        }
    }
}

impl std::fmt::Display for TriggerRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Delay strategy between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Constant `base_delay` between attempts.
    #[default]
    None,
    /// Same as `None`: constant `base_delay`.
    Fixed,
    /// `base_delay * 2^(attempt - 1)`, optionally capped by `max_delay`.
    Exponential,
}

/// Retry configuration for a task.
///
/// `max_retries` counts re-attempts after the first invocation, so a task
/// with `max_retries = 3` is invoked at most four times.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first invocation (default 0, no retries).
    /// Not the total number of invocations; see [`RetryPolicy::max_invocations`].
    #[serde(default, alias = "max_attempts")]
    pub max_retries: u32,
    /// Backoff strategy between attempts.
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Base delay in milliseconds.
    #[serde(default)]
    pub base_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self::default()
    }

    /// Constant delay between up to `max_retries` retries.
    pub fn fixed(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: BackoffStrategy::Fixed,
            base_delay_ms: duration_ms(base_delay),
            max_delay_ms: None,
        }
    }

    /// Doubling delay between up to `max_retries` retries.
    pub fn exponential(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: BackoffStrategy::Exponential,
            base_delay_ms: duration_ms(base_delay),
            max_delay_ms: None,
        }
    }

    /// Cap every computed delay at `max_delay`.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay_ms = Some(duration_ms(max_delay));
        self
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Option<Duration> {
        self.max_delay_ms.map(Duration::from_millis)
    }

    /// Upper bound on the number of invocations (first attempt plus retries).
    pub fn max_invocations(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Task specification
// ---------------------------------------------------------------------------

/// Declarative description of a task inside a workflow graph.
///
/// Carries everything about a task except its executable logic, which lives
/// in the task registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Task ID, unique within a workflow.
    pub id: String,
    /// IDs of tasks that must reach a terminal state first, in declaration order.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Rule evaluated over the dependencies' terminal states.
    #[serde(default)]
    pub trigger_rule: TriggerRule,
    /// Retry configuration.
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    /// Per-attempt timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl TaskSpec {
    /// A root task with default trigger rule and no retries.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            dependencies: Vec::new(),
            trigger_rule: TriggerRule::default(),
            retry_policy: RetryPolicy::default(),
            timeout_secs: None,
        }
    }

    /// Add dependencies, ignoring ones already declared.
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for dep in deps {
            let dep = dep.into();
            if !self.dependencies.contains(&dep) {
                self.dependencies.push(dep);
            }
        }
        self
    }

    pub fn trigger_rule(mut self, rule: TriggerRule) -> Self {
        self.trigger_rule = rule;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

// ---------------------------------------------------------------------------
// Execution status
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Completed, Failed and Cancelled are final; a run never leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("invalid run status: {other}")),
        }
    }
}

/// Status of a task within a run, and of an individual attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskStatus {
    /// Succeeded, Failed and Skipped are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            "skipped" => Ok(TaskStatus::Skipped),
            other => Err(format!("invalid task status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

/// A single execution instance of a workflow version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// UUIDv7 run ID.
    pub id: Uuid,
    /// Name of the workflow being executed.
    pub workflow_name: String,
    /// Content-derived version of the workflow definition.
    pub workflow_version: String,
    /// Current run status.
    pub status: RunStatus,
    /// When the run record was created.
    pub created_at: DateTime<Utc>,
    /// When execution started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// First unretried task failure, or the reason for cancellation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Longest execution lease a backend will grant.
pub const MAX_LEASE: Duration = Duration::from_secs(24 * 60 * 60);

/// Expiry of an execution lease taken at `now` for `ttl`, capped at [`MAX_LEASE`].
pub fn lease_deadline(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::TimeDelta::from_std(ttl.min(MAX_LEASE)).unwrap_or(chrono::TimeDelta::zero());
    now + ttl
}

/// One attempt at executing a task.
///
/// Created as `Running` when the attempt starts and finalized exactly once.
/// A retry appends a new record rather than editing the previous one. Skip
/// records are created already final with attempt number 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAttempt {
    /// UUIDv7 attempt ID.
    pub id: Uuid,
    /// Parent run ID.
    pub run_id: Uuid,
    /// Task ID within the workflow.
    pub task_id: String,
    /// Attempt number (1-based; 0 for skip records).
    pub attempt: u32,
    /// Attempt status.
    pub status: TaskStatus,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// When the attempt was finalized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Error detail for failed attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskAttempt {
    /// Start a new running attempt.
    pub fn running(run_id: Uuid, task_id: &str, attempt: u32) -> Self {
        Self {
            id: Uuid::now_v7(),
            run_id,
            task_id: task_id.to_string(),
            attempt,
            status: TaskStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    /// A finalized skip record.
    pub fn skipped(run_id: Uuid, task_id: &str, reason: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            run_id,
            task_id: task_id.to_string(),
            attempt: 0,
            status: TaskStatus::Skipped,
            started_at: now,
            completed_at: Some(now),
            error: reason,
        }
    }

    /// Finalize a running attempt with a terminal status.
    pub fn finish(mut self, status: TaskStatus, error: Option<String>) -> Self {
        self.status = status;
        self.error = error;
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn is_final(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Current status of a task within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    pub run_id: Uuid,
    pub task_id: String,
    pub status: TaskStatus,
    /// Number of attempts started so far.
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

/// Serialized context captured at a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub run_id: Uuid,
    /// Monotonic per-run sequence number (0 = run start).
    pub sequence: u64,
    /// Marker naming the checkpoint (e.g. `run:start`, `task:load:1`).
    pub checkpoint: String,
    /// Context serialized as a JSON object, key order preserved.
    pub context: String,
    pub created_at: DateTime<Utc>,
}

/// An atomic unit of task progress.
///
/// Backends apply the attempt write, the task state upsert and the optional
/// snapshot together or not at all.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskTransition {
    pub state: TaskState,
    pub attempt: TaskAttempt,
    pub snapshot: Option<ContextSnapshot>,
}

/// Everything persisted about a run, as loaded for recovery or inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub run: WorkflowRun,
    pub tasks: Vec<TaskState>,
    pub attempts: Vec<TaskAttempt>,
    pub latest_snapshot: Option<ContextSnapshot>,
}

impl RunRecord {
    /// Attempts for a single task, in attempt order.
    pub fn attempts_for<'a>(&'a self, task_id: &'a str) -> impl Iterator<Item = &'a TaskAttempt> + 'a {
        self.attempts.iter().filter(move |a| a.task_id == task_id)
    }

    pub fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.tasks
            .iter()
            .find(|t| t.task_id == task_id)
            .map(|t| t.status)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_rule_default_is_all_success() {
        assert_eq!(TriggerRule::default(), TriggerRule::AllSuccess);
    }

    #[test]
    fn test_trigger_rule_serde_snake_case() {
        let json = serde_json::to_string(&TriggerRule::NoneFailed).unwrap();
        assert_eq!(json, "\"none_failed\"");
        let parsed: TriggerRule = serde_json::from_str("\"one_failed\"").unwrap();
        assert_eq!(parsed, TriggerRule::OneFailed);
        assert_eq!(TriggerRule::OneSuccess.to_string(), "one_success");
    }

    #[test]
    fn test_retry_policy_defaults_from_toml() {
        let policy: RetryPolicy = toml::from_str("backoff = \"exponential\"").unwrap();
        assert_eq!(policy.max_retries, 0);
        assert_eq!(policy.backoff, BackoffStrategy::Exponential);
        assert_eq!(policy.base_delay(), Duration::ZERO);
        assert!(policy.max_delay().is_none());
    }

    #[test]
    fn test_lease_deadline_is_capped() {
        let now = Utc::now();
        assert_eq!(
            lease_deadline(now, Duration::from_secs(30)),
            now + chrono::TimeDelta::seconds(30)
        );
        assert_eq!(
            lease_deadline(now, Duration::MAX),
            now + chrono::TimeDelta::days(1)
        );
    }

    #[test]
    fn test_retry_policy_accepts_max_attempts_alias() {
        let policy: RetryPolicy = toml::from_str("max_attempts = 2").unwrap();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.max_invocations(), 3);
    }

    #[test]
    fn test_retry_policy_constructors() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(2));
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.max_invocations(), 4);
        assert_eq!(policy.base_delay_ms, 100);
        assert_eq!(policy.max_delay_ms, Some(2000));

        let fixed = RetryPolicy::fixed(1, Duration::from_millis(5));
        assert_eq!(fixed.backoff, BackoffStrategy::Fixed);
        assert_eq!(RetryPolicy::none().max_invocations(), 1);
    }

    #[test]
    fn test_task_spec_builder_dedupes_dependencies() {
        let spec = TaskSpec::new("report")
            .depends_on(["load", "clean"])
            .depends_on(["load"])
            .trigger_rule(TriggerRule::NoneFailed)
            .timeout_secs(30);
        assert_eq!(spec.dependencies, vec!["load", "clean"]);
        assert_eq!(spec.trigger_rule, TriggerRule::NoneFailed);
        assert_eq!(spec.timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_task_spec_deserialize_minimal() {
        let spec: TaskSpec = serde_json::from_str(r#"{"id":"extract"}"#).unwrap();
        assert_eq!(spec, TaskSpec::new("extract"));
    }

    #[test]
    fn test_run_status_terminal() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Succeeded,
            TaskStatus::Failed,
            TaskStatus::Skipped,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
            // serde and as_str agree
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert!("crashed".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_task_attempt_lifecycle() {
        let run_id = Uuid::now_v7();
        let attempt = TaskAttempt::running(run_id, "load", 2);
        assert_eq!(attempt.status, TaskStatus::Running);
        assert!(!attempt.is_final());

        let done = attempt.finish(TaskStatus::Failed, Some("boom".to_string()));
        assert_eq!(done.attempt, 2);
        assert!(done.is_final());
        assert_eq!(done.error.as_deref(), Some("boom"));

        let skipped = TaskAttempt::skipped(run_id, "report", None);
        assert_eq!(skipped.attempt, 0);
        assert!(skipped.is_final());
    }
}
