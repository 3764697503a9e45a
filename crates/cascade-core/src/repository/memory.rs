//! In-memory `RunRepository` backend.
//!
//! Keeps all records behind a single mutex so every operation, including
//! `commit_transition`, is trivially atomic. `set_available(false)` makes
//! every call fail with `RepositoryError::Connection`, which tests use to
//! simulate a storage outage mid-run.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cascade_types::error::RepositoryError;
use cascade_types::workflow::{
    ContextSnapshot, RunStatus, TaskAttempt, TaskState, TaskTransition, WorkflowRun, lease_deadline,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::run::RunRepository;

struct Lease {
    owner: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    runs: HashMap<Uuid, WorkflowRun>,
    leases: HashMap<Uuid, Lease>,
    tasks: HashMap<Uuid, BTreeMap<String, TaskState>>,
    attempts: HashMap<Uuid, Vec<TaskAttempt>>,
    snapshots: HashMap<Uuid, BTreeMap<u64, ContextSnapshot>>,
}

impl MemoryState {
    fn require_run(&self, run_id: &Uuid) -> Result<(), RepositoryError> {
        if self.runs.contains_key(run_id) {
            Ok(())
        } else {
            Err(RepositoryError::NotFound)
        }
    }

    fn check_new_attempt(&self, attempt: &TaskAttempt) -> Result<(), RepositoryError> {
        let existing = self.attempts.get(&attempt.run_id).into_iter().flatten();
        for a in existing {
            if a.id == attempt.id {
                return Err(RepositoryError::Conflict(format!("attempt {} already exists", attempt.id)));
            }
            if attempt.attempt > 0 && a.task_id == attempt.task_id && a.attempt == attempt.attempt {
                return Err(RepositoryError::Conflict(format!(
                    "attempt {} of task '{}' already recorded",
                    attempt.attempt, attempt.task_id
                )));
            }
        }
        Ok(())
    }

    fn check_snapshot(&self, snapshot: &ContextSnapshot) -> Result<(), RepositoryError> {
        let taken = self
            .snapshots
            .get(&snapshot.run_id)
            .is_some_and(|s| s.contains_key(&snapshot.sequence));
        if taken {
            return Err(RepositoryError::Conflict(format!(
                "snapshot {} already exists for run {}",
                snapshot.sequence, snapshot.run_id
            )));
        }
        Ok(())
    }

    fn insert_snapshot(&mut self, snapshot: &ContextSnapshot) {
        self.snapshots
            .entry(snapshot.run_id)
            .or_default()
            .insert(snapshot.sequence, snapshot.clone());
    }

    fn upsert_state(&mut self, state: &TaskState) {
        self.tasks
            .entry(state.run_id)
            .or_default()
            .insert(state.task_id.clone(), state.clone());
    }
}

/// Volatile run storage for tests and embedded use.
#[derive(Clone, Default)]
pub struct InMemoryRunRepository {
    state: Arc<Mutex<MemoryState>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated storage availability. Clones share the switch.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, RepositoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepositoryError::Connection);
        }
        Ok(self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl RunRepository for InMemoryRunRepository {
    async fn create_run(
        &self,
        run: &WorkflowRun,
        tasks: &[TaskState],
        snapshot: &ContextSnapshot,
    ) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        if state.runs.contains_key(&run.id) {
            return Err(RepositoryError::Conflict(format!("run {} already exists", run.id)));
        }
        state.runs.insert(run.id, run.clone());
        for task in tasks {
            state.upsert_state(task);
        }
        state.insert_snapshot(snapshot);
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        Ok(self.lock()?.runs.get(run_id).cloned())
    }

    async fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        let run = state.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        if run.status.is_terminal() {
            return Err(RepositoryError::Conflict(format!(
                "run {run_id} is already {}",
                run.status
            )));
        }
        let now = Utc::now();
        run.status = status;
        run.error = error.map(str::to_string);
        if status == RunStatus::Running && run.started_at.is_none() {
            run.started_at = Some(now);
        }
        if status.is_terminal() {
            run.completed_at = Some(now);
        }
        Ok(())
    }

    async fn list_runs(
        &self,
        workflow_name: Option<&str>,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let state = self.lock()?;
        let mut runs: Vec<WorkflowRun> = state
            .runs
            .values()
            .filter(|r| workflow_name.is_none_or(|name| r.workflow_name == name))
            .cloned()
            .collect();
        runs.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn list_unfinished_runs(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let state = self.lock()?;
        let mut runs: Vec<WorkflowRun> = state
            .runs
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect();
        runs.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(runs)
    }

    async fn claim_run(&self, run_id: &Uuid, owner: &Uuid, ttl: Duration) -> Result<bool, RepositoryError> {
        let mut state = self.lock()?;
        state.require_run(run_id)?;
        let now = Utc::now();
        let held_by_other = state
            .leases
            .get(run_id)
            .is_some_and(|lease| lease.owner != *owner && lease.expires_at > now);
        if held_by_other {
            return Ok(false);
        }
        state.leases.insert(
            *run_id,
            Lease {
                owner: *owner,
                expires_at: lease_deadline(now, ttl),
            },
        );
        Ok(true)
    }

    async fn release_run(&self, run_id: &Uuid, owner: &Uuid) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        if state.leases.get(run_id).is_some_and(|lease| lease.owner == *owner) {
            state.leases.remove(run_id);
        }
        Ok(())
    }

    async fn append_attempt(&self, attempt: &TaskAttempt) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        let status = state
            .runs
            .get(&attempt.run_id)
            .map(|run| run.status)
            .ok_or(RepositoryError::NotFound)?;
        if status.is_terminal() {
            return Err(RepositoryError::Conflict(format!(
                "run {} is already {status}",
                attempt.run_id
            )));
        }
        state.check_new_attempt(attempt)?;
        state
            .attempts
            .entry(attempt.run_id)
            .or_default()
            .push(attempt.clone());
        Ok(())
    }

    async fn update_task_status(&self, task: &TaskState) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        state.require_run(&task.run_id)?;
        state.upsert_state(task);
        Ok(())
    }

    async fn commit_transition(&self, transition: &TaskTransition) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        let attempt = &transition.attempt;
        state.require_run(&attempt.run_id)?;

        // Validate everything before mutating anything.
        let existing = state
            .attempts
            .get(&attempt.run_id)
            .and_then(|list| list.iter().position(|a| a.id == attempt.id));
        if let Some(idx) = existing {
            let current = &state.attempts[&attempt.run_id][idx];
            if current.is_final() {
                return Err(RepositoryError::Conflict(format!(
                    "attempt {} of task '{}' is already finalized",
                    current.attempt, current.task_id
                )));
            }
        } else {
            state.check_new_attempt(attempt)?;
        }
        if let Some(snapshot) = &transition.snapshot {
            state.check_snapshot(snapshot)?;
        }

        let list = state.attempts.entry(attempt.run_id).or_default();
        match existing {
            Some(idx) => list[idx] = attempt.clone(),
            None => list.push(attempt.clone()),
        }
        state.upsert_state(&transition.state);
        if let Some(snapshot) = &transition.snapshot {
            state.insert_snapshot(snapshot);
        }
        Ok(())
    }

    async fn save_snapshot(&self, snapshot: &ContextSnapshot) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        state.require_run(&snapshot.run_id)?;
        state.check_snapshot(snapshot)?;
        state.insert_snapshot(snapshot);
        Ok(())
    }

    async fn list_task_states(&self, run_id: &Uuid) -> Result<Vec<TaskState>, RepositoryError> {
        let state = self.lock()?;
        Ok(state
            .tasks
            .get(run_id)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_attempts(&self, run_id: &Uuid) -> Result<Vec<TaskAttempt>, RepositoryError> {
        Ok(self.lock()?.attempts.get(run_id).cloned().unwrap_or_default())
    }

    async fn latest_snapshot(&self, run_id: &Uuid) -> Result<Option<ContextSnapshot>, RepositoryError> {
        let state = self.lock()?;
        Ok(state
            .snapshots
            .get(run_id)
            .and_then(|s| s.last_key_value())
            .map(|(_, snap)| snap.clone()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_types::workflow::TaskStatus;

    fn make_run(name: &str) -> WorkflowRun {
        WorkflowRun {
            id: Uuid::now_v7(),
            workflow_name: name.to_string(),
            workflow_version: "abcdef0123456789".to_string(),
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    fn make_state(run_id: Uuid, task_id: &str, status: TaskStatus, attempts: u32) -> TaskState {
        TaskState {
            run_id,
            task_id: task_id.to_string(),
            status,
            attempts,
            updated_at: Utc::now(),
        }
    }

    fn make_snapshot(run_id: Uuid, sequence: u64, json: &str) -> ContextSnapshot {
        ContextSnapshot {
            run_id,
            sequence,
            checkpoint: format!("test:{sequence}"),
            context: json.to_string(),
            created_at: Utc::now(),
        }
    }

    async fn seeded() -> (InMemoryRunRepository, WorkflowRun) {
        let repo = InMemoryRunRepository::new();
        let run = make_run("etl");
        repo.create_run(
            &run,
            &[make_state(run.id, "a", TaskStatus::Pending, 0)],
            &make_snapshot(run.id, 0, "{}"),
        )
        .await
        .unwrap();
        (repo, run)
    }

    #[tokio::test]
    async fn test_create_and_load_run() {
        let (repo, run) = seeded().await;
        let record = repo.load_run(&run.id).await.unwrap().unwrap();
        assert_eq!(record.run, run);
        assert_eq!(record.tasks.len(), 1);
        assert_eq!(record.latest_snapshot.unwrap().sequence, 0);

        let dup = repo
            .create_run(&run, &[], &make_snapshot(run.id, 0, "{}"))
            .await
            .unwrap_err();
        assert!(matches!(dup, RepositoryError::Conflict(_)));
        assert!(repo.load_run(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_terminal_status_is_immutable() {
        let (repo, run) = seeded().await;
        repo.update_run_status(&run.id, RunStatus::Running, None).await.unwrap();
        repo.update_run_status(&run.id, RunStatus::Completed, None).await.unwrap();

        let stored = repo.get_run(&run.id).await.unwrap().unwrap();
        assert!(stored.started_at.is_some());
        assert!(stored.completed_at.is_some());

        let err = repo
            .update_run_status(&run.id, RunStatus::Failed, Some("late"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert_eq!(repo.get_run(&run.id).await.unwrap().unwrap().status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_commit_transition_finalizes_once() {
        let (repo, run) = seeded().await;
        let attempt = TaskAttempt::running(run.id, "a", 1);
        repo.append_attempt(&attempt).await.unwrap();

        let done = TaskTransition {
            state: make_state(run.id, "a", TaskStatus::Succeeded, 1),
            attempt: attempt.clone().finish(TaskStatus::Succeeded, None),
            snapshot: Some(make_snapshot(run.id, 1, r#"{"a":1}"#)),
        };
        repo.commit_transition(&done).await.unwrap();

        // Second finalization is rejected and writes nothing.
        let again = TaskTransition {
            state: make_state(run.id, "a", TaskStatus::Failed, 1),
            attempt: attempt.finish(TaskStatus::Failed, Some("late".into())),
            snapshot: Some(make_snapshot(run.id, 2, "{}")),
        };
        assert!(matches!(
            repo.commit_transition(&again).await,
            Err(RepositoryError::Conflict(_))
        ));
        let record = repo.load_run(&run.id).await.unwrap().unwrap();
        assert_eq!(record.task_status("a"), Some(TaskStatus::Succeeded));
        assert_eq!(record.latest_snapshot.unwrap().sequence, 1);
        assert_eq!(record.attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_attempt_number_rejected() {
        let (repo, run) = seeded().await;
        repo.append_attempt(&TaskAttempt::running(run.id, "a", 1)).await.unwrap();
        let err = repo
            .append_attempt(&TaskAttempt::running(run.id, "a", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        // Skip records share attempt number 0 freely across tasks.
        repo.append_attempt(&TaskAttempt::skipped(run.id, "b", None)).await.unwrap();
        repo.append_attempt(&TaskAttempt::skipped(run.id, "c", None)).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_runs_filters_and_orders() {
        let repo = InMemoryRunRepository::new();
        let mut ids = Vec::new();
        for name in ["etl", "report", "etl"] {
            let run = make_run(name);
            ids.push(run.id);
            repo.create_run(&run, &[], &make_snapshot(run.id, 0, "{}")).await.unwrap();
        }
        let etl = repo.list_runs(Some("etl"), 10).await.unwrap();
        assert_eq!(etl.len(), 2);
        assert_eq!(etl[0].id, ids[2]);
        assert_eq!(repo.list_runs(None, 1).await.unwrap().len(), 1);

        repo.update_run_status(&ids[0], RunStatus::Running, None).await.unwrap();
        repo.update_run_status(&ids[0], RunStatus::Completed, None).await.unwrap();
        let unfinished = repo.list_unfinished_runs().await.unwrap();
        assert_eq!(unfinished.iter().map(|r| r.id).collect::<Vec<_>>(), vec![ids[1], ids[2]]);
    }

    #[tokio::test]
    async fn test_claim_run_is_exclusive_until_released_or_expired() {
        let (repo, run) = seeded().await;
        let first = Uuid::now_v7();
        let second = Uuid::now_v7();
        let ttl = Duration::from_secs(30);

        assert!(repo.claim_run(&run.id, &first, ttl).await.unwrap());
        assert!(!repo.claim_run(&run.id, &second, ttl).await.unwrap());
        // Renewal by the holder.
        assert!(repo.claim_run(&run.id, &first, ttl).await.unwrap());

        // Releasing someone else's lease does nothing.
        repo.release_run(&run.id, &second).await.unwrap();
        assert!(!repo.claim_run(&run.id, &second, ttl).await.unwrap());
        repo.release_run(&run.id, &first).await.unwrap();
        assert!(repo.claim_run(&run.id, &second, ttl).await.unwrap());

        // A zero-length lease expires immediately.
        assert!(repo.claim_run(&run.id, &second, Duration::ZERO).await.unwrap());
        assert!(repo.claim_run(&run.id, &first, ttl).await.unwrap());

        assert!(matches!(
            repo.claim_run(&Uuid::now_v7(), &first, ttl).await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_append_attempt_rejected_on_terminal_run() {
        let (repo, run) = seeded().await;
        repo.update_run_status(&run.id, RunStatus::Cancelled, Some("stop")).await.unwrap();
        let err = repo
            .append_attempt(&TaskAttempt::running(run.id, "a", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        // Skip records still commit on a terminal run.
        let skip = TaskTransition {
            state: make_state(run.id, "a", TaskStatus::Skipped, 0),
            attempt: TaskAttempt::skipped(run.id, "a", Some("stop".into())),
            snapshot: None,
        };
        repo.commit_transition(&skip).await.unwrap();
    }

    #[tokio::test]
    async fn test_unavailable_backend() {
        let (repo, run) = seeded().await;
        let handle = repo.clone();
        handle.set_available(false);
        assert!(matches!(repo.get_run(&run.id).await, Err(RepositoryError::Connection)));
        handle.set_available(true);
        assert!(repo.get_run(&run.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_run_not_found() {
        let repo = InMemoryRunRepository::new();
        let err = repo
            .update_task_status(&make_state(Uuid::now_v7(), "a", TaskStatus::Pending, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }
}
