//! Task registry and workflow catalog.
//!
//! The registry maps task IDs to their spec and executable logic, and keeps
//! every finalized version of every workflow. It has two phases: tasks are
//! registered freely until [`TaskRegistry::freeze`] is called (the first
//! `Runner::execute` does this), after which it is read-only for tasks.
//!
//! A process-wide instance is available through [`TaskRegistry::global`] and
//! the free functions [`register_task`] and [`build_workflow`]. Tests inject
//! isolated registries instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use cascade_types::workflow::{RetryPolicy, TaskSpec, TriggerRule};
use thiserror::Error;

use crate::task::{SharedTask, Task};
use crate::workflow::definition::{WorkflowBuilder, WorkflowDefinition};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("task '{0}' is already registered")]
    DuplicateTask(String),

    #[error("task '{0}' is not registered")]
    UnknownTask(String),

    #[error("registry is frozen; cannot register task '{0}'")]
    Frozen(String),

    #[error("workflow '{name}' not found{}", .version.as_ref().map(|v| format!(" (version {v})")).unwrap_or_default())]
    UnknownWorkflow {
        name: String,
        version: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// TaskRegistry
// ---------------------------------------------------------------------------

struct RegisteredTask {
    spec: TaskSpec,
    logic: SharedTask,
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, RegisteredTask>>,
    /// Workflow versions per name, in registration order.
    workflows: RwLock<HashMap<String, Vec<Arc<WorkflowDefinition>>>>,
    frozen: AtomicBool,
}

static GLOBAL: OnceLock<Arc<TaskRegistry>> = OnceLock::new();

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> Arc<TaskRegistry> {
        GLOBAL.get_or_init(|| Arc::new(TaskRegistry::new())).clone()
    }

    /// Register a task spec with its logic.
    pub fn register<T: Task + 'static>(&self, spec: TaskSpec, logic: T) -> Result<(), RegistryError> {
        self.register_shared(spec, Arc::new(logic))
    }

    /// Register a task spec with already type-erased logic.
    pub fn register_shared(&self, spec: TaskSpec, logic: SharedTask) -> Result<(), RegistryError> {
        if self.is_frozen() {
            return Err(RegistryError::Frozen(spec.id));
        }
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        if tasks.contains_key(&spec.id) {
            return Err(RegistryError::DuplicateTask(spec.id));
        }
        tracing::debug!(task_id = %spec.id, deps = spec.dependencies.len(), "Task registered");
        tasks.insert(spec.id.clone(), RegisteredTask { spec, logic });
        Ok(())
    }

    /// Register a task from its parts.
    pub fn register_task<T, I, S>(
        &self,
        id: impl Into<String>,
        dependencies: I,
        trigger_rule: TriggerRule,
        retry_policy: RetryPolicy,
        logic: T,
    ) -> Result<(), RegistryError>
    where
        T: Task + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = TaskSpec::new(id)
            .depends_on(dependencies)
            .trigger_rule(trigger_rule)
            .retry_policy(retry_policy);
        self.register(spec, logic)
    }

    /// Executable logic for a task.
    pub fn lookup(&self, id: &str) -> Result<SharedTask, RegistryError> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|t| t.logic.clone())
            .ok_or_else(|| RegistryError::UnknownTask(id.to_string()))
    }

    /// Registered spec for a task.
    pub fn spec(&self, id: &str) -> Option<TaskSpec> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|t| t.spec.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// End the registration phase. Idempotent.
    pub fn freeze(&self) {
        if !self.frozen.swap(true, Ordering::SeqCst) {
            tracing::debug!("Task registry frozen");
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Start a workflow whose task IDs resolve against this registry.
    pub fn build_workflow(self: &Arc<Self>, name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::with_registry(name, Arc::clone(self))
    }

    // -----------------------------------------------------------------------
    // Workflow catalog
    // -----------------------------------------------------------------------

    /// Add a definition to the catalog.
    ///
    /// Re-registering a version that is already present returns the existing
    /// entry and does not change which version is latest.
    pub fn register_workflow(&self, definition: WorkflowDefinition) -> Arc<WorkflowDefinition> {
        let mut workflows = self.workflows.write().unwrap_or_else(PoisonError::into_inner);
        let versions = workflows.entry(definition.name().to_string()).or_default();
        if let Some(existing) = versions.iter().find(|d| d.version() == definition.version()) {
            return Arc::clone(existing);
        }
        tracing::info!(
            workflow = %definition.name(),
            version = %definition.version(),
            "Workflow version registered"
        );
        let definition = Arc::new(definition);
        versions.push(Arc::clone(&definition));
        definition
    }

    /// Look up a workflow by name, optionally pinned to a version.
    ///
    /// Without a version, returns the most recently registered one.
    pub fn workflow(&self, name: &str, version: Option<&str>) -> Result<Arc<WorkflowDefinition>, RegistryError> {
        let workflows = self.workflows.read().unwrap_or_else(PoisonError::into_inner);
        let found = workflows.get(name).and_then(|versions| match version {
            Some(v) => versions.iter().find(|d| d.version() == v),
            None => versions.last(),
        });
        found.cloned().ok_or_else(|| RegistryError::UnknownWorkflow {
            name: name.to_string(),
            version: version.map(str::to_string),
        })
    }

    /// Registered versions of a workflow, oldest first.
    pub fn versions(&self, name: &str) -> Vec<String> {
        self.workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|v| v.iter().map(|d| d.version().to_string()).collect())
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Process-wide convenience functions
// ---------------------------------------------------------------------------

/// Register a task in the global registry.
pub fn register_task<T, I, S>(
    id: impl Into<String>,
    dependencies: I,
    trigger_rule: TriggerRule,
    retry_policy: RetryPolicy,
    logic: T,
) -> Result<(), RegistryError>
where
    T: Task + 'static,
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    TaskRegistry::global().register_task(id, dependencies, trigger_rule, retry_policy, logic)
}

/// Start a workflow against the global registry.
pub fn build_workflow(name: impl Into<String>) -> WorkflowBuilder {
    TaskRegistry::global().build_workflow(name)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
