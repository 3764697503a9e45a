//! Workflow definitions and the builder that validates them.
//!
//! A `WorkflowDefinition` is an immutable, named and versioned DAG of task
//! specs. The version is derived from structural content only, so two
//! definitions with the same tasks, dependencies, trigger rules, retry
//! policies and timeouts share a version regardless of declaration order.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use cascade_types::workflow::{RetryPolicy, TaskSpec, TriggerRule};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::dag;
use crate::registry::TaskRegistry;

/// Number of hex characters kept from the SHA-256 digest.
const VERSION_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Structural errors detected when finalizing a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Dependency graph contains a cycle; `path` starts and ends at the same task.
    #[error("cycle detected: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    /// A task depends on a task that is not part of the workflow.
    #[error("task '{task}' depends on unknown task '{dependency}'")]
    MissingDependency { task: String, dependency: String },

    /// The same task ID was added twice.
    #[error("duplicate task '{0}' in workflow")]
    DuplicateTask(String),

    /// A task was added by ID but is not registered.
    #[error("task '{0}' is not registered")]
    UnknownTask(String),

    /// Task IDs must be non-empty.
    #[error("invalid task id: {0:?}")]
    InvalidTaskId(String),
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// Immutable, validated workflow graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowDefinition {
    name: String,
    version: String,
    description: Option<String>,
    tasks: BTreeMap<String, TaskSpec>,
    order: Vec<String>,
}

impl WorkflowDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Content-derived version identifier (16 hex chars).
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn task(&self, id: &str) -> Option<&TaskSpec> {
        self.tasks.get(id)
    }

    /// Task specs in topological order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskSpec> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }

    /// Task IDs in lexical order.
    pub fn task_ids(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks that directly depend on `id`, in lexical order.
    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        self.tasks
            .values()
            .filter(|t| t.dependencies.iter().any(|d| d == id))
            .map(|t| t.id.as_str())
            .collect()
    }

    /// Every task `id` transitively depends on.
    pub fn upstream_of(&self, id: &str) -> BTreeSet<String> {
        let specs: Vec<TaskSpec> = self.tasks.values().cloned().collect();
        dag::upstream_closure(id, &specs)
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Topological order, ties broken by task ID.
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }
}

// ---------------------------------------------------------------------------
// Version hashing
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct CanonicalTask<'a> {
    id: &'a str,
    dependencies: Vec<&'a str>,
    trigger_rule: TriggerRule,
    retry_policy: &'a RetryPolicy,
    timeout_secs: Option<u64>,
}

/// First 16 hex chars of SHA-256 over the canonical JSON of the task set.
fn compute_version(tasks: &BTreeMap<String, TaskSpec>) -> String {
    let canonical: Vec<CanonicalTask<'_>> = tasks
        .values()
        .map(|t| {
            let mut dependencies: Vec<&str> = t.dependencies.iter().map(String::as_str).collect();
            dependencies.sort_unstable();
            CanonicalTask {
                id: &t.id,
                dependencies,
                trigger_rule: t.trigger_rule,
                retry_policy: &t.retry_policy,
                timeout_secs: t.timeout_secs,
            }
        })
        .collect();

    // Serializing plain structs, strings and integers cannot fail.
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>()
        .chars()
        .take(VERSION_LEN)
        .collect()
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

enum Entry {
    Spec(TaskSpec),
    Registered(String),
}

/// Collects tasks and validates them into a [`WorkflowDefinition`].
///
/// Tasks may be added in any order; forward references are resolved and
/// acyclicity is checked only in [`WorkflowBuilder::finalize`].
pub struct WorkflowBuilder {
    name: String,
    description: Option<String>,
    registry: Option<Arc<TaskRegistry>>,
    entries: Vec<Entry>,
}

impl WorkflowBuilder {
    /// A builder that only accepts explicit specs via [`WorkflowBuilder::task`].
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            registry: None,
            entries: Vec::new(),
        }
    }

    /// A builder that resolves task IDs against `registry` and registers the
    /// finalized definition in its workflow catalog.
    pub fn with_registry(name: impl Into<String>, registry: Arc<TaskRegistry>) -> Self {
        Self {
            registry: Some(registry),
            ..Self::new(name)
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add a registered task by ID. Its spec is read from the registry at finalize.
    pub fn add_task(mut self, id: impl Into<String>) -> Self {
        self.entries.push(Entry::Registered(id.into()));
        self
    }

    /// Add several registered tasks by ID.
    pub fn add_tasks<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for id in ids {
            self.entries.push(Entry::Registered(id.into()));
        }
        self
    }

    /// Add an explicit task spec.
    pub fn task(mut self, spec: TaskSpec) -> Self {
        self.entries.push(Entry::Spec(spec));
        self
    }

    /// Validate the graph and produce an immutable definition.
    pub fn finalize(self) -> Result<WorkflowDefinition, GraphError> {
        let mut specs: Vec<TaskSpec> = Vec::with_capacity(self.entries.len());
        for entry in self.entries {
            let spec = match entry {
                Entry::Spec(spec) => spec,
                Entry::Registered(id) => self
                    .registry
                    .as_ref()
                    .and_then(|r| r.spec(&id))
                    .ok_or(GraphError::UnknownTask(id))?,
            };
            if spec.id.trim().is_empty() {
                return Err(GraphError::InvalidTaskId(spec.id));
            }
            if specs.iter().any(|s| s.id == spec.id) {
                return Err(GraphError::DuplicateTask(spec.id));
            }
            specs.push(spec);
        }

        let order = dag::validate_dag(&specs)?;
        let tasks: BTreeMap<String, TaskSpec> =
            specs.into_iter().map(|t| (t.id.clone(), t)).collect();
        let version = compute_version(&tasks);

        let definition = WorkflowDefinition {
            name: self.name,
            version,
            description: self.description,
            tasks,
            order,
        };

        tracing::debug!(
            workflow = %definition.name,
            version = %definition.version,
            tasks = definition.len(),
            "Workflow finalized"
        );

        if let Some(registry) = &self.registry {
            registry.register_workflow(definition.clone());
        }

        Ok(definition)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
