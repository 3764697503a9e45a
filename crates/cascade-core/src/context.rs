//! Workflow run context: an ordered key/value store shared by tasks.
//!
//! `Context` is the mutable state that flows through a workflow run. Keys are
//! unique and keep their first-insertion position; overwriting a key updates
//! it in place. Values are arbitrary JSON.
//!
//! Tasks receive a private copy of the context. When a task succeeds the
//! scheduler computes a [`ContextDelta`] between the task's output and the
//! copy it was given, and applies that delta to the run context.

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Serialized size above which a single value triggers a warning (1 MB).
pub const LARGE_VALUE_WARN_SIZE: usize = 1_048_576;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("context key '{0}' already exists")]
    KeyExists(String),

    #[error("context key '{0}' not found")]
    KeyNotFound(String),

    #[error("context key '{key}' has unexpected type: {message}")]
    TypeMismatch { key: String, message: String },

    #[error("context serialization error: {0}")]
    Serialization(String),
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Ordered mapping from string keys to JSON values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    values: IndexMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Read a value and deserialize it into `T`.
    ///
    /// Returns `Ok(None)` when the key is absent.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ContextError> {
        match self.values.get(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| ContextError::TypeMismatch {
                    key: key.to_string(),
                    message: e.to_string(),
                }),
        }
    }

    /// Insert or overwrite a value, returning the previous one.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        let size = serde_json::to_string(&value).map(|s| s.len()).unwrap_or(0);
        if size > LARGE_VALUE_WARN_SIZE {
            tracing::warn!(key = %key, size, "Large context value stored");
        }
        self.values.insert(key, value)
    }

    /// Insert a value that must not already exist.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<(), ContextError> {
        let key = key.into();
        if self.values.contains_key(&key) {
            return Err(ContextError::KeyExists(key));
        }
        self.set(key, value);
        Ok(())
    }

    /// Overwrite a value that must already exist.
    pub fn update(&mut self, key: &str, value: impl Into<Value>) -> Result<Value, ContextError> {
        match self.values.get_mut(key) {
            Some(slot) => Ok(std::mem::replace(slot, value.into())),
            None => Err(ContextError::KeyNotFound(key.to_string())),
        }
    }

    /// Remove a key, keeping the relative order of the remaining keys.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.shift_remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Serialize as a JSON object, preserving key order.
    pub fn to_json_string(&self) -> Result<String, ContextError> {
        serde_json::to_string(&self.values).map_err(|e| ContextError::Serialization(e.to_string()))
    }

    /// Deserialize from a JSON object string, preserving key order.
    pub fn from_json_str(json: &str) -> Result<Self, ContextError> {
        let values: IndexMap<String, Value> =
            serde_json::from_str(json).map_err(|e| ContextError::Serialization(e.to_string()))?;
        Ok(Self { values })
    }

    /// Changes that turn `base` into `self`.
    pub fn diff(&self, base: &Context) -> ContextDelta {
        let upserts = self
            .values
            .iter()
            .filter(|(k, v)| base.values.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let removals = base
            .values
            .keys()
            .filter(|k| !self.values.contains_key(*k))
            .cloned()
            .collect();
        ContextDelta { upserts, removals }
    }

    /// Apply a delta produced by [`Context::diff`].
    pub fn apply(&mut self, delta: &ContextDelta) {
        for key in &delta.removals {
            self.values.shift_remove(key);
        }
        for (key, value) in &delta.upserts {
            self.values.insert(key.clone(), value.clone());
        }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Context {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut ctx = Context::new();
        for (k, v) in iter {
            ctx.set(k, v);
        }
        ctx
    }
}

impl From<IndexMap<String, Value>> for Context {
    fn from(values: IndexMap<String, Value>) -> Self {
        Self { values }
    }
}

impl<'a> IntoIterator for &'a Context {
    type Item = (&'a String, &'a Value);
    type IntoIter = indexmap::map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

// ---------------------------------------------------------------------------
// ContextDelta
// ---------------------------------------------------------------------------

/// Keys written and removed by a task, relative to the context it was given.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextDelta {
    pub upserts: IndexMap<String, Value>,
    pub removals: Vec<String>,
}

impl ContextDelta {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_overwrites_in_place() {
        let mut ctx = Context::new();
        ctx.set("a", 1);
        ctx.set("b", 2);
        let prev = ctx.set("a", 10);
        assert_eq!(prev, Some(json!(1)));
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(ctx.get("a"), Some(&json!(10)));
    }

    #[test]
    fn test_strict_insert_and_update() {
        let mut ctx = Context::new();
        ctx.insert("k", "v").unwrap();
        assert!(matches!(ctx.insert("k", "w"), Err(ContextError::KeyExists(_))));
        assert!(matches!(ctx.update("missing", 1), Err(ContextError::KeyNotFound(_))));
        let old = ctx.update("k", "w").unwrap();
        assert_eq!(old, json!("v"));
        assert_eq!(ctx.get("k"), Some(&json!("w")));
    }

    #[test]
    fn test_get_as_typed() {
        let ctx: Context = [("count", json!(3)), ("name", json!("etl"))].into_iter().collect();
        assert_eq!(ctx.get_as::<u32>("count").unwrap(), Some(3));
        assert_eq!(ctx.get_as::<String>("missing").unwrap(), None);
        assert!(matches!(
            ctx.get_as::<u32>("name"),
            Err(ContextError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_remove_keeps_order() {
        let mut ctx: Context = [("a", 1), ("b", 2), ("c", 3)].into_iter().collect();
        assert_eq!(ctx.remove("b"), Some(json!(2)));
        assert!(!ctx.contains_key("b"));
        assert_eq!(ctx.keys().collect::<Vec<_>>(), vec!["a", "c"]);
    }

    #[test]
    fn test_json_roundtrip_preserves_order() {
        let ctx: Context = [("zeta", json!(1)), ("alpha", json!({"x": [1, 2]})), ("mid", json!(null))]
            .into_iter()
            .collect();
        let json = ctx.to_json_string().unwrap();
        assert!(json.starts_with("{\"zeta\""));
        let restored = Context::from_json_str(&json).unwrap();
        assert_eq!(restored, ctx);
        assert_eq!(restored.keys().collect::<Vec<_>>(), vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_from_json_rejects_non_object() {
        assert!(Context::from_json_str("[1,2]").is_err());
    }

    #[test]
    fn test_diff_and_apply() {
        let base: Context = [("a", 1), ("b", 2), ("c", 3)].into_iter().collect();
        let mut task_view = base.clone();
        task_view.set("b", 20);
        task_view.remove("c");
        task_view.set("d", 4);

        let delta = task_view.diff(&base);
        assert_eq!(delta.upserts.len(), 2);
        assert_eq!(delta.removals, vec!["c".to_string()]);

        // Another task wrote "e" meanwhile; applying the delta keeps it.
        let mut run_ctx = base.clone();
        run_ctx.set("e", 5);
        run_ctx.apply(&delta);
        assert_eq!(run_ctx.get("b"), Some(&json!(20)));
        assert_eq!(run_ctx.get("d"), Some(&json!(4)));
        assert_eq!(run_ctx.get("e"), Some(&json!(5)));
        assert!(!run_ctx.contains_key("c"));
    }

    #[test]
    fn test_unchanged_view_has_empty_delta() {
        let base: Context = [("a", 1)].into_iter().collect();
        assert!(base.clone().diff(&base).is_empty());
    }
}
