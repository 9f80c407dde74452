//! View models and the repository abstraction that persists them.
//!
//! # Overview
//!
//! View models are the **query side of CQRS**. Each one is a JSON document
//! owned by a collection; view builders load it, apply a single event and
//! commit it back. Commits are protected by optimistic concurrency: a view
//! model remembers the store revision it was loaded at, and the repository
//! rejects a commit if someone else wrote in between.
//!
//! ```text
//!   Event ──► ViewBuilder ──► ViewModel (in memory) ──► Repository::commit
//!                                   ▲                         │
//!                                   └──── Repository::get ◄───┘
//! ```
//!
//! ## Example
//!
//! ```
//! use denormalizer_core::projection::{ActionOnCommit, ViewModel};
//! use serde_json::json;
//!
//! let mut vm = ViewModel::new("user-1");
//! assert_eq!(vm.action_on_commit(), ActionOnCommit::Create);
//!
//! vm.set("email", json!("jane@example.com"));
//! assert_eq!(vm.get("email"), Some(&json!("jane@example.com")));
//!
//! vm.destroy();
//! assert_eq!(vm.action_on_commit(), ActionOnCommit::Delete);
//! ```

use crate::error::StoreError;
use crate::path;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// What a repository does with a view model on commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionOnCommit {
    /// Insert a view model that does not exist yet.
    Create,
    /// Replace an existing view model.
    Update,
    /// Remove the view model.
    Delete,
}

impl ActionOnCommit {
    /// Lowercase name used in notifications.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for ActionOnCommit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mutable projection record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewModel {
    id: String,
    attributes: Value,
    revision: Option<u64>,
    action_on_commit: ActionOnCommit,
}

impl ViewModel {
    /// A blank view model that will be created on commit.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_attributes(id, Value::Object(Map::new()))
    }

    /// A new view model seeded with `attributes` (usually collection defaults).
    #[must_use]
    pub fn with_attributes(id: impl Into<String>, attributes: Value) -> Self {
        Self {
            id: id.into(),
            attributes,
            revision: None,
            action_on_commit: ActionOnCommit::Create,
        }
    }

    /// A view model loaded from a store at `revision`; commits as an update.
    #[must_use]
    pub fn stored(id: impl Into<String>, attributes: Value, revision: u64) -> Self {
        Self {
            id: id.into(),
            attributes,
            revision: Some(revision),
            action_on_commit: ActionOnCommit::Update,
        }
    }

    /// The view model id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Store revision this view model was loaded at (`None` if never persisted).
    #[must_use]
    pub const fn revision(&self) -> Option<u64> {
        self.revision
    }

    /// Record the store revision after a successful commit.
    pub const fn set_revision(&mut self, revision: u64) {
        self.revision = Some(revision);
    }

    /// The pending commit action.
    #[must_use]
    pub const fn action_on_commit(&self) -> ActionOnCommit {
        self.action_on_commit
    }

    /// Mark this view model as persisted so the next commit is an update.
    pub const fn mark_persisted(&mut self) {
        self.action_on_commit = ActionOnCommit::Update;
    }

    /// Whether the view model does not exist in the store yet.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.action_on_commit == ActionOnCommit::Create
    }

    /// Whether [`destroy`](Self::destroy) was called.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.action_on_commit == ActionOnCommit::Delete
    }

    /// Projected fields, without the id.
    #[must_use]
    pub const fn attributes(&self) -> &Value {
        &self.attributes
    }

    /// Read a projected field.
    #[must_use]
    pub fn get(&self, field_path: &str) -> Option<&Value> {
        path::get(&self.attributes, field_path)
    }

    /// Check whether a projected field is set.
    #[must_use]
    pub fn has(&self, field_path: &str) -> bool {
        path::has(&self.attributes, field_path)
    }

    /// Write a projected field.
    pub fn set(&mut self, field_path: &str, value: Value) {
        path::set(&mut self.attributes, field_path, value);
    }

    /// Remove a projected field, returning its old value.
    pub fn unset(&mut self, field_path: &str) -> Option<Value> {
        path::remove(&mut self.attributes, field_path)
    }

    /// Mark the view model for deletion on commit.
    pub const fn destroy(&mut self) {
        self.action_on_commit = ActionOnCommit::Delete;
    }

    /// Projected fields with the id merged in, as sent in notifications.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut document = match &self.attributes {
            Value::Object(map) => Value::Object(map.clone()),
            Value::Null => Value::Object(Map::new()),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other.clone());
                Value::Object(map)
            }
        };
        path::set(&mut document, "id", Value::String(self.id.clone()));
        document
    }

    /// Simple equality query: every top-level entry of `query` must equal the
    /// field at the same path. `id` matches the view model id.
    #[must_use]
    pub fn matches(&self, query: &Value) -> bool {
        let Value::Object(criteria) = query else {
            return query.is_null();
        };
        criteria.iter().all(|(field, expected)| {
            if field == "id" {
                path::as_id(expected).as_deref() == Some(self.id.as_str())
            } else {
                self.get(field) == Some(expected)
            }
        })
    }
}

/// Paging options for [`Repository::find`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindOptions {
    /// Number of matches to skip.
    pub skip: Option<usize>,
    /// Maximum number of matches to return.
    pub limit: Option<usize>,
}

/// Storage backend for one collection of view models.
///
/// # Optimistic Concurrency
///
/// `commit` must compare the view model's [`revision`](ViewModel::revision)
/// with the stored one and return [`StoreError::Concurrency`] on mismatch.
/// Creating an id that already exists is also a conflict.
///
/// # Dyn Compatibility
///
/// This trait returns boxed futures so collections can hold an
/// `Arc<dyn Repository>` regardless of the backend.
pub trait Repository: Send + Sync {
    /// Load a view model, or a blank one (action `create`) if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<ViewModel, StoreError>>;

    /// Find every view model matching `query` (see [`ViewModel::matches`]).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn find<'a>(
        &'a self,
        query: &'a Value,
        options: FindOptions,
    ) -> BoxFuture<'a, Result<Vec<ViewModel>, StoreError>>;

    /// Persist according to [`ViewModel::action_on_commit`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Concurrency`] if the stored revision moved.
    fn commit(&self, view_model: ViewModel) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Allocate a fresh view model id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn get_new_id(&self) -> BoxFuture<'_, Result<String, StoreError>>;

    /// Remove every view model of this collection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn clear(&self) -> BoxFuture<'_, Result<(), StoreError>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stored_view_model_commits_as_update() {
        let vm = ViewModel::stored("a", json!({ "n": 1 }), 4);
        assert_eq!(vm.action_on_commit(), ActionOnCommit::Update);
        assert_eq!(vm.revision(), Some(4));
        assert!(!vm.is_new());
    }

    #[test]
    fn to_json_includes_id() {
        let mut vm = ViewModel::new("user-1");
        vm.set("profile.name", json!("Jane"));
        assert_eq!(
            vm.to_json(),
            json!({ "id": "user-1", "profile": { "name": "Jane" } })
        );
    }

    #[test]
    fn matches_equality_query() {
        let vm = ViewModel::stored("o-1", json!({ "status": "open", "owner": "u1" }), 1);
        assert!(vm.matches(&json!({ "status": "open" })));
        assert!(vm.matches(&json!({ "id": "o-1", "owner": "u1" })));
        assert!(!vm.matches(&json!({ "status": "closed" })));
        assert!(vm.matches(&json!({})));
    }

    #[test]
    fn action_display() {
        assert_eq!(ActionOnCommit::Delete.to_string(), "delete");
    }
}
