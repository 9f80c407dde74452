//! Collections: a repository plus replay buffering.
//!
//! A collection is the unit view builders write to. In steady state every
//! save goes straight to the repository. While a replay runs, saves are kept
//! in two private maps instead (`to_save`, `to_delete`) and reads consult
//! those maps first, so the replay sees its own writes without touching the
//! store. [`Collection::flush_replay`] commits the buffers, deletes first.
//! With a batch size set, full buffers are committed early; failures of those
//! early commits are held back and reported by the final flush.
//!
//! ```text
//!   save ──► replaying? ──no──► repository.commit
//!                 │
//!                yes
//!                 ▼
//!      destroyed? ──yes──► to_delete (if persisted)
//!                 │
//!                 no ────► to_save
//! ```

use crate::metrics::counter;
use denormalizer_core::projection::{FindOptions, Repository, ViewModel};
use denormalizer_core::{DenormalizerError, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct ReplayBuffer {
    active: bool,
    to_save: BTreeMap<String, ViewModel>,
    to_delete: BTreeMap<String, ViewModel>,
    failed: Vec<DenormalizerError>,
}

enum BufferedWrite {
    Commit(ViewModel),
    Buffered,
    Flush {
        to_delete: BTreeMap<String, ViewModel>,
        to_save: BTreeMap<String, ViewModel>,
    },
}

/// Named set of view models backed by one repository.
pub struct Collection {
    name: String,
    repository: Arc<dyn Repository>,
    default_attributes: Value,
    // 0 means unbounded
    batch_size: AtomicUsize,
    replay: Mutex<ReplayBuffer>,
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("default_attributes", &self.default_attributes)
            .field("batch_size", &self.batch_size())
            .field("replaying", &self.is_replaying())
            .finish_non_exhaustive()
    }
}

impl Collection {
    /// Create a collection over `repository`.
    #[must_use]
    pub fn new(name: impl Into<String>, repository: Arc<dyn Repository>) -> Self {
        Self {
            name: name.into(),
            repository,
            default_attributes: Value::Object(Map::new()),
            batch_size: AtomicUsize::new(0),
            replay: Mutex::new(ReplayBuffer::default()),
        }
    }

    /// Attributes every newly created view model starts with.
    #[must_use]
    pub fn with_defaults(mut self, defaults: Value) -> Self {
        self.default_attributes = defaults;
        self
    }

    /// Flush the replay buffer whenever it holds `size` view models.
    #[must_use]
    pub fn with_batch_size(self, size: Option<usize>) -> Self {
        self.set_batch_size(size);
        self
    }

    /// Change the replay flush threshold of a shared collection.
    pub fn set_batch_size(&self, size: Option<usize>) {
        self.batch_size.store(size.unwrap_or(0), Ordering::Relaxed);
    }

    /// Replay flush threshold (`None` when unbounded).
    #[must_use]
    pub fn batch_size(&self) -> Option<usize> {
        match self.batch_size.load(Ordering::Relaxed) {
            0 => None,
            size => Some(size),
        }
    }

    /// Collection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The backing repository.
    #[must_use]
    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    /// Default attributes of new view models.
    #[must_use]
    pub const fn default_attributes(&self) -> &Value {
        &self.default_attributes
    }

    fn buffer(&self) -> MutexGuard<'_, ReplayBuffer> {
        self.replay.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn blank(&self, id: &str) -> ViewModel {
        ViewModel::with_attributes(id, self.default_attributes.clone())
    }

    /// Load a view model, or a blank one seeded with the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`DenormalizerError::Store`] if the repository fails.
    pub async fn load_view_model(&self, id: &str) -> Result<ViewModel> {
        {
            let buffer = self.buffer();
            if buffer.active {
                if let Some(vm) = buffer.to_save.get(id) {
                    return Ok(vm.clone());
                }
                if buffer.to_delete.contains_key(id) {
                    return Ok(self.blank(id));
                }
            }
        }

        let vm = self.repository.get(id).await?;
        if vm.is_new() {
            return Ok(self.blank(id));
        }
        Ok(vm)
    }

    /// Find view models matching an equality query.
    ///
    /// During a replay buffered writes shadow the repository's results.
    ///
    /// # Errors
    ///
    /// Returns [`DenormalizerError::Store`] if the repository fails.
    pub async fn find_view_models(&self, query: &Value, options: FindOptions) -> Result<Vec<ViewModel>> {
        if !self.is_replaying() {
            return Ok(self.repository.find(query, options).await?);
        }

        let stored = self.repository.find(query, FindOptions::default()).await?;

        let mut merged: BTreeMap<String, ViewModel> = BTreeMap::new();
        {
            let buffer = self.buffer();
            for vm in stored {
                if buffer.to_delete.contains_key(vm.id()) || buffer.to_save.contains_key(vm.id()) {
                    continue;
                }
                merged.insert(vm.id().to_string(), vm);
            }
            for (id, vm) in &buffer.to_save {
                if vm.matches(query) {
                    merged.insert(id.clone(), vm.clone());
                }
            }
        }

        Ok(merged
            .into_values()
            .skip(options.skip.unwrap_or(0))
            .take(options.limit.unwrap_or(usize::MAX))
            .collect())
    }

    /// Persist a view model, or buffer it while replaying.
    ///
    /// # Errors
    ///
    /// Returns [`DenormalizerError::Store`] if a steady-state commit fails.
    /// Concurrency conflicts are returned as-is for the caller to retry. A
    /// failed batch flush during replay is not an error of this save: it is
    /// kept for [`flush_replay`](Self::flush_replay).
    pub async fn save_view_model(&self, vm: ViewModel) -> Result<()> {
        match self.buffer_write(vm) {
            BufferedWrite::Commit(vm) => {
                self.repository.commit(vm).await?;
                counter!("collection_commits_total", "collection" => self.name.clone()).increment(1);
                Ok(())
            }
            BufferedWrite::Buffered => Ok(()),
            BufferedWrite::Flush { to_delete, to_save } => {
                tracing::debug!(
                    collection = %self.name,
                    deletes = to_delete.len(),
                    saves = to_save.len(),
                    "Flushing replay batch"
                );
                let errors = self.commit_buffers(to_delete, to_save).await;
                if !errors.is_empty() {
                    self.buffer().failed.extend(errors);
                }
                Ok(())
            }
        }
    }

    fn buffer_write(&self, vm: ViewModel) -> BufferedWrite {
        let mut buffer = self.buffer();
        if !buffer.active {
            return BufferedWrite::Commit(vm);
        }

        let id = vm.id().to_string();
        if vm.is_destroyed() {
            buffer.to_save.remove(&id);
            if vm.revision().is_some() {
                buffer.to_delete.entry(id).or_insert(vm);
            }
        } else {
            buffer.to_save.insert(id, vm);
        }

        match self.batch_size() {
            Some(size) if buffer.to_save.len() + buffer.to_delete.len() >= size => BufferedWrite::Flush {
                to_delete: std::mem::take(&mut buffer.to_delete),
                to_save: std::mem::take(&mut buffer.to_save),
            },
            _ => BufferedWrite::Buffered,
        }
    }

    /// Allocate a fresh view model id from the repository.
    ///
    /// # Errors
    ///
    /// Returns [`DenormalizerError::Store`] if the repository fails.
    pub async fn get_new_id(&self) -> Result<String> {
        Ok(self.repository.get_new_id().await?)
    }

    /// Enter replay mode. Idempotent.
    pub fn start_replay(&self) {
        let mut buffer = self.buffer();
        if !buffer.active {
            tracing::debug!(collection = %self.name, "Collection entering replay mode");
            buffer.active = true;
        }
    }

    /// Whether writes are currently buffered.
    #[must_use]
    pub fn is_replaying(&self) -> bool {
        self.buffer().active
    }

    /// Commit everything buffered during the replay and leave replay mode.
    ///
    /// Deletes are committed before creates and updates. Every failure is
    /// collected, including those of earlier batch flushes; an empty vector
    /// means every buffered write reached the repository.
    pub async fn flush_replay(&self) -> Vec<DenormalizerError> {
        let (to_delete, to_save, mut errors) = {
            let mut buffer = self.buffer();
            buffer.active = false;
            (
                std::mem::take(&mut buffer.to_delete),
                std::mem::take(&mut buffer.to_save),
                std::mem::take(&mut buffer.failed),
            )
        };

        tracing::debug!(
            collection = %self.name,
            deletes = to_delete.len(),
            saves = to_save.len(),
            "Flushing replay buffer"
        );
        errors.extend(self.commit_buffers(to_delete, to_save).await);
        errors
    }

    async fn commit_buffers(
        &self,
        to_delete: BTreeMap<String, ViewModel>,
        to_save: BTreeMap<String, ViewModel>,
    ) -> Vec<DenormalizerError> {
        let mut errors = Vec::new();
        for vm in to_delete.into_values().chain(to_save.into_values()) {
            if let Err(error) = self.repository.commit(vm).await {
                tracing::error!(collection = %self.name, error = %error, "Replay flush commit failed");
                errors.push(error.into());
            }
        }
        errors
    }

    /// Remove every view model and drop any replay buffer.
    ///
    /// # Errors
    ///
    /// Returns [`DenormalizerError::Store`] if the repository fails.
    pub async fn clear(&self) -> Result<()> {
        {
            let mut buffer = self.buffer();
            buffer.to_save.clear();
            buffer.to_delete.clear();
            buffer.failed.clear();
        }
        self.repository.clear().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use denormalizer_testing::{FlakyRepository, InMemoryRepository};
    use serde_json::json;

    fn collection(repo: &InMemoryRepository) -> Collection {
        Collection::new("users", Arc::new(repo.clone())).with_defaults(json!({ "active": true }))
    }

    #[tokio::test]
    async fn new_view_model_gets_defaults() {
        let repo = InMemoryRepository::new();
        let users = collection(&repo);

        let vm = users.load_view_model("u1").await.unwrap();
        assert!(vm.is_new());
        assert_eq!(vm.get("active"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn steady_state_save_commits_immediately() {
        let repo = InMemoryRepository::new();
        let users = collection(&repo);

        let mut vm = users.load_view_model("u1").await.unwrap();
        vm.set("name", json!("Jane"));
        users.save_view_model(vm).await.unwrap();

        assert_eq!(repo.len(), 1);
        let stored = users.load_view_model("u1").await.unwrap();
        assert_eq!(stored.revision(), Some(1));
        assert_eq!(stored.get("name"), Some(&json!("Jane")));
    }

    #[tokio::test]
    async fn replay_buffers_until_flush() {
        let repo = InMemoryRepository::new();
        let users = collection(&repo);
        users.start_replay();

        let mut vm = users.load_view_model("u1").await.unwrap();
        vm.set("name", json!("Jane"));
        users.save_view_model(vm).await.unwrap();
        assert!(repo.is_empty());

        let buffered = users.load_view_model("u1").await.unwrap();
        assert_eq!(buffered.get("name"), Some(&json!("Jane")));

        assert!(users.flush_replay().await.is_empty());
        assert!(!users.is_replaying());
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn deleted_during_replay_reloads_as_fresh_create() {
        let repo = InMemoryRepository::new();
        repo.insert(ViewModel::stored("u1", json!({ "name": "Old" }), 1));
        let users = collection(&repo);
        users.start_replay();

        let mut vm = users.load_view_model("u1").await.unwrap();
        vm.destroy();
        users.save_view_model(vm).await.unwrap();

        let reloaded = users.load_view_model("u1").await.unwrap();
        assert!(reloaded.is_new());
        assert_eq!(reloaded.get("name"), None);

        let mut recreated = reloaded;
        recreated.set("name", json!("New"));
        users.save_view_model(recreated).await.unwrap();

        assert!(users.flush_replay().await.is_empty());
        let stored = repo.get_stored("u1").unwrap();
        assert_eq!(stored.get("name"), Some(&json!("New")));
    }

    #[tokio::test]
    async fn find_during_replay_sees_buffered_writes() {
        let repo = InMemoryRepository::new();
        repo.insert(ViewModel::stored("u1", json!({ "team": "a" }), 1));
        repo.insert(ViewModel::stored("u2", json!({ "team": "a" }), 1));
        let users = collection(&repo);
        users.start_replay();

        let mut moved = users.load_view_model("u1").await.unwrap();
        moved.set("team", json!("b"));
        users.save_view_model(moved).await.unwrap();

        let mut added = users.load_view_model("u3").await.unwrap();
        added.set("team", json!("a"));
        users.save_view_model(added).await.unwrap();

        let team_a = users
            .find_view_models(&json!({ "team": "a" }), FindOptions::default())
            .await
            .unwrap();
        let ids: Vec<&str> = team_a.iter().map(ViewModel::id).collect();
        assert_eq!(ids, vec!["u2", "u3"]);
    }

    #[tokio::test]
    async fn batch_size_flushes_early() {
        let repo = InMemoryRepository::new();
        let users = collection(&repo).with_batch_size(Some(2));
        users.start_replay();

        for id in ["u1", "u2", "u3"] {
            let vm = users.load_view_model(id).await.unwrap();
            users.save_view_model(vm).await.unwrap();
        }
        assert_eq!(repo.len(), 2);
        assert!(users.is_replaying());

        assert!(users.flush_replay().await.is_empty());
        assert_eq!(repo.len(), 3);
    }

    #[tokio::test]
    async fn failed_batch_commit_is_reported_by_final_flush() {
        let repo = InMemoryRepository::new();
        let flaky = FlakyRepository::new(repo.clone(), 1).only_for("u1");
        let users = Collection::new("users", Arc::new(flaky)).with_batch_size(Some(2));
        users.start_replay();

        for id in ["u1", "u2"] {
            let vm = users.load_view_model(id).await.unwrap();
            users.save_view_model(vm).await.unwrap();
        }
        assert_eq!(repo.ids(), vec!["u2"]);

        let errors = users.flush_replay().await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_concurrency_conflict());
        assert!(users.flush_replay().await.is_empty());
    }
}
