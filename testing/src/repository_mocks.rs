//! In-memory view model repositories.
//!
//! - [`InMemoryRepository`]: one collection's view models with revision checks
//! - [`FlakyRepository`]: wraps a repository and loses the next N commits

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only happens after a test already panicked

use denormalizer_core::StoreError;
use denormalizer_core::projection::{ActionOnCommit, FindOptions, Repository, ViewModel};
use futures::FutureExt;
use futures::future::{BoxFuture, ready};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

#[derive(Clone, Debug)]
struct StoredViewModel {
    attributes: Value,
    revision: u64,
}

/// In-memory repository for one collection.
///
/// Commits follow the optimistic concurrency contract: creating an existing
/// id, or updating/deleting with a revision other than the stored one, is a
/// [`StoreError::Concurrency`]. Each successful write bumps the revision.
///
/// # Example
///
/// ```
/// use denormalizer_testing::InMemoryRepository;
/// use denormalizer_core::projection::{Repository, ViewModel};
/// use serde_json::json;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let repo = InMemoryRepository::new();
///
/// let mut vm = repo.get("u1").await?;
/// assert!(vm.is_new());
/// vm.set("name", json!("Jane"));
/// repo.commit(vm).await?;
///
/// let stored = repo.get_stored("u1").unwrap();
/// assert_eq!(stored.revision(), Some(1));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryRepository {
    view_models: Arc<RwLock<BTreeMap<String, StoredViewModel>>>,
}

impl InMemoryRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a view model directly. Its revision defaults to 1.
    pub fn insert(&self, view_model: ViewModel) {
        self.view_models.write().unwrap().insert(
            view_model.id().to_string(),
            StoredViewModel {
                attributes: view_model.attributes().clone(),
                revision: view_model.revision().unwrap_or(1),
            },
        );
    }

    /// The persisted state of a view model.
    #[must_use]
    pub fn get_stored(&self, id: &str) -> Option<ViewModel> {
        self.view_models
            .read()
            .unwrap()
            .get(id)
            .map(|stored| ViewModel::stored(id, stored.attributes.clone(), stored.revision))
    }

    /// Ids of every persisted view model, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.view_models.read().unwrap().keys().cloned().collect()
    }

    /// Number of persisted view models.
    #[must_use]
    pub fn len(&self) -> usize {
        self.view_models.read().unwrap().len()
    }

    /// Whether nothing is persisted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.view_models.read().unwrap().is_empty()
    }

    fn apply(&self, view_model: &ViewModel) -> Result<(), StoreError> {
        let mut view_models = self.view_models.write().unwrap();
        let id = view_model.id();
        let actual = view_models.get(id).map(|stored| stored.revision);
        let conflict = || StoreError::Concurrency {
            key: id.to_string(),
            expected: view_model.revision(),
            actual,
        };

        match view_model.action_on_commit() {
            ActionOnCommit::Create => {
                if actual.is_some() {
                    return Err(conflict());
                }
                view_models.insert(
                    id.to_string(),
                    StoredViewModel {
                        attributes: view_model.attributes().clone(),
                        revision: 1,
                    },
                );
            }
            ActionOnCommit::Update => {
                let Some(current) = actual.filter(|current| Some(*current) == view_model.revision()) else {
                    return Err(conflict());
                };
                view_models.insert(
                    id.to_string(),
                    StoredViewModel {
                        attributes: view_model.attributes().clone(),
                        revision: current + 1,
                    },
                );
            }
            ActionOnCommit::Delete => {
                if actual != view_model.revision() {
                    return Err(conflict());
                }
                view_models.remove(id);
            }
        }
        Ok(())
    }
}

impl Repository for InMemoryRepository {
    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<ViewModel, StoreError>> {
        let view_model = self.get_stored(id).unwrap_or_else(|| ViewModel::new(id));
        ready(Ok(view_model)).boxed()
    }

    fn find<'a>(
        &'a self,
        query: &'a Value,
        options: FindOptions,
    ) -> BoxFuture<'a, Result<Vec<ViewModel>, StoreError>> {
        let matches = self
            .view_models
            .read()
            .unwrap()
            .iter()
            .map(|(id, stored)| ViewModel::stored(id, stored.attributes.clone(), stored.revision))
            .filter(|vm| vm.matches(query))
            .skip(options.skip.unwrap_or(0))
            .take(options.limit.unwrap_or(usize::MAX))
            .collect();
        ready(Ok(matches)).boxed()
    }

    fn commit(&self, view_model: ViewModel) -> BoxFuture<'_, Result<(), StoreError>> {
        ready(self.apply(&view_model)).boxed()
    }

    fn get_new_id(&self) -> BoxFuture<'_, Result<String, StoreError>> {
        ready(Ok(Uuid::new_v4().to_string())).boxed()
    }

    fn clear(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        self.view_models.write().unwrap().clear();
        ready(Ok(())).boxed()
    }
}

/// Repository wrapper that rejects the next N commits with a concurrency
/// conflict before delegating.
///
/// Reads are never affected, so a retrying writer sees the real stored state.
/// [`only_for`](Self::only_for) restricts the failures to one view model id.
#[derive(Clone, Debug)]
pub struct FlakyRepository<R> {
    inner: R,
    target: Option<String>,
    remaining: Arc<AtomicUsize>,
    injected: Arc<AtomicUsize>,
}

impl<R: Repository> FlakyRepository<R> {
    /// Wrap `inner`, failing the next `failures` commits.
    #[must_use]
    pub fn new(inner: R, failures: usize) -> Self {
        Self {
            inner,
            target: None,
            remaining: Arc::new(AtomicUsize::new(failures)),
            injected: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Only reject commits of the view model `id`; others pass through.
    #[must_use]
    pub fn only_for(mut self, id: impl Into<String>) -> Self {
        self.target = Some(id.into());
        self
    }

    /// Commits rejected so far.
    #[must_use]
    pub fn failures_injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }
}

impl<R: Repository> Repository for FlakyRepository<R> {
    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<ViewModel, StoreError>> {
        self.inner.get(id)
    }

    fn find<'a>(
        &'a self,
        query: &'a Value,
        options: FindOptions,
    ) -> BoxFuture<'a, Result<Vec<ViewModel>, StoreError>> {
        self.inner.find(query, options)
    }

    fn commit(&self, view_model: ViewModel) -> BoxFuture<'_, Result<(), StoreError>> {
        if self.target.as_deref().is_some_and(|target| target != view_model.id()) {
            return self.inner.commit(view_model);
        }
        let fail = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return ready(Err(StoreError::Concurrency {
                key: view_model.id().to_string(),
                expected: view_model.revision(),
                actual: None,
            }))
            .boxed();
        }
        self.inner.commit(view_model)
    }

    fn get_new_id(&self) -> BoxFuture<'_, Result<String, StoreError>> {
        self.inner.get_new_id()
    }

    fn clear(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        self.inner.clear()
    }
}
