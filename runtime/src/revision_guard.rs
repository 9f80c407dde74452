//! Per-aggregate revision ordering.
//!
//! The guard sits between the event source and the [`EventDispatcher`] and
//! makes sure every aggregate's events reach the consumers exactly in
//! revision order, whatever order they arrive in.
//!
//! # Decision per event
//!
//! | Situation | Action |
//! |-----------|--------|
//! | ordering disabled, or no aggregate id / revision | dispatch right away |
//! | `revision < expected` | drop as stale, clear its dispatch entry |
//! | `revision > expected` | buffer, re-check on every queue timeout |
//! | `revision == expected` | CAS `expected = revision + 1`, dispatch, then admit the buffered successor |
//!
//! `expected` is the stored next revision, or `start_revision_number` for an
//! aggregate with no entry (or the event's own revision when that is unset).
//!
//! A CAS conflict means another instance admitted something for the same
//! aggregate; the whole decision is retried after a fixed short delay.
//!
//! After `queue_timeout_max_loops` unsuccessful re-checks a buffered event's
//! predecessor is declared missing with a [`DenormalizerSignal::EventMissing`].
//! The event stays buffered so a late predecessor can still release it.
//!
//! # Concurrency
//!
//! Within one process all decisions for an aggregate are serialized by a
//! per-aggregate async lock; across processes the revision store CAS is the
//! only coordination.

use crate::dispatcher::EventDispatcher;
use crate::metrics::GuardMetrics;
use crate::order_queue::{Escalation, OrderQueue};
use crate::signals::SignalSender;
use denormalizer_core::config::RevisionGuardConfig;
use denormalizer_core::event::{Event, EventDefinition, EventIdentity};
use denormalizer_core::notification::MissingEvent;
use denormalizer_core::revision::RevisionStore;
use denormalizer_core::{DenormalizerSignal, Result, Utc};
use futures::future::BoxFuture;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

/// What the guard did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardOutcome {
    /// The event (and `count - 1` buffered successors) was dispatched in order.
    Admitted {
        /// Events dispatched by this admission chain.
        count: usize,
    },
    /// The event arrived ahead of its predecessor and waits in the queue.
    Buffered,
    /// The revision was already applied; the event was dropped.
    Stale,
    /// Ordering does not apply; the event was dispatched directly.
    Bypassed,
}

#[derive(Debug, Clone)]
struct BufferedEvent {
    event: Event,
    revision: u64,
}

/// Per-aggregate async locks, dropped once nobody holds them.
#[derive(Debug, Default)]
struct AggregateLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AggregateLocks {
    async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    fn release(&self, key: &str, guard: OwnedMutexGuard<()>) {
        drop(guard);
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }
}

struct GuardInner {
    store: Arc<dyn RevisionStore>,
    dispatcher: Arc<EventDispatcher>,
    definition: EventDefinition,
    config: RevisionGuardConfig,
    queue: OrderQueue<BufferedEvent>,
    locks: AggregateLocks,
    signals: SignalSender,
}

/// Admits events to the dispatcher in strict per-aggregate revision order.
#[derive(Clone)]
pub struct RevisionGuard {
    inner: Arc<GuardInner>,
}

impl std::fmt::Debug for RevisionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionGuard")
            .field("config", &self.inner.config)
            .field("buffered", &self.inner.queue.len())
            .finish_non_exhaustive()
    }
}

impl RevisionGuard {
    /// Create a guard in front of `dispatcher`.
    #[must_use]
    pub fn new(
        store: Arc<dyn RevisionStore>,
        dispatcher: Arc<EventDispatcher>,
        definition: EventDefinition,
        config: RevisionGuardConfig,
        signals: SignalSender,
    ) -> Self {
        let queue = OrderQueue::new(config.queue_timeout);
        Self {
            inner: Arc::new(GuardInner {
                store,
                dispatcher,
                definition,
                config,
                queue,
                locks: AggregateLocks::default(),
                signals,
            }),
        }
    }

    /// Number of events currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.inner.queue.len()
    }

    /// Route one incoming event.
    ///
    /// Resolves once the event (and any successors it released) has been
    /// dispatched, or as soon as it was buffered or dropped.
    ///
    /// # Errors
    ///
    /// - [`DenormalizerError::Event`](denormalizer_core::DenormalizerError::Event)
    ///   if the event cannot be read
    /// - [`DenormalizerError::Store`](denormalizer_core::DenormalizerError::Store)
    ///   for revision store failures other than CAS conflicts
    /// - any dispatch error
    #[tracing::instrument(skip_all, fields(event = tracing::field::Empty))]
    pub async fn guard(&self, event: Event) -> Result<GuardOutcome> {
        let inner = &self.inner;
        let identity = inner.definition.identity(&event)?;
        tracing::Span::current().record("event", tracing::field::display(&identity));

        let ordered = (!inner.config.ignore_revision)
            .then(|| identity.revision_key().zip(identity.revision))
            .flatten();
        let Some((key, revision)) = ordered else {
            tracing::debug!("Dispatching without revision check");
            GuardMetrics::record_bypassed();
            inner.dispatcher.dispatch(event).await?;
            return Ok(GuardOutcome::Bypassed);
        };

        let lock = inner.locks.acquire(&key).await;
        let outcome = self.admit_chain(key.clone(), event, identity, revision).await;
        inner.locks.release(&key, lock);
        outcome
    }

    /// Admission loop for one aggregate. The caller holds the aggregate lock.
    ///
    /// Boxed because buffered events re-enter it from their timer tasks.
    fn admit_chain(
        &self,
        key: String,
        event: Event,
        identity: EventIdentity,
        revision: u64,
    ) -> BoxFuture<'static, Result<GuardOutcome>> {
        let guard = self.clone();
        Box::pin(async move {
            let inner = &guard.inner;
            let prefix = inner.config.prefix.as_str();
            let (mut event, mut identity, mut revision) = (event, identity, revision);
            let mut admitted = 0;

            loop {
                let stored = inner.store.get(prefix, &key).await?;
                let stored_revision = stored.as_ref().map(|entry| entry.revision);
                let expected = guard.expected_revision(stored_revision, revision);

                match revision.cmp(&expected) {
                    Ordering::Less => {
                        guard.discard_stale(&key, &identity, revision, expected).await?;
                        return Ok(chain_outcome(admitted, GuardOutcome::Stale));
                    }
                    Ordering::Greater => {
                        guard.buffer(&key, event, &identity, revision, expected);
                        return Ok(chain_outcome(admitted, GuardOutcome::Buffered));
                    }
                    Ordering::Equal => {}
                }

                let data = stored.and_then(|entry| entry.data);
                match inner.store.set(prefix, &key, data, revision + 1, stored_revision).await {
                    Ok(()) => {}
                    Err(error) if error.is_concurrency_conflict() => {
                        GuardMetrics::record_conflict();
                        tracing::warn!(
                            aggregate = %key,
                            revision,
                            "Revision changed concurrently, retrying"
                        );
                        tokio::time::sleep(inner.config.concurrency_retry_delay).await;
                        continue;
                    }
                    Err(error) => return Err(error.into()),
                }

                inner.store.save_last_event(prefix, &event).await?;
                inner.queue.remove(&key, &queue_id(&identity, revision));
                tracing::debug!(aggregate = %key, revision, "Event admitted");

                inner.dispatcher.dispatch(event).await?;
                admitted += 1;

                let next_revision = revision + 1;
                let Some(next) = inner.queue.take_first(&key, |buffered| buffered.revision == next_revision)
                else {
                    break;
                };
                tracing::debug!(aggregate = %key, revision = next_revision, "Releasing buffered event");
                identity = inner.definition.identity(&next.item.event)?;
                event = next.item.event;
                revision = next_revision;
            }

            GuardMetrics::record_admitted(admitted);
            GuardMetrics::record_waiting(inner.queue.len());
            Ok(GuardOutcome::Admitted { count: admitted })
        })
    }

    fn expected_revision(&self, stored: Option<u64>, incoming: u64) -> u64 {
        stored
            .or(self.inner.config.start_revision_number)
            .unwrap_or(incoming)
    }

    async fn discard_stale(
        &self,
        key: &str,
        identity: &EventIdentity,
        revision: u64,
        expected: u64,
    ) -> Result<()> {
        let inner = &self.inner;
        GuardMetrics::record_stale();
        tracing::debug!(aggregate = %key, revision, expected, "Dropping stale event");

        inner.queue.remove(key, &queue_id(identity, revision));
        if let Some(id) = &identity.id {
            inner.dispatcher.discard(id).await?;
        }
        Ok(())
    }

    fn buffer(&self, key: &str, event: Event, identity: &EventIdentity, revision: u64, expected: u64) {
        let inner = &self.inner;
        let id = queue_id(identity, revision);

        let guard = self.clone();
        let timer_key = key.to_string();
        let timer_id = id.clone();
        let pushed = inner.queue.push(
            key,
            &id,
            BufferedEvent { event, revision },
            move |loop_count| guard.on_queue_timeout(timer_key.clone(), timer_id.clone(), loop_count),
        );

        if pushed {
            GuardMetrics::record_buffered(inner.queue.len());
            tracing::debug!(aggregate = %key, revision, expected, "Event ahead of its predecessor, buffered");
        } else {
            tracing::debug!(aggregate = %key, revision, "Event already buffered");
        }
    }

    fn on_queue_timeout(&self, key: String, id: String, loop_count: u32) -> BoxFuture<'static, Escalation> {
        let guard = self.clone();
        Box::pin(async move {
            let max_loops = guard.inner.config.queue_timeout_max_loops;
            let lock = guard.inner.locks.acquire(&key).await;
            let result = guard.recheck(&key, &id, loop_count).await;
            guard.inner.locks.release(&key, lock);

            match result {
                Ok(escalation) => escalation,
                Err(error) => {
                    tracing::error!(
                        aggregate = %key,
                        event_id = %id,
                        loop_count,
                        error = %error,
                        "Re-check of buffered event failed"
                    );
                    if loop_count >= max_loops {
                        Escalation::Stop
                    } else {
                        Escalation::Rearm
                    }
                }
            }
        })
    }

    async fn recheck(&self, key: &str, id: &str, loop_count: u32) -> Result<Escalation> {
        let inner = &self.inner;
        let Some(buffered) = inner.queue.find(key, id) else {
            return Ok(Escalation::Stop);
        };

        let stored = inner.store.get(&inner.config.prefix, key).await?;
        let stored_revision = stored.map(|entry| entry.revision);
        let expected = self.expected_revision(stored_revision, buffered.revision);

        match buffered.revision.cmp(&expected) {
            Ordering::Equal => {
                tracing::debug!(aggregate = %key, revision = buffered.revision, "Buffered event became admissible");
                let identity = inner.definition.identity(&buffered.event)?;
                let outcome = self
                    .admit_chain(key.to_string(), buffered.event, identity, buffered.revision)
                    .await?;
                Ok(match outcome {
                    GuardOutcome::Buffered => Escalation::Rearm,
                    _ => Escalation::Stop,
                })
            }
            Ordering::Less => {
                let identity = inner.definition.identity(&buffered.event)?;
                self.discard_stale(key, &identity, buffered.revision, expected).await?;
                Ok(Escalation::Stop)
            }
            Ordering::Greater if loop_count >= inner.config.queue_timeout_max_loops => {
                GuardMetrics::record_missing();
                tracing::warn!(
                    aggregate = %key,
                    store_revision = ?stored_revision,
                    event_revision = buffered.revision,
                    loop_count,
                    "Predecessor event missing"
                );
                inner.signals.emit(DenormalizerSignal::EventMissing(MissingEvent {
                    aggregate_id: key.to_string(),
                    store_revision: stored_revision,
                    event_revision: buffered.revision,
                    event: buffered.event,
                    detected_at: Utc::now(),
                }));
                Ok(Escalation::Stop)
            }
            Ordering::Greater => {
                tracing::debug!(
                    aggregate = %key,
                    revision = buffered.revision,
                    expected,
                    loop_count,
                    "Still waiting for predecessor"
                );
                Ok(Escalation::Rearm)
            }
        }
    }
}

/// Identity of a buffered event within its aggregate's queue.
fn queue_id(identity: &EventIdentity, revision: u64) -> String {
    identity
        .id
        .clone()
        .unwrap_or_else(|| format!("revision-{revision}"))
}

const fn chain_outcome(admitted: usize, otherwise: GuardOutcome) -> GuardOutcome {
    if admitted > 0 {
        GuardOutcome::Admitted { count: admitted }
    } else {
        otherwise
    }
}
