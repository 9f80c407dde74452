//! Outbound signals: notifications, extended events and missing-event alerts.

use crate::event::{Event, EventIdentity};
use crate::projection::ActionOnCommit;
use crate::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reference to the event that caused a notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventReference {
    /// Event id.
    pub id: Option<String>,
    /// Event type name.
    pub name: String,
    /// Aggregate instance id.
    pub aggregate_id: Option<String>,
    /// Aggregate type.
    pub aggregate: Option<String>,
    /// Bounded context.
    pub context: Option<String>,
    /// Event revision.
    pub revision: Option<u64>,
}

impl From<&EventIdentity> for EventReference {
    fn from(identity: &EventIdentity) -> Self {
        Self {
            id: identity.id.clone(),
            name: identity.name.clone(),
            aggregate_id: identity.aggregate_id.clone(),
            aggregate: identity.aggregate.clone(),
            context: identity.context.clone(),
            revision: identity.revision,
        }
    }
}

/// Change notice for one committed view model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Notification id.
    pub id: String,
    /// Correlation id copied from the event.
    pub correlation_id: Option<String>,
    /// What happened to the view model.
    pub action: ActionOnCommit,
    /// Collection the view model belongs to.
    pub collection: String,
    /// The view model as committed, including its id.
    pub payload: Value,
    /// The event that caused the change.
    pub event: EventReference,
    /// Metadata copied from the event.
    pub meta: Option<Value>,
}

/// Raised when a buffered event's predecessor never arrived.
///
/// Signals that an upstream event was lost and a replay may be required.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingEvent {
    /// Concatenated aggregate key.
    pub aggregate_id: String,
    /// Next expected revision according to the store (`None` if no entry).
    pub store_revision: Option<u64>,
    /// Revision of the buffered event.
    pub event_revision: u64,
    /// The buffered event.
    pub event: Event,
    /// When the gap was declared.
    pub detected_at: DateTime<Utc>,
}

/// Everything the denormalizer reports to downstream consumers.
#[derive(Clone, Debug, PartialEq)]
pub enum DenormalizerSignal {
    /// A view model was committed.
    Notification(Notification),
    /// An event finished every consumer and extender.
    EventExtended(Event),
    /// A predecessor event is considered lost.
    EventMissing(MissingEvent),
}
