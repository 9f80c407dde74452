//! Event documents and the definition that locates their fields.
//!
//! Events arrive from the write side as JSON documents. The denormalizer only
//! needs a handful of fields to order and route them (id, name, aggregate
//! identity, revision); everything else is opaque payload handed to view
//! builders. Where those fields live is described by an [`EventDefinition`].
//!
//! # Example
//!
//! ```
//! use denormalizer_core::event::{Event, EventDefinition};
//! use serde_json::json;
//!
//! let event = Event::new(json!({
//!     "id": "evt-1",
//!     "name": "userCreated",
//!     "aggregate": { "id": "user-1", "name": "user" },
//!     "context": { "name": "identity" },
//!     "revision": 1,
//!     "payload": { "email": "jane@example.com" }
//! }));
//!
//! let identity = EventDefinition::default().identity(&event).unwrap();
//! assert_eq!(identity.name, "userCreated");
//! assert_eq!(identity.revision, Some(1));
//! assert_eq!(identity.revision_key().as_deref(), Some("identity::user::user-1"));
//! ```

use crate::path;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Errors raised while reading an event through its definition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// A required field is absent from the event document.
    #[error("Event is missing required field '{0}'")]
    MissingField(String),

    /// The revision field exists but is not a non-negative integer.
    #[error("Invalid revision at '{path}': {value}")]
    InvalidRevision {
        /// Path of the revision field.
        path: String,
        /// The offending value rendered as JSON.
        value: String,
    },
}

/// An immutable event document.
///
/// The denormalizer never edits an incoming event in place. Enrichment
/// produces a new event via [`Event::extended`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event(Value);

impl Event {
    /// Wrap a JSON document as an event.
    #[must_use]
    pub const fn new(document: Value) -> Self {
        Self(document)
    }

    /// Borrow the underlying document.
    #[must_use]
    pub const fn as_value(&self) -> &Value {
        &self.0
    }

    /// Consume the event and return its document.
    #[must_use]
    pub fn into_value(self) -> Value {
        self.0
    }

    /// Read the value at a dotted path.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Value> {
        path::get(&self.0, path)
    }

    /// Return a copy of this event with `value` written at `path`.
    #[must_use]
    pub fn extended(&self, path: &str, value: Value) -> Self {
        let mut document = self.0.clone();
        path::set(&mut document, path, value);
        Self(document)
    }
}

impl From<Value> for Event {
    fn from(document: Value) -> Self {
        Self(document)
    }
}

/// Locations of the fields the denormalizer reads from an event.
///
/// Optional paths may be switched off by setting them to `None`. With no
/// `revision` or no `aggregate_id` path, events are not revision-tracked at all.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventDefinition {
    /// Event identifier.
    pub id: Option<String>,
    /// Event type name. Always required.
    pub name: String,
    /// Aggregate instance identifier.
    pub aggregate_id: Option<String>,
    /// Aggregate type name.
    pub aggregate: Option<String>,
    /// Bounded context name.
    pub context: Option<String>,
    /// Per-aggregate revision number.
    pub revision: Option<String>,
    /// Correlation id copied onto notifications.
    pub correlation_id: Option<String>,
    /// Metadata copied onto notifications.
    pub meta: Option<String>,
    /// Domain payload.
    pub payload: Option<String>,
}

impl Default for EventDefinition {
    fn default() -> Self {
        Self {
            id: Some("id".to_string()),
            name: "name".to_string(),
            aggregate_id: Some("aggregate.id".to_string()),
            aggregate: Some("aggregate.name".to_string()),
            context: Some("context.name".to_string()),
            revision: Some("revision".to_string()),
            correlation_id: Some("correlationId".to_string()),
            meta: Some("meta".to_string()),
            payload: Some("payload".to_string()),
        }
    }
}

impl EventDefinition {
    /// Extract the routing and ordering identity of `event`.
    ///
    /// # Errors
    ///
    /// - [`EventError::MissingField`] if the event has no name
    /// - [`EventError::InvalidRevision`] if the revision is not an unsigned integer
    pub fn identity(&self, event: &Event) -> Result<EventIdentity, EventError> {
        let name = event
            .get(&self.name)
            .and_then(path::as_id)
            .ok_or_else(|| EventError::MissingField(self.name.clone()))?;

        let revision = match &self.revision {
            Some(revision_path) => match event.get(revision_path) {
                None | Some(Value::Null) => None,
                Some(value) => Some(parse_revision(revision_path, value)?),
            },
            None => None,
        };

        Ok(EventIdentity {
            id: self.lookup_id(event, self.id.as_deref()),
            name,
            aggregate_id: self.lookup_id(event, self.aggregate_id.as_deref()),
            aggregate: self.lookup_id(event, self.aggregate.as_deref()),
            context: self.lookup_id(event, self.context.as_deref()),
            revision,
        })
    }

    /// Read the correlation id, if configured and present.
    #[must_use]
    pub fn correlation_id(&self, event: &Event) -> Option<String> {
        self.lookup_id(event, self.correlation_id.as_deref())
    }

    /// Read the metadata block, if configured and present.
    #[must_use]
    pub fn meta(&self, event: &Event) -> Option<Value> {
        self.meta.as_deref().and_then(|p| event.get(p)).cloned()
    }

    /// Read the payload, falling back to the whole document.
    #[must_use]
    pub fn payload<'a>(&self, event: &'a Event) -> &'a Value {
        self.payload
            .as_deref()
            .and_then(|p| event.get(p))
            .unwrap_or_else(|| event.as_value())
    }

    /// Whether both paths needed for revision tracking are configured.
    #[must_use]
    pub const fn tracks_revisions(&self) -> bool {
        self.aggregate_id.is_some() && self.revision.is_some()
    }

    #[allow(clippy::unused_self)]
    fn lookup_id(&self, event: &Event, field_path: Option<&str>) -> Option<String> {
        field_path.and_then(|p| event.get(p)).and_then(path::as_id)
    }
}

fn parse_revision(revision_path: &str, value: &Value) -> Result<u64, EventError> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse::<u64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| EventError::InvalidRevision {
        path: revision_path.to_string(),
        value: value.to_string(),
    })
}

/// The fields of an event that drive ordering and routing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventIdentity {
    /// Event identifier.
    pub id: Option<String>,
    /// Event type name.
    pub name: String,
    /// Aggregate instance identifier.
    pub aggregate_id: Option<String>,
    /// Aggregate type name.
    pub aggregate: Option<String>,
    /// Bounded context name.
    pub context: Option<String>,
    /// Per-aggregate revision.
    pub revision: Option<u64>,
}

impl EventIdentity {
    /// Concatenated `context::aggregate::aggregateId` key.
    ///
    /// Absent context or aggregate names are left out. Returns `None` when the
    /// event carries no aggregate id.
    #[must_use]
    pub fn revision_key(&self) -> Option<String> {
        let aggregate_id = self.aggregate_id.as_deref()?;
        let key = [self.context.as_deref(), self.aggregate.as_deref(), Some(aggregate_id)]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join("::");
        Some(key)
    }
}

impl fmt::Display for EventIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(key) = self.revision_key() {
            write!(f, "@{key}")?;
        }
        if let Some(revision) = self.revision {
            write!(f, "#{revision}")?;
        }
        Ok(())
    }
}

/// The events a view builder or extender subscribes to.
///
/// `aggregate` and `context` act as wildcards when unset.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventTarget {
    /// Event type name.
    pub name: String,
    /// Aggregate type name filter.
    pub aggregate: Option<String>,
    /// Bounded context filter.
    pub context: Option<String>,
}

impl EventTarget {
    /// Target every event called `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            aggregate: None,
            context: None,
        }
    }

    /// Restrict to one aggregate type.
    #[must_use]
    pub fn aggregate(mut self, aggregate: impl Into<String>) -> Self {
        self.aggregate = Some(aggregate.into());
        self
    }

    /// Restrict to one bounded context.
    #[must_use]
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Check whether an event with `identity` is addressed to this target.
    #[must_use]
    pub fn matches(&self, identity: &EventIdentity) -> bool {
        self.name == identity.name
            && self
                .aggregate
                .as_ref()
                .is_none_or(|a| identity.aggregate.as_ref() == Some(a))
            && self
                .context
                .as_ref()
                .is_none_or(|c| identity.context.as_ref() == Some(c))
    }
}

impl fmt::Display for EventTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.context.as_deref().unwrap_or("*"),
            self.aggregate.as_deref().unwrap_or("*"),
            self.name
        )
    }
}
