//! Builder for event documents in the default definition layout.

use denormalizer_core::event::Event;
use serde_json::{Map, Value, json};

/// Builds an [`Event`] readable by `EventDefinition::default()`.
///
/// ```
/// use denormalizer_testing::EventBuilder;
/// use denormalizer_core::event::EventDefinition;
/// use serde_json::json;
///
/// let event = EventBuilder::new("userCreated")
///     .id("e1")
///     .aggregate("user", "u1")
///     .revision(1)
///     .payload(json!({ "name": "Jane" }))
///     .build();
///
/// let identity = EventDefinition::default().identity(&event).unwrap();
/// assert_eq!(identity.revision_key().as_deref(), Some("user::u1"));
/// ```
#[derive(Debug, Clone)]
pub struct EventBuilder {
    name: String,
    id: Option<String>,
    aggregate: Option<(String, String)>,
    context: Option<String>,
    revision: Option<u64>,
    correlation_id: Option<String>,
    payload: Value,
    meta: Option<Value>,
}

impl EventBuilder {
    /// Start an event of type `name` with an empty payload.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            aggregate: None,
            context: None,
            revision: None,
            correlation_id: None,
            payload: Value::Object(Map::new()),
            meta: None,
        }
    }

    /// Event id.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Aggregate type and id.
    #[must_use]
    pub fn aggregate(mut self, name: impl Into<String>, id: impl Into<String>) -> Self {
        self.aggregate = Some((name.into(), id.into()));
        self
    }

    /// Bounded context.
    #[must_use]
    pub fn context(mut self, name: impl Into<String>) -> Self {
        self.context = Some(name.into());
        self
    }

    /// Aggregate revision.
    #[must_use]
    pub const fn revision(mut self, revision: u64) -> Self {
        self.revision = Some(revision);
        self
    }

    /// Correlation id copied into notifications.
    #[must_use]
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Event payload.
    #[must_use]
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Event metadata.
    #[must_use]
    pub fn meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Assemble the document.
    #[must_use]
    pub fn build(self) -> Event {
        let mut document = Map::new();
        if let Some(id) = self.id {
            document.insert("id".to_string(), Value::String(id));
        }
        document.insert("name".to_string(), Value::String(self.name));
        if let Some((name, id)) = self.aggregate {
            document.insert("aggregate".to_string(), json!({ "id": id, "name": name }));
        }
        if let Some(name) = self.context {
            document.insert("context".to_string(), json!({ "name": name }));
        }
        if let Some(revision) = self.revision {
            document.insert("revision".to_string(), json!(revision));
        }
        if let Some(correlation_id) = self.correlation_id {
            document.insert("correlationId".to_string(), Value::String(correlation_id));
        }
        document.insert("payload".to_string(), self.payload);
        if let Some(meta) = self.meta {
            document.insert("meta".to_string(), meta);
        }
        Event::new(Value::Object(document))
    }
}
