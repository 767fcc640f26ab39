use super::{ContextBuilder, EventContext, FlowIdentity};
use crate::location::ComponentLocation;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Identity of an event context as it crosses a process or persistence boundary.
///
/// Only identity travels: no parent, no children and no signal state. Restoring a snapshot
/// always yields a fresh root whose signals are unresolved, whatever state the original
/// context was in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ContextSnapshot {
    pub id: String,
    pub correlation_id: String,
    pub flow: FlowIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<ComponentLocation>,
    pub received_at: DateTime<Utc>,
}

impl ContextSnapshot {
    pub fn restore<E: Clone + Send + 'static>(&self) -> EventContext<E> {
        let mut builder = ContextBuilder::new(self.flow.clone())
            .id(self.id.clone())
            .correlation_id(self.correlation_id.clone())
            .received_at(self.received_at);
        if let Some(location) = &self.location {
            builder = builder.location(location.clone());
        }
        builder.build()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// JSON schema of the serialized form of an event context.
pub fn snapshot_schema() -> schemars::Schema {
    schemars::schema_for!(ContextSnapshot)
}

impl<E: Clone + Send + 'static> EventContext<E> {
    /// Detaches this context from its parent and captures its identity.
    ///
    /// The parent stops waiting on this context as a side effect, since the signals of a
    /// context cannot follow it across the boundary. Children of this context stay
    /// registered with it in this process.
    pub fn snapshot(&self) -> ContextSnapshot {
        self.detach();
        ContextSnapshot {
            id: self.inner.id.clone(),
            correlation_id: self.inner.correlation_id.clone(),
            flow: self.inner.flow.clone(),
            location: self.inner.location.clone(),
            received_at: self.inner.received_at,
        }
    }
}

/// Serializes via [`EventContext::snapshot`], so serializing detaches the context.
impl<E: Clone + Send + 'static> Serialize for EventContext<E> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

/// Deserializes into a fresh root context.
impl<'de, E: Clone + Send + 'static> Deserialize<'de> for EventContext<E> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        ContextSnapshot::deserialize(deserializer).map(|snapshot| snapshot.restore())
    }
}
