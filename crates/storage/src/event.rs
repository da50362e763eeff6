use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AggregateId, Clock, SystemClock};

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an event ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<EventId> for Uuid {
    fn from(id: EventId) -> Self {
        id.0
    }
}

/// A fact recorded by an aggregate while it was being mutated.
///
/// Events are immutable once created; fields are only readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    event_id: EventId,
    event_type: String,
    aggregate_id: AggregateId,
    aggregate_type: String,
    occurred_at: DateTime<Utc>,
    payload: serde_json::Value,
}

impl DomainEvent {
    /// Creates an event stamped with the current system time.
    pub fn new<T: Serialize>(
        aggregate_type: impl Into<String>,
        aggregate_id: AggregateId,
        event_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Self::with_clock(&SystemClock, aggregate_type, aggregate_id, event_type, payload)
    }

    /// Creates an event stamped with `clock`.
    pub fn with_clock<T: Serialize>(
        clock: &dyn Clock,
        aggregate_type: impl Into<String>,
        aggregate_id: AggregateId,
        event_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::from_raw(
            aggregate_type,
            aggregate_id,
            event_type,
            serde_json::to_value(payload)?,
            clock.now(),
        ))
    }

    /// Creates an event from an already serialized payload.
    pub fn from_raw(
        aggregate_type: impl Into<String>,
        aggregate_id: AggregateId,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            event_type: event_type.into(),
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            occurred_at,
            payload,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    /// The type of the event (e.g., "UserRegistered", "OrderPlaced").
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Registered {
        email: &'static str,
    }

    #[test]
    fn event_id_new_creates_unique_ids() {
        assert_ne!(EventId::new(), EventId::new());
    }

    #[test]
    fn new_serializes_payload() {
        let aggregate_id = AggregateId::new();
        let event = DomainEvent::new(
            "User",
            aggregate_id,
            "UserRegistered",
            &Registered { email: "a@b.c" },
        )
        .unwrap();

        assert_eq!(event.event_type(), "UserRegistered");
        assert_eq!(event.aggregate_type(), "User");
        assert_eq!(event.aggregate_id(), aggregate_id);
        assert_eq!(event.payload(), &serde_json::json!({"email": "a@b.c"}));
    }

    #[test]
    fn with_clock_stamps_occurrence_time() {
        let clock = common::ManualClock::default();
        clock.advance(chrono::Duration::days(-3));

        let event = DomainEvent::with_clock(
            &clock,
            "User",
            AggregateId::new(),
            "UserRegistered",
            &Registered { email: "a@b.c" },
        )
        .unwrap();

        assert_eq!(event.occurred_at(), clock.now());
    }

    #[test]
    fn each_event_gets_its_own_id() {
        let id = AggregateId::new();
        let a = DomainEvent::from_raw("User", id, "X", serde_json::Value::Null, Utc::now());
        let b = DomainEvent::from_raw("User", id, "X", serde_json::Value::Null, Utc::now());
        assert_ne!(a.event_id(), b.event_id());
    }
}
