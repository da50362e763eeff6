//! Aggregate capability trait.

use common::AggregateId;
use storage::{DomainEvent, Version};

/// Trait for aggregates persisted as a state snapshot.
///
/// An aggregate is a cluster of domain objects that can be treated as a single unit.
/// Behavior methods mutate its state and record the domain events describing each
/// change; the unit of work drains those events and writes them to the outbox in
/// the same transaction as the new state.
///
/// The version is owned by storage:
/// - A freshly constructed aggregate is at [`Version::initial`] and has never been stored
/// - Every successful save advances it by exactly one
/// - It is never serialized with the state
pub trait AggregateRoot: Send + Sync {
    /// Returns the aggregate type name.
    ///
    /// Used as the storage partition key and as the outbox `aggregate_type`.
    fn aggregate_type() -> &'static str
    where
        Self: Sized;

    /// Returns the aggregate's unique identifier.
    fn id(&self) -> AggregateId;

    /// Returns the version last read from or written to storage.
    fn version(&self) -> Version;

    /// Sets the aggregate version.
    ///
    /// Called by repositories after a load or a successful write.
    fn set_version(&mut self, version: Version);

    /// Returns true if the aggregate has never been stored.
    fn is_new(&self) -> bool {
        self.version().is_initial()
    }

    /// Removes and returns the events recorded since the last call.
    fn pull_events(&mut self) -> Vec<DomainEvent>;
}

/// Buffer of events recorded by an aggregate and not yet pulled.
///
/// Embed it with `#[serde(skip)]` so it never reaches stored state.
#[derive(Debug, Clone, Default)]
pub struct PendingEvents(Vec<DomainEvent>);

impl PendingEvents {
    pub fn record(&mut self, event: DomainEvent) {
        self.0.push(event);
    }

    /// Takes every buffered event, leaving the buffer empty.
    pub fn drain(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
