//! User account aggregate.

use common::{AggregateId, Version};
use serde::{Deserialize, Serialize};
use storage::DomainEvent;

use crate::aggregate::{AggregateRoot, PendingEvents};
use crate::error::DomainError;

pub const USER_REGISTERED: &str = "UserRegistered";
pub const USER_RENAMED: &str = "UserRenamed";
pub const USER_DEACTIVATED: &str = "UserDeactivated";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    id: AggregateId,
    email: String,
    name: String,
    active: bool,
    #[serde(skip)]
    version: Version,
    #[serde(skip)]
    events: PendingEvents,
}

impl User {
    /// Creates a new, unsaved user and records `UserRegistered`.
    pub fn register(
        email: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self, DomainError> {
        let mut user = Self {
            id: AggregateId::new(),
            email: email.into(),
            name: name.into(),
            active: true,
            version: Version::initial(),
            events: PendingEvents::default(),
        };
        user.record(
            USER_REGISTERED,
            serde_json::json!({
                "user_id": user.id,
                "email": user.email,
                "name": user.name,
            }),
        )?;
        Ok(user)
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn rename(&mut self, name: impl Into<String>) -> Result<(), DomainError> {
        let name = name.into();
        if name == self.name {
            return Ok(());
        }
        let previous = std::mem::replace(&mut self.name, name);
        self.record(
            USER_RENAMED,
            serde_json::json!({
                "user_id": self.id,
                "previous": previous,
                "name": self.name,
            }),
        )
    }

    pub fn deactivate(&mut self) -> Result<(), DomainError> {
        if !self.active {
            return Err(DomainError::validation(format!(
                "user {} is already inactive",
                self.id
            )));
        }
        self.active = false;
        self.record(USER_DEACTIVATED, serde_json::json!({ "user_id": self.id }))
    }

    fn record(&mut self, event_type: &str, payload: serde_json::Value) -> Result<(), DomainError> {
        let event = DomainEvent::new(Self::aggregate_type(), self.id, event_type, &payload)?;
        self.events.record(event);
        Ok(())
    }
}

impl AggregateRoot for User {
    fn aggregate_type() -> &'static str {
        "User"
    }

    fn id(&self) -> AggregateId {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    fn pull_events(&mut self) -> Vec<DomainEvent> {
        self.events.drain()
    }
}
