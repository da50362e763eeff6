//! Publish targets for outbox events.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::PublishError;

/// Destination for relayed events.
///
/// Delivery is at-least-once: the same event may be handed over again after
/// a crash or a lost acknowledgement, so implementations should be idempotent
/// or tolerate duplicates.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, event_type: &str, payload: &serde_json::Value)
    -> Result<(), PublishError>;
}

/// Publisher that only logs each event.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(
        &self,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<(), PublishError> {
        tracing::info!(event_type, %payload, "event published");
        Ok(())
    }
}

/// An event handed to an [`InMemoryPublisher`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub event_type: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Default)]
struct Script {
    next_failures: VecDeque<PublishError>,
    failing_types: HashSet<String>,
    attempts: usize,
    published: Vec<PublishedMessage>,
}

/// In-memory publisher for tests and local runs.
///
/// Records every successful publish and can be told to fail.
#[derive(Debug, Default)]
pub struct InMemoryPublisher {
    script: Mutex<Script>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next publish call fail with `error`.
    pub fn fail_next(&self, error: PublishError) {
        self.script().next_failures.push_back(error);
    }

    /// Makes every publish of `event_type` fail until [`recover`](Self::recover).
    pub fn fail_event_type(&self, event_type: impl Into<String>) {
        self.script().failing_types.insert(event_type.into());
    }

    /// Clears every scripted failure.
    pub fn recover(&self) {
        let mut script = self.script();
        script.next_failures.clear();
        script.failing_types.clear();
    }

    /// Returns the successfully published events in order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.script().published.clone()
    }

    /// Returns the number of publish calls, failed ones included.
    pub fn attempts(&self) -> usize {
        self.script().attempts
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Publisher for InMemoryPublisher {
    async fn publish(
        &self,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<(), PublishError> {
        let mut script = self.script();
        script.attempts += 1;

        if let Some(error) = script.next_failures.pop_front() {
            return Err(error);
        }
        if script.failing_types.contains(event_type) {
            return Err(PublishError::Unavailable(format!(
                "{event_type} is not accepted"
            )));
        }

        script.published.push(PublishedMessage {
            event_type: event_type.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_successful_publishes() {
        let publisher = InMemoryPublisher::new();
        publisher
            .publish("UserRegistered", &serde_json::json!({"id": 1}))
            .await
            .unwrap();

        assert_eq!(
            publisher.published(),
            vec![PublishedMessage {
                event_type: "UserRegistered".to_string(),
                payload: serde_json::json!({"id": 1}),
            }]
        );
        assert_eq!(publisher.attempts(), 1);
    }

    #[tokio::test]
    async fn scripted_failures() {
        let publisher = InMemoryPublisher::new();
        publisher.fail_next(PublishError::Rejected("bad payload".into()));
        publisher.fail_event_type("OrderPaid");

        let payload = serde_json::json!({});
        assert!(matches!(
            publisher.publish("UserRegistered", &payload).await,
            Err(PublishError::Rejected(_))
        ));
        assert!(publisher.publish("UserRegistered", &payload).await.is_ok());
        assert!(publisher.publish("OrderPaid", &payload).await.is_err());

        publisher.recover();
        assert!(publisher.publish("OrderPaid", &payload).await.is_ok());
        assert_eq!(publisher.attempts(), 4);
        assert_eq!(publisher.published().len(), 2);
    }
}
