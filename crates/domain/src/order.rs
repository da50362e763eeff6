//! Order aggregate.

use common::{AggregateId, Version};
use serde::{Deserialize, Serialize};
use storage::DomainEvent;

use crate::aggregate::{AggregateRoot, PendingEvents};
use crate::error::DomainError;

/// The status of an order.
///
/// ```text
/// Placed ──► Paid
///   │         │
///   └─────────┴──► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OrderStatus {
    #[default]
    Placed,
    Paid,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Placed => "Placed",
            OrderStatus::Paid => "Paid",
            OrderStatus::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A line in an order. Prices are in cents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub sku: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

impl OrderLine {
    pub fn new(sku: impl Into<String>, quantity: u32, unit_price_cents: i64) -> Self {
        Self {
            sku: sku.into(),
            quantity,
            unit_price_cents,
        }
    }

    pub fn total_cents(&self) -> i64 {
        self.unit_price_cents * i64::from(self.quantity)
    }
}

/// Payload of `OrderPlaced`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPlacedData {
    pub order_id: AggregateId,
    pub customer_id: AggregateId,
    pub lines: Vec<OrderLine>,
    pub total_cents: i64,
}

/// Payload of `OrderPaid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPaidData {
    pub order_id: AggregateId,
    pub amount_cents: i64,
}

/// Payload of `OrderCancelled`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCancelledData {
    pub order_id: AggregateId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    id: AggregateId,
    customer_id: AggregateId,
    lines: Vec<OrderLine>,
    status: OrderStatus,
    #[serde(skip)]
    version: Version,
    #[serde(skip)]
    events: PendingEvents,
}

impl Order {
    /// Creates a new, unsaved order and records `OrderPlaced`.
    pub fn place(customer_id: AggregateId, lines: Vec<OrderLine>) -> Result<Self, DomainError> {
        if lines.is_empty() {
            return Err(DomainError::validation("an order needs at least one line"));
        }
        if lines.iter().any(|line| line.quantity == 0) {
            return Err(DomainError::validation("order line quantity must be positive"));
        }

        let mut order = Self {
            id: AggregateId::new(),
            customer_id,
            lines,
            status: OrderStatus::Placed,
            version: Version::initial(),
            events: PendingEvents::default(),
        };
        let data = OrderPlacedData {
            order_id: order.id,
            customer_id,
            lines: order.lines.clone(),
            total_cents: order.total_cents(),
        };
        order.record("OrderPlaced", &data)?;
        Ok(order)
    }

    pub fn customer_id(&self) -> AggregateId {
        self.customer_id
    }

    pub fn lines(&self) -> &[OrderLine] {
        &self.lines
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn total_cents(&self) -> i64 {
        self.lines.iter().map(OrderLine::total_cents).sum()
    }

    pub fn pay(&mut self) -> Result<(), DomainError> {
        if self.status != OrderStatus::Placed {
            return Err(DomainError::validation(format!(
                "cannot pay an order that is {}",
                self.status
            )));
        }
        self.status = OrderStatus::Paid;
        let data = OrderPaidData {
            order_id: self.id,
            amount_cents: self.total_cents(),
        };
        self.record("OrderPaid", &data)
    }

    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), DomainError> {
        if self.status == OrderStatus::Cancelled {
            return Err(DomainError::validation("order is already cancelled"));
        }
        self.status = OrderStatus::Cancelled;
        let data = OrderCancelledData {
            order_id: self.id,
            reason: reason.into(),
        };
        self.record("OrderCancelled", &data)
    }

    fn record<T: Serialize>(&mut self, event_type: &str, data: &T) -> Result<(), DomainError> {
        let event = DomainEvent::new(Self::aggregate_type(), self.id, event_type, data)?;
        self.events.record(event);
        Ok(())
    }
}

impl AggregateRoot for Order {
    fn aggregate_type() -> &'static str {
        "Order"
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
