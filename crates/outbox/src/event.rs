//! Outbox event record and its status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The domain event types this system records and publishes.
///
/// Each variant maps to one message-bus topic; the serialized form is the
/// topic name itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    /// An order was created with its item snapshot.
    #[serde(rename = "order.created")]
    OrderCreated,

    /// Stock was deducted for an order.
    #[serde(rename = "order.deduct_stock")]
    DeductStock,

    /// Payment was taken from the user's point wallet.
    #[serde(rename = "order.payment")]
    Payment,

    /// The saga ran to completion.
    #[serde(rename = "order.success")]
    Success,

    /// The saga terminated in failure.
    #[serde(rename = "order.failed")]
    Failed,
}

impl EventType {
    /// Returns the message-bus topic for this event type.
    pub fn topic(&self) -> &'static str {
        match self {
            EventType::OrderCreated => "order.created",
            EventType::DeductStock => "order.deduct_stock",
            EventType::Payment => "order.payment",
            EventType::Success => "order.success",
            EventType::Failed => "order.failed",
        }
    }

    /// Parses an event type from its topic name.
    pub fn from_topic(topic: &str) -> Option<Self> {
        match topic {
            "order.created" => Some(EventType::OrderCreated),
            "order.deduct_stock" => Some(EventType::DeductStock),
            "order.payment" => Some(EventType::Payment),
            "order.success" => Some(EventType::Success),
            "order.failed" => Some(EventType::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.topic())
    }
}

/// Delivery status of an outbox row.
///
/// Transitions are monotonic: `Init -> Success`, `Init -> Fail`,
/// `Fail -> Success` (compensation resolved the failure). `Success` is
/// terminal. Same-status updates are treated as no-ops by the stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutboxStatus {
    /// Recorded but not yet published.
    #[serde(rename = "INIT")]
    Init,

    /// Published (or resolved by compensation). Terminal.
    #[serde(rename = "SUCCESS")]
    Success,

    /// Publishing or handling failed; awaiting compensation.
    #[serde(rename = "FAIL")]
    Fail,
}

impl OutboxStatus {
    /// Returns the persisted string form of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Init => "INIT",
            OutboxStatus::Success => "SUCCESS",
            OutboxStatus::Fail => "FAIL",
        }
    }

    /// Parses a status from its persisted string form.
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "INIT" => Some(OutboxStatus::Init),
            "SUCCESS" => Some(OutboxStatus::Success),
            "FAIL" => Some(OutboxStatus::Fail),
            _ => None,
        }
    }

    /// Returns true if moving from `self` to `to` is a valid transition.
    pub fn can_transition_to(&self, to: OutboxStatus) -> bool {
        matches!(
            (self, to),
            (OutboxStatus::Init, OutboxStatus::Success)
                | (OutboxStatus::Init, OutboxStatus::Fail)
                | (OutboxStatus::Fail, OutboxStatus::Success)
        )
    }

    /// Returns true if this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Success)
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable record of a domain event pending (or past) publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Saga instance key, e.g. `order-<uuid>`. Doubles as the broker
    /// partition key so events of one aggregate stay ordered.
    pub aggregate_id: String,

    /// The event type; `(aggregate_id, event_type)` is unique.
    pub event_type: EventType,

    /// Canonical JSON payload, encoded exactly once.
    pub payload: serde_json::Value,

    /// Current delivery status.
    pub status: OutboxStatus,

    /// When the row was recorded.
    pub created_at: DateTime<Utc>,

    /// When the status last changed.
    pub updated_at: DateTime<Utc>,
}

impl OutboxEvent {
    /// Creates a new pending (`Init`) outbox event.
    pub fn new(
        aggregate_id: impl Into<String>,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            aggregate_id: aggregate_id.into(),
            event_type,
            payload,
            status: OutboxStatus::Init,
            created_at: now,
            updated_at: now,
        }
    }
}
