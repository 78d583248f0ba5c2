//! Queue transport abstraction.
//!
//! Queues are durable and point-to-point with at-least-once delivery. Every delivery carries
//! a token that must be acked or nacked; a consumer that goes away with unacked deliveries
//! gets them redelivered to the remaining consumers. The transport tracks how many times a
//! message has been delivered and exposes it as [`Delivery::attempt`], which the retry
//! policy reads. No deduplication is performed, so handlers must be idempotent per
//! document id.

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;

pub use memory::InMemoryBroker;

/// Errors returned by queue transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Queue was used before being declared.
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
    /// Queue was re-declared with different settings.
    #[error("queue {0} already declared with different settings")]
    DeclarationConflict(String),
    /// Token does not refer to an outstanding delivery.
    #[error("unknown delivery tag {tag} on queue {queue}")]
    UnknownDelivery {
        /// Queue the token was issued for.
        queue: String,
        /// Tag carried by the token.
        tag: u64,
    },
    /// Transport has been shut down.
    #[error("transport closed")]
    Closed,
}

/// Settings applied when declaring a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name.
    pub name: String,
    /// Whether the queue survives broker restarts.
    pub durable: bool,
    /// Queue receiving messages nacked without requeue.
    pub dead_letter: Option<String>,
}

impl QueueSpec {
    /// Durable queue without a dead-letter target.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            dead_letter: None,
        }
    }

    /// Route rejected messages to `target`.
    pub fn with_dead_letter(mut self, target: impl Into<String>) -> Self {
        self.dead_letter = Some(target.into());
        self
    }
}

/// Handle identifying one outstanding delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryToken {
    /// Queue the message was consumed from.
    pub queue: String,
    /// Broker-assigned tag, unique per broker.
    pub tag: u64,
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Token used to ack or nack this delivery.
    pub token: DeliveryToken,
    /// Raw message body.
    pub body: Vec<u8>,
    /// Delivery count for this message, starting at 1.
    pub attempt: u32,
}

impl Delivery {
    /// Whether the message has been delivered before.
    pub fn redelivered(&self) -> bool {
        self.attempt > 1
    }
}

/// Stream of deliveries from one queue. Dropping it returns unacked deliveries to the queue.
#[async_trait]
pub trait Consumer: Send {
    /// Wait for the next delivery; `None` once the transport is closed.
    async fn next(&mut self) -> Option<Delivery>;
}

/// Durable, acknowledged, point-to-point queues.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Create a queue, or confirm an existing one has the same settings.
    async fn declare(&self, spec: QueueSpec) -> Result<(), TransportError>;

    /// Enqueue a message. Returns once the transport has accepted it.
    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), TransportError>;

    /// Register a competing consumer on `queue`.
    async fn consume(&self, queue: &str) -> Result<Box<dyn Consumer>, TransportError>;

    /// Settle a delivery as done.
    async fn ack(&self, token: &DeliveryToken) -> Result<(), TransportError>;

    /// Reject a delivery. With `requeue` the message goes back to its queue with its attempt
    /// count preserved; otherwise it is wrapped in a dead-letter record carrying `reason`.
    async fn nack(
        &self,
        token: &DeliveryToken,
        requeue: bool,
        reason: &str,
    ) -> Result<(), TransportError>;
}
