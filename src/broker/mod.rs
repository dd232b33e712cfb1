//! Broker gateway: the narrow surface the pipeline needs from a message broker.
//!
//! ```text
//! publisher pool ──publish──▶ [queue] ──consume──▶ Subscription ──▶ Delivery ──ack / nack──▶
//! ```
//!
//! Delivery is at-least-once: a [`Delivery`] stays owned by the broker until
//! it is acknowledged. Negative acknowledgement with `requeue = true`, a
//! dropped subscription, or a closed connection all put the message back so
//! it is delivered again (with [`Delivery::attempt`] incremented).
//!
//! ## Gateways
//!
//! - [`MemoryBroker`]: in-process queues, used by tests and single-node runs
//! - [`RedisBroker`]: Redis Streams with consumer groups

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;

pub use self::memory::MemoryBroker;
pub use self::redis::RedisBroker;

/// Errors surfaced by a broker gateway.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("queue '{0}' has not been declared")]
    UnknownQueue(String),

    #[error("broker command failed: {0}")]
    Command(String),

    #[error("broker connection is closed")]
    Closed,
}

/// Settlement half of a delivery, implemented by each gateway.
#[async_trait]
pub trait Acker: Send {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError>;
}

/// One message handed to a consumer.
pub struct Delivery {
    queue: String,
    body: Bytes,
    attempt: u32,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(queue: impl Into<String>, body: Bytes, attempt: u32, acker: Box<dyn Acker>) -> Self {
        Self {
            queue: queue.into(),
            body,
            attempt,
            acker,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// 1 on first delivery, incremented on every redelivery.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }

    /// Positively acknowledge; the broker forgets the message.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Negatively acknowledge; with `requeue` the message is delivered again.
    pub async fn nack(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("attempt", &self.attempt)
            .field("len", &self.body.len())
            .finish()
    }
}

/// A lazy, unbounded stream of deliveries from one queue.
///
/// Dropping the subscription without settling a delivery returns that
/// delivery to the queue.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery. `None` means the connection closed.
    async fn next(&mut self) -> Option<Delivery>;
}

/// Queue declare / publish / consume surface used by the pipeline.
///
/// Implementations serialize concurrent publishes internally, so a single
/// gateway can be shared by every publisher worker.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Durable, non-exclusive, non-auto-deleted queues. Idempotent.
    async fn declare_queues(&self, names: &[&str]) -> Result<(), BrokerError>;

    async fn publish(&self, queue: &str, body: Bytes) -> Result<(), BrokerError>;

    async fn consume(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError>;

    /// Close the connection. Open subscriptions end and unacknowledged
    /// deliveries return to their queues.
    async fn close(&self);
}
