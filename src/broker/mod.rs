//! Generic broker seam.
//!
//! The hub's publisher and subscriber work against [`Broker`], which models
//! the minimum a message broker must offer: topic-keyed publish with
//! acknowledgement-based consumption. Two implementations live here: the
//! AMQP-backed production broker and an in-process broker used by tests and
//! single-process deployments.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::EventHubResult;

pub mod amqp;
pub mod memory;

pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

/// Acknowledgement capability for one in-flight delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Marks the delivery processed; the broker removes the message.
    async fn ack(&self) -> EventHubResult<()>;

    /// Rejects the delivery. With `requeue` the broker redelivers it;
    /// without, the message is dropped.
    async fn reject(&self, requeue: bool) -> EventHubResult<()>;
}

/// One message received from the broker, together with its acknowledgement
/// capability. Dropping a delivery without deciding counts as a requeue for
/// brokers that track unacknowledged messages.
pub struct Delivery {
    routing_key: String,
    payload: Vec<u8>,
    ack: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(routing_key: String, payload: Vec<u8>, ack: Box<dyn Acknowledger>) -> Self {
        Self {
            routing_key,
            payload,
            ack,
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub async fn ack(self) -> EventHubResult<()> {
        self.ack.ack().await
    }

    pub async fn reject(self, requeue: bool) -> EventHubResult<()> {
        self.ack.reject(requeue).await
    }
}

/// Minimal broker contract: topic-keyed publish/subscribe with
/// acknowledgement.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Sends one message to the given routing key, awaiting the broker write.
    async fn publish(&self, routing_key: &str, payload: Vec<u8>) -> EventHubResult<()>;

    /// Sends a batch in input order over one pipelined path. Partial failure
    /// surfaces `EventHubError::PublishBatch` naming the failed indices.
    async fn publish_batch(&self, messages: Vec<(String, Vec<u8>)>) -> EventHubResult<()>;

    /// Starts consuming the given routing key. At most one consumer per key
    /// is allowed; the hub's subscriber reference-counts local handlers on
    /// top of this.
    async fn subscribe(&self, routing_key: &str) -> EventHubResult<mpsc::Receiver<Delivery>>;

    /// Stops consuming the given routing key. Idempotent.
    async fn unsubscribe(&self, routing_key: &str) -> EventHubResult<()>;

    /// Tears down all consumers and the underlying connection. Idempotent;
    /// operations issued afterwards fail fast.
    async fn close(&self) -> EventHubResult<()>;
}
