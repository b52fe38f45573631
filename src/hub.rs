//! Constructible event hub facade.
//!
//! There is intentionally no module-level shared instance: every hub is an
//! explicit value whose ownership is passed around, and tests construct an
//! isolated hub each.

use std::sync::Arc;
use tracing::info;

use crate::{
    broker::{AmqpBroker, Broker},
    config::EventHubConfig,
    error::EventHubResult,
    publisher::Publisher,
    retry::RetryPolicy,
    subscriber::Subscriber,
};

/// Publish/subscribe hub over one broker connection.
pub struct EventHub {
    broker: Arc<dyn Broker>,
    publisher: Publisher,
    subscriber: Subscriber,
}

impl EventHub {
    /// Connects to the AMQP broker described by `config`.
    ///
    /// # Errors
    /// `EventHubError::Connect` once the reconnect policy is exhausted.
    pub async fn connect(config: EventHubConfig) -> EventHubResult<Self> {
        let broker = Arc::new(AmqpBroker::connect(&config).await?);
        info!(url = %config.broker_url, source = %config.source, "event hub connected");
        Ok(Self::with_broker(broker, &config))
    }

    /// Builds a hub on top of any broker implementation; used with
    /// [`crate::broker::MemoryBroker`] for tests and single-process buses.
    pub fn with_broker(broker: Arc<dyn Broker>, config: &EventHubConfig) -> Self {
        let publisher = Publisher::new(
            Arc::clone(&broker),
            config.source.clone(),
            config.max_history_size,
        );
        let subscriber = Subscriber::new(
            Arc::clone(&broker),
            RetryPolicy::new(config.max_retries),
            config.dead_letter_destination.clone(),
        );
        Self {
            broker,
            publisher,
            subscriber,
        }
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn subscriber(&self) -> &Subscriber {
        &self.subscriber
    }

    /// Tears down subscriptions and releases the broker connection.
    /// Idempotent; operations issued afterwards fail fast.
    pub async fn close(&self) -> EventHubResult<()> {
        self.subscriber.unsubscribe_all().await?;
        self.broker.close().await?;
        info!("event hub closed");
        Ok(())
    }
}
