//! AMQP-backed broker implementation.
//!
//! Events are routed through one durable topic exchange; each consumed event
//! type gets a durable queue bound by its routing key. Consumer tasks watch
//! the connection epoch and re-establish their broker subscriptions after a
//! reconnect, so subscribers upstream never observe the churn.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio::{select, sync::mpsc, sync::Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use amqp_transport::{
    AmqpDelivery, ConnectionManager, TopicConsumer, TopicPublisher, TransportConfig,
};

use crate::{
    broker::{Acknowledger, Broker, Delivery},
    config::{DisconnectedPolicy, EventHubConfig},
    error::{EventHubError, EventHubResult},
};

struct PublisherSlot {
    publisher: TopicPublisher,
    epoch: u64,
}

/// Broker over one AMQP connection.
pub struct AmqpBroker {
    manager: ConnectionManager,
    exchange: String,
    queue_prefix: String,
    prefetch: u16,
    policy: DisconnectedPolicy,
    publisher: AsyncMutex<Option<PublisherSlot>>,
    pending: Mutex<VecDeque<(String, Vec<u8>)>>,
    consumers: Mutex<HashMap<String, CancellationToken>>,
}

impl AmqpBroker {
    /// Connects to the broker and prepares the dead-letter queue so messages
    /// routed there are retained even before an operator consumes them.
    pub async fn connect(config: &EventHubConfig) -> EventHubResult<Self> {
        let manager = ConnectionManager::connect(TransportConfig {
            url: config.broker_url.clone(),
            app_id: config.source.clone(),
            heartbeat_secs: config.heartbeat_secs,
            reconnect: config.reconnect.clone(),
        })
        .await?;

        let dead_letter_queue = format!(
            "{}.{}",
            config.queue_prefix, config.dead_letter_destination
        );
        manager
            .declare_topic_queue(
                &config.exchange,
                &dead_letter_queue,
                &config.dead_letter_destination,
            )
            .await?;

        Ok(Self {
            manager,
            exchange: config.exchange.clone(),
            queue_prefix: config.queue_prefix.clone(),
            prefetch: config.prefetch,
            policy: config.disconnected_policy.clone(),
            publisher: AsyncMutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            consumers: Mutex::new(HashMap::new()),
        })
    }

    /// Reopens the publisher channel when the connection epoch has moved.
    async fn ensure_publisher<'a>(
        &self,
        slot: &'a mut Option<PublisherSlot>,
    ) -> EventHubResult<&'a TopicPublisher> {
        let epoch = *self.manager.watch_epoch().borrow();
        let stale = slot.as_ref().map_or(true, |s| s.epoch != epoch);
        if stale {
            let publisher = self.manager.topic_publisher(&self.exchange).await?;
            *slot = Some(PublisherSlot { publisher, epoch });
        }
        let Some(current) = slot.as_ref() else {
            return Err(EventHubError::NotConnected);
        };
        Ok(&current.publisher)
    }

    /// Drains publishes buffered while disconnected, preserving order.
    async fn flush_pending(&self, publisher: &TopicPublisher) -> EventHubResult<()> {
        loop {
            let Some((routing_key, payload)) = self.pending.lock().pop_front() else {
                return Ok(());
            };
            if let Err(err) = publisher.publish(&routing_key, payload.clone()).await {
                self.pending.lock().push_front((routing_key, payload));
                return Err(EventHubError::Publish(err.to_string()));
            }
        }
    }

    fn buffer_or_fail(&self, routing_key: &str, payload: Vec<u8>) -> EventHubResult<()> {
        match self.policy {
            DisconnectedPolicy::FailFast => Err(EventHubError::NotConnected),
            DisconnectedPolicy::Buffer { limit } => {
                let mut pending = self.pending.lock();
                if pending.len() >= limit {
                    return Err(EventHubError::Publish(format!(
                        "disconnected publish buffer is full ({limit})"
                    )));
                }
                pending.push_back((routing_key.to_owned(), payload));
                warn!(routing_key, "buffered publish while disconnected");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn publish(&self, routing_key: &str, payload: Vec<u8>) -> EventHubResult<()> {
        if self.manager.is_closed() {
            return Err(EventHubError::ConnectionClosing);
        }
        if !self.manager.is_connected().await {
            return self.buffer_or_fail(routing_key, payload);
        }

        let mut slot = self.publisher.lock().await;
        let publisher = self.ensure_publisher(&mut slot).await?;
        self.flush_pending(publisher).await?;
        publisher
            .publish(routing_key, payload)
            .await
            .map_err(|err| EventHubError::Publish(err.to_string()))
    }

    async fn publish_batch(&self, messages: Vec<(String, Vec<u8>)>) -> EventHubResult<()> {
        if self.manager.is_closed() {
            return Err(EventHubError::ConnectionClosing);
        }
        if !self.manager.is_connected().await {
            return Err(EventHubError::NotConnected);
        }

        let mut slot = self.publisher.lock().await;
        let publisher = self.ensure_publisher(&mut slot).await?;
        self.flush_pending(publisher).await?;

        // pipelined on one channel; input order is wire order
        let mut failed = Vec::new();
        for (index, (routing_key, payload)) in messages.into_iter().enumerate() {
            if let Err(err) = publisher.publish(&routing_key, payload).await {
                error!(%err, index, routing_key, "batch publish entry failed");
                failed.push(index);
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(EventHubError::PublishBatch { failed })
        }
    }

    async fn subscribe(&self, routing_key: &str) -> EventHubResult<mpsc::Receiver<Delivery>> {
        if self.manager.is_closed() {
            return Err(EventHubError::ConnectionClosing);
        }
        if self.consumers.lock().contains_key(routing_key) {
            return Err(EventHubError::Subscribe(format!(
                "consumer already active for {routing_key}"
            )));
        }

        let queue = format!("{}.{}", self.queue_prefix, routing_key);
        let consumer = self
            .manager
            .topic_consumer(&self.exchange, &queue, routing_key, self.prefetch)
            .await?;

        let (tx, rx) = mpsc::channel(usize::from(self.prefetch).max(1));
        let token = CancellationToken::new();
        self.consumers
            .lock()
            .insert(routing_key.to_owned(), token.clone());

        tokio::spawn(consume_loop(
            self.manager.clone(),
            self.exchange.clone(),
            queue,
            routing_key.to_owned(),
            self.prefetch,
            consumer,
            tx,
            token,
        ));

        Ok(rx)
    }

    async fn unsubscribe(&self, routing_key: &str) -> EventHubResult<()> {
        if let Some(token) = self.consumers.lock().remove(routing_key) {
            token.cancel();
            debug!(routing_key, "consumer stopped");
        }
        Ok(())
    }

    async fn close(&self) -> EventHubResult<()> {
        for (_, token) in self.consumers.lock().drain() {
            token.cancel();
        }
        if let Some(slot) = self.publisher.lock().await.take()
            && let Err(err) = slot.publisher.close().await
        {
            debug!(%err, "error closing publisher channel");
        }
        self.manager.close().await?;
        Ok(())
    }
}

const REBUILD_PROBE: std::time::Duration = std::time::Duration::from_secs(5);

#[allow(clippy::too_many_arguments)]
async fn consume_loop(
    manager: ConnectionManager,
    exchange: String,
    queue: String,
    routing_key: String,
    prefetch: u16,
    initial: TopicConsumer,
    tx: mpsc::Sender<Delivery>,
    token: CancellationToken,
) {
    let mut epoch_rx = manager.watch_epoch();
    let _ = epoch_rx.borrow_and_update();
    let mut consumer = Some(initial);

    loop {
        match consumer.take() {
            None => {
                // connection is down; wait for the next epoch (or probe
                // periodically, in case a rebuild attempt failed after the
                // epoch already moved), then rebuild
                select! {
                    _ = token.cancelled() => break,
                    changed = epoch_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(REBUILD_PROBE) => {}
                }
                if manager.is_closed() {
                    break;
                }
                if !manager.is_connected().await {
                    continue;
                }
                match manager
                    .topic_consumer(&exchange, &queue, &routing_key, prefetch)
                    .await
                {
                    Ok(rebuilt) => {
                        info!(routing_key, "consumer re-established after reconnect");
                        consumer = Some(rebuilt);
                    }
                    Err(err) => {
                        error!(%err, routing_key, "failed to re-establish consumer");
                    }
                }
            }
            Some(mut active) => {
                select! {
                    _ = token.cancelled() => {
                        if let Err(err) = active.close().await {
                            debug!(%err, routing_key, "error closing consumer channel");
                        }
                        break;
                    }
                    changed = epoch_rx.changed() => {
                        if changed.is_err() || manager.is_closed() {
                            break;
                        }
                        // the old channel died with the old connection
                        match manager
                            .topic_consumer(&exchange, &queue, &routing_key, prefetch)
                            .await
                        {
                            Ok(rebuilt) => {
                                info!(routing_key, "consumer re-established after reconnect");
                                consumer = Some(rebuilt);
                            }
                            Err(err) => {
                                error!(%err, routing_key, "failed to re-establish consumer");
                            }
                        }
                    }
                    msg = active.next() => match msg {
                        Some(amqp_delivery) => {
                            let delivery = Delivery::new(
                                amqp_delivery.routing_key().to_owned(),
                                amqp_delivery.payload().to_vec(),
                                Box::new(AmqpAcknowledger { delivery: amqp_delivery }),
                            );
                            consumer = Some(active);
                            select! {
                                _ = token.cancelled() => break,
                                sent = tx.send(delivery) => {
                                    if sent.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        None => {
                            if manager.is_closed() {
                                break;
                            }
                            warn!(routing_key, "consumer channel closed, awaiting reconnect");
                        }
                    }
                }
            }
        }
    }
    debug!(routing_key, "consumer loop ended");
}

struct AmqpAcknowledger {
    delivery: AmqpDelivery,
}

#[async_trait]
impl Acknowledger for AmqpAcknowledger {
    async fn ack(&self) -> EventHubResult<()> {
        self.delivery.ack().await?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> EventHubResult<()> {
        self.delivery.reject(requeue).await?;
        Ok(())
    }
}
