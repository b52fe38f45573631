//--------------------------------------------------------------------------------------------------
// STRUCTS & TRAITS
//--------------------------------------------------------------------------------------------------
// | Name                    | Description                                       | Key Methods       |
// |-------------------------|---------------------------------------------------|------------------|
// | EventHandler            | Trait for event handling                          | handle            |
// | Subscriber              | Maps broker subscriptions to local handlers       | subscribe         |
// | Subscription            | One handler's registration to one event type      | unsubscribe       |
//--------------------------------------------------------------------------------------------------

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::{collections::HashMap, future::Future, marker::PhantomData, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{
    broker::{Broker, Delivery},
    envelope::{self, Envelope},
    error::{EventHubError, EventHubResult},
    retry::{DeadLetter, FailureAction, RetryPolicy},
};

/// Event handler trait for processing decoded envelopes.
///
/// Handlers may be invoked more than once for the same envelope id because
/// delivery is at-least-once; handlers that must not double-apply an effect
/// should dedupe on `event.id`.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Processes an event. A returned error feeds the retry policy; it never
    /// affects other handlers registered for the same event type.
    async fn handle(&self, event: &Envelope) -> anyhow::Result<()>;
}

/// Wraps an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    struct FnHandler<F, Fut> {
        f: F,
        _marker: PhantomData<fn() -> Fut>,
    }

    #[async_trait]
    impl<F, Fut> EventHandler for FnHandler<F, Fut>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        async fn handle(&self, event: &Envelope) -> anyhow::Result<()> {
            (self.f)(event.clone()).await
        }
    }

    Arc::new(FnHandler {
        f,
        _marker: PhantomData,
    })
}

#[derive(Clone)]
struct HandlerEntry {
    id: Uuid,
    handler: Arc<dyn EventHandler>,
}

struct SubscriberInner {
    broker: Arc<dyn Broker>,
    retry: Arc<RetryPolicy>,
    dead_letter_destination: String,
    registry: Arc<RwLock<HashMap<String, Vec<HandlerEntry>>>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    // serializes broker-level subscription setup and teardown
    ops: tokio::sync::Mutex<()>,
}

/// Maps broker-level topic subscriptions to local handler registrations.
///
/// Many handlers may register for the same event type; only the first one
/// triggers the broker `consume` call and only the last one's departure tears
/// it down. The retry and dead-letter policy is enforced here, inside the
/// dispatch loop, so call sites cannot forget it.
#[derive(Clone)]
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
}

/// One handler's registration to one event type.
pub struct Subscription {
    event_type: String,
    id: Uuid,
    inner: Arc<SubscriberInner>,
}

impl Subscription {
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Removes this handler. The broker-level subscription survives while
    /// other handlers for the same event type remain; an in-flight invocation
    /// of this handler is not cancelled.
    pub async fn unsubscribe(self) -> EventHubResult<()> {
        self.inner.remove_handler(&self.event_type, self.id).await
    }
}

impl Subscriber {
    pub fn new(
        broker: Arc<dyn Broker>,
        retry: RetryPolicy,
        dead_letter_destination: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(SubscriberInner {
                broker,
                retry: Arc::new(retry),
                dead_letter_destination: dead_letter_destination.into(),
                registry: Arc::new(RwLock::new(HashMap::new())),
                tasks: Mutex::new(HashMap::new()),
                ops: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Registers `handler` for `event_type`.
    ///
    /// The broker-level subscription is created once per event type and
    /// shared by all local handlers; repeated calls never issue duplicate
    /// broker subscriptions.
    pub async fn subscribe(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) -> EventHubResult<Subscription> {
        let _ops = self.inner.ops.lock().await;

        let id = Uuid::new_v4();
        let first = {
            let mut registry = self.inner.registry.write();
            let entries = registry.entry(event_type.to_owned()).or_default();
            entries.push(HandlerEntry { id, handler });
            entries.len() == 1
        };

        if first {
            match self.inner.broker.subscribe(event_type).await {
                Ok(rx) => {
                    let handle = tokio::spawn(dispatch_loop(
                        DispatchContext {
                            event_type: event_type.to_owned(),
                            broker: Arc::clone(&self.inner.broker),
                            retry: Arc::clone(&self.inner.retry),
                            dead_letter_destination: self
                                .inner
                                .dead_letter_destination
                                .clone(),
                            registry: Arc::clone(&self.inner.registry),
                        },
                        rx,
                    ));
                    self.inner.tasks.lock().insert(event_type.to_owned(), handle);
                    debug!(event_type, "broker subscription established");
                }
                Err(err) => {
                    let mut registry = self.inner.registry.write();
                    if let Some(entries) = registry.get_mut(event_type) {
                        entries.retain(|entry| entry.id != id);
                        if entries.is_empty() {
                            registry.remove(event_type);
                        }
                    }
                    return Err(err);
                }
            }
        }

        Ok(Subscription {
            event_type: event_type.to_owned(),
            id,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Registers the same handler for each event type; each returned
    /// [`Subscription`] can be unsubscribed independently.
    pub async fn subscribe_to_many(
        &self,
        event_types: &[&str],
        handler: Arc<dyn EventHandler>,
    ) -> EventHubResult<Vec<Subscription>> {
        let mut subscriptions = Vec::with_capacity(event_types.len());
        for event_type in event_types {
            subscriptions.push(self.subscribe(event_type, Arc::clone(&handler)).await?);
        }
        Ok(subscriptions)
    }

    /// Removes a handler by identity. The broker-level subscription is torn
    /// down when the last handler for the event type is removed.
    pub async fn unsubscribe(
        &self,
        event_type: &str,
        handler: &Arc<dyn EventHandler>,
    ) -> EventHubResult<()> {
        let id = {
            let registry = self.inner.registry.read();
            registry.get(event_type).and_then(|entries| {
                entries
                    .iter()
                    .find(|entry| Arc::ptr_eq(&entry.handler, handler))
                    .map(|entry| entry.id)
            })
        };
        let Some(id) = id else {
            return Err(EventHubError::UnknownSubscription(event_type.to_owned()));
        };
        self.inner.remove_handler(event_type, id).await
    }

    /// Tears down every broker-level subscription and clears all handlers.
    /// Safe to call repeatedly.
    pub async fn unsubscribe_all(&self) -> EventHubResult<()> {
        let _ops = self.inner.ops.lock().await;

        let event_types: Vec<String> = {
            let mut registry = self.inner.registry.write();
            let keys = registry.keys().cloned().collect();
            registry.clear();
            keys
        };
        for event_type in &event_types {
            if let Err(err) = self.inner.broker.unsubscribe(event_type).await {
                warn!(%err, event_type, "failed to tear down broker subscription");
            }
        }
        self.inner.tasks.lock().clear();
        Ok(())
    }

    /// Event types with at least one locally registered handler, sorted.
    pub fn active_subscriptions(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .inner
            .registry
            .read()
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(event_type, _)| event_type.clone())
            .collect();
        types.sort();
        types
    }
}

impl SubscriberInner {
    async fn remove_handler(&self, event_type: &str, id: Uuid) -> EventHubResult<()> {
        let _ops = self.ops.lock().await;

        let teardown = {
            let mut registry = self.registry.write();
            let Some(entries) = registry.get_mut(event_type) else {
                return Err(EventHubError::UnknownSubscription(event_type.to_owned()));
            };
            let before = entries.len();
            entries.retain(|entry| entry.id != id);
            if entries.len() == before {
                return Err(EventHubError::UnknownSubscription(event_type.to_owned()));
            }
            if entries.is_empty() {
                registry.remove(event_type);
                true
            } else {
                false
            }
        };

        if teardown {
            self.broker.unsubscribe(event_type).await?;
            // the dispatch loop ends on its own once the delivery channel
            // closes
            self.tasks.lock().remove(event_type);
            debug!(event_type, "broker subscription torn down");
        }
        Ok(())
    }
}

struct DispatchContext {
    event_type: String,
    broker: Arc<dyn Broker>,
    retry: Arc<RetryPolicy>,
    dead_letter_destination: String,
    registry: Arc<RwLock<HashMap<String, Vec<HandlerEntry>>>>,
}

async fn dispatch_loop(ctx: DispatchContext, mut rx: mpsc::Receiver<Delivery>) {
    while let Some(delivery) = rx.recv().await {
        handle_delivery(&ctx, delivery).await;
    }
    debug!(event_type = %ctx.event_type, "dispatch loop ended");
}

/// Decodes one delivery, fans it out and settles it. Handler errors are
/// contained here; nothing escapes into the loop.
async fn handle_delivery(ctx: &DispatchContext, delivery: Delivery) {
    let envelope = match envelope::decode(delivery.payload()) {
        Ok(envelope) => envelope,
        Err(err) => {
            // poison message: not worth retrying
            error!(
                %err,
                event_type = %ctx.event_type,
                "rejecting undecodable message without requeue"
            );
            if let Err(err) = delivery.reject(false).await {
                error!(%err, "failed to reject poison message");
            }
            return;
        }
    };

    let handlers: Vec<Arc<dyn EventHandler>> = ctx
        .registry
        .read()
        .get(&ctx.event_type)
        .map(|entries| entries.iter().map(|e| Arc::clone(&e.handler)).collect())
        .unwrap_or_default();

    if handlers.is_empty() {
        // everyone unsubscribed while this message was in flight
        if let Err(err) = delivery.reject(true).await {
            error!(%err, id = %envelope.id, "failed to requeue unhandled message");
        }
        return;
    }

    // handlers run concurrently; every outcome is awaited before the
    // ack/nack decision
    let results = join_all(handlers.iter().map(|handler| handler.handle(&envelope))).await;
    let mut failures = Vec::new();
    for (index, result) in results.into_iter().enumerate() {
        if let Err(err) = result {
            error!(
                id = %envelope.id,
                event_type = %envelope.event_type,
                handler = index,
                %err,
                "event handler failed"
            );
            failures.push(err.to_string());
        }
    }

    if failures.is_empty() {
        ctx.retry.resolve(envelope.id);
        if let Err(err) = delivery.ack().await {
            error!(%err, id = %envelope.id, "failed to ack delivery");
        }
        return;
    }

    match ctx.retry.on_failure(envelope.id) {
        FailureAction::Requeue { attempt } => {
            warn!(
                id = %envelope.id,
                event_type = %envelope.event_type,
                attempt,
                max_retries = ctx.retry.max_retries(),
                "handler failure, requeueing for redelivery"
            );
            if let Err(err) = delivery.reject(true).await {
                error!(%err, id = %envelope.id, "failed to requeue delivery");
            }
        }
        FailureAction::DeadLetter { attempts } => {
            dead_letter(ctx, &envelope, delivery, &failures.join("; "), attempts).await;
        }
    }
}

/// Publishes the exhausted message to the dead-letter destination and acks
/// the original so it is not redelivered again. If dead-lettering itself
/// fails the original is requeued instead, never dropped.
async fn dead_letter(
    ctx: &DispatchContext,
    envelope: &Envelope,
    delivery: Delivery,
    last_error: &str,
    attempts: u32,
) {
    let payload =
        match DeadLetter::build(delivery.payload(), &envelope.event_type, last_error, attempts) {
            Ok(payload) => payload,
            Err(err) => {
                error!(%err, id = %envelope.id, "failed to build dead letter, requeueing original");
                if let Err(err) = delivery.reject(true).await {
                    error!(%err, id = %envelope.id, "failed to requeue delivery");
                }
                return;
            }
        };

    match ctx.broker.publish(&ctx.dead_letter_destination, payload).await {
        Ok(()) => {
            warn!(
                id = %envelope.id,
                event_type = %envelope.event_type,
                attempts,
                destination = %ctx.dead_letter_destination,
                "retries exhausted, message dead-lettered"
            );
            ctx.retry.resolve(envelope.id);
            if let Err(err) = delivery.ack().await {
                error!(%err, id = %envelope.id, "failed to ack dead-lettered delivery");
            }
        }
        Err(err) => {
            error!(%err, id = %envelope.id, "failed to publish dead letter, requeueing original");
            if let Err(err) = delivery.reject(true).await {
                error!(%err, id = %envelope.id, "failed to requeue delivery");
            }
        }
    }
}
