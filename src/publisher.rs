use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

use crate::{
    broker::Broker,
    envelope::{self, Envelope},
    error::{EventHubError, EventHubResult},
    history::EventHistory,
};

/// One logical event in a batch publish.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub event_type: String,
    pub data: Value,
    pub correlation_id: Option<String>,
}

impl EventDraft {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Turns logical events into wire envelopes and pushes them to the broker.
///
/// Publish calls are awaited until the broker accepts the write; failures are
/// surfaced to the caller instead of being silently retried, so backpressure
/// is never masked.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    source: String,
    history: Arc<Mutex<EventHistory>>,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, source: impl Into<String>, max_history_size: usize) -> Self {
        Self {
            broker,
            source: source.into(),
            history: Arc::new(Mutex::new(EventHistory::new(max_history_size))),
        }
    }

    /// Publishes one event to its routing key.
    ///
    /// # Errors
    /// `EventHubError::MalformedEvent` if `data` is not a JSON object;
    /// broker-side failures surface as `EventHubError::Publish` or
    /// `EventHubError::NotConnected` depending on the disconnected policy.
    pub async fn publish(
        &self,
        event_type: &str,
        data: Value,
        correlation_id: Option<String>,
    ) -> EventHubResult<()> {
        let envelope = Envelope::new(
            event_type,
            into_object(data)?,
            self.source.clone(),
            correlation_id,
        );
        let bytes = envelope::encode(&envelope)?;

        self.broker.publish(event_type, bytes).await?;
        debug!(id = %envelope.id, event_type, "event published");
        self.history.lock().push(envelope);
        Ok(())
    }

    /// Publishes a batch over one pipelined send, preserving input order.
    /// Every draft gets its own fresh envelope id.
    ///
    /// # Errors
    /// `EventHubError::PublishBatch` names the indices the broker failed to
    /// accept; the remaining entries were sent.
    pub async fn publish_batch(&self, drafts: Vec<EventDraft>) -> EventHubResult<()> {
        let mut envelopes = Vec::with_capacity(drafts.len());
        let mut messages = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let envelope = Envelope::new(
                draft.event_type.clone(),
                into_object(draft.data)?,
                self.source.clone(),
                draft.correlation_id,
            );
            messages.push((draft.event_type, envelope::encode(&envelope)?));
            envelopes.push(envelope);
        }

        let outcome = self.broker.publish_batch(messages).await;

        let failed: Vec<usize> = match &outcome {
            Ok(()) => Vec::new(),
            Err(EventHubError::PublishBatch { failed }) => failed.clone(),
            Err(_) => {
                // nothing was accepted; record nothing
                return outcome;
            }
        };
        let mut history = self.history.lock();
        for (index, envelope) in envelopes.into_iter().enumerate() {
            if !failed.contains(&index) {
                history.push(envelope);
            }
        }
        drop(history);

        outcome
    }

    /// Identifier stamped as the envelope source.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Recently published envelopes, oldest first, bounded by the configured
    /// history size.
    pub fn history(&self) -> Vec<Envelope> {
        self.history.lock().recent()
    }
}

fn into_object(data: Value) -> EventHubResult<Map<String, Value>> {
    match data {
        Value::Object(map) => Ok(map),
        other => Err(EventHubError::MalformedEvent(format!(
            "event data must be a JSON object, got {other}"
        ))),
    }
}
