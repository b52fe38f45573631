//! The canonical event envelope and its JSON codec.
//!
//! Every event crossing the broker boundary is wrapped in an [`Envelope`]
//! carrying identity, timing and provenance metadata next to the opaque
//! payload. Payload schemas are owned by producers and consumers, not by the
//! hub.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

use crate::error::{EventHubError, EventHubResult};

/// The unit of transport.
///
/// Envelopes are immutable after construction; the history buffer and the
/// dispatch path hand out clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique identifier, generated at publish time
    pub id: Uuid,
    /// Routing key, e.g. "auth:login"; also the local dispatch key
    #[serde(rename = "type")]
    pub event_type: String,
    /// Creation time, monotonic non-decreasing per publishing process
    pub timestamp: DateTime<Utc>,
    /// Identifier of the producing service
    pub source: String,
    /// Opaque payload owned by producers/consumers
    pub data: Map<String, Value>,
    /// Propagates a causal chain across events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Envelope {
    /// Builds an envelope with a fresh id and a clamped-monotonic timestamp.
    pub fn new(
        event_type: impl Into<String>,
        data: Map<String, Value>,
        source: impl Into<String>,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            timestamp: monotonic_now(),
            source: source.into(),
            data,
            correlation_id,
        }
    }
}

/// Serializes an envelope into its wire bytes.
pub fn encode(envelope: &Envelope) -> EventHubResult<Vec<u8>> {
    serde_json::to_vec(envelope).map_err(|err| EventHubError::MalformedEvent(err.to_string()))
}

/// Decodes wire bytes into an envelope.
///
/// # Errors
/// `EventHubError::MalformedEvent` if the bytes are not valid envelope JSON
/// (missing required fields, wrong types). Callers treat this as a poison
/// message: it is rejected without requeue, never retried.
pub fn decode(bytes: &[u8]) -> EventHubResult<Envelope> {
    serde_json::from_slice(bytes).map_err(|err| EventHubError::MalformedEvent(err.to_string()))
}

// Last timestamp handed out, in milliseconds since the epoch. Keeps stamps
// non-decreasing within this process even if the OS clock steps backwards.
static LAST_TIMESTAMP_MS: AtomicI64 = AtomicI64::new(0);

fn monotonic_now() -> DateTime<Utc> {
    let now = Utc::now().timestamp_millis();
    let mut prev = LAST_TIMESTAMP_MS.load(Ordering::SeqCst);
    loop {
        let stamped = now.max(prev);
        match LAST_TIMESTAMP_MS.compare_exchange(prev, stamped, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                return DateTime::from_timestamp_millis(stamped).unwrap_or_else(Utc::now);
            }
            Err(observed) => prev = observed,
        }
    }
}
