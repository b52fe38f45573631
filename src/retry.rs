//! Bounded retry with dead-lettering.
//!
//! Brokers do not carry a first-class attempt count across redeliveries, so
//! attempts are tracked here in an in-memory map keyed by envelope id. The
//! map is cleaned up on terminal outcomes (acked or dead-lettered); entries
//! abandoned by a consumer crash are reclaimed by process restart.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{EventHubError, EventHubResult};

/// Decision for one failed delivery.
#[derive(Debug, PartialEq)]
pub enum FailureAction {
    /// Reject with requeue; the broker redelivers the message.
    Requeue { attempt: u32 },
    /// The retry budget is spent; publish to the dead-letter destination and
    /// ack the original.
    DeadLetter { attempts: u32 },
}

/// Tracks per-message delivery attempts against a retry bound.
#[derive(Debug)]
pub struct RetryPolicy {
    max_retries: u32,
    attempts: Mutex<HashMap<Uuid, u32>>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Records a failed delivery of the given envelope and decides what
    /// happens next. A handler that always fails is invoked `max_retries + 1`
    /// times in total before the message is dead-lettered.
    pub fn on_failure(&self, id: Uuid) -> FailureAction {
        let mut attempts = self.attempts.lock();
        let count = attempts.entry(id).or_insert(0);
        *count += 1;
        if *count <= self.max_retries {
            FailureAction::Requeue { attempt: *count }
        } else {
            FailureAction::DeadLetter { attempts: *count }
        }
    }

    /// Clears bookkeeping after a terminal outcome.
    pub fn resolve(&self, id: Uuid) {
        self.attempts.lock().remove(&id);
    }

    /// Number of messages currently mid-retry.
    pub fn tracked(&self) -> usize {
        self.attempts.lock().len()
    }
}

/// Payload published to the dead-letter destination.
///
/// The original envelope is embedded byte-for-byte so operators can inspect
/// or replay it without the hub retaining any extra state.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// Routing key the message originally travelled under
    pub routing_key: String,
    /// Error text from the last failed delivery
    pub last_error: String,
    /// Total failed delivery attempts
    pub attempt_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
    /// The original envelope, verbatim
    pub envelope: Box<RawValue>,
}

impl DeadLetter {
    /// Wraps the original wire bytes with failure metadata.
    pub fn build(
        original: &[u8],
        routing_key: &str,
        last_error: &str,
        attempt_count: u32,
    ) -> EventHubResult<Vec<u8>> {
        let raw = std::str::from_utf8(original)
            .map_err(|err| EventHubError::MalformedEvent(err.to_string()))?;
        let envelope = RawValue::from_string(raw.to_owned())
            .map_err(|err| EventHubError::MalformedEvent(err.to_string()))?;
        let dead_letter = DeadLetter {
            routing_key: routing_key.to_owned(),
            last_error: last_error.to_owned(),
            attempt_count,
            dead_lettered_at: Utc::now(),
            envelope,
        };
        serde_json::to_vec(&dead_letter)
            .map_err(|err| EventHubError::MalformedEvent(err.to_string()))
    }
}
