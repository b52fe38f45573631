use amqp_transport::TransportError;

/// Result alias used across the hub.
pub type EventHubResult<T> = Result<T, EventHubError>;

/// Error types for event hub operations
#[derive(Debug, thiserror::Error)]
pub enum EventHubError {
    /// The broker could not be reached after exhausting the reconnect policy
    #[error("broker connection failed: {0}")]
    Connect(String),
    /// A publish or subscribe call was attempted while disconnected and the
    /// disconnected policy is fail-fast
    #[error("not connected to the broker")]
    NotConnected,
    /// The hub is shutting down; outstanding operations fail fast
    #[error("connection is closing")]
    ConnectionClosing,
    /// Received bytes could not be decoded into a valid envelope
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    /// A registered handler failed; contained by the retry policy
    #[error("event handler failed: {0}")]
    Handler(String),
    /// The broker rejected or failed to confirm a publish
    #[error("publish failed: {0}")]
    Publish(String),
    /// A batch publish partially failed; indices refer to the input order
    #[error("batch publish failed at indices {failed:?}")]
    PublishBatch { failed: Vec<usize> },
    /// Establishing a broker-level subscription failed
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    /// Unsubscribe was called for a handler that is not registered
    #[error("no active subscription for event type {0}")]
    UnknownSubscription(String),
    /// Any other broker-level failure (channel setup, acknowledgement, close)
    #[error("broker operation failed: {0}")]
    Broker(String),
}

impl From<TransportError> for EventHubError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotConnected => Self::NotConnected,
            TransportError::Uri(msg) | TransportError::Connect(msg) => Self::Connect(msg),
            TransportError::Consume(msg) => Self::Subscribe(msg),
            TransportError::Publish(msg) => Self::Publish(msg),
            other => Self::Broker(other.to_string()),
        }
    }
}
