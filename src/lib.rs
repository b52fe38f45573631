// Expose the modules
pub mod broker;
pub mod config;
pub mod envelope;
pub mod error;
pub mod event_types;
pub mod history;
pub mod hub;
pub mod publisher;
pub mod retry;
pub mod subscriber;

// Re-export key types for easier usage
pub use broker::{AmqpBroker, Broker, Delivery, MemoryBroker};
pub use config::{DisconnectedPolicy, EventHubConfig};
pub use envelope::Envelope;
pub use error::{EventHubError, EventHubResult};
pub use history::EventHistory;
pub use hub::EventHub;
pub use publisher::{EventDraft, Publisher};
pub use retry::{DeadLetter, RetryPolicy};
pub use subscriber::{EventHandler, Subscriber, Subscription, handler_fn};

pub use amqp_transport::ReconnectPolicy;
