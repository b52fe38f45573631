//! In-process broker used by tests and single-process deployments.
//!
//! Each routing key owns a FIFO queue. A pump task per active consumer pops
//! messages and hands them out with at most `prefetch` unacknowledged
//! deliveries in flight; a rejected-with-requeue (or dropped-undecided)
//! delivery goes back to the front of its queue, so prefetch=1 consumers see
//! strict per-key ordering even across redeliveries.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{
    select,
    sync::{Notify, OwnedSemaphorePermit, Semaphore, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    broker::{Acknowledger, Broker, Delivery},
    error::{EventHubError, EventHubResult},
};

struct Topic {
    queue: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
}

impl Topic {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn push_back(&self, payload: Vec<u8>) {
        self.queue.lock().push_back(payload);
        self.notify.notify_one();
    }

    fn push_front(&self, payload: Vec<u8>) {
        self.queue.lock().push_front(payload);
        self.notify.notify_one();
    }
}

struct Pump {
    token: CancellationToken,
    _handle: JoinHandle<()>,
}

/// Topic-keyed in-process broker with acknowledgement semantics.
pub struct MemoryBroker {
    prefetch: usize,
    topics: Mutex<HashMap<String, Arc<Topic>>>,
    pumps: Mutex<HashMap<String, Pump>>,
    closed: AtomicBool,
}

impl MemoryBroker {
    /// Creates a broker delivering at most `prefetch` unacknowledged messages
    /// per routing key. Prefetch of 1 gives strict per-key FIFO ordering.
    pub fn new(prefetch: u16) -> Self {
        Self {
            prefetch: usize::from(prefetch).max(1),
            topics: Mutex::new(HashMap::new()),
            pumps: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn topic(&self, routing_key: &str) -> Arc<Topic> {
        Arc::clone(
            self.topics
                .lock()
                .entry(routing_key.to_owned())
                .or_insert_with(|| Arc::new(Topic::new())),
        )
    }

    fn ensure_open(&self) -> EventHubResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventHubError::ConnectionClosing);
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, routing_key: &str, payload: Vec<u8>) -> EventHubResult<()> {
        self.ensure_open()?;
        self.topic(routing_key).push_back(payload);
        Ok(())
    }

    async fn publish_batch(&self, messages: Vec<(String, Vec<u8>)>) -> EventHubResult<()> {
        self.ensure_open()?;
        for (routing_key, payload) in messages {
            self.topic(&routing_key).push_back(payload);
        }
        Ok(())
    }

    async fn subscribe(&self, routing_key: &str) -> EventHubResult<mpsc::Receiver<Delivery>> {
        self.ensure_open()?;
        let topic = self.topic(routing_key);

        let mut pumps = self.pumps.lock();
        if pumps.contains_key(routing_key) {
            return Err(EventHubError::Subscribe(format!(
                "consumer already active for {routing_key}"
            )));
        }

        let (tx, rx) = mpsc::channel(self.prefetch);
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_pump(
            topic,
            routing_key.to_owned(),
            self.prefetch,
            tx,
            token.clone(),
        ));
        pumps.insert(
            routing_key.to_owned(),
            Pump {
                token,
                _handle: handle,
            },
        );
        Ok(rx)
    }

    async fn unsubscribe(&self, routing_key: &str) -> EventHubResult<()> {
        if let Some(pump) = self.pumps.lock().remove(routing_key) {
            pump.token.cancel();
            debug!(routing_key, "consumer stopped");
        }
        Ok(())
    }

    async fn close(&self) -> EventHubResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for (_, pump) in self.pumps.lock().drain() {
            pump.token.cancel();
        }
        Ok(())
    }
}

async fn run_pump(
    topic: Arc<Topic>,
    routing_key: String,
    prefetch: usize,
    tx: mpsc::Sender<Delivery>,
    token: CancellationToken,
) {
    let slots = Arc::new(Semaphore::new(prefetch));
    loop {
        let permit = select! {
            _ = token.cancelled() => break,
            permit = Arc::clone(&slots).acquire_owned() => {
                let Ok(permit) = permit else { break };
                permit
            }
        };

        let payload = select! {
            _ = token.cancelled() => break,
            payload = next_payload(&topic) => payload,
        };

        let ack = Box::new(MemoryAcknowledger {
            topic: Arc::clone(&topic),
            state: Mutex::new(Some(AckState { payload: payload.clone(), _permit: permit })),
        });
        let delivery = Delivery::new(routing_key.clone(), payload, ack);

        select! {
            // dropping the un-sent delivery requeues it via the acknowledger
            _ = token.cancelled() => break,
            sent = tx.send(delivery) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}

async fn next_payload(topic: &Topic) -> Vec<u8> {
    loop {
        if let Some(payload) = topic.queue.lock().pop_front() {
            return payload;
        }
        topic.notify.notified().await;
    }
}

struct AckState {
    payload: Vec<u8>,
    _permit: OwnedSemaphorePermit,
}

struct MemoryAcknowledger {
    topic: Arc<Topic>,
    state: Mutex<Option<AckState>>,
}

#[async_trait]
impl Acknowledger for MemoryAcknowledger {
    async fn ack(&self) -> EventHubResult<()> {
        self.state.lock().take();
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> EventHubResult<()> {
        if let Some(state) = self.state.lock().take()
            && requeue
        {
            self.topic.push_front(state.payload);
        }
        Ok(())
    }
}

impl Drop for MemoryAcknowledger {
    fn drop(&mut self) {
        // an undecided delivery is treated as requeued, preserving
        // at-least-once semantics when a consumer goes away mid-flight
        if let Some(state) = self.state.lock().take() {
            self.topic.push_front(state.payload);
        }
    }
}
