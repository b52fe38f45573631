use event_hub::{
    Broker, DeadLetter, Envelope, EventDraft, EventHub, EventHubConfig, EventHubError,
    MemoryBroker, event_types, handler_fn,
};
use parking_lot::Mutex;
use serde_json::json;
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::time::{sleep, timeout};
use uuid::Uuid;

const SETTLE: Duration = Duration::from_millis(150);

fn test_config() -> EventHubConfig {
    EventHubConfig {
        source: "test-shell".to_owned(),
        ..EventHubConfig::default()
    }
}

fn memory_hub(prefetch: u16, max_retries: u32) -> (EventHub, Arc<MemoryBroker>, EventHubConfig) {
    let config = EventHubConfig {
        max_retries,
        prefetch,
        ..test_config()
    };
    let broker = Arc::new(MemoryBroker::new(prefetch));
    let hub = EventHub::with_broker(broker.clone(), &config);
    (hub, broker, config)
}

async fn wait_for(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let result = timeout(deadline, async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    result.is_ok()
}

fn counting_handler(counter: Arc<AtomicUsize>) -> Arc<dyn event_hub::EventHandler> {
    handler_fn(move |_event| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

#[test_log::test(tokio::test)]
async fn fan_out_invokes_every_handler_exactly_once() {
    let (hub, _broker, _config) = memory_hub(1, 3);

    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    hub.subscriber()
        .subscribe(event_types::PAYMENTS_COMPLETED, counting_handler(Arc::clone(&first)))
        .await
        .unwrap();
    hub.subscriber()
        .subscribe(event_types::PAYMENTS_COMPLETED, counting_handler(Arc::clone(&second)))
        .await
        .unwrap();

    hub.publisher()
        .publish(event_types::PAYMENTS_COMPLETED, json!({"amount": 10}), None)
        .await
        .unwrap();

    assert!(
        wait_for(Duration::from_secs(1), || {
            first.load(Ordering::SeqCst) == 1 && second.load(Ordering::SeqCst) == 1
        })
        .await
    );

    // no duplicate deliveries afterwards
    sleep(SETTLE).await;
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

#[test_log::test(tokio::test)]
async fn failing_handler_does_not_prevent_the_other_from_running() {
    // zero retries: the single delivery is dead-lettered immediately, so
    // each handler runs exactly once
    let (hub, _broker, _config) = memory_hub(1, 0);

    let succeeded = Arc::new(AtomicUsize::new(0));
    hub.subscriber()
        .subscribe(
            event_types::AUTH_LOGIN,
            handler_fn(|_event| async move { anyhow::bail!("handler one always fails") }),
        )
        .await
        .unwrap();
    hub.subscriber()
        .subscribe(event_types::AUTH_LOGIN, counting_handler(Arc::clone(&succeeded)))
        .await
        .unwrap();

    hub.publisher()
        .publish(event_types::AUTH_LOGIN, json!({"user": "u1"}), None)
        .await
        .unwrap();

    assert!(wait_for(Duration::from_secs(1), || succeeded.load(Ordering::SeqCst) == 1).await);
    sleep(SETTLE).await;
    assert_eq!(succeeded.load(Ordering::SeqCst), 1);
}

#[test_log::test(tokio::test)]
async fn reference_counting_keeps_the_subscription_until_the_last_handler_leaves() {
    let (hub, _broker, _config) = memory_hub(1, 3);
    let event_type = event_types::ADMIN_USER_UPDATED;

    let a = Arc::new(AtomicUsize::new(0));
    let b = Arc::new(AtomicUsize::new(0));
    let sub_a = hub
        .subscriber()
        .subscribe(event_type, counting_handler(Arc::clone(&a)))
        .await
        .unwrap();
    let sub_b = hub
        .subscriber()
        .subscribe(event_type, counting_handler(Arc::clone(&b)))
        .await
        .unwrap();

    hub.publisher()
        .publish(event_type, json!({"seq": 1}), None)
        .await
        .unwrap();
    assert!(
        wait_for(Duration::from_secs(1), || {
            a.load(Ordering::SeqCst) == 1 && b.load(Ordering::SeqCst) == 1
        })
        .await
    );

    // removing one handler leaves the broker-level subscription active
    sub_a.unsubscribe().await.unwrap();
    assert_eq!(hub.subscriber().active_subscriptions(), vec![event_type.to_owned()]);

    hub.publisher()
        .publish(event_type, json!({"seq": 2}), None)
        .await
        .unwrap();
    assert!(wait_for(Duration::from_secs(1), || b.load(Ordering::SeqCst) == 2).await);
    assert_eq!(a.load(Ordering::SeqCst), 1);

    // removing the last handler tears it down
    sub_b.unsubscribe().await.unwrap();
    assert!(hub.subscriber().active_subscriptions().is_empty());

    hub.publisher()
        .publish(event_type, json!({"seq": 3}), None)
        .await
        .unwrap();
    sleep(SETTLE).await;
    assert_eq!(b.load(Ordering::SeqCst), 2);
}

#[test_log::test(tokio::test)]
async fn always_failing_handler_is_retried_then_dead_lettered_exactly_once() {
    let max_retries = 3;
    let (hub, broker, config) = memory_hub(1, max_retries);

    // raw tap on the dead-letter destination
    let mut dead_letters = broker
        .subscribe(&config.dead_letter_destination)
        .await
        .unwrap();

    let invocations = Arc::new(AtomicUsize::new(0));
    let seen_id: Arc<Mutex<Option<Uuid>>> = Arc::new(Mutex::new(None));
    {
        let invocations = Arc::clone(&invocations);
        let seen_id = Arc::clone(&seen_id);
        hub.subscriber()
            .subscribe(
                event_types::PAYMENTS_FAILED,
                handler_fn(move |event| {
                    let invocations = Arc::clone(&invocations);
                    let seen_id = Arc::clone(&seen_id);
                    async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        *seen_id.lock() = Some(event.id);
                        anyhow::bail!("cannot settle payment")
                    }
                }),
            )
            .await
            .unwrap();
    }

    hub.publisher()
        .publish(event_types::PAYMENTS_FAILED, json!({"payment": "p1"}), None)
        .await
        .unwrap();

    // initial delivery plus max_retries redeliveries
    let expected = max_retries as usize + 1;
    assert!(wait_for(Duration::from_secs(2), || {
        invocations.load(Ordering::SeqCst) == expected
    })
    .await);

    let delivery = timeout(Duration::from_secs(1), dead_letters.recv())
        .await
        .expect("dead letter within timeout")
        .expect("dead letter delivery");
    let dead_letter: DeadLetter = serde_json::from_slice(delivery.payload()).unwrap();
    delivery.ack().await.unwrap();

    assert_eq!(dead_letter.routing_key, event_types::PAYMENTS_FAILED);
    assert_eq!(dead_letter.attempt_count, max_retries + 1);
    assert!(dead_letter.last_error.contains("cannot settle payment"));

    // the original envelope is embedded byte-for-byte and replayable
    let embedded: Envelope =
        serde_json::from_str(dead_letter.envelope.get()).expect("embedded envelope decodes");
    assert_eq!(Some(embedded.id), *seen_id.lock());
    assert_eq!(embedded.event_type, event_types::PAYMENTS_FAILED);

    // no further redeliveries and no second dead letter
    sleep(SETTLE).await;
    assert_eq!(invocations.load(Ordering::SeqCst), expected);
    assert!(
        timeout(SETTLE, dead_letters.recv()).await.is_err(),
        "message must be dead-lettered exactly once"
    );
}

#[test_log::test(tokio::test)]
async fn prefetch_one_preserves_publish_order() {
    let (hub, _broker, _config) = memory_hub(1, 3);

    let received: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let received = Arc::clone(&received);
        hub.subscriber()
            .subscribe(
                event_types::PAYMENTS_CREATED,
                handler_fn(move |event| {
                    let received = Arc::clone(&received);
                    async move {
                        let seq = event
                            .data
                            .get("seq")
                            .and_then(|v| v.as_u64())
                            .expect("seq field");
                        received.lock().push(seq);
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();
    }

    for seq in 0..100u64 {
        hub.publisher()
            .publish(event_types::PAYMENTS_CREATED, json!({"seq": seq}), None)
            .await
            .unwrap();
    }

    assert!(wait_for(Duration::from_secs(2), || received.lock().len() == 100).await);
    let received = received.lock();
    assert_eq!(*received, (0..100u64).collect::<Vec<_>>());
}

#[test_log::test(tokio::test)]
async fn history_is_bounded_to_the_most_recent_events() {
    let config = EventHubConfig {
        max_history_size: 10,
        ..test_config()
    };
    let broker = Arc::new(MemoryBroker::new(1));
    let hub = EventHub::with_broker(broker, &config);

    for seq in 0..15u64 {
        hub.publisher()
            .publish(event_types::SYSTEM_HEALTH, json!({"seq": seq}), None)
            .await
            .unwrap();
    }

    let history = hub.publisher().history();
    assert_eq!(history.len(), 10);
    let sequences: Vec<u64> = history
        .iter()
        .map(|envelope| envelope.data["seq"].as_u64().unwrap())
        .collect();
    // most recent entries, oldest first
    assert_eq!(sequences, (5..15u64).collect::<Vec<_>>());
}

#[test_log::test(tokio::test)]
async fn login_event_reaches_the_handler_with_payload_and_source() {
    let (hub, _broker, _config) = memory_hub(1, 3);

    let captured: Arc<Mutex<Option<Envelope>>> = Arc::new(Mutex::new(None));
    {
        let captured = Arc::clone(&captured);
        hub.subscriber()
            .subscribe(
                event_types::AUTH_LOGIN,
                handler_fn(move |event| {
                    let captured = Arc::clone(&captured);
                    async move {
                        *captured.lock() = Some(event);
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();
    }

    let payload = json!({
        "user": {"id": "u1"},
        "accessToken": "t1",
        "refreshToken": "r1"
    });
    hub.publisher()
        .publish(event_types::AUTH_LOGIN, payload.clone(), None)
        .await
        .unwrap();

    assert!(wait_for(Duration::from_millis(200), || captured.lock().is_some()).await);
    let envelope = captured.lock().clone().unwrap();
    assert_eq!(serde_json::Value::Object(envelope.data.clone()), payload);
    assert_eq!(envelope.source, "test-shell");
    assert_eq!(envelope.correlation_id, None);
}

#[test_log::test(tokio::test)]
async fn unsubscribed_handler_receives_nothing() {
    let (hub, _broker, _config) = memory_hub(1, 3);

    let calls = Arc::new(AtomicUsize::new(0));
    let subscription = hub
        .subscriber()
        .subscribe(event_types::PAYMENTS_CREATED, counting_handler(Arc::clone(&calls)))
        .await
        .unwrap();
    subscription.unsubscribe().await.unwrap();

    hub.publisher()
        .publish(event_types::PAYMENTS_CREATED, json!({"seq": 1}), None)
        .await
        .unwrap();

    sleep(SETTLE).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test_log::test(tokio::test)]
async fn batch_publish_preserves_order_and_generates_fresh_ids() {
    let (hub, _broker, _config) = memory_hub(1, 3);

    let received: Arc<Mutex<Vec<Envelope>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let received = Arc::clone(&received);
        hub.subscriber()
            .subscribe(
                event_types::PAYMENTS_CREATED,
                handler_fn(move |event| {
                    let received = Arc::clone(&received);
                    async move {
                        received.lock().push(event);
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();
    }

    let drafts = (0..5u64)
        .map(|seq| {
            EventDraft::new(event_types::PAYMENTS_CREATED, json!({"seq": seq}))
                .with_correlation_id("batch-1")
        })
        .collect();
    hub.publisher().publish_batch(drafts).await.unwrap();

    assert!(wait_for(Duration::from_secs(1), || received.lock().len() == 5).await);
    let received = received.lock();

    let sequences: Vec<u64> = received
        .iter()
        .map(|envelope| envelope.data["seq"].as_u64().unwrap())
        .collect();
    assert_eq!(sequences, vec![0, 1, 2, 3, 4]);

    let mut ids: Vec<Uuid> = received.iter().map(|envelope| envelope.id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 5, "every batch entry gets its own id");

    for envelope in received.iter() {
        assert_eq!(envelope.correlation_id.as_deref(), Some("batch-1"));
    }
}

#[test_log::test(tokio::test)]
async fn undecodable_message_is_dropped_without_stopping_the_stream() {
    let (hub, broker, _config) = memory_hub(1, 3);

    let calls = Arc::new(AtomicUsize::new(0));
    hub.subscriber()
        .subscribe(event_types::AUTH_LOGIN, counting_handler(Arc::clone(&calls)))
        .await
        .unwrap();

    // poison bytes straight onto the wire, then a valid event
    broker
        .publish(event_types::AUTH_LOGIN, b"not json at all".to_vec())
        .await
        .unwrap();
    hub.publisher()
        .publish(event_types::AUTH_LOGIN, json!({"user": "u2"}), None)
        .await
        .unwrap();

    assert!(wait_for(Duration::from_secs(1), || calls.load(Ordering::SeqCst) == 1).await);
    sleep(SETTLE).await;
    // the poison message was rejected without requeue, not retried
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test_log::test(tokio::test)]
async fn subscribe_to_many_returns_independent_subscriptions() {
    let (hub, _broker, _config) = memory_hub(1, 3);

    let calls = Arc::new(AtomicUsize::new(0));
    let handler = counting_handler(Arc::clone(&calls));
    let subscriptions = hub
        .subscriber()
        .subscribe_to_many(
            &[event_types::AUTH_LOGIN, event_types::AUTH_LOGOUT],
            handler,
        )
        .await
        .unwrap();
    assert_eq!(subscriptions.len(), 2);
    assert_eq!(
        hub.subscriber().active_subscriptions(),
        vec![
            event_types::AUTH_LOGIN.to_owned(),
            event_types::AUTH_LOGOUT.to_owned()
        ]
    );

    let mut subscriptions = subscriptions.into_iter();
    subscriptions.next().unwrap().unsubscribe().await.unwrap();
    assert_eq!(
        hub.subscriber().active_subscriptions(),
        vec![event_types::AUTH_LOGOUT.to_owned()]
    );

    hub.publisher()
        .publish(event_types::AUTH_LOGOUT, json!({}), None)
        .await
        .unwrap();
    assert!(wait_for(Duration::from_secs(1), || calls.load(Ordering::SeqCst) == 1).await);
}

#[test_log::test(tokio::test)]
async fn unsubscribe_all_is_safe_to_call_repeatedly() {
    let (hub, _broker, _config) = memory_hub(1, 3);

    let calls = Arc::new(AtomicUsize::new(0));
    hub.subscriber()
        .subscribe(event_types::AUTH_LOGIN, counting_handler(Arc::clone(&calls)))
        .await
        .unwrap();
    hub.subscriber()
        .subscribe(event_types::PAYMENTS_CREATED, counting_handler(Arc::clone(&calls)))
        .await
        .unwrap();

    hub.subscriber().unsubscribe_all().await.unwrap();
    hub.subscriber().unsubscribe_all().await.unwrap();
    assert!(hub.subscriber().active_subscriptions().is_empty());

    hub.publisher()
        .publish(event_types::AUTH_LOGIN, json!({}), None)
        .await
        .unwrap();
    sleep(SETTLE).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test_log::test(tokio::test)]
async fn operations_after_close_fail_fast() {
    let (hub, _broker, _config) = memory_hub(1, 3);

    hub.close().await.unwrap();
    // idempotent
    hub.close().await.unwrap();

    let result = hub
        .publisher()
        .publish(event_types::AUTH_LOGIN, json!({}), None)
        .await;
    assert!(matches!(result, Err(EventHubError::ConnectionClosing)));

    let calls = Arc::new(AtomicUsize::new(0));
    let result = hub
        .subscriber()
        .subscribe(event_types::AUTH_LOGIN, counting_handler(calls))
        .await;
    assert!(matches!(result, Err(EventHubError::ConnectionClosing)));
}
