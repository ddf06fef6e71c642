// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! End-to-end behaviour of the client against the in-memory mock driver:
//! connect and failover, circuit breaking, pool limits, publish confirms,
//! consumer pipelines and shutdown.

use async_trait::async_trait;
use rabbitmq_resilient::client::RabbitMQClient;
use rabbitmq_resilient::config::{BreakerConfig, ClientConfig, PoolConfig};
use rabbitmq_resilient::consume::{AckActions, ConsumeOptions, HandlerResult, MessageHandler};
use rabbitmq_resilient::driver::Delivery;
use rabbitmq_resilient::events::{Event, EventKind};
use rabbitmq_resilient::mock::{test_delivery, ConnectBehavior, MockDriver, PublishBehavior};
use rabbitmq_resilient::publish::{BatchMessage, PublishOptions};
use rabbitmq_resilient::topology::{DeleteQueueOptions, ExchangeOptions, QueueOptions};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn base_config(urls: &[&str]) -> ClientConfig {
    ClientConfig::new(urls.to_vec()).pool(PoolConfig {
        max_channels: 2,
        acquire_timeout_ms: 500,
    })
}

fn client_with(config: ClientConfig) -> (RabbitMQClient, MockDriver) {
    let driver = MockDriver::new();
    let client = RabbitMQClient::with_driver(config, Arc::new(driver.clone())).unwrap();
    (client, driver)
}

fn recording_events(client: &RabbitMQClient) -> Arc<Mutex<Vec<EventKind>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    client.subscribe(Arc::new(move |event: &Event| {
        sink.lock().unwrap().push(event.kind());
    }));
    seen
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within the deadline");
}

enum HandlerMode {
    Succeed,
    Fail,
    AckThenNack,
}

struct TestHandler {
    mode: HandlerMode,
    payloads: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl TestHandler {
    fn new(mode: HandlerMode) -> (Arc<Self>, Arc<Mutex<Vec<Vec<u8>>>>) {
        let payloads = Arc::new(Mutex::new(Vec::new()));
        (
            Arc::new(TestHandler {
                mode,
                payloads: payloads.clone(),
            }),
            payloads,
        )
    }
}

#[async_trait]
impl MessageHandler for TestHandler {
    async fn handle(&self, delivery: &Delivery, actions: Option<Arc<AckActions>>) -> HandlerResult {
        self.payloads.lock().unwrap().push(delivery.data.clone());
        match self.mode {
            HandlerMode::Succeed => Ok(()),
            HandlerMode::Fail => Err("handler failure".into()),
            HandlerMode::AckThenNack => {
                let actions = actions.expect("manual ack actions expected");
                actions.ack().await?;
                actions.nack(true).await?;
                assert!(actions.is_settled());
                Ok(())
            }
        }
    }
}

#[tokio::test]
async fn single_node_publish_and_consume() {
    let urls = ["amqp://localhost:5672"];
    let (client, driver) = client_with(base_config(&urls).prefetch(1, false));

    client.connect().await.unwrap();

    client
        .assert_exchange("events", &ExchangeOptions::topic().durable())
        .await
        .unwrap();
    client
        .assert_queue(
            "user-events",
            &QueueOptions::new().durable().message_ttl_ms(3_600_000),
        )
        .await
        .unwrap();
    client
        .bind_queue("user-events", "events", "user.*")
        .await
        .unwrap();

    client
        .publish(
            "events",
            "user.created",
            b"{\"id\":1}",
            PublishOptions::new().persistent(),
        )
        .await
        .unwrap();
    assert_eq!(client.metrics().messages_sent, 1);

    let default_channel = driver.last_connection().unwrap().channels()[0].clone();
    assert_eq!(default_channel.qos_calls(), vec![(1, false)]);
    assert_eq!(default_channel.declared_exchanges(), vec!["events"]);
    assert!(default_channel
        .bindings()
        .contains(&("user-events".into(), "events".into(), "user.*".into())));

    let recorded = default_channel.publishes();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].exchange, "events");
    assert_eq!(recorded[0].routing_key, "user.created");
    assert!(recorded[0].options.persistent);

    let (handler, payloads) = TestHandler::new(HandlerMode::Succeed);
    let tag = client
        .consume("user-events", handler, ConsumeOptions::new())
        .await
        .unwrap();

    default_channel.push_delivery(&tag, test_delivery(1, "user.created", b"{\"id\":1}"));
    wait_until(|| client.metrics().messages_received == 1).await;

    assert_eq!(payloads.lock().unwrap().as_slice(), [b"{\"id\":1}".to_vec()]);
    assert_eq!(default_channel.acks(), vec![(1, false)]);

    client.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn reconnect_emits_bounded_attempts_then_fails() {
    let urls = ["amqp://node-a:5672", "amqp://node-b:5672"];
    let mut config = base_config(&urls);
    config.reconnect_delay_ms = 1_000;
    config.exponential_backoff = true;
    config.max_reconnect_attempts = 3;
    let (client, driver) = client_with(config);

    for url in urls {
        driver.set_behavior(url, ConnectBehavior::Fail);
    }
    let events = recording_events(&client);

    let err = client.reconnect().await.unwrap_err();
    assert_eq!(err.code(), "RECONNECTION");

    let seen = events.lock().unwrap();
    let reconnecting = seen
        .iter()
        .filter(|kind| **kind == EventKind::Reconnecting)
        .count();
    assert_eq!(reconnecting, 3);
    assert_eq!(*seen.last().unwrap(), EventKind::ReconnectFailed);
}

#[tokio::test]
async fn circuit_breaker_opens_after_threshold_and_skips_the_driver() {
    let urls = ["amqp://bad:1"];
    let mut config = base_config(&urls);
    config.breaker = BreakerConfig {
        failure_threshold: 2,
        reset_timeout_ms: 60_000,
    };
    let (client, driver) = client_with(config);
    driver.set_behavior("amqp://bad:1", ConnectBehavior::Fail);

    assert_eq!(client.connect().await.unwrap_err().code(), "CLUSTER");
    assert_eq!(client.connect().await.unwrap_err().code(), "CLUSTER");
    assert_eq!(driver.connect_attempts().len(), 2);

    let err = client.connect().await.unwrap_err();
    assert_eq!(err.code(), "CIRCUIT_BREAKER_OPEN");
    // The third call never reached the driver.
    assert_eq!(driver.connect_attempts().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn channel_pool_acquisition_times_out_when_exhausted() {
    let urls = ["amqp://localhost:5672"];
    let (client, _driver) = client_with(base_config(&urls));
    client.connect().await.unwrap();

    let first = client.acquire_channel().await.unwrap();
    let second = client.acquire_channel().await.unwrap();

    let started = tokio::time::Instant::now();
    let err = client.acquire_channel().await.unwrap_err();
    let waited = started.elapsed();

    assert_eq!(err.code(), "CHANNEL_ACQUISITION_TIMEOUT");
    assert!(waited >= Duration::from_millis(500));
    assert!(waited < Duration::from_millis(750));

    drop(first);
    drop(second);
    let reclaimed = client.acquire_channel().await.unwrap();
    drop(reclaimed);

    client.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn round_robin_failover_advances_the_cursor_across_reconnects() {
    let urls = [
        "amqp://node-a:5672",
        "amqp://node-b:5672",
        "amqp://node-c:5672",
    ];
    let mut config = base_config(&urls);
    config.exponential_backoff = false;
    config.reconnect_delay_ms = 1_000;
    let (client, driver) = client_with(config);

    driver.set_behavior("amqp://node-a:5672", ConnectBehavior::Fail);
    driver.set_behavior("amqp://node-b:5672", ConnectBehavior::Fail);

    client.connect().await.unwrap();
    assert_eq!(
        driver.connect_attempts(),
        vec![
            "amqp://node-a:5672",
            "amqp://node-b:5672",
            "amqp://node-c:5672",
        ]
    );

    client.reconnect().await.unwrap();

    // The forced reconnect starts from node B: the cursor advanced past the
    // selection that began at node A.
    let attempts = driver.connect_attempts();
    assert_eq!(attempts[3], "amqp://node-b:5672");
    assert_eq!(attempts[4], "amqp://node-c:5672");
    assert_eq!(client.metrics().reconnections, 1);

    client.close().await.unwrap();
}

#[tokio::test]
async fn manual_ack_settles_at_most_once() {
    let urls = ["amqp://localhost:5672"];
    let (client, driver) = client_with(base_config(&urls));
    client.connect().await.unwrap();

    let (handler, _) = TestHandler::new(HandlerMode::AckThenNack);
    let tag = client
        .consume("jobs", handler, ConsumeOptions::new().manual_ack())
        .await
        .unwrap();

    let channel = driver.last_connection().unwrap().channels()[0].clone();
    channel.push_delivery(&tag, test_delivery(7, "jobs", b"payload"));
    wait_until(|| client.metrics().messages_received == 1).await;

    assert_eq!(channel.acks(), vec![(7, false)]);
    assert!(channel.nacks().is_empty());

    client.close().await.unwrap();
}

#[tokio::test]
async fn failed_auto_ack_handler_nacks_with_requeue() {
    let urls = ["amqp://localhost:5672"];
    let (client, driver) = client_with(base_config(&urls));
    client.connect().await.unwrap();

    let (handler, _) = TestHandler::new(HandlerMode::Fail);
    let tag = client
        .consume("jobs", handler, ConsumeOptions::new())
        .await
        .unwrap();

    let channel = driver.last_connection().unwrap().channels()[0].clone();
    channel.push_delivery(&tag, test_delivery(3, "jobs", b"payload"));
    wait_until(|| client.metrics().errors >= 1).await;

    assert_eq!(channel.nacks(), vec![(3, false, true)]);
    assert!(channel.acks().is_empty());
    assert_eq!(client.metrics().messages_received, 0);

    client.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn publish_times_out_when_the_confirm_never_arrives() {
    let urls = ["amqp://localhost:5672"];
    let (client, driver) = client_with(base_config(&urls));
    client.connect().await.unwrap();

    let channel = driver.last_connection().unwrap().channels()[0].clone();
    channel.push_publish_behavior(PublishBehavior::Hang);

    let err = client
        .publish(
            "events",
            "user.created",
            b"x",
            PublishOptions::new().timeout_ms(100),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), "PUBLISH_TIMEOUT");
    assert_eq!(client.metrics().messages_sent, 0);

    client.close().await.unwrap();
}

#[tokio::test]
async fn broker_nack_surfaces_as_publish_error() {
    let urls = ["amqp://localhost:5672"];
    let (client, driver) = client_with(base_config(&urls));
    client.connect().await.unwrap();

    let channel = driver.last_connection().unwrap().channels()[0].clone();
    channel.push_publish_behavior(PublishBehavior::Nack);

    let err = client
        .publish("events", "user.created", b"x", PublishOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "PUBLISH");
    assert_eq!(client.metrics().messages_sent, 0);
    assert_eq!(client.metrics().errors, 1);

    client.close().await.unwrap();
}

#[tokio::test]
async fn batch_publish_stops_at_the_first_failure() {
    let urls = ["amqp://localhost:5672"];
    let (client, driver) = client_with(base_config(&urls));
    client.connect().await.unwrap();

    let channel = driver.last_connection().unwrap().channels()[0].clone();
    channel.push_publish_behavior(PublishBehavior::Ack);
    channel.push_publish_behavior(PublishBehavior::Nack);

    let batch = vec![
        BatchMessage::new("events", "a", b"1".to_vec()),
        BatchMessage::new("events", "b", b"2".to_vec()),
        BatchMessage::new("events", "c", b"3".to_vec()),
    ];
    let err = client.publish_batch(&batch).await.unwrap_err();

    assert_eq!(err.code(), "PUBLISH");
    // The third message was never sent.
    assert_eq!(channel.publishes().len(), 2);
    assert_eq!(client.metrics().messages_sent, 1);

    client.close().await.unwrap();
}

#[tokio::test]
async fn buffered_publishing_flushes_at_batch_size() {
    let urls = ["amqp://localhost:5672"];
    let mut config = base_config(&urls);
    config.batch.size = 2;
    config.batch.timeout_ms = 60_000;
    let (client, driver) = client_with(config);
    client.connect().await.unwrap();

    client
        .publish_buffered(BatchMessage::new("events", "a", b"1".to_vec()))
        .await
        .unwrap();
    assert_eq!(client.metrics().messages_sent, 0);

    client
        .publish_buffered(BatchMessage::new("events", "b", b"2".to_vec()))
        .await
        .unwrap();
    wait_until(|| client.metrics().messages_sent == 2).await;

    let channel = driver.last_connection().unwrap().channels()[0].clone();
    assert_eq!(channel.publishes().len(), 2);

    client.close().await.unwrap();
}

#[tokio::test]
async fn get_counts_received_messages() {
    let urls = ["amqp://localhost:5672"];
    let (client, driver) = client_with(base_config(&urls));
    client.connect().await.unwrap();

    let channel = driver.last_connection().unwrap().channels()[0].clone();
    channel.push_get_response(Some(test_delivery(9, "jobs", b"pull")));

    let message = client.get("jobs", false).await.unwrap().unwrap();
    assert_eq!(message.data, b"pull");
    assert_eq!(client.metrics().messages_received, 1);

    assert!(client.get("jobs", false).await.unwrap().is_none());
    assert_eq!(client.metrics().messages_received, 1);

    client.close().await.unwrap();
}

#[tokio::test]
async fn health_check_reflects_connection_state() {
    let urls = ["amqp://localhost:5672"];
    let (client, driver) = client_with(base_config(&urls));

    assert!(!client.health_check().await);

    client.connect().await.unwrap();
    assert!(client.health_check().await);

    driver.last_connection().unwrap().set_open(false);
    assert!(!client.health_check().await);

    client.close().await.unwrap();
}

#[tokio::test]
async fn connect_emits_connecting_then_connected() {
    let urls = ["amqp://localhost:5672"];
    let (client, _driver) = client_with(base_config(&urls));
    let events = recording_events(&client);

    client.connect().await.unwrap();

    {
        let seen = events.lock().unwrap();
        assert_eq!(seen[0], EventKind::Connecting);
        assert_eq!(seen[1], EventKind::Connected);
    }

    client.close().await.unwrap();
}

#[tokio::test]
async fn close_is_idempotent_and_seals_the_event_bus() {
    let urls = ["amqp://localhost:5672"];
    let (client, _driver) = client_with(base_config(&urls));
    client.connect().await.unwrap();

    let events = recording_events(&client);
    client.close().await.unwrap();
    client.close().await.unwrap();

    let closed = events
        .lock()
        .unwrap()
        .iter()
        .filter(|kind| **kind == EventKind::Closed)
        .count();
    assert_eq!(closed, 1);

    let err = client
        .publish("events", "x", b"y", PublishOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_CONNECTED");
}

#[tokio::test(start_paused = true)]
async fn graceful_shutdown_then_close_does_not_fail() {
    let urls = ["amqp://localhost:5672"];
    let (client, _driver) = client_with(base_config(&urls));
    client.connect().await.unwrap();

    client
        .publish("events", "user.created", b"x", PublishOptions::new())
        .await
        .unwrap();

    client.graceful_shutdown().await.unwrap();
    client.close().await.unwrap();
    assert!(!client.is_connected().await);
}

#[tokio::test]
async fn api_calls_fail_before_connect() {
    let urls = ["amqp://localhost:5672"];
    let (client, _driver) = client_with(base_config(&urls));

    let err = client
        .publish("events", "x", b"y", PublishOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_CONNECTED");

    let err = client
        .assert_queue("q", &QueueOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_CONNECTED");
}

#[tokio::test]
async fn topology_operations_forward_to_the_default_channel() {
    let urls = ["amqp://localhost:5672"];
    let (client, driver) = client_with(base_config(&urls));
    client.connect().await.unwrap();

    let first = client
        .assert_queue("orders", &QueueOptions::new().durable())
        .await
        .unwrap();
    let second = client
        .assert_queue("orders", &QueueOptions::new().durable())
        .await
        .unwrap();
    assert_eq!(first, second);

    client.unbind_queue("orders", "events", "order.*").await.unwrap();
    client.prefetch(5, true).await.unwrap();

    let dropped = client
        .delete_queue("orders", DeleteQueueOptions::default())
        .await
        .unwrap();
    assert_eq!(dropped, 0);
    assert_eq!(client.purge_queue("unknown").await.unwrap(), 0);
    client.delete_exchange("events", false).await.unwrap();

    let channel = driver.last_connection().unwrap().channels()[0].clone();
    assert_eq!(
        channel.unbindings(),
        vec![("orders".to_string(), "events".to_string(), "order.*".to_string())]
    );
    assert!(channel.qos_calls().contains(&(5, true)));
    assert_eq!(channel.deleted_queues(), vec!["orders"]);
    assert_eq!(channel.purged_queues(), vec!["unknown"]);
    assert_eq!(channel.deleted_exchanges(), vec!["events"]);

    let delivery = test_delivery(11, "order.created", b"x");
    client.ack(&delivery, false).await.unwrap();
    client.nack(&delivery, false, true).await.unwrap();
    client.reject(&delivery, false).await.unwrap();
    assert_eq!(channel.acks(), vec![(11, false)]);
    assert_eq!(channel.nacks(), vec![(11, false, true)]);
    assert_eq!(channel.rejects(), vec![(11, false)]);

    client.close().await.unwrap();
}

#[tokio::test]
async fn concurrent_connect_callers_share_one_attempt() {
    let urls = ["amqp://bad:1"];
    let mut config = base_config(&urls);
    config.breaker = BreakerConfig {
        failure_threshold: 2,
        reset_timeout_ms: 60_000,
    };
    let (client, driver) = client_with(config);
    driver.set_behavior("amqp://bad:1", ConnectBehavior::Fail);

    let (first, second) = tokio::join!(client.connect(), client.connect());
    assert_eq!(first.unwrap_err().code(), "CLUSTER");
    assert_eq!(second.unwrap_err().code(), "CLUSTER");

    // One shared cycle: one driver attempt, one breaker increment. The
    // breaker only opens after a second, separate cycle.
    assert_eq!(driver.connect_attempts().len(), 1);
    assert_eq!(client.connect().await.unwrap_err().code(), "CLUSTER");
    assert_eq!(client.connect().await.unwrap_err().code(), "CIRCUIT_BREAKER_OPEN");
}

#[tokio::test(start_paused = true)]
async fn driver_connection_error_triggers_a_reconnect() {
    let urls = ["amqp://localhost:5672"];
    let mut config = base_config(&urls);
    config.exponential_backoff = false;
    config.reconnect_delay_ms = 1_000;
    let (client, driver) = client_with(config);
    client.connect().await.unwrap();

    let events = recording_events(&client);
    let first_conn = driver.last_connection().unwrap();
    first_conn.emit(rabbitmq_resilient::driver::ConnectionEvent::Error(
        "socket reset".to_owned(),
    ));

    wait_until(|| client.metrics().reconnections == 1).await;

    {
        let seen = events.lock().unwrap();
        assert!(seen.contains(&EventKind::ConnectionError));
        assert!(seen.contains(&EventKind::Reconnecting));
        assert!(seen.contains(&EventKind::Reconnected));
        let reconnecting = seen
            .iter()
            .position(|kind| *kind == EventKind::Reconnecting)
            .unwrap();
        let reconnected = seen
            .iter()
            .position(|kind| *kind == EventKind::Reconnected)
            .unwrap();
        assert!(reconnecting < reconnected);
    }
    // The old transport was force-closed during the cycle.
    assert!(first_conn.close_calls() >= 1);

    client.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn recovery_sweep_recreates_a_closed_default_channel() {
    let urls = ["amqp://localhost:5672"];
    let (client, driver) = client_with(base_config(&urls));
    client.connect().await.unwrap();

    let conn = driver.last_connection().unwrap();
    // Default channel plus two pooled channels.
    assert_eq!(conn.channels().len(), 3);
    conn.channels()[0].set_open(false);

    // The sweep runs every five seconds.
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(conn.channels().len(), 4);
    client
        .publish("events", "user.created", b"x", PublishOptions::new())
        .await
        .unwrap();

    client.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn cluster_probe_tracks_node_health_in_the_background() {
    let urls = ["amqp://node-a:5672", "amqp://node-b:5672"];
    let mut config = base_config(&urls);
    config.cluster.node_recovery_interval_ms = Some(1_000);
    let (client, driver) = client_with(config);
    driver.set_behavior("amqp://node-b:5672", ConnectBehavior::Fail);

    client.connect().await.unwrap();
    let after_connect = driver.connect_attempts().len();

    tokio::time::sleep(Duration::from_millis(3_500)).await;

    let probes = driver.connect_attempts().len() - after_connect;
    // Three rounds probing both configured nodes.
    assert_eq!(probes, 6);

    client.close().await.unwrap();
}

#[tokio::test]
async fn broker_flow_control_surfaces_blocked_and_unblocked() {
    let urls = ["amqp://localhost:5672"];
    let (client, driver) = client_with(base_config(&urls));
    client.connect().await.unwrap();

    let reasons = Arc::new(Mutex::new(Vec::new()));
    let sink = reasons.clone();
    client.subscribe(Arc::new(move |event: &Event| {
        if let Event::Blocked(reason) = event {
            sink.lock().unwrap().push(reason.clone());
        }
    }));
    let events = recording_events(&client);

    let conn = driver.last_connection().unwrap();
    conn.emit(rabbitmq_resilient::driver::ConnectionEvent::Blocked(
        "low on memory".to_owned(),
    ));
    conn.emit(rabbitmq_resilient::driver::ConnectionEvent::Unblocked);

    wait_until(|| events.lock().unwrap().contains(&EventKind::Unblocked)).await;
    assert_eq!(reasons.lock().unwrap().as_slice(), ["low on memory"]);
    // Flow control does not tear the connection down.
    assert_eq!(client.metrics().reconnections, 0);

    client.close().await.unwrap();
}

#[tokio::test]
async fn cancel_stops_the_consumer_and_forwards_to_the_driver() {
    let urls = ["amqp://localhost:5672"];
    let (client, driver) = client_with(base_config(&urls));
    client.connect().await.unwrap();

    let (handler, _) = TestHandler::new(HandlerMode::Succeed);
    let tag = client
        .consume("jobs", handler, ConsumeOptions::new())
        .await
        .unwrap();

    let channel = driver.last_connection().unwrap().channels()[0].clone();
    assert_eq!(channel.consumer_tags(), vec![tag.clone()]);

    client.cancel(&tag).await.unwrap();
    assert_eq!(channel.cancelled(), vec![tag]);
    assert!(channel.consumer_tags().is_empty());

    client.close().await.unwrap();
}
