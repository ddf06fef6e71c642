// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Mock Driver
//!
//! Deterministic driver implementation used by the test suite. Connect
//! outcomes are scripted per URL, every driver call is recorded, publish
//! confirms and `get` responses are programmable, and deliveries are pushed
//! into consumer streams by the test. No network is involved.

use crate::consume::ConsumeOptions;
use crate::driver::{
    AmqpChannel, AmqpConnection, AmqpDriver, ChannelEvent, Confirmation, ConnectOptions,
    ConnectionEvent, Delivery, DeliveryStream, QueueInfo,
};
use crate::errors::AmqpError;
use crate::publish::PublishOptions;
use crate::topology::{DeleteQueueOptions, ExchangeOptions, QueueOptions};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Scripted outcome for connect attempts against one URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// Connection succeeds
    Succeed,
    /// Connection fails with a transport error
    Fail,
    /// Connection never completes, for timeout tests
    Hang,
}

/// Scripted outcome for confirm-mode publishes.
#[derive(Debug, Clone)]
pub enum PublishBehavior {
    Ack,
    AckReturned(crate::driver::ReturnedMessage),
    Nack,
    /// Confirm never arrives, for publish-timeout tests
    Hang,
}

/// One recorded publish call.
#[derive(Debug, Clone)]
pub struct RecordedPublish {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub options: PublishOptions,
}

#[derive(Default)]
struct DriverState {
    behaviors: HashMap<String, ConnectBehavior>,
    connect_log: Vec<String>,
    connections: Vec<Arc<MockConnection>>,
}

/// Driver whose every observable behaviour is scripted by the test.
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<Mutex<DriverState>>,
}

impl MockDriver {
    pub fn new() -> Self {
        MockDriver::default()
    }

    /// Scripts the outcome of connects against the given URL. URLs without
    /// a script succeed.
    pub fn set_behavior(&self, url: &str, behavior: ConnectBehavior) {
        self.state
            .lock()
            .unwrap()
            .behaviors
            .insert(url.to_owned(), behavior);
    }

    /// Every URL handed to `connect`, in call order.
    pub fn connect_attempts(&self) -> Vec<String> {
        self.state.lock().unwrap().connect_log.clone()
    }

    /// Connections handed out so far, oldest first.
    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.state.lock().unwrap().connections.clone()
    }

    pub fn last_connection(&self) -> Option<Arc<MockConnection>> {
        self.state.lock().unwrap().connections.last().cloned()
    }
}

#[async_trait]
impl AmqpDriver for MockDriver {
    async fn connect(
        &self,
        url: &str,
        _options: &ConnectOptions,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        let behavior = {
            let mut state = self.state.lock().unwrap();
            state.connect_log.push(url.to_owned());
            state
                .behaviors
                .get(url)
                .copied()
                .unwrap_or(ConnectBehavior::Succeed)
        };

        match behavior {
            ConnectBehavior::Fail => Err(AmqpError::Connection {
                url: url.to_owned(),
                message: "connection refused".to_owned(),
            }),
            ConnectBehavior::Hang => {
                futures_util::future::pending::<()>().await;
                unreachable!()
            }
            ConnectBehavior::Succeed => {
                let conn = Arc::new(MockConnection::new(url));
                self.state.lock().unwrap().connections.push(conn.clone());
                Ok(conn)
            }
        }
    }
}

/// In-memory connection handed out by [`MockDriver`].
pub struct MockConnection {
    url: String,
    open: AtomicBool,
    fail_channel_creation: AtomicBool,
    channels: Mutex<Vec<Arc<MockChannel>>>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    close_calls: AtomicU64,
}

impl MockConnection {
    fn new(url: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        MockConnection {
            url: url.to_owned(),
            open: AtomicBool::new(true),
            fail_channel_creation: AtomicBool::new(false),
            channels: Mutex::new(Vec::new()),
            events_tx: tx,
            events_rx: Mutex::new(Some(rx)),
            close_calls: AtomicU64::new(0),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Channels created on this connection, oldest first.
    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.channels.lock().unwrap().clone()
    }

    /// Injects a connection event as the driver would.
    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn set_fail_channel_creation(&self, fail: bool) {
        self.fail_channel_creation.store(fail, Ordering::SeqCst);
    }

    pub fn close_calls(&self) -> u64 {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AmqpConnection for MockConnection {
    async fn create_confirm_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if self.fail_channel_creation.load(Ordering::SeqCst) {
            return Err(AmqpError::channel("scripted channel creation failure"));
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(AmqpError::channel("connection is closed"));
        }

        let channel = Arc::new(MockChannel::new());
        self.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct ChannelState {
    publishes: Vec<RecordedPublish>,
    publish_behaviors: VecDeque<PublishBehavior>,
    consumers: HashMap<String, mpsc::UnboundedSender<Result<Delivery, AmqpError>>>,
    cancelled: Vec<String>,
    acks: Vec<(u64, bool)>,
    nacks: Vec<(u64, bool, bool)>,
    rejects: Vec<(u64, bool)>,
    get_responses: VecDeque<Option<Delivery>>,
    declared_queues: HashMap<String, QueueInfo>,
    declared_exchanges: Vec<String>,
    bindings: Vec<(String, String, String)>,
    unbindings: Vec<(String, String, String)>,
    deleted_queues: Vec<String>,
    purged_queues: Vec<String>,
    deleted_exchanges: Vec<String>,
    qos_calls: Vec<(u16, bool)>,
}

/// In-memory confirm channel handed out by [`MockConnection`].
pub struct MockChannel {
    open: AtomicBool,
    state: Mutex<ChannelState>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

impl MockChannel {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        MockChannel {
            open: AtomicBool::new(true),
            state: Mutex::new(ChannelState::default()),
            events_tx: tx,
            events_rx: Mutex::new(Some(rx)),
        }
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    /// Queues one scripted publish outcome; unscripted publishes ack.
    pub fn push_publish_behavior(&self, behavior: PublishBehavior) {
        self.state
            .lock()
            .unwrap()
            .publish_behaviors
            .push_back(behavior);
    }

    pub fn publishes(&self) -> Vec<RecordedPublish> {
        self.state.lock().unwrap().publishes.clone()
    }

    /// Injects a channel event as the driver would.
    pub fn emit(&self, event: ChannelEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Pushes one delivery into the consumer registered under the tag.
    pub fn push_delivery(&self, consumer_tag: &str, delivery: Delivery) {
        let state = self.state.lock().unwrap();
        if let Some(tx) = state.consumers.get(consumer_tag) {
            let _ = tx.send(Ok(delivery));
        }
    }

    /// Ends the delivery stream of the consumer registered under the tag.
    pub fn end_consumer(&self, consumer_tag: &str) {
        self.state.lock().unwrap().consumers.remove(consumer_tag);
    }

    pub fn consumer_tags(&self) -> Vec<String> {
        self.state.lock().unwrap().consumers.keys().cloned().collect()
    }

    pub fn acks(&self) -> Vec<(u64, bool)> {
        self.state.lock().unwrap().acks.clone()
    }

    pub fn nacks(&self) -> Vec<(u64, bool, bool)> {
        self.state.lock().unwrap().nacks.clone()
    }

    pub fn rejects(&self) -> Vec<(u64, bool)> {
        self.state.lock().unwrap().rejects.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub fn qos_calls(&self) -> Vec<(u16, bool)> {
        self.state.lock().unwrap().qos_calls.clone()
    }

    pub fn declared_queues(&self) -> Vec<String> {
        self.state.lock().unwrap().declared_queues.keys().cloned().collect()
    }

    pub fn declared_exchanges(&self) -> Vec<String> {
        self.state.lock().unwrap().declared_exchanges.clone()
    }

    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.state.lock().unwrap().bindings.clone()
    }

    pub fn deleted_queues(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_queues.clone()
    }

    pub fn unbindings(&self) -> Vec<(String, String, String)> {
        self.state.lock().unwrap().unbindings.clone()
    }

    pub fn purged_queues(&self) -> Vec<String> {
        self.state.lock().unwrap().purged_queues.clone()
    }

    pub fn deleted_exchanges(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_exchanges.clone()
    }

    /// Queues one scripted `get` response; unscripted gets return empty.
    pub fn push_get_response(&self, response: Option<Delivery>) {
        self.state.lock().unwrap().get_responses.push_back(response);
    }
}

#[async_trait]
impl AmqpChannel for MockChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<Confirmation, AmqpError> {
        let behavior = {
            let mut state = self.state.lock().unwrap();
            state.publishes.push(RecordedPublish {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                payload: payload.to_vec(),
                options: options.clone(),
            });
            state
                .publish_behaviors
                .pop_front()
                .unwrap_or(PublishBehavior::Ack)
        };

        match behavior {
            PublishBehavior::Ack => Ok(Confirmation::Ack { returned: None }),
            PublishBehavior::AckReturned(message) => Ok(Confirmation::Ack {
                returned: Some(message),
            }),
            PublishBehavior::Nack => Ok(Confirmation::Nack {
                message: "broker negative acknowledgement".to_owned(),
            }),
            PublishBehavior::Hang => {
                futures_util::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    async fn consume(
        &self,
        _queue: &str,
        consumer_tag: &str,
        _options: &ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .unwrap()
            .consumers
            .insert(consumer_tag.to_owned(), tx);

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        state.cancelled.push(consumer_tag.to_owned());
        state.consumers.remove(consumer_tag);
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.state.lock().unwrap().acks.push((delivery_tag, multiple));
        Ok(())
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.state
            .lock()
            .unwrap()
            .nacks
            .push((delivery_tag, multiple, requeue));
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.state
            .lock()
            .unwrap()
            .rejects
            .push((delivery_tag, requeue));
        Ok(())
    }

    async fn get(&self, _queue: &str, _no_ack: bool) -> Result<Option<Delivery>, AmqpError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .get_responses
            .pop_front()
            .unwrap_or(None))
    }

    async fn qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError> {
        self.state
            .lock()
            .unwrap()
            .qos_calls
            .push((prefetch_count, global));
        Ok(())
    }

    async fn queue_declare(
        &self,
        queue: &str,
        _options: &QueueOptions,
    ) -> Result<QueueInfo, AmqpError> {
        let mut state = self.state.lock().unwrap();
        let info = state
            .declared_queues
            .entry(queue.to_owned())
            .or_insert_with(|| QueueInfo {
                name: queue.to_owned(),
                message_count: 0,
                consumer_count: 0,
            })
            .clone();
        Ok(info)
    }

    async fn queue_check(&self, queue: &str) -> Result<QueueInfo, AmqpError> {
        self.state
            .lock()
            .unwrap()
            .declared_queues
            .get(queue)
            .cloned()
            .ok_or_else(|| AmqpError::channel_for(queue, "no queue"))
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.state.lock().unwrap().bindings.push((
            queue.to_owned(),
            exchange.to_owned(),
            routing_key.to_owned(),
        ));
        Ok(())
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.state.lock().unwrap().unbindings.push((
            queue.to_owned(),
            exchange.to_owned(),
            routing_key.to_owned(),
        ));
        Ok(())
    }

    async fn queue_delete(
        &self,
        queue: &str,
        _options: &DeleteQueueOptions,
    ) -> Result<u32, AmqpError> {
        let mut state = self.state.lock().unwrap();
        state.deleted_queues.push(queue.to_owned());
        let dropped = state
            .declared_queues
            .remove(queue)
            .map(|info| info.message_count)
            .unwrap_or(0);
        Ok(dropped)
    }

    async fn queue_purge(&self, queue: &str) -> Result<u32, AmqpError> {
        let mut state = self.state.lock().unwrap();
        state.purged_queues.push(queue.to_owned());
        let purged = state
            .declared_queues
            .get_mut(queue)
            .map(|info| std::mem::take(&mut info.message_count))
            .unwrap_or(0);
        Ok(purged)
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        _options: &ExchangeOptions,
    ) -> Result<(), AmqpError> {
        self.state
            .lock()
            .unwrap()
            .declared_exchanges
            .push(exchange.to_owned());
        Ok(())
    }

    async fn exchange_delete(&self, exchange: &str, _if_unused: bool) -> Result<(), AmqpError> {
        self.state
            .lock()
            .unwrap()
            .deleted_exchanges
            .push(exchange.to_owned());
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        self.state.lock().unwrap().consumers.clear();
        Ok(())
    }
}

/// Builds a delivery for tests.
pub fn test_delivery(delivery_tag: u64, routing_key: &str, data: &[u8]) -> Delivery {
    Delivery {
        delivery_tag,
        exchange: "events".to_owned(),
        routing_key: routing_key.to_owned(),
        redelivered: false,
        properties: Default::default(),
        data: data.to_vec(),
    }
}
