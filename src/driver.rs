// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Driver Adapter
//!
//! This module is the seam between the client core and the underlying AMQP
//! driver. The core talks exclusively to the [`AmqpDriver`],
//! [`AmqpConnection`] and [`AmqpChannel`] traits; [`LapinDriver`] implements
//! them on top of `lapin`. Keeping the seam narrow makes the connection
//! supervisor, pool and orchestration testable against an in-memory driver.

use crate::consume::ConsumeOptions;
use crate::errors::AmqpError;
use crate::publish::PublishOptions;
use crate::topology::{
    DeleteQueueOptions, ExchangeKind, ExchangeOptions, QueueOptions, ALTERNATE_EXCHANGE_ARG,
    CONSUMER_PRIORITY_ARG, DEAD_LETTER_EXCHANGE_ARG, DEAD_LETTER_ROUTING_KEY_ARG, EXPIRES_ARG,
    MAX_LENGTH_ARG, MAX_PRIORITY_ARG, MESSAGE_TTL_ARG,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use lapin::message::Delivery as LapinDelivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions,
    ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions,
    QueueDeleteOptions, QueuePurgeOptions,
};
use lapin::publisher_confirm::Confirmation as LapinConfirmation;
use lapin::tcp::{OwnedIdentity, OwnedTLSConfig};
use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use lapin::{BasicProperties, ConnectionProperties};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// AMQP close code for a normal shutdown.
const REPLY_SUCCESS: u16 = 200;

/// Connection-level events surfaced by the driver.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Transport or protocol error on the connection
    Error(String),
    /// Connection closed
    Closed,
    /// Broker applied flow control, with the broker reason when available
    Blocked(String),
    /// Broker cleared flow control
    Unblocked,
}

/// Channel-level events surfaced by the driver.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Error on the channel
    Error(String),
    /// Channel closed
    Closed,
    /// Channel write buffer drained
    Drain,
}

/// Options applied to a single driver connect.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub connection_name: String,
    pub heartbeat_secs: u64,
    pub tls: Option<crate::config::TlsConfig>,
}

/// A message the broker handed back for an unroutable mandatory publish.
#[derive(Debug, Clone)]
pub struct ReturnedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub reply_code: u16,
    pub reply_text: String,
    pub data: Vec<u8>,
}

/// Broker response to a confirm-mode publish.
#[derive(Debug, Clone)]
pub enum Confirmation {
    /// Broker acknowledged; `returned` carries the message if it was
    /// mandatory and unroutable
    Ack { returned: Option<ReturnedMessage> },
    /// Broker negatively acknowledged
    Nack { message: String },
}

/// Typed header or argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    String(String),
    Int(i64),
    UInt(u32),
    Bool(bool),
}

/// Properties attached to a delivered message.
#[derive(Debug, Clone, Default)]
pub struct DeliveryProperties {
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub headers: BTreeMap<String, HeaderValue>,
}

/// One message handed to a consumer or returned by `get`.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: DeliveryProperties,
    pub data: Vec<u8>,
}

/// Queue state reported by declare and check operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Stream of deliveries for one consumer tag.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Entry point of the driver seam: opens connections.
#[async_trait]
pub trait AmqpDriver: Send + Sync {
    /// Opens one transport connection to the given broker URL.
    async fn connect(
        &self,
        url: &str,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}

/// One live transport connection.
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    /// Opens a channel and puts it in publisher-confirms mode.
    async fn create_confirm_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    /// Whether the connection is usable for traffic in both directions.
    fn is_open(&self) -> bool;

    /// Hands out the connection event stream. Yields `Some` exactly once.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>>;

    /// Closes the connection.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// One confirm-capable channel.
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Hands out the channel event stream. Yields `Some` exactly once.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;

    /// Publishes one message and waits for the broker confirm.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<Confirmation, AmqpError>;

    /// Registers a consumer and returns its delivery stream.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;
    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError>;
    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool)
        -> Result<(), AmqpError>;
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;
    async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<Delivery>, AmqpError>;
    async fn qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError>;

    async fn queue_declare(
        &self,
        queue: &str,
        options: &QueueOptions,
    ) -> Result<QueueInfo, AmqpError>;

    /// Passive declare: checks existence and reports counts.
    async fn queue_check(&self, queue: &str) -> Result<QueueInfo, AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    async fn queue_delete(
        &self,
        queue: &str,
        options: &DeleteQueueOptions,
    ) -> Result<u32, AmqpError>;

    async fn queue_purge(&self, queue: &str) -> Result<u32, AmqpError>;

    async fn exchange_declare(
        &self,
        exchange: &str,
        options: &ExchangeOptions,
    ) -> Result<(), AmqpError>;

    async fn exchange_delete(&self, exchange: &str, if_unused: bool) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Driver implementation backed by `lapin`.
pub struct LapinDriver;

#[async_trait]
impl AmqpDriver for LapinDriver {
    async fn connect(
        &self,
        url: &str,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        debug!(url = url, "creating amqp connection...");

        let uri = with_heartbeat(url, options.heartbeat_secs);
        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(options.connection_name.clone()));

        let result = match &options.tls {
            Some(tls) => {
                lapin::Connection::connect_with_config(&uri, properties, tls_config(tls)).await
            }
            None => lapin::Connection::connect(&uri, properties).await,
        };

        let conn = match result {
            Ok(conn) => conn,
            Err(err) => {
                error!(error = err.to_string(), url = url, "failure to connect");
                return Err(AmqpError::Connection {
                    url: url.to_owned(),
                    message: err.to_string(),
                });
            }
        };
        debug!("amqp connected");

        Ok(Arc::new(LapinConnection::new(conn)))
    }
}

fn tls_config(tls: &crate::config::TlsConfig) -> OwnedTLSConfig {
    if !tls.verify_peer {
        // The driver offers no peer-verification toggle.
        warn!("tls verify_peer=false is not supported by the driver and is ignored");
    }

    OwnedTLSConfig {
        identity: tls.client_identity.as_ref().map(|der| OwnedIdentity {
            der: der.clone(),
            password: tls.key_passphrase.clone().unwrap_or_default(),
        }),
        cert_chain: if tls.ca_certificates.is_empty() {
            None
        } else {
            Some(tls.ca_certificates.join("\n"))
        },
    }
}

/// Appends the heartbeat query parameter understood by the AMQP URI scheme.
fn with_heartbeat(url: &str, heartbeat_secs: u64) -> String {
    if url.contains('?') {
        format!("{url}&heartbeat={heartbeat_secs}")
    } else {
        format!("{url}?heartbeat={heartbeat_secs}")
    }
}

struct LapinConnection {
    conn: lapin::Connection,
    events: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
}

impl LapinConnection {
    fn new(conn: lapin::Connection) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        conn.on_error({
            let tx = tx.clone();
            move |err| {
                let _ = tx.send(ConnectionEvent::Error(err.to_string()));
            }
        });

        // lapin exposes block state on the connection status only, so
        // blocked/unblocked transitions are observed by a watcher task. The
        // broker reason string is not available through this path.
        let status = conn.status().clone();
        tokio::spawn(async move {
            let mut blocked = false;
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
                if !status.connected() {
                    let _ = tx.send(ConnectionEvent::Closed);
                    return;
                }
                let now_blocked = status.blocked();
                if now_blocked != blocked {
                    blocked = now_blocked;
                    let event = if blocked {
                        ConnectionEvent::Blocked(String::new())
                    } else {
                        ConnectionEvent::Unblocked
                    };
                    if tx.send(event).is_err() {
                        return;
                    }
                }
            }
        });

        LapinConnection {
            conn,
            events: Mutex::new(Some(rx)),
        }
    }
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn create_confirm_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        let channel = match self.conn.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                return Err(AmqpError::channel(err.to_string()));
            }
        };

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| AmqpError::channel(err.to_string()))?;
        debug!("channel created");

        Ok(Arc::new(LapinChannel::new(channel)))
    }

    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events.lock().expect("event receiver lock poisoned").take()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| AmqpError::channel(err.to_string()))
    }
}

struct LapinChannel {
    channel: lapin::Channel,
    events: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    // Keeps the channel event stream open for the lifetime of the channel.
    _events_tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl LapinChannel {
    fn new(channel: lapin::Channel) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        LapinChannel {
            channel,
            events: Mutex::new(Some(rx)),
            _events_tx: tx,
        }
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events.lock().expect("event receiver lock poisoned").take()
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<Confirmation, AmqpError> {
        let publish_error = |message: String| AmqpError::Publish {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            message,
        };

        let mut properties = BasicProperties::default().with_message_id(ShortString::from(
            options
                .message_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        ));
        if options.persistent {
            properties = properties.with_delivery_mode(2);
        }
        if let Some(content_type) = &options.content_type {
            properties = properties.with_content_type(ShortString::from(content_type.clone()));
        }
        if let Some(correlation_id) = &options.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(correlation_id.clone()));
        }
        if let Some(expiration_ms) = options.expiration_ms {
            properties = properties.with_expiration(ShortString::from(expiration_ms.to_string()));
        }
        if let Some(priority) = options.priority {
            properties = properties.with_priority(priority);
        }
        if !options.headers.is_empty() {
            properties = properties.with_headers(FieldTable::from(to_amqp_table(&options.headers)));
        }

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: options.mandatory,
                    immediate: false,
                },
                payload,
                properties,
            )
            .await
            .map_err(|err| publish_error(err.to_string()))?
            .await
            .map_err(|err| publish_error(err.to_string()))?;

        Ok(match confirm {
            LapinConfirmation::Ack(returned) => Confirmation::Ack {
                returned: returned.map(|msg| ReturnedMessage {
                    exchange: msg.delivery.exchange.to_string(),
                    routing_key: msg.delivery.routing_key.to_string(),
                    reply_code: msg.reply_code,
                    reply_text: msg.reply_text.to_string(),
                    data: msg.delivery.data,
                }),
            },
            LapinConfirmation::Nack(_) => Confirmation::Nack {
                message: "broker negative acknowledgement".to_owned(),
            },
            LapinConfirmation::NotRequested => Confirmation::Ack { returned: None },
        })
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        let mut arguments = to_amqp_table(&options.arguments);
        if let Some(priority) = options.priority {
            arguments.insert(
                ShortString::from(CONSUMER_PRIORITY_ARG),
                AMQPValue::LongInt(LongInt::from(priority)),
            );
        }

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: options.no_local,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                FieldTable::from(arguments),
            )
            .await
            .map_err(|err| AmqpError::Consume {
                queue: queue.to_owned(),
                message: err.to_string(),
            })?;

        let queue = queue.to_owned();
        Ok(consumer
            .map(move |result| {
                result
                    .map(from_lapin_delivery)
                    .map_err(|err| AmqpError::Consume {
                        queue: queue.clone(),
                        message: err.to_string(),
                    })
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| AmqpError::channel(err.to_string()))
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|err| AmqpError::channel(err.to_string()))
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|err| AmqpError::channel(err.to_string()))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| AmqpError::channel(err.to_string()))
    }

    async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<Delivery>, AmqpError> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack })
            .await
            .map_err(|err| AmqpError::Consume {
                queue: queue.to_owned(),
                message: err.to_string(),
            })?;

        Ok(message.map(|msg| from_lapin_delivery(msg.delivery)))
    }

    async fn qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global })
            .await
            .map_err(|err| AmqpError::channel(err.to_string()))
    }

    async fn queue_declare(
        &self,
        queue: &str,
        options: &QueueOptions,
    ) -> Result<QueueInfo, AmqpError> {
        debug!("creating queue: {}", queue);

        let mut arguments = to_amqp_table(&options.arguments);
        if let Some(dlx) = &options.dead_letter_exchange {
            arguments.insert(
                ShortString::from(DEAD_LETTER_EXCHANGE_ARG),
                AMQPValue::LongString(LongString::from(dlx.clone())),
            );
        }
        if let Some(dlrk) = &options.dead_letter_routing_key {
            arguments.insert(
                ShortString::from(DEAD_LETTER_ROUTING_KEY_ARG),
                AMQPValue::LongString(LongString::from(dlrk.clone())),
            );
        }
        if let Some(ttl) = options.message_ttl_ms {
            arguments.insert(
                ShortString::from(MESSAGE_TTL_ARG),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }
        if let Some(expires) = options.expires_ms {
            arguments.insert(
                ShortString::from(EXPIRES_ARG),
                AMQPValue::LongInt(LongInt::from(expires)),
            );
        }
        if let Some(max_length) = options.max_length {
            arguments.insert(
                ShortString::from(MAX_LENGTH_ARG),
                AMQPValue::LongInt(LongInt::from(max_length)),
            );
        }
        if let Some(max_priority) = options.max_priority {
            arguments.insert(
                ShortString::from(MAX_PRIORITY_ARG),
                AMQPValue::LongInt(LongInt::from(max_priority)),
            );
        }

        let queue_state = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: false,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: false,
                },
                FieldTable::from(arguments),
            )
            .await
            .map_err(|err| AmqpError::channel_for(queue, err.to_string()))?;

        Ok(QueueInfo {
            name: queue_state.name().to_string(),
            message_count: queue_state.message_count(),
            consumer_count: queue_state.consumer_count(),
        })
    }

    async fn queue_check(&self, queue: &str) -> Result<QueueInfo, AmqpError> {
        let queue_state = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| AmqpError::channel_for(queue, err.to_string()))?;

        Ok(QueueInfo {
            name: queue_state.name().to_string(),
            message_count: queue_state.message_count(),
            consumer_count: queue_state.consumer_count(),
        })
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue, exchange, routing_key
        );

        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| AmqpError::channel_for(queue, err.to_string()))
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await
            .map_err(|err| AmqpError::channel_for(queue, err.to_string()))
    }

    async fn queue_delete(
        &self,
        queue: &str,
        options: &DeleteQueueOptions,
    ) -> Result<u32, AmqpError> {
        let count = self
            .channel
            .queue_delete(
                queue,
                QueueDeleteOptions {
                    if_unused: options.if_unused,
                    if_empty: options.if_empty,
                    nowait: false,
                },
            )
            .await
            .map_err(|err| AmqpError::channel_for(queue, err.to_string()))?;

        Ok(count)
    }

    async fn queue_purge(&self, queue: &str) -> Result<u32, AmqpError> {
        let count = self
            .channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(|err| AmqpError::channel_for(queue, err.to_string()))?;

        Ok(count)
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        options: &ExchangeOptions,
    ) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", exchange);

        let mut arguments = to_amqp_table(&options.arguments);
        if let Some(alternate) = &options.alternate_exchange {
            arguments.insert(
                ShortString::from(ALTERNATE_EXCHANGE_ARG),
                AMQPValue::LongString(LongString::from(alternate.clone())),
            );
        }

        self.channel
            .exchange_declare(
                exchange,
                to_lapin_exchange_kind(options.kind),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    internal: options.internal,
                    nowait: false,
                },
                FieldTable::from(arguments),
            )
            .await
            .map_err(|err| AmqpError::channel_for(exchange, err.to_string()))
    }

    async fn exchange_delete(&self, exchange: &str, if_unused: bool) -> Result<(), AmqpError> {
        self.channel
            .exchange_delete(
                exchange,
                ExchangeDeleteOptions {
                    if_unused,
                    nowait: false,
                },
            )
            .await
            .map_err(|err| AmqpError::channel_for(exchange, err.to_string()))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| AmqpError::channel(err.to_string()))
    }
}

fn to_lapin_exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

fn to_amqp_table(values: &BTreeMap<String, HeaderValue>) -> BTreeMap<ShortString, AMQPValue> {
    let mut table = BTreeMap::new();
    for (key, value) in values {
        let amqp_value = match value {
            HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
            HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
            HeaderValue::UInt(v) => AMQPValue::LongUInt(*v),
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
        };
        table.insert(ShortString::from(key.clone()), amqp_value);
    }
    table
}

fn from_lapin_delivery(delivery: LapinDelivery) -> Delivery {
    let mut headers = BTreeMap::new();
    if let Some(table) = delivery.properties.headers() {
        for (key, value) in table.inner() {
            let converted = match value {
                AMQPValue::LongString(v) => {
                    Some(HeaderValue::String(String::from_utf8_lossy(v.as_bytes()).into_owned()))
                }
                AMQPValue::ShortString(v) => Some(HeaderValue::String(v.to_string())),
                AMQPValue::LongLongInt(v) => Some(HeaderValue::Int(*v)),
                AMQPValue::LongInt(v) => Some(HeaderValue::Int(i64::from(*v))),
                AMQPValue::ShortInt(v) => Some(HeaderValue::Int(i64::from(*v))),
                AMQPValue::LongUInt(v) => Some(HeaderValue::UInt(*v)),
                AMQPValue::Boolean(v) => Some(HeaderValue::Bool(*v)),
                _ => None,
            };
            if let Some(converted) = converted {
                headers.insert(key.to_string(), converted);
            }
        }
    }

    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        properties: DeliveryProperties {
            content_type: delivery.properties.content_type().as_ref().map(|v| v.to_string()),
            message_id: delivery.properties.message_id().as_ref().map(|v| v.to_string()),
            correlation_id: delivery
                .properties
                .correlation_id()
                .as_ref()
                .map(|v| v.to_string()),
            headers,
        },
        data: delivery.data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_is_appended_as_query_parameter() {
        assert_eq!(
            with_heartbeat("amqp://localhost:5672", 30),
            "amqp://localhost:5672?heartbeat=30"
        );
        assert_eq!(
            with_heartbeat("amqp://localhost:5672?frame_max=8192", 30),
            "amqp://localhost:5672?frame_max=8192&heartbeat=30"
        );
    }

    #[test]
    fn header_values_map_to_amqp_types() {
        let mut headers = BTreeMap::new();
        headers.insert("kind".to_owned(), HeaderValue::String("event".to_owned()));
        headers.insert("attempt".to_owned(), HeaderValue::Int(3));
        headers.insert("flag".to_owned(), HeaderValue::Bool(true));

        let table = to_amqp_table(&headers);
        assert_eq!(
            table.get(&ShortString::from("attempt")),
            Some(&AMQPValue::LongLongInt(3))
        );
        assert_eq!(
            table.get(&ShortString::from("flag")),
            Some(&AMQPValue::Boolean(true))
        );
    }
}
