// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publishing
//!
//! This module provides the publishing surface of the client. Every publish
//! runs on the default confirm channel and resolves only after the broker
//! acknowledged the message, bounded by a per-call timeout. Batches publish
//! sequentially, one awaited confirm per message; there is no cross-message
//! transactional guarantee. A buffered variant accumulates messages and
//! flushes them through the batch path on size or timer.

use crate::client::{ClientInner, RabbitMQClient};
use crate::driver::{Confirmation, HeaderValue};
use crate::errors::AmqpError;
use crate::events::Event;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error, warn};

/// Default confirm deadline for a single publish.
const DEFAULT_PUBLISH_TIMEOUT_MS: u64 = 30_000;

/// Options for a single publish.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Mark the message persistent (survives broker restart on durable
    /// queues)
    pub persistent: bool,
    /// Ask the broker to return the message when it is unroutable
    pub mandatory: bool,
    pub content_type: Option<String>,
    /// Generated when absent
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Per-message TTL
    pub expiration_ms: Option<u64>,
    pub priority: Option<u8>,
    pub headers: BTreeMap<String, HeaderValue>,
    /// Confirm deadline for this call, 30 seconds when absent
    pub timeout_ms: Option<u64>,
}

impl PublishOptions {
    pub fn new() -> PublishOptions {
        PublishOptions::default()
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: HeaderValue) -> Self {
        self.headers.insert(key.into(), value);
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// One message of a batch publish.
#[derive(Debug, Clone)]
pub struct BatchMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub options: PublishOptions,
}

impl BatchMessage {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> BatchMessage {
        BatchMessage {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload: payload.into(),
            options: PublishOptions::default(),
        }
    }

    pub fn options(mut self, options: PublishOptions) -> Self {
        self.options = options;
        self
    }
}

/// Messages buffered for the next flush, plus the armed flush timer.
#[derive(Default)]
pub(crate) struct PendingBatch {
    messages: Vec<BatchMessage>,
    timer: Option<JoinHandle<()>>,
}

impl RabbitMQClient {
    /// Publishes one message and waits for the broker confirm.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange, empty for the default exchange
    /// * `routing_key` - Routing key
    /// * `payload` - Message bytes
    /// * `options` - Publish options including the per-call confirm timeout
    ///
    /// # Returns
    /// Ok(()) once the broker acknowledged, `PublishTimeout` when the
    /// confirm did not arrive in time, `Publish` on a broker nack, or
    /// `NotConnected` without an open connection.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<(), AmqpError> {
        self.inner
            .publish_inner(exchange, routing_key, payload, &options)
            .await
    }

    /// Publishes to a queue through the default exchange.
    pub async fn send_to_queue(
        &self,
        queue: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<(), AmqpError> {
        self.inner.publish_inner("", queue, payload, &options).await
    }

    /// Publishes the messages in order, awaiting each confirm before the
    /// next message is sent. The first failure surfaces immediately and the
    /// remaining messages are not sent; the sent counter reflects only the
    /// confirmed messages.
    pub async fn publish_batch(&self, messages: &[BatchMessage]) -> Result<(), AmqpError> {
        self.inner.publish_batch_inner(messages).await
    }

    /// Buffers a message for batch publishing.
    ///
    /// The buffer flushes through [`publish_batch`](RabbitMQClient::publish_batch)
    /// when it reaches the configured batch size, or when the batch timeout
    /// elapses after the first buffered message. Flush failures are routed
    /// through the central error handler.
    pub async fn publish_buffered(&self, message: BatchMessage) -> Result<(), AmqpError> {
        if !self.inner.is_connected().await {
            return Err(AmqpError::not_connected("publishBuffered"));
        }

        let flush_now = {
            let mut batch = self
                .inner
                .pending_batch
                .lock()
                .expect("batch lock poisoned");
            batch.messages.push(message);

            if batch.messages.len() >= self.inner.config.batch.size {
                if let Some(timer) = batch.timer.take() {
                    timer.abort();
                }
                true
            } else {
                if batch.timer.is_none() {
                    batch.timer = Some(self.inner.spawn_batch_timer());
                }
                false
            }
        };

        if flush_now {
            self.inner.flush_pending_batch().await;
        }
        Ok(())
    }
}

impl ClientInner {
    pub(crate) async fn publish_inner(
        self: &Arc<Self>,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<(), AmqpError> {
        let channel = self.default_channel_for("publish").await?;
        let timeout_ms = options.timeout_ms.unwrap_or(DEFAULT_PUBLISH_TIMEOUT_MS);

        let confirmation = match timeout(
            Duration::from_millis(timeout_ms),
            channel.publish(exchange, routing_key, payload, options),
        )
        .await
        {
            Ok(Ok(confirmation)) => confirmation,
            Ok(Err(err)) => return Err(self.fail(err)),
            Err(_) => {
                return Err(self.fail(AmqpError::PublishTimeout {
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    timeout_ms,
                }))
            }
        };

        match confirmation {
            Confirmation::Ack { returned } => {
                if let Some(message) = returned {
                    warn!(
                        exchange = exchange,
                        routing_key = routing_key,
                        reply = message.reply_text.as_str(),
                        "broker returned unroutable message"
                    );
                    self.events.emit(Event::MessageReturned(message));
                }
                self.record_sent();
                Ok(())
            }
            Confirmation::Nack { message } => Err(self.fail(AmqpError::Publish {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                message,
            })),
        }
    }

    pub(crate) async fn publish_batch_inner(
        self: &Arc<Self>,
        messages: &[BatchMessage],
    ) -> Result<(), AmqpError> {
        for message in messages {
            self.publish_inner(
                &message.exchange,
                &message.routing_key,
                &message.payload,
                &message.options,
            )
            .await?;
        }

        debug!(count = messages.len(), "batch published");
        Ok(())
    }

    fn spawn_batch_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let timeout_ms = self.config.batch.timeout_ms;

        tokio::spawn(async move {
            sleep(Duration::from_millis(timeout_ms)).await;
            if let Some(inner) = weak.upgrade() {
                inner.flush_pending_batch().await;
            }
        })
    }

    /// Publishes the buffered messages. The timer handle is dropped, not
    /// aborted: the expired timer task itself takes this path.
    pub(crate) async fn flush_pending_batch(self: &Arc<Self>) {
        let messages = {
            let mut batch = self.pending_batch.lock().expect("batch lock poisoned");
            drop(batch.timer.take());
            std::mem::take(&mut batch.messages)
        };
        if messages.is_empty() {
            return;
        }

        if let Err(err) = self.publish_batch_inner(&messages).await {
            error!(error = err.to_string(), "buffered batch flush failed");
        }
    }

    /// Discards buffered messages and the flush timer.
    pub(crate) fn clear_pending_batch(&self) {
        let mut batch = self.pending_batch.lock().expect("batch lock poisoned");
        if let Some(timer) = batch.timer.take() {
            timer.abort();
        }
        batch.messages.clear();
    }
}
