// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Operations
//!
//! This module provides the queue and exchange management surface of the
//! client: declaring, binding, purging and deleting broker-side topology.
//! Queue and exchange options follow the builder pattern and carry the
//! broker extension arguments (dead-lettering, TTL, length and priority
//! caps, alternate exchange) as opaque `x-*` arguments the broker
//! interprets.
//!
//! All operations run on the client's default channel and require an open
//! connection.

use crate::client::RabbitMQClient;
use crate::driver::{HeaderValue, QueueInfo};
use crate::errors::AmqpError;
use std::collections::BTreeMap;
use tracing::debug;

/// Argument key for a dead letter exchange
pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
/// Argument key for a dead letter routing key
pub const DEAD_LETTER_ROUTING_KEY_ARG: &str = "x-dead-letter-routing-key";
/// Argument key for per-message TTL
pub const MESSAGE_TTL_ARG: &str = "x-message-ttl";
/// Argument key for queue expiry
pub const EXPIRES_ARG: &str = "x-expires";
/// Argument key for maximum queue length
pub const MAX_LENGTH_ARG: &str = "x-max-length";
/// Argument key for maximum message priority
pub const MAX_PRIORITY_ARG: &str = "x-max-priority";
/// Argument key for an alternate exchange
pub const ALTERNATE_EXCHANGE_ARG: &str = "alternate-exchange";
/// Argument key for consumer priority
pub const CONSUMER_PRIORITY_ARG: &str = "x-priority";

/// Represents the types of exchanges available in RabbitMQ.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

/// Options for declaring a queue.
///
/// Implements the builder pattern. Extension arguments are forwarded to the
/// broker untouched.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub message_ttl_ms: Option<i32>,
    pub expires_ms: Option<i32>,
    pub max_length: Option<i32>,
    pub max_priority: Option<i32>,
    /// Additional arguments passed through to the broker
    pub arguments: BTreeMap<String, HeaderValue>,
}

impl QueueOptions {
    pub fn new() -> QueueOptions {
        QueueOptions::default()
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Routes dead-lettered messages to the given exchange.
    pub fn dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    /// Overrides the routing key used when dead-lettering.
    pub fn dead_letter_routing_key(mut self, key: impl Into<String>) -> Self {
        self.dead_letter_routing_key = Some(key.into());
        self
    }

    /// Sets the message Time-To-Live in milliseconds.
    pub fn message_ttl_ms(mut self, ttl: i32) -> Self {
        self.message_ttl_ms = Some(ttl);
        self
    }

    /// Deletes the queue after this long without use.
    pub fn expires_ms(mut self, expires: i32) -> Self {
        self.expires_ms = Some(expires);
        self
    }

    /// Caps the number of messages the queue holds.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Enables priority support up to the given level.
    pub fn max_priority(mut self, max: i32) -> Self {
        self.max_priority = Some(max);
        self
    }

    /// Adds a raw broker argument.
    pub fn argument(mut self, key: impl Into<String>, value: HeaderValue) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }
}

/// Options for declaring an exchange.
#[derive(Debug, Clone, Default)]
pub struct ExchangeOptions {
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub alternate_exchange: Option<String>,
    /// Additional arguments passed through to the broker
    pub arguments: BTreeMap<String, HeaderValue>,
}

impl ExchangeOptions {
    pub fn new(kind: ExchangeKind) -> ExchangeOptions {
        ExchangeOptions {
            kind,
            ..ExchangeOptions::default()
        }
    }

    pub fn direct() -> ExchangeOptions {
        ExchangeOptions::new(ExchangeKind::Direct)
    }

    pub fn fanout() -> ExchangeOptions {
        ExchangeOptions::new(ExchangeKind::Fanout)
    }

    pub fn topic() -> ExchangeOptions {
        ExchangeOptions::new(ExchangeKind::Topic)
    }

    pub fn headers() -> ExchangeOptions {
        ExchangeOptions::new(ExchangeKind::Headers)
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Routes unroutable messages to the given alternate exchange.
    pub fn alternate_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.alternate_exchange = Some(exchange.into());
        self
    }

    /// Adds a raw broker argument.
    pub fn argument(mut self, key: impl Into<String>, value: HeaderValue) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }
}

/// Options for deleting a queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteQueueOptions {
    /// Only delete when the queue has no consumers
    pub if_unused: bool,
    /// Only delete when the queue holds no messages
    pub if_empty: bool,
}

impl RabbitMQClient {
    /// Declares a queue, creating it when absent.
    ///
    /// Declaring an existing queue with the same options is idempotent and
    /// reports the current message and consumer counts.
    ///
    /// # Parameters
    /// * `queue` - The queue name
    /// * `options` - Declaration options including broker extension arguments
    ///
    /// # Returns
    /// The queue state as reported by the broker, or AmqpError on failure
    pub async fn assert_queue(
        &self,
        queue: &str,
        options: &QueueOptions,
    ) -> Result<QueueInfo, AmqpError> {
        let channel = self.inner.default_channel_for("assertQueue").await?;
        let info = channel
            .queue_declare(queue, options)
            .await
            .map_err(|err| self.inner.fail(err))?;

        debug!("queue: {} was created", queue);
        Ok(info)
    }

    /// Declares an exchange, creating it when absent.
    ///
    /// # Parameters
    /// * `exchange` - The exchange name
    /// * `options` - Declaration options including the exchange kind
    ///
    /// # Returns
    /// Ok(()) on success or AmqpError on failure
    pub async fn assert_exchange(
        &self,
        exchange: &str,
        options: &ExchangeOptions,
    ) -> Result<(), AmqpError> {
        let channel = self.inner.default_channel_for("assertExchange").await?;
        channel
            .exchange_declare(exchange, options)
            .await
            .map_err(|err| self.inner.fail(err))?;

        debug!("exchange: {} was created", exchange);
        Ok(())
    }

    /// Binds a queue to an exchange with the given routing pattern.
    pub async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let channel = self.inner.default_channel_for("bindQueue").await?;
        channel
            .queue_bind(queue, exchange, routing_key)
            .await
            .map_err(|err| self.inner.fail(err))
    }

    /// Removes a queue-to-exchange binding.
    pub async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let channel = self.inner.default_channel_for("unbindQueue").await?;
        channel
            .queue_unbind(queue, exchange, routing_key)
            .await
            .map_err(|err| self.inner.fail(err))
    }

    /// Deletes a queue and reports how many messages were dropped.
    pub async fn delete_queue(
        &self,
        queue: &str,
        options: DeleteQueueOptions,
    ) -> Result<u32, AmqpError> {
        let channel = self.inner.default_channel_for("deleteQueue").await?;
        channel
            .queue_delete(queue, &options)
            .await
            .map_err(|err| self.inner.fail(err))
    }

    /// Drops every ready message from a queue and reports the count.
    pub async fn purge_queue(&self, queue: &str) -> Result<u32, AmqpError> {
        let channel = self.inner.default_channel_for("purgeQueue").await?;
        channel
            .queue_purge(queue)
            .await
            .map_err(|err| self.inner.fail(err))
    }

    /// Deletes an exchange.
    pub async fn delete_exchange(&self, exchange: &str, if_unused: bool) -> Result<(), AmqpError> {
        let channel = self.inner.default_channel_for("deleteExchange").await?;
        channel
            .exchange_delete(exchange, if_unused)
            .await
            .map_err(|err| self.inner.fail(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_builder_collects_extension_arguments() {
        let options = QueueOptions::new()
            .durable()
            .dead_letter_exchange("events-dlx")
            .dead_letter_routing_key("dead")
            .message_ttl_ms(3_600_000)
            .max_length(10_000)
            .max_priority(9);

        assert!(options.durable);
        assert_eq!(options.dead_letter_exchange.as_deref(), Some("events-dlx"));
        assert_eq!(options.dead_letter_routing_key.as_deref(), Some("dead"));
        assert_eq!(options.message_ttl_ms, Some(3_600_000));
        assert_eq!(options.max_length, Some(10_000));
        assert_eq!(options.max_priority, Some(9));
    }

    #[test]
    fn exchange_builder_carries_kind_and_alternate() {
        let options = ExchangeOptions::topic()
            .durable()
            .alternate_exchange("unrouted");

        assert_eq!(options.kind, ExchangeKind::Topic);
        assert!(options.durable);
        assert_eq!(options.alternate_exchange.as_deref(), Some("unrouted"));
    }
}
