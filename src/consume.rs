// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumption
//!
//! This module provides the consuming surface of the client: registering
//! consumers on the default channel, the per-message processing pipeline,
//! synchronous pulls and direct settlement.
//!
//! Each delivery races the handler against a processing timeout. The race
//! does not cancel the handler: when the timeout wins, the handler may still
//! run to completion in the background. In automatic mode a resolved handler
//! acks and a failed or timed-out handler nacks with requeue; in manual mode
//! the handler settles through [`AckActions`], where the first of ack, nack
//! or reject wins and later calls are ignored with a warning.

use crate::client::{ClientInner, RabbitMQClient};
use crate::driver::{AmqpChannel, Delivery, HeaderValue};
use crate::errors::AmqpError;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default per-message processing timeout.
const DEFAULT_PROCESSING_TIMEOUT_MS: u64 = 30_000;

/// Outcome of a message handler.
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Processes deliveries of one consumer.
///
/// `actions` is `Some` only with `manual_ack` enabled; the handler then owns
/// settlement. Without it the client settles based on the returned result.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery, actions: Option<Arc<AckActions>>) -> HandlerResult;
}

/// Options for registering a consumer.
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    /// Hand settlement to the handler through [`AckActions`]
    pub manual_ack: bool,
    /// Per-message processing timeout in milliseconds
    pub timeout_ms: u64,
    /// Broker-side automatic acknowledgement, no settlement at all
    pub no_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    /// Consumer priority
    pub priority: Option<i32>,
    /// Additional consume arguments passed through to the broker
    pub arguments: BTreeMap<String, HeaderValue>,
    /// Explicit consumer tag, generated when absent
    pub consumer_tag: Option<String>,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        ConsumeOptions {
            manual_ack: false,
            timeout_ms: DEFAULT_PROCESSING_TIMEOUT_MS,
            no_ack: false,
            exclusive: false,
            no_local: false,
            priority: None,
            arguments: BTreeMap::new(),
            consumer_tag: None,
        }
    }
}

impl ConsumeOptions {
    pub fn new() -> ConsumeOptions {
        ConsumeOptions::default()
    }

    pub fn manual_ack(mut self) -> Self {
        self.manual_ack = true;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn no_ack(mut self) -> Self {
        self.no_ack = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }
}

/// Settlement surface handed to manual-ack handlers.
///
/// A message settles at most once: the first of `ack`, `nack` or `reject`
/// wins, later calls log a warning and do nothing.
pub struct AckActions {
    channel: Arc<dyn AmqpChannel>,
    delivery_tag: u64,
    settled: AtomicBool,
}

impl AckActions {
    fn new(channel: Arc<dyn AmqpChannel>, delivery_tag: u64) -> Self {
        AckActions {
            channel,
            delivery_tag,
            settled: AtomicBool::new(false),
        }
    }

    /// Acknowledges the message.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            warn!(
                delivery_tag = self.delivery_tag,
                "message already settled, ignoring ack"
            );
            return Ok(());
        }
        self.channel.ack(self.delivery_tag, false).await
    }

    /// Negatively acknowledges the message, requeueing it when asked.
    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            warn!(
                delivery_tag = self.delivery_tag,
                "message already settled, ignoring nack"
            );
            return Ok(());
        }
        self.channel.nack(self.delivery_tag, false, requeue).await
    }

    /// Rejects the message, requeueing it when asked.
    pub async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            warn!(
                delivery_tag = self.delivery_tag,
                "message already settled, ignoring reject"
            );
            return Ok(());
        }
        self.channel.reject(self.delivery_tag, requeue).await
    }

    /// Whether the message was settled already.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }
}

impl RabbitMQClient {
    /// Registers a consumer on the default channel and returns its tag.
    ///
    /// Deliveries are processed sequentially per consumer; see the module
    /// documentation for the per-message pipeline.
    ///
    /// # Parameters
    /// * `queue` - Queue to consume from
    /// * `handler` - Processes each delivery
    /// * `options` - Consumer options, including the acknowledgement mode
    ///
    /// # Returns
    /// The consumer tag, usable with [`cancel`](RabbitMQClient::cancel)
    pub async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        options: ConsumeOptions,
    ) -> Result<String, AmqpError> {
        let channel = self.inner.default_channel_for("consume").await?;
        let tag = options
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("ctag-{}", Uuid::new_v4()));

        let mut stream = channel
            .consume(queue, &tag, &options)
            .await
            .map_err(|err| self.inner.fail(err))?;

        let weak = Arc::downgrade(&self.inner);
        let pump_channel = channel.clone();
        let pump_tag = tag.clone();
        let queue = queue.to_owned();

        let handle = tokio::spawn(async move {
            while let Some(result) = stream.next().await {
                let Some(inner) = weak.upgrade() else { return };
                if inner.is_shutting_down() {
                    return;
                }
                match result {
                    Ok(delivery) => {
                        process_delivery(&inner, &pump_channel, &handler, &options, &queue, delivery)
                            .await
                    }
                    Err(err) => {
                        error!(error = err.to_string(), "delivery stream error");
                        inner.handle_error(&err);
                    }
                }
            }
            debug!(consumer_tag = pump_tag.as_str(), "consumer stream ended");
        });

        self.inner
            .consumers
            .lock()
            .expect("consumer map lock poisoned")
            .insert(tag.clone(), handle);

        Ok(tag)
    }

    /// Cancels a consumer. Deliveries for the tag stop once the broker
    /// confirmed the cancel.
    pub async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let channel = self.inner.default_channel_for("cancel").await?;
        channel
            .cancel(consumer_tag)
            .await
            .map_err(|err| self.inner.fail(err))?;

        if let Some(handle) = self
            .inner
            .consumers
            .lock()
            .expect("consumer map lock poisoned")
            .remove(consumer_tag)
        {
            handle.abort();
        }
        Ok(())
    }

    /// Sets the prefetch window on the default channel.
    pub async fn prefetch(&self, count: u16, global: bool) -> Result<(), AmqpError> {
        let channel = self.inner.default_channel_for("prefetch").await?;
        channel
            .qos(count, global)
            .await
            .map_err(|err| self.inner.fail(err))
    }

    /// Pulls one message synchronously. Returns `None` when the queue is
    /// empty; a returned message counts as received.
    pub async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<Delivery>, AmqpError> {
        let channel = self.inner.default_channel_for("get").await?;
        let message = channel
            .get(queue, no_ack)
            .await
            .map_err(|err| self.inner.fail(err))?;

        if message.is_some() {
            self.inner.record_received();
        }
        Ok(message)
    }

    /// Acknowledges a delivery on the default channel.
    pub async fn ack(&self, delivery: &Delivery, all_up_to: bool) -> Result<(), AmqpError> {
        let channel = self.inner.default_channel_for("ack").await?;
        channel
            .ack(delivery.delivery_tag, all_up_to)
            .await
            .map_err(|err| self.inner.fail(err))
    }

    /// Negatively acknowledges a delivery on the default channel.
    pub async fn nack(
        &self,
        delivery: &Delivery,
        all_up_to: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        let channel = self.inner.default_channel_for("nack").await?;
        channel
            .nack(delivery.delivery_tag, all_up_to, requeue)
            .await
            .map_err(|err| self.inner.fail(err))
    }

    /// Rejects a delivery on the default channel.
    pub async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), AmqpError> {
        let channel = self.inner.default_channel_for("reject").await?;
        channel
            .reject(delivery.delivery_tag, requeue)
            .await
            .map_err(|err| self.inner.fail(err))
    }
}

/// Runs one delivery through the processing pipeline.
async fn process_delivery(
    inner: &Arc<ClientInner>,
    channel: &Arc<dyn AmqpChannel>,
    handler: &Arc<dyn MessageHandler>,
    options: &ConsumeOptions,
    queue: &str,
    delivery: Delivery,
) {
    let started = Instant::now();
    let deadline = Duration::from_millis(options.timeout_ms);
    let delivery_tag = delivery.delivery_tag;

    if options.manual_ack {
        let actions = Arc::new(AckActions::new(channel.clone(), delivery_tag));
        let outcome = timeout(deadline, handler.handle(&delivery, Some(actions))).await;

        match outcome {
            Ok(Ok(())) => {
                inner
                    .metrics
                    .record_processing_time(started.elapsed().as_millis() as u64);
                inner.record_received();
            }
            // Timed-out and failed handlers take the same path; the message
            // stays unsettled for the broker to redeliver.
            Ok(Err(err)) => inner.handle_error(&AmqpError::Consume {
                queue: queue.to_owned(),
                message: err.to_string(),
            }),
            Err(_) => inner.handle_error(&AmqpError::Consume {
                queue: queue.to_owned(),
                message: format!("handler did not finish within {} ms", options.timeout_ms),
            }),
        }
        return;
    }

    let outcome = timeout(deadline, handler.handle(&delivery, None)).await;
    match outcome {
        Ok(Ok(())) => {
            if !options.no_ack {
                if let Err(err) = channel.ack(delivery_tag, false).await {
                    error!(error = err.to_string(), "failed to ack message");
                    inner.handle_error(&err);
                    return;
                }
            }
            inner
                .metrics
                .record_processing_time(started.elapsed().as_millis() as u64);
            inner.record_received();
        }
        failure => {
            let message = match failure {
                Ok(Err(err)) => err.to_string(),
                _ => format!("handler did not finish within {} ms", options.timeout_ms),
            };
            if !options.no_ack {
                if let Err(err) = channel.nack(delivery_tag, false, true).await {
                    error!(error = err.to_string(), "failed to nack message");
                    inner.handle_error(&err);
                }
            }
            inner.handle_error(&AmqpError::Consume {
                queue: queue.to_owned(),
                message,
            });
        }
    }
}
