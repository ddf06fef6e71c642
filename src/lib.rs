// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Resilient RabbitMQ client core on top of `lapin`.
//!
//! Provides a single long-lived, self-healing logical connection to a
//! broker cluster with multi-node failover, a pool of confirm channels, a
//! circuit breaker on the connect path, publish/consume/topology operations
//! with at-least-once semantics, and an event bus for operators.
//!
//! # Examples
//!
//! ```no_run
//! use rabbitmq_resilient::{ClientConfig, RabbitMQClient};
//!
//! async fn run() -> Result<(), rabbitmq_resilient::AmqpError> {
//!     let client = RabbitMQClient::new(ClientConfig::new([
//!         "amqp://rabbit-1:5672",
//!         "amqp://rabbit-2:5672",
//!     ]))?;
//!     client.connect().await?;
//!     client
//!         .publish("events", "user.created", b"{\"id\":1}", Default::default())
//!         .await?;
//!     client.graceful_shutdown().await
//! }
//! ```

mod breaker;
mod metrics;
mod nodes;
mod pool;

pub mod client;
pub mod config;
pub mod consume;
pub mod driver;
pub mod errors;
pub mod events;
pub mod mock;
pub mod publish;
pub mod topology;

pub use client::RabbitMQClient;
pub use config::{
    BatchConfig, BreakerConfig, ChannelRecoveryConfig, ClientConfig, ClusterConfig,
    FailoverStrategy, PoolConfig, TlsConfig,
};
pub use consume::{AckActions, ConsumeOptions, HandlerResult, MessageHandler};
pub use driver::{Delivery, HeaderValue, QueueInfo, ReturnedMessage};
pub use errors::AmqpError;
pub use events::{Event, EventHandler, EventKind, SubscriptionId};
pub use metrics::MetricsSnapshot;
pub use pool::{PoolStats, PooledChannel};
pub use publish::{BatchMessage, PublishOptions};
pub use topology::{DeleteQueueOptions, ExchangeKind, ExchangeOptions, QueueOptions};
