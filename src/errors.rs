// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Resilient RabbitMQ Client
//!
//! This module provides the error type returned by every fallible operation of
//! the client. Each variant carries the context of the failing operation and
//! maps to a stable machine-readable code, so callers can switch on failures
//! without string matching. Errors serialize to JSON for structured logging
//! and transport across service boundaries.

use serde_json::{json, Value};
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Variants cover the full failure surface of the client: configuration
/// rejection, circuit-breaker fast-fail, connection and channel failures,
/// publishing, consuming, reconnection exhaustion, and whole-cluster
/// connect failures. Use [`AmqpError::code`] to dispatch on the failure
/// class and [`AmqpError::details`] for the operation context.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Configuration rejected at construction time
    #[error("invalid configuration: {message}")]
    Configuration { message: String },

    /// `connect` was called while the circuit breaker is open
    #[error("circuit breaker is open after {failures} consecutive failures")]
    CircuitBreakerOpen { failures: u32 },

    /// An API call was made with no open connection or default channel
    #[error("not connected to the broker (operation: {operation})")]
    NotConnected { operation: String },

    /// Transport-level failure while connecting to a node
    #[error("failure to connect to `{url}`: {message}")]
    Connection { url: String, message: String },

    /// A single connect attempt exceeded the configured timeout
    #[error("connection attempt to `{url}` timed out after {timeout_ms} ms")]
    ConnectionTimeout { url: String, timeout_ms: u64 },

    /// Failure creating or using a channel
    #[error("channel failure: {message}")]
    Channel {
        message: String,
        context: Option<String>,
    },

    /// The channel pool could not hand out a channel before the deadline
    #[error("channel acquisition timed out after {timeout_ms} ms")]
    ChannelAcquisitionTimeout { timeout_ms: u64 },

    /// The broker negatively acknowledged a publish, or the publish failed
    #[error("failure to publish to exchange `{exchange}`: {message}")]
    Publish {
        exchange: String,
        routing_key: String,
        message: String,
    },

    /// The broker did not confirm a publish before the per-call deadline
    #[error("publish to exchange `{exchange}` timed out after {timeout_ms} ms")]
    PublishTimeout {
        exchange: String,
        routing_key: String,
        timeout_ms: u64,
    },

    /// Failure registering a consumer or a delivery-pipeline error
    #[error("consumer failure on queue `{queue}`: {message}")]
    Consume { queue: String, message: String },

    /// Reconnect retries exhausted
    #[error("reconnection failed after {attempts} attempts: {message}")]
    Reconnection { attempts: u32, message: String },

    /// Every configured cluster node failed within a single connect cycle
    #[error("every cluster node failed: {}", .errors.join("; "))]
    Cluster { errors: Vec<String> },
}

impl AmqpError {
    /// Stable machine-readable code identifying the failure class.
    pub fn code(&self) -> &'static str {
        match self {
            AmqpError::Configuration { .. } => "CONFIGURATION",
            AmqpError::CircuitBreakerOpen { .. } => "CIRCUIT_BREAKER_OPEN",
            AmqpError::NotConnected { .. } => "NOT_CONNECTED",
            AmqpError::Connection { .. } => "CONNECTION",
            AmqpError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            AmqpError::Channel { .. } => "CHANNEL",
            AmqpError::ChannelAcquisitionTimeout { .. } => "CHANNEL_ACQUISITION_TIMEOUT",
            AmqpError::Publish { .. } => "PUBLISH",
            AmqpError::PublishTimeout { .. } => "PUBLISH_TIMEOUT",
            AmqpError::Consume { .. } => "CONSUME",
            AmqpError::Reconnection { .. } => "RECONNECTION",
            AmqpError::Cluster { .. } => "CLUSTER",
        }
    }

    /// Context of the failing operation as a JSON map.
    pub fn details(&self) -> Value {
        match self {
            AmqpError::Configuration { message } => json!({ "message": message }),
            AmqpError::CircuitBreakerOpen { failures } => json!({ "failures": failures }),
            AmqpError::NotConnected { operation } => json!({ "operation": operation }),
            AmqpError::Connection { url, message } => {
                json!({ "url": url, "message": message })
            }
            AmqpError::ConnectionTimeout { url, timeout_ms } => {
                json!({ "url": url, "timeoutMs": timeout_ms })
            }
            AmqpError::Channel { message, context } => {
                json!({ "message": message, "context": context })
            }
            AmqpError::ChannelAcquisitionTimeout { timeout_ms } => {
                json!({ "timeoutMs": timeout_ms })
            }
            AmqpError::Publish {
                exchange,
                routing_key,
                message,
            } => json!({
                "exchange": exchange,
                "routingKey": routing_key,
                "message": message,
            }),
            AmqpError::PublishTimeout {
                exchange,
                routing_key,
                timeout_ms,
            } => json!({
                "exchange": exchange,
                "routingKey": routing_key,
                "timeoutMs": timeout_ms,
            }),
            AmqpError::Consume { queue, message } => {
                json!({ "queue": queue, "message": message })
            }
            AmqpError::Reconnection { attempts, message } => {
                json!({ "attempts": attempts, "message": message })
            }
            AmqpError::Cluster { errors } => json!({ "errors": errors }),
        }
    }

    /// Full JSON form: `{ code, message, details }`.
    pub fn to_json(&self) -> Value {
        json!({
            "code": self.code(),
            "message": self.to_string(),
            "details": self.details(),
        })
    }

    /// Shorthand for a channel failure without extra context.
    pub(crate) fn channel(message: impl Into<String>) -> Self {
        AmqpError::Channel {
            message: message.into(),
            context: None,
        }
    }

    /// Shorthand for a channel failure tied to a queue or exchange name.
    pub(crate) fn channel_for(context: impl Into<String>, message: impl Into<String>) -> Self {
        AmqpError::Channel {
            message: message.into(),
            context: Some(context.into()),
        }
    }

    /// Shorthand for a not-connected failure naming the rejected operation.
    pub(crate) fn not_connected(operation: &str) -> Self {
        AmqpError::NotConnected {
            operation: operation.to_owned(),
        }
    }

    /// Whether the error indicates the connection is lost, which makes the
    /// central error handler schedule a reconnect. Channel failures are not
    /// in this set: repeatedly failing channels escalate through the
    /// recovery sweep instead.
    pub(crate) fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            AmqpError::Connection { .. }
                | AmqpError::ConnectionTimeout { .. }
                | AmqpError::Cluster { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_is_stable_per_variant() {
        let err = AmqpError::PublishTimeout {
            exchange: "events".to_owned(),
            routing_key: "user.created".to_owned(),
            timeout_ms: 30_000,
        };
        assert_eq!(err.code(), "PUBLISH_TIMEOUT");

        let err = AmqpError::not_connected("publish");
        assert_eq!(err.code(), "NOT_CONNECTED");
    }

    #[test]
    fn details_carry_operation_context() {
        let err = AmqpError::Publish {
            exchange: "events".to_owned(),
            routing_key: "user.created".to_owned(),
            message: "broker nack".to_owned(),
        };

        let details = err.details();
        assert_eq!(details["exchange"], "events");
        assert_eq!(details["routingKey"], "user.created");
    }

    #[test]
    fn json_form_is_serialisable() {
        let err = AmqpError::Cluster {
            errors: vec!["node a down".to_owned(), "node b down".to_owned()],
        };

        let value = err.to_json();
        assert_eq!(value["code"], "CLUSTER");
        assert_eq!(value["details"]["errors"].as_array().unwrap().len(), 2);
        serde_json::to_string(&value).unwrap();
    }

    #[test]
    fn connection_loss_classification() {
        assert!(AmqpError::Connection {
            url: "amqp://localhost".to_owned(),
            message: "refused".to_owned(),
        }
        .is_connection_loss());
        assert!(!AmqpError::Configuration {
            message: "bad heartbeat".to_owned(),
        }
        .is_connection_loss());
    }
}
