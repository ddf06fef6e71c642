// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Client Configuration
//!
//! This module defines the configuration accepted by the client constructor.
//! Configuration is a structured value with enumerated fields, validated once
//! at construction; invalid values make construction fail with a
//! `Configuration` error. The value is immutable afterwards.

use crate::errors::AmqpError;

/// Strategy used to order cluster node URLs for connect attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailoverStrategy {
    /// Rotate through the candidate list with a monotonic cursor
    #[default]
    RoundRobin,
    /// Shuffle the candidate list on every selection
    Random,
}

/// Channel pool sizing and acquisition limits.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on pooled confirm channels, must be at least 1
    pub max_channels: usize,
    /// How long `acquire` waits for a free channel before failing
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_channels: 10,
            acquire_timeout_ms: 30_000,
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive connect-cycle failures before the breaker opens
    pub failure_threshold: u32,
    /// How long an open breaker suppresses connects before allowing a probe
    pub reset_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
        }
    }
}

/// Buffered batch publishing limits.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Pending messages that trigger an immediate flush
    pub size: usize,
    /// Flush deadline counted from the first buffered message
    pub timeout_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            size: 100,
            timeout_ms: 1_000,
        }
    }
}

/// Cluster-level failover behaviour.
#[derive(Debug, Clone, Default)]
pub struct ClusterConfig {
    /// Per-attempt timeout used by the reconnect loop instead of
    /// `connection_timeout_ms` when set
    pub retry_connect_timeout_ms: Option<u64>,
    /// Interval of the background per-node health probe; disabled when unset
    pub node_recovery_interval_ms: Option<u64>,
    /// Shuffle the configured node list once at construction
    pub shuffle_nodes: bool,
    /// Nodes tried first on every selection, in the given order
    pub priority_nodes: Vec<String>,
}

/// Recovery policy for closed channels.
#[derive(Debug, Clone)]
pub struct ChannelRecoveryConfig {
    /// Recreation attempts per closed channel before giving up
    pub max_retries: u32,
    /// Delay between recreation attempts
    pub retry_delay_ms: u64,
    /// Whether the background sweep recreates closed channels at all
    pub auto_recovery: bool,
}

impl Default for ChannelRecoveryConfig {
    fn default() -> Self {
        ChannelRecoveryConfig {
            max_retries: 3,
            retry_delay_ms: 1_000,
            auto_recovery: true,
        }
    }
}

/// Explicit TLS material for `amqps` connections.
///
/// The URL scheme selects TLS; this struct supplies the optional material.
/// The client identity is a PKCS#12 archive, which is what the underlying
/// driver accepts.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// PEM-encoded CA certificates trusted in addition to the system roots
    pub ca_certificates: Vec<String>,
    /// PKCS#12 client identity (certificate plus key)
    pub client_identity: Option<Vec<u8>>,
    /// Passphrase protecting the client identity
    pub key_passphrase: Option<String>,
    /// Whether to validate the broker certificate
    pub verify_peer: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig {
            ca_certificates: vec![],
            client_identity: None,
            key_passphrase: None,
            verify_peer: true,
        }
    }
}

/// Configuration for [`RabbitMQClient`](crate::client::RabbitMQClient).
///
/// Construct with [`ClientConfig::new`] (or [`ClientConfig::single`] for a
/// one-node setup) and adjust fields through the builder methods. Validation
/// happens in the client constructor; out-of-range values are rejected with
/// a `Configuration` error.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker URLs, `amqp[s]://[user[:pass]@]host[:port][/vhost]`
    pub urls: Vec<String>,
    /// Vhost applied to URLs that do not carry one
    pub vhost: Option<String>,
    /// Connection name reported to the broker
    pub connection_name: String,
    /// AMQP heartbeat interval in seconds, 1 to 60
    pub heartbeat_secs: u64,
    /// Per-attempt connect timeout in milliseconds
    pub connection_timeout_ms: u64,
    /// Base reconnect backoff in milliseconds, 1000 to 60000
    pub reconnect_delay_ms: u64,
    /// Reconnect attempts before giving up, -1 for unbounded
    pub max_reconnect_attempts: i32,
    /// Exponential backoff with jitter instead of a constant delay
    pub exponential_backoff: bool,
    /// Node ordering strategy for connect attempts
    pub failover_strategy: FailoverStrategy,
    /// Prefetch applied to the default channel after connect, 0 for unlimited
    pub prefetch_count: u16,
    /// Whether the prefetch applies per channel instead of per consumer
    pub prefetch_global: bool,
    pub pool: PoolConfig,
    pub breaker: BreakerConfig,
    pub batch: BatchConfig,
    pub cluster: ClusterConfig,
    pub channel_recovery: ChannelRecoveryConfig,
    pub tls: Option<TlsConfig>,
}

impl ClientConfig {
    /// Creates a configuration for the given broker URLs with defaults for
    /// everything else.
    pub fn new<I, S>(urls: I) -> ClientConfig
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ClientConfig {
            urls: urls.into_iter().map(Into::into).collect(),
            vhost: None,
            connection_name: env!("CARGO_PKG_NAME").to_owned(),
            heartbeat_secs: 60,
            connection_timeout_ms: 30_000,
            reconnect_delay_ms: 5_000,
            max_reconnect_attempts: 10,
            exponential_backoff: true,
            failover_strategy: FailoverStrategy::RoundRobin,
            prefetch_count: 0,
            prefetch_global: false,
            pool: PoolConfig::default(),
            breaker: BreakerConfig::default(),
            batch: BatchConfig::default(),
            cluster: ClusterConfig::default(),
            channel_recovery: ChannelRecoveryConfig::default(),
            tls: None,
        }
    }

    /// Creates a configuration for a single broker URL.
    pub fn single(url: impl Into<String>) -> ClientConfig {
        ClientConfig::new([url.into()])
    }

    /// Sets the vhost applied to URLs that do not carry one.
    pub fn vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = Some(vhost.into());
        self
    }

    /// Sets the connection name reported to the broker.
    pub fn connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }

    /// Sets the heartbeat interval in seconds.
    pub fn heartbeat_secs(mut self, secs: u64) -> Self {
        self.heartbeat_secs = secs;
        self
    }

    /// Sets the per-attempt connect timeout in milliseconds.
    pub fn connection_timeout_ms(mut self, ms: u64) -> Self {
        self.connection_timeout_ms = ms;
        self
    }

    /// Sets the base reconnect delay in milliseconds.
    pub fn reconnect_delay_ms(mut self, ms: u64) -> Self {
        self.reconnect_delay_ms = ms;
        self
    }

    /// Caps reconnect attempts, -1 for unbounded.
    pub fn max_reconnect_attempts(mut self, attempts: i32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Enables or disables exponential backoff.
    pub fn exponential_backoff(mut self, enabled: bool) -> Self {
        self.exponential_backoff = enabled;
        self
    }

    /// Sets the failover strategy.
    pub fn failover_strategy(mut self, strategy: FailoverStrategy) -> Self {
        self.failover_strategy = strategy;
        self
    }

    /// Sets the prefetch applied to the default channel after connect.
    pub fn prefetch(mut self, count: u16, global: bool) -> Self {
        self.prefetch_count = count;
        self.prefetch_global = global;
        self
    }

    /// Replaces the channel pool limits.
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Replaces the circuit breaker thresholds.
    pub fn breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Replaces the batch publishing limits.
    pub fn batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    /// Replaces the cluster failover behaviour.
    pub fn cluster(mut self, cluster: ClusterConfig) -> Self {
        self.cluster = cluster;
        self
    }

    /// Replaces the channel recovery policy.
    pub fn channel_recovery(mut self, recovery: ChannelRecoveryConfig) -> Self {
        self.channel_recovery = recovery;
        self
    }

    /// Sets explicit TLS material.
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Validates every field range. Called by the client constructor.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.urls.is_empty() {
            return Err(configuration("at least one broker URL is required"));
        }
        if !(1..=60).contains(&self.heartbeat_secs) {
            return Err(configuration("heartbeat must be between 1 and 60 seconds"));
        }
        if !(1_000..=60_000).contains(&self.reconnect_delay_ms) {
            return Err(configuration(
                "reconnect delay must be between 1000 and 60000 milliseconds",
            ));
        }
        if self.max_reconnect_attempts < -1 {
            return Err(configuration(
                "max reconnect attempts must be -1 (unbounded) or non-negative",
            ));
        }
        if self.pool.max_channels < 1 {
            return Err(configuration("pool must allow at least one channel"));
        }
        if self.breaker.failure_threshold < 1 {
            return Err(configuration(
                "circuit breaker failure threshold must be at least 1",
            ));
        }
        if self.batch.size < 1 {
            return Err(configuration("batch size must be at least 1"));
        }
        Ok(())
    }

    /// The configured URLs with the vhost applied where missing.
    pub(crate) fn effective_urls(&self) -> Vec<String> {
        self.urls
            .iter()
            .map(|url| apply_vhost(url, self.vhost.as_deref()))
            .collect()
    }

    /// Priority node URLs normalised the same way as the main URL list.
    pub(crate) fn effective_priority_nodes(&self) -> Vec<String> {
        self.cluster
            .priority_nodes
            .iter()
            .map(|url| apply_vhost(url, self.vhost.as_deref()))
            .collect()
    }
}

fn configuration(message: &str) -> AmqpError {
    AmqpError::Configuration {
        message: message.to_owned(),
    }
}

/// Appends the vhost path to a URL that does not already carry one.
fn apply_vhost(url: &str, vhost: Option<&str>) -> String {
    let Some(vhost) = vhost else {
        return url.to_owned();
    };

    let authority_start = match url.find("://") {
        Some(idx) => idx + 3,
        None => return url.to_owned(),
    };
    if url[authority_start..].contains('/') {
        return url.to_owned();
    }

    format!("{}/{}", url, urlencoded(vhost))
}

// URL encode a vhost for use in paths
fn urlencoded(s: &str) -> String {
    s.replace('/', "%2F")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let cfg = ClientConfig::single("amqp://localhost:5672");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_empty_url_list() {
        let cfg = ClientConfig::new(Vec::<String>::new());
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION");
    }

    #[test]
    fn rejects_out_of_range_heartbeat() {
        let cfg = ClientConfig::single("amqp://localhost").heartbeat_secs(0);
        assert!(cfg.validate().is_err());

        let cfg = ClientConfig::single("amqp://localhost").heartbeat_secs(61);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_reconnect_delay() {
        let cfg = ClientConfig::single("amqp://localhost").reconnect_delay_ms(999);
        assert!(cfg.validate().is_err());

        let cfg = ClientConfig::single("amqp://localhost").reconnect_delay_ms(60_001);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_channel_pool() {
        let cfg = ClientConfig::single("amqp://localhost").pool(PoolConfig {
            max_channels: 0,
            acquire_timeout_ms: 500,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn vhost_is_applied_only_when_missing() {
        let cfg = ClientConfig::new(["amqp://localhost:5672", "amqp://other:5672/existing"])
            .vhost("my/app");

        let urls = cfg.effective_urls();
        assert_eq!(urls[0], "amqp://localhost:5672/my%2Fapp");
        assert_eq!(urls[1], "amqp://other:5672/existing");
    }
}
