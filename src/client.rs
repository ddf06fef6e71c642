// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervisor
//!
//! This module provides the client itself: a single long-lived, self-healing
//! logical connection to a RabbitMQ cluster. The supervisor owns the active
//! connection and the default confirm channel, drives connect and reconnect
//! cycles across the configured nodes, wires driver events into the event
//! bus, and runs the background jobs (metrics emission, connection health,
//! channel recovery, cluster-node probing). Connect, reconnect and shutdown
//! are mutually exclusive; overlapping callers wait for the in-flight
//! operation.

use crate::breaker::CircuitBreaker;
use crate::config::ClientConfig;
use crate::driver::{
    AmqpChannel, AmqpConnection, AmqpDriver, ChannelEvent, ConnectOptions, ConnectionEvent,
    LapinDriver,
};
use crate::errors::AmqpError;
use crate::events::{Event, EventBus, EventHandler, EventKind, SubscriptionId};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::nodes::NodeRegistry;
use crate::pool::{ChannelPool, PoolStats, PooledChannel};
use crate::publish::PendingBatch;
use crate::topology::{DeleteQueueOptions, QueueOptions};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

/// URL selections walked within one connect cycle.
const CONNECT_URL_ATTEMPTS: usize = 5;
/// Hard cap on the reconnect backoff.
const BACKOFF_CAP_MS: u64 = 60_000;
/// Queue used by the lightweight connection probe.
const HEALTH_CHECK_QUEUE: &str = "healthCheckQueue";
/// Timeout of one cluster-node probe connect.
const NODE_PROBE_TIMEOUT_MS: u64 = 5_000;
/// How long a graceful shutdown waits for in-flight messages.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);
/// Poll interval of the graceful shutdown drain.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// In-flight connect attempt shared by overlapping callers.
type SharedConnect = Shared<BoxFuture<'static, Result<(), AmqpError>>>;

/// Resilient RabbitMQ client.
///
/// Wraps a low-level AMQP driver with a self-healing connection, a pool of
/// confirm channels, publish/consume/topology operations and an event bus.
/// Cloning is cheap and every clone drives the same underlying connection.
///
/// # Example
/// ```no_run
/// use rabbitmq_resilient::{ClientConfig, RabbitMQClient};
///
/// async fn run() -> Result<(), rabbitmq_resilient::AmqpError> {
///     let client = RabbitMQClient::new(ClientConfig::single("amqp://localhost:5672"))?;
///     client.connect().await?;
///     client.publish("events", "user.created", b"{\"id\":1}", Default::default()).await?;
///     client.close().await
/// }
/// ```
#[derive(Clone)]
pub struct RabbitMQClient {
    pub(crate) inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) config: ClientConfig,
    pub(crate) driver: Arc<dyn AmqpDriver>,
    pub(crate) conn: RwLock<Option<Arc<dyn AmqpConnection>>>,
    pub(crate) default_channel: RwLock<Option<Arc<dyn AmqpChannel>>>,
    pub(crate) pool: ChannelPool,
    pub(crate) breaker: CircuitBreaker,
    pub(crate) nodes: NodeRegistry,
    pub(crate) metrics: Metrics,
    pub(crate) events: EventBus,
    pub(crate) pending_batch: std::sync::Mutex<PendingBatch>,
    pub(crate) consumers: std::sync::Mutex<HashMap<String, JoinHandle<()>>>,
    // Serialises connect, reconnect and shutdown
    op_lock: AsyncMutex<()>,
    // Overlapping connect callers join this attempt instead of stacking up
    connect_inflight: std::sync::Mutex<Option<SharedConnect>>,
    shutdown: AtomicBool,
    closed: AtomicBool,
    reconnecting: AtomicBool,
    tasks_started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

enum PeriodicJob {
    Metrics,
    ConnectionHealth,
    ChannelRecovery,
    NodeHealth,
}

impl RabbitMQClient {
    /// Creates a client over the real `lapin` driver.
    ///
    /// The configuration is validated here; out-of-range values fail with a
    /// `Configuration` error. No connection is opened until
    /// [`connect`](RabbitMQClient::connect).
    pub fn new(config: ClientConfig) -> Result<Self, AmqpError> {
        RabbitMQClient::with_driver(config, Arc::new(LapinDriver))
    }

    /// Creates a client over a custom driver implementation.
    pub fn with_driver(
        config: ClientConfig,
        driver: Arc<dyn AmqpDriver>,
    ) -> Result<Self, AmqpError> {
        config.validate()?;

        let (shutdown_tx, _) = watch::channel(false);
        let inner = Arc::new(ClientInner {
            nodes: NodeRegistry::new(
                config.effective_urls(),
                config.failover_strategy,
                config.effective_priority_nodes(),
                config.cluster.shuffle_nodes,
            ),
            pool: ChannelPool::new(config.pool.max_channels, config.pool.acquire_timeout_ms),
            breaker: CircuitBreaker::new(config.breaker.clone()),
            metrics: Metrics::default(),
            events: EventBus::default(),
            pending_batch: std::sync::Mutex::new(PendingBatch::default()),
            consumers: std::sync::Mutex::new(HashMap::new()),
            conn: RwLock::new(None),
            default_channel: RwLock::new(None),
            op_lock: AsyncMutex::new(()),
            connect_inflight: std::sync::Mutex::new(None),
            shutdown: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            tasks_started: AtomicBool::new(false),
            shutdown_tx,
            tasks: std::sync::Mutex::new(Vec::new()),
            driver,
            config,
        });

        Ok(RabbitMQClient { inner })
    }

    /// Opens the logical connection. Idempotent: returns immediately when
    /// already connected, and concurrent callers share one attempt.
    ///
    /// # Returns
    /// Ok(()) once connected, `CircuitBreakerOpen` while the breaker
    /// suppresses attempts, or the last connect error once every candidate
    /// node of this cycle failed.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        self.inner.connect().await
    }

    /// Tears the current connection down and runs a reconnect cycle.
    /// Skipped while a shutdown is in progress.
    pub async fn reconnect(&self) -> Result<(), AmqpError> {
        self.inner.reconnect().await
    }

    /// Lightweight liveness probe. Never fails: reports `false` when there
    /// is no usable connection or the broker round-trip does not complete.
    pub async fn health_check(&self) -> bool {
        self.inner.health_check().await
    }

    /// Whether a connection is currently open.
    pub async fn is_connected(&self) -> bool {
        self.inner.is_connected().await
    }

    /// Point-in-time copy of the client counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Registers a handler for every lifecycle event.
    pub fn subscribe(&self, handler: EventHandler) -> SubscriptionId {
        self.inner.events.subscribe(handler)
    }

    /// Registers a handler for one event kind.
    pub fn subscribe_kind(&self, kind: EventKind, handler: EventHandler) -> SubscriptionId {
        self.inner.events.subscribe_kind(kind, handler)
    }

    /// Removes an event subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.events.unsubscribe(id)
    }

    /// Leases a confirm channel from the pool, waiting up to the configured
    /// acquire timeout. The lease returns to the pool on drop.
    pub async fn acquire_channel(&self) -> Result<PooledChannel, AmqpError> {
        let conn = { self.inner.conn.read().await.clone() };
        let Some(conn) = conn else {
            return Err(AmqpError::not_connected("acquireChannel"));
        };
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::not_connected("acquireChannel"));
        }

        match self.inner.pool.acquire(&conn).await {
            Ok(lease) => Ok(lease),
            Err(err) => Err(self.inner.fail(err)),
        }
    }

    /// Counters describing the channel pool.
    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Shuts the client down: stops background jobs, drops the pending
    /// batch timer, closes every channel and the connection, and emits the
    /// terminating `closed` event. Safe to call repeatedly.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.inner.close().await
    }

    /// Like [`close`](RabbitMQClient::close), but first blocks reconnects,
    /// flushes the pending batch and waits up to three seconds for
    /// in-flight messages to drain.
    pub async fn graceful_shutdown(&self) -> Result<(), AmqpError> {
        self.inner.graceful_shutdown().await
    }
}

impl ClientInner {
    pub(crate) async fn connect(self: &Arc<Self>) -> Result<(), AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::not_connected("connect"));
        }
        if self.is_connected().await {
            return Ok(());
        }
        self.breaker.check()?;

        // Overlapping callers share one attempt and its outcome.
        let attempt = {
            let mut inflight = self
                .connect_inflight
                .lock()
                .expect("connect slot lock poisoned");
            match inflight.as_ref() {
                Some(attempt) => attempt.clone(),
                None => {
                    let inner = self.clone();
                    let attempt: SharedConnect = async move {
                        let result = inner.connect_cycle().await;
                        inner
                            .connect_inflight
                            .lock()
                            .expect("connect slot lock poisoned")
                            .take();
                        result
                    }
                    .boxed()
                    .shared();
                    *inflight = Some(attempt.clone());
                    attempt
                }
            }
        };

        attempt.await
    }

    async fn connect_cycle(self: &Arc<Self>) -> Result<(), AmqpError> {
        let _guard = self.op_lock.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::not_connected("connect"));
        }
        if self.is_connected().await {
            return Ok(());
        }

        self.events.emit(Event::Connecting);
        match self.establish_connection().await {
            Ok(()) => {
                self.breaker.reset();
                self.events.emit(Event::Connected);
                self.start_background_tasks();
                Ok(())
            }
            Err(err) => {
                self.breaker.record_failure();
                self.events.emit(Event::ConnectionFailed(err.clone()));
                Err(err)
            }
        }
    }

    /// Walks up to five nodes of one registry selection. The breaker is
    /// touched by the caller, once per cycle.
    async fn establish_connection(self: &Arc<Self>) -> Result<(), AmqpError> {
        let urls = self.nodes.select_urls();
        let mut errors = Vec::new();

        for url in urls.iter().take(CONNECT_URL_ATTEMPTS) {
            match self
                .try_connect_url(url, self.config.connection_timeout_ms)
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(error = err.to_string(), url = url.as_str(), "node failed");
                    self.nodes.mark_failure(url);
                    errors.push(format!("{url}: {err}"));
                }
            }
        }

        if errors.is_empty() {
            errors.push("no nodes configured".to_owned());
        }
        Err(AmqpError::Cluster { errors })
    }

    async fn try_connect_url(self: &Arc<Self>, url: &str, timeout_ms: u64) -> Result<(), AmqpError> {
        let options = self.connect_options();
        let conn = match timeout(
            Duration::from_millis(timeout_ms),
            self.driver.connect(url, &options),
        )
        .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(AmqpError::ConnectionTimeout {
                    url: url.to_owned(),
                    timeout_ms,
                })
            }
        };

        self.install_connection(conn, url).await
    }

    /// Creates the default confirm channel, pre-fills the pool and wires
    /// driver events, then publishes the new connection handles.
    async fn install_connection(
        self: &Arc<Self>,
        conn: Arc<dyn AmqpConnection>,
        url: &str,
    ) -> Result<(), AmqpError> {
        let channel = conn.create_confirm_channel().await?;
        if self.config.prefetch_count > 0 {
            channel
                .qos(self.config.prefetch_count, self.config.prefetch_global)
                .await?;
        }
        // Entries of a silently dead predecessor connection must not count
        // against capacity.
        self.pool.cleanup_stale();
        self.pool.fill(&conn).await?;

        self.wire_connection_events(&conn, url);
        self.wire_channel_events(&channel);

        *self.conn.write().await = Some(conn);
        *self.default_channel.write().await = Some(channel);
        self.nodes.mark_healthy(url);

        debug!(url = url, "connection established");
        Ok(())
    }

    fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            connection_name: self.config.connection_name.clone(),
            heartbeat_secs: self.config.heartbeat_secs,
            tls: self.config.tls.clone(),
        }
    }

    fn wire_connection_events(self: &Arc<Self>, conn: &Arc<dyn AmqpConnection>, url: &str) {
        let Some(mut rx) = conn.take_events() else {
            return;
        };

        let weak = Arc::downgrade(self);
        let url = url.to_owned();
        self.track_task(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { return };
                match event {
                    ConnectionEvent::Error(message) => {
                        error!(error = message.as_str(), "connection error");
                        inner.events.emit(Event::ConnectionError(AmqpError::Connection {
                            url: url.clone(),
                            message,
                        }));
                        inner.schedule_reconnect();
                    }
                    ConnectionEvent::Closed => {
                        inner.events.emit(Event::ConnectionClosed);
                        inner.schedule_reconnect();
                    }
                    ConnectionEvent::Blocked(reason) => {
                        warn!(reason = reason.as_str(), "broker applied flow control");
                        inner.events.emit(Event::Blocked(reason));
                    }
                    ConnectionEvent::Unblocked => inner.events.emit(Event::Unblocked),
                }
            }
        }));
    }

    fn wire_channel_events(self: &Arc<Self>, channel: &Arc<dyn AmqpChannel>) {
        let Some(mut rx) = channel.take_events() else {
            return;
        };

        let weak = Arc::downgrade(self);
        self.track_task(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { return };
                match event {
                    ChannelEvent::Error(message) => {
                        error!(error = message.as_str(), "default channel error");
                        inner
                            .events
                            .emit(Event::ChannelError(AmqpError::channel(message)));
                        if let Err(err) = inner.recover_default_channel().await {
                            warn!(error = err.to_string(), "default channel recovery failed");
                            inner.schedule_reconnect();
                        }
                    }
                    ChannelEvent::Closed => inner.events.emit(Event::ChannelClosed),
                    ChannelEvent::Drain => inner.events.emit(Event::ChannelDrain),
                }
            }
        }));
    }

    pub(crate) async fn reconnect(self: &Arc<Self>) -> Result<(), AmqpError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // A cycle is already running.
            return Ok(());
        }
        self.run_reconnect_loop().await
    }

    /// Spawns a reconnect cycle unless one is running or shutdown started.
    pub(crate) fn schedule_reconnect(self: &Arc<Self>) {
        if self.shutdown.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let inner = self.clone();
        self.track_task(tokio::spawn(async move {
            if let Err(err) = inner.run_reconnect_loop().await {
                error!(error = err.to_string(), "reconnection abandoned");
            }
        }));
    }

    async fn run_reconnect_loop(self: &Arc<Self>) -> Result<(), AmqpError> {
        let result = self.reconnect_cycle().await;
        self.reconnecting.store(false, Ordering::SeqCst);
        result
    }

    async fn reconnect_cycle(self: &Arc<Self>) -> Result<(), AmqpError> {
        let _guard = self.op_lock.lock().await;
        if self.shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.teardown_connection().await;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let max = self.config.max_reconnect_attempts;
        let mut attempt: u32 = 0;
        let mut last_error = String::from("no attempts made");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }
            if max >= 0 && attempt >= max as u32 {
                let err = AmqpError::Reconnection {
                    attempts: attempt,
                    message: last_error,
                };
                self.events.emit(Event::ReconnectFailed(err.clone()));
                return Err(err);
            }

            let delay = backoff_delay(&self.config, attempt);
            debug!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "reconnecting..."
            );
            self.events.emit(Event::Reconnecting);
            tokio::select! {
                _ = shutdown_rx.changed() => return Ok(()),
                _ = sleep(delay) => {}
            }
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }

            match self.try_next_cluster_node().await {
                Ok(()) => {
                    self.metrics.record_reconnection();
                    self.emit_metrics();
                    self.events.emit(Event::Reconnected);
                    return Ok(());
                }
                Err(err) => {
                    warn!(error = err.to_string(), "reconnect attempt failed");
                    last_error = err.to_string();
                    attempt += 1;
                }
            }
        }
    }

    /// One reconnect attempt against the next node of the failover order.
    async fn try_next_cluster_node(self: &Arc<Self>) -> Result<(), AmqpError> {
        let urls = self.nodes.select_urls();
        let Some(url) = urls.first() else {
            return Err(AmqpError::Cluster {
                errors: vec!["no nodes configured".to_owned()],
            });
        };

        let timeout_ms = self
            .config
            .cluster
            .retry_connect_timeout_ms
            .unwrap_or(self.config.connection_timeout_ms);

        match self.try_connect_url(url, timeout_ms).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.nodes.mark_failure(url);
                Err(err)
            }
        }
    }

    /// Force-closes channels and the connection, swallowing close errors.
    async fn teardown_connection(&self) {
        self.pool.close_all().await;

        let channel = self.default_channel.write().await.take();
        if let Some(channel) = channel {
            if let Err(err) = channel.close().await {
                debug!(error = err.to_string(), "ignoring channel close error");
            }
        }

        let conn = self.conn.write().await.take();
        if let Some(conn) = conn {
            if let Err(err) = conn.close().await {
                debug!(error = err.to_string(), "ignoring connection close error");
            }
        }
    }

    pub(crate) async fn is_connected(&self) -> bool {
        let conn = self.conn.read().await;
        conn.as_ref().map(|conn| conn.is_open()).unwrap_or(false)
    }

    pub(crate) async fn health_check(&self) -> bool {
        let Some(conn) = self.conn.read().await.clone() else {
            return false;
        };
        let Some(channel) = self.default_channel.read().await.clone() else {
            return false;
        };
        if !conn.is_open() || !channel.is_open() {
            return false;
        }

        // Broker round-trip: declare, check and delete a transient queue.
        let options = QueueOptions::new().auto_delete();
        if channel
            .queue_declare(HEALTH_CHECK_QUEUE, &options)
            .await
            .is_err()
        {
            return false;
        }
        if channel.queue_check(HEALTH_CHECK_QUEUE).await.is_err() {
            return false;
        }
        channel
            .queue_delete(HEALTH_CHECK_QUEUE, &DeleteQueueOptions::default())
            .await
            .is_ok()
    }

    /// Hands out the default channel for the named operation, or fails with
    /// `NotConnected`.
    pub(crate) async fn default_channel_for(
        &self,
        operation: &str,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::not_connected(operation));
        }
        if !self.is_connected().await {
            return Err(AmqpError::not_connected(operation));
        }

        match self.default_channel.read().await.clone() {
            Some(channel) if channel.is_open() => Ok(channel),
            _ => Err(AmqpError::not_connected(operation)),
        }
    }

    /// Recreates the default channel under the channel recovery policy.
    async fn recover_default_channel(self: &Arc<Self>) -> Result<(), AmqpError> {
        if !self.config.channel_recovery.auto_recovery {
            return Err(AmqpError::channel("channel auto recovery is disabled"));
        }
        let Some(conn) = self.conn.read().await.clone() else {
            return Err(AmqpError::not_connected("channelRecovery"));
        };

        let retry_delay = Duration::from_millis(self.config.channel_recovery.retry_delay_ms);
        let mut last_err = AmqpError::channel("default channel recovery failed");

        for attempt in 0..self.config.channel_recovery.max_retries.max(1) {
            if attempt > 0 {
                sleep(retry_delay).await;
            }
            match conn.create_confirm_channel().await {
                Ok(channel) => {
                    if self.config.prefetch_count > 0 {
                        channel
                            .qos(self.config.prefetch_count, self.config.prefetch_global)
                            .await?;
                    }
                    self.wire_channel_events(&channel);
                    *self.default_channel.write().await = Some(channel);
                    debug!("default channel recovered");
                    return Ok(());
                }
                Err(err) => last_err = err,
            }
        }

        Err(last_err)
    }

    fn start_background_tasks(self: &Arc<Self>) {
        if self.tasks_started.swap(true, Ordering::SeqCst) {
            return;
        }

        self.spawn_periodic(Duration::from_secs(60), PeriodicJob::Metrics);
        self.spawn_periodic(Duration::from_secs(30), PeriodicJob::ConnectionHealth);
        self.spawn_periodic(Duration::from_secs(5), PeriodicJob::ChannelRecovery);
        if let Some(interval_ms) = self.config.cluster.node_recovery_interval_ms {
            self.spawn_periodic(Duration::from_millis(interval_ms), PeriodicJob::NodeHealth);
        }
    }

    /// Periodic jobs never overlap themselves: the next tick is consumed
    /// only after the previous run finished.
    fn spawn_periodic(self: &Arc<Self>, period: Duration, job: PeriodicJob) {
        let weak = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        self.track_task(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { return };
                inner.run_periodic_job(&job).await;
            }
        }));
    }

    async fn run_periodic_job(self: &Arc<Self>, job: &PeriodicJob) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        match job {
            PeriodicJob::Metrics => self.emit_metrics(),
            PeriodicJob::ConnectionHealth => {
                if !self.health_check().await && !self.reconnecting.load(Ordering::SeqCst) {
                    warn!("connection health check failed, scheduling reconnect");
                    self.schedule_reconnect();
                }
            }
            PeriodicJob::ChannelRecovery => self.channel_recovery_sweep().await,
            PeriodicJob::NodeHealth => self.probe_cluster_nodes().await,
        }
    }

    async fn channel_recovery_sweep(self: &Arc<Self>) {
        if self.reconnecting.load(Ordering::SeqCst) {
            return;
        }
        let Some(conn) = self.conn.read().await.clone() else {
            return;
        };

        if !self.config.channel_recovery.auto_recovery {
            self.pool.cleanup_stale();
            return;
        }

        let default_closed = match self.default_channel.read().await.as_ref() {
            Some(channel) => !channel.is_open(),
            None => true,
        };
        if default_closed {
            if let Err(err) = self.recover_default_channel().await {
                error!(error = err.to_string(), "default channel recovery exhausted");
                self.events.emit(Event::ChannelError(err));
                self.schedule_reconnect();
                return;
            }
        }

        if let Err(err) = self
            .pool
            .recover(
                &conn,
                self.config.channel_recovery.max_retries,
                Duration::from_millis(self.config.channel_recovery.retry_delay_ms),
            )
            .await
        {
            error!(error = err.to_string(), "pool channel recovery exhausted");
            self.events.emit(Event::ChannelError(err));
            self.schedule_reconnect();
        }
    }

    /// Probes every configured node with a short-lived open and close.
    async fn probe_cluster_nodes(self: &Arc<Self>) {
        let options = self.connect_options();
        for node in self.nodes.nodes() {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            match timeout(
                Duration::from_millis(NODE_PROBE_TIMEOUT_MS),
                self.driver.connect(&node.url, &options),
            )
            .await
            {
                Ok(Ok(conn)) => {
                    let _ = conn.close().await;
                    self.nodes.mark_healthy(&node.url);
                }
                _ => self.nodes.mark_failure(&node.url),
            }
        }
    }

    pub(crate) fn emit_metrics(&self) {
        self.events.emit(Event::Metrics(self.metrics.snapshot()));
    }

    pub(crate) fn record_sent(&self) {
        self.metrics.record_sent();
        self.emit_metrics();
    }

    pub(crate) fn record_received(&self) {
        self.metrics.record_received();
        self.emit_metrics();
    }

    /// Central error handler: counts, emits and schedules a reconnect when
    /// the error means the connection is gone.
    pub(crate) fn handle_error(self: &Arc<Self>, err: &AmqpError) {
        self.metrics.record_error();
        self.emit_metrics();
        self.events.emit(Event::Error(err.clone()));

        if err.is_connection_loss()
            && !self.reconnecting.load(Ordering::SeqCst)
            && !self.shutdown.load(Ordering::SeqCst)
        {
            self.schedule_reconnect();
        }
    }

    /// Routes the error through the central handler and returns it.
    pub(crate) fn fail(self: &Arc<Self>, err: AmqpError) -> AmqpError {
        self.handle_error(&err);
        err
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn track_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().expect("task list lock poisoned");
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    pub(crate) async fn close(self: &Arc<Self>) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);

        // Stop background jobs, event pumps and any reconnect cycle.
        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().expect("task list lock poisoned"));
        for task in tasks {
            task.abort();
        }

        // Stop consumer pumps and drop the pending batch timer.
        let pumps: Vec<JoinHandle<()>> = self
            .consumers
            .lock()
            .expect("consumer map lock poisoned")
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for pump in pumps {
            pump.abort();
        }
        self.clear_pending_batch();
        self.connect_inflight
            .lock()
            .expect("connect slot lock poisoned")
            .take();

        {
            let _guard = self.op_lock.lock().await;
            self.teardown_connection().await;
        }

        self.events.emit_closed_and_seal();
        debug!("client closed");
        Ok(())
    }

    pub(crate) async fn graceful_shutdown(self: &Arc<Self>) -> Result<(), AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return self.close().await;
        }

        // One-way latch: reconnects are forbidden from here on.
        self.shutdown.store(true, Ordering::SeqCst);
        self.flush_pending_batch().await;

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while Instant::now() < deadline {
            if self.metrics.sent() == self.metrics.received() {
                break;
            }
            sleep(DRAIN_POLL).await;
        }

        self.close().await
    }
}

/// Delay before the given reconnect attempt, starting at zero.
///
/// Without exponential backoff this is the configured base delay exactly.
/// With it, the base doubles per attempt with a uniform jitter of twenty
/// percent of the exponential term, clamped to `[base, 60s]`.
pub(crate) fn backoff_delay(config: &ClientConfig, attempt: u32) -> Duration {
    let base = config.reconnect_delay_ms;
    if !config.exponential_backoff {
        return Duration::from_millis(base);
    }

    let exponential = (base as f64) * 2f64.powi(attempt.min(16) as i32);
    let jitter = exponential * 0.2 * (rand::thread_rng().gen::<f64>() * 2.0 - 1.0);
    let delay = (exponential + jitter).clamp(base as f64, BACKOFF_CAP_MS as f64);
    Duration::from_millis(delay as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;

    fn config(base_ms: u64, exponential: bool) -> ClientConfig {
        let mut config = ClientConfig::single("amqp://localhost:5672");
        config.reconnect_delay_ms = base_ms;
        config.exponential_backoff = exponential;
        config
    }

    #[test]
    fn constant_backoff_equals_base_exactly() {
        let config = config(2_500, false);
        for attempt in 0..6 {
            assert_eq!(backoff_delay(&config, attempt), Duration::from_millis(2_500));
        }
    }

    #[test]
    fn exponential_backoff_stays_within_bounds() {
        let config = config(1_000, true);
        for attempt in 0..12 {
            let delay = backoff_delay(&config, attempt).as_millis() as u64;
            assert!(delay >= 1_000, "attempt {attempt} delay {delay} below base");
            assert!(delay <= 60_000, "attempt {attempt} delay {delay} above cap");
        }
    }

    #[test]
    fn exponential_backoff_is_monotonic_until_the_cap() {
        let config = config(1_000, true);

        // Jitter is twenty percent of the exponential term, so consecutive
        // attempts cannot overlap before the cap kicks in.
        let mut previous = 0u64;
        for attempt in 0..8 {
            let delay = backoff_delay(&config, attempt).as_millis() as u64;
            assert!(delay >= previous, "attempt {attempt} regressed");
            previous = delay.min(60_000);
        }
    }

    #[test]
    fn large_attempt_counts_saturate_at_the_cap() {
        let config = config(1_000, true);
        let delay = backoff_delay(&config, 40).as_millis() as u64;
        assert_eq!(delay, 60_000);
    }
}
