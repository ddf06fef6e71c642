// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Confirm Channel Pool
//!
//! A bounded set of confirm-capable channels partitioned into free and
//! in-use entries. `acquire` hands out a free open channel, opens a new one
//! while under capacity, or queues the caller; queued callers are satisfied
//! in FIFO order as channels are released. Leases are represented by a guard
//! that releases on drop; releasing twice is a no-op.
//!
//! The client's default channel is not a pool member.

use crate::driver::{AmqpChannel, AmqpConnection};
use crate::errors::AmqpError;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

/// Counters describing the pool state at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub in_use: usize,
    pub waiters: usize,
}

struct PoolEntry {
    id: u64,
    channel: Arc<dyn AmqpChannel>,
    in_use: bool,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<(u64, Arc<dyn AmqpChannel>)>,
}

#[derive(Default)]
struct PoolState {
    entries: Vec<PoolEntry>,
    waiters: VecDeque<Waiter>,
    next_entry_id: u64,
    next_waiter_id: u64,
    // Channels being opened right now, counted against capacity
    opening: usize,
}

/// Bounded pool of confirm channels with a fair waiter queue.
pub(crate) struct ChannelPool {
    max_channels: usize,
    acquire_timeout: Duration,
    state: Arc<Mutex<PoolState>>,
}

impl ChannelPool {
    pub(crate) fn new(max_channels: usize, acquire_timeout_ms: u64) -> Self {
        ChannelPool {
            max_channels,
            acquire_timeout: Duration::from_millis(acquire_timeout_ms),
            state: Arc::new(Mutex::new(PoolState::default())),
        }
    }

    /// Takes a channel out of the pool, waiting up to the acquire timeout.
    pub(crate) async fn acquire(
        &self,
        conn: &Arc<dyn AmqpConnection>,
    ) -> Result<PooledChannel, AmqpError> {
        let rx = {
            let mut state = self.state.lock().expect("pool lock poisoned");

            if let Some(entry) = state
                .entries
                .iter_mut()
                .find(|entry| !entry.in_use && entry.channel.is_open())
            {
                entry.in_use = true;
                return Ok(self.lease(entry.id, entry.channel.clone()));
            }

            if state.entries.len() + state.opening < self.max_channels {
                state.opening += 1;
                None
            } else {
                let waiter_id = state.next_waiter_id;
                state.next_waiter_id += 1;
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(Waiter { id: waiter_id, tx });
                Some((waiter_id, rx))
            }
        };

        match rx {
            None => self.open_entry(conn).await,
            Some((waiter_id, mut rx)) => match timeout(self.acquire_timeout, &mut rx).await {
                Ok(Ok((id, channel))) => Ok(self.lease(id, channel)),
                Ok(Err(_)) => Err(AmqpError::channel("channel pool closed")),
                Err(_) => {
                    self.abandon_waiter(waiter_id);
                    // A release may have raced the deadline; hand the lease
                    // straight back instead of leaking it.
                    if let Ok((id, channel)) = rx.try_recv() {
                        drop(self.lease(id, channel));
                    }
                    Err(AmqpError::ChannelAcquisitionTimeout {
                        timeout_ms: self.acquire_timeout.as_millis() as u64,
                    })
                }
            },
        }
    }

    /// Opens a new channel for the slot reserved in `acquire`.
    async fn open_entry(&self, conn: &Arc<dyn AmqpConnection>) -> Result<PooledChannel, AmqpError> {
        let created = conn.create_confirm_channel().await;

        let mut state = self.state.lock().expect("pool lock poisoned");
        state.opening -= 1;

        let channel = created?;
        let id = state.next_entry_id;
        state.next_entry_id += 1;
        state.entries.push(PoolEntry {
            id,
            channel: channel.clone(),
            in_use: true,
        });

        debug!(pool_size = state.entries.len(), "pool channel created");
        Ok(self.lease(id, channel))
    }

    fn lease(&self, id: u64, channel: Arc<dyn AmqpChannel>) -> PooledChannel {
        PooledChannel {
            id,
            channel,
            state: self.state.clone(),
            released: false,
        }
    }

    /// Removes a timed-out waiter from the queue.
    fn abandon_waiter(&self, waiter_id: u64) {
        let mut state = self.state.lock().expect("pool lock poisoned");
        state.waiters.retain(|waiter| waiter.id != waiter_id);
    }

    /// Creates channels until the pool is at capacity.
    pub(crate) async fn fill(&self, conn: &Arc<dyn AmqpConnection>) -> Result<(), AmqpError> {
        loop {
            {
                let state = self.state.lock().expect("pool lock poisoned");
                if state.entries.len() >= self.max_channels {
                    return Ok(());
                }
            }

            let channel = conn.create_confirm_channel().await?;
            let mut state = self.state.lock().expect("pool lock poisoned");
            let id = state.next_entry_id;
            state.next_entry_id += 1;
            state.entries.push(PoolEntry {
                id,
                channel,
                in_use: false,
            });
        }
    }

    /// Removes every closed entry, swallowing close errors on stale
    /// channels. Returns how many entries were dropped.
    pub(crate) fn cleanup_stale(&self) -> usize {
        let mut state = self.state.lock().expect("pool lock poisoned");
        let before = state.entries.len();
        state.entries.retain(|entry| entry.channel.is_open());
        let removed = before - state.entries.len();
        if removed > 0 {
            warn!(removed = removed, "removed stale pool channels");
        }
        removed
    }

    /// Recreates closed entries, retrying each up to `max_retries` times
    /// spaced by `retry_delay`. Fails once a slot cannot be recovered.
    pub(crate) async fn recover(
        &self,
        conn: &Arc<dyn AmqpConnection>,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Result<(), AmqpError> {
        let stale = self.cleanup_stale();
        if stale == 0 {
            return Ok(());
        }

        for _ in 0..stale {
            let mut last_err = AmqpError::channel("channel recovery failed");
            let mut recovered = false;

            for attempt in 0..max_retries {
                if attempt > 0 {
                    tokio::time::sleep(retry_delay).await;
                }
                match conn.create_confirm_channel().await {
                    Ok(channel) => {
                        let mut state = self.state.lock().expect("pool lock poisoned");
                        let id = state.next_entry_id;
                        state.next_entry_id += 1;
                        state.entries.push(PoolEntry {
                            id,
                            channel,
                            in_use: false,
                        });
                        recovered = true;
                        break;
                    }
                    Err(err) => last_err = err,
                }
            }

            if !recovered {
                return Err(last_err);
            }
        }

        Ok(())
    }

    /// Closes every channel and fails all queued waiters.
    pub(crate) async fn close_all(&self) {
        let (entries, waiters) = {
            let mut state = self.state.lock().expect("pool lock poisoned");
            (
                std::mem::take(&mut state.entries),
                std::mem::take(&mut state.waiters),
            )
        };

        drop(waiters);

        for entry in entries {
            if let Err(err) = entry.channel.close().await {
                debug!(error = err.to_string(), "ignoring pool channel close error");
            }
        }
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let state = self.state.lock().expect("pool lock poisoned");
        PoolStats {
            size: state.entries.len(),
            in_use: state.entries.iter().filter(|entry| entry.in_use).count(),
            waiters: state.waiters.len(),
        }
    }
}

/// Lease on one pooled channel.
///
/// The channel returns to the free set when the guard is dropped or
/// [`release`](PooledChannel::release) is called; a second release is a
/// no-op.
pub struct PooledChannel {
    id: u64,
    channel: Arc<dyn AmqpChannel>,
    state: Arc<Mutex<PoolState>>,
    released: bool,
}

impl std::fmt::Debug for PooledChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledChannel")
            .field("id", &self.id)
            .field("released", &self.released)
            .finish()
    }
}

impl PooledChannel {
    /// The leased channel.
    pub fn channel(&self) -> &Arc<dyn AmqpChannel> {
        &self.channel
    }

    /// Returns the channel to the pool.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        release_entry(&self.state, self.id);
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Marks the entry free or transfers it to the first live waiter.
fn release_entry(state: &Arc<Mutex<PoolState>>, id: u64) {
    let mut state = state.lock().expect("pool lock poisoned");

    let Some(index) = state.entries.iter().position(|entry| entry.id == id) else {
        // Entry was swept while leased.
        return;
    };

    if !state.entries[index].in_use {
        return;
    }

    if state.entries[index].channel.is_open() {
        let channel = state.entries[index].channel.clone();
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.tx.send((id, channel.clone())).is_ok() {
                // The lease moved to the waiter, the entry stays in use.
                return;
            }
        }
    }

    state.entries[index].in_use = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDriver;
    use crate::driver::{AmqpDriver, ConnectOptions};

    async fn pool_and_conn(max: usize, timeout_ms: u64) -> (ChannelPool, Arc<dyn AmqpConnection>) {
        let driver = MockDriver::new();
        let conn = driver
            .connect("amqp://localhost:5672", &connect_options())
            .await
            .unwrap();
        (ChannelPool::new(max, timeout_ms), conn)
    }

    fn connect_options() -> ConnectOptions {
        ConnectOptions {
            connection_name: "test".to_owned(),
            heartbeat_secs: 60,
            tls: None,
        }
    }

    #[tokio::test]
    async fn acquire_creates_up_to_capacity() {
        let (pool, conn) = pool_and_conn(2, 500).await;

        let first = pool.acquire(&conn).await.unwrap();
        let second = pool.acquire(&conn).await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.in_use, 2);

        drop(first);
        drop(second);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn release_is_idempotent_and_reuses_channels() {
        let (pool, conn) = pool_and_conn(1, 500).await;

        let lease = pool.acquire(&conn).await.unwrap();
        lease.release();
        assert_eq!(pool.stats().in_use, 0);

        let again = pool.acquire(&conn).await.unwrap();
        assert_eq!(pool.stats().size, 1);
        assert_eq!(pool.stats().in_use, 1);
        drop(again);
    }

    #[tokio::test(start_paused = true)]
    async fn full_pool_times_out_waiters() {
        let (pool, conn) = pool_and_conn(2, 500).await;

        let _one = pool.acquire(&conn).await.unwrap();
        let _two = pool.acquire(&conn).await.unwrap();

        let started = tokio::time::Instant::now();
        let err = pool.acquire(&conn).await.unwrap_err();
        let waited = started.elapsed();

        assert_eq!(err.code(), "CHANNEL_ACQUISITION_TIMEOUT");
        assert!(waited >= Duration::from_millis(500));
        assert!(waited < Duration::from_millis(750));
        assert_eq!(pool.stats().waiters, 0);
    }

    #[tokio::test]
    async fn waiters_are_satisfied_in_fifo_order_on_release() {
        let (pool, conn) = pool_and_conn(1, 5_000).await;
        let lease = pool.acquire(&conn).await.unwrap();

        let pool = Arc::new(pool);
        let first = {
            let pool = pool.clone();
            let conn = conn.clone();
            tokio::spawn(async move { pool.acquire(&conn).await.map(|lease| lease.release()) })
        };
        // Lets the waiter enqueue before releasing.
        tokio::task::yield_now().await;

        lease.release();
        first.await.unwrap().unwrap();
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn cleanup_removes_closed_entries() {
        let driver = MockDriver::new();
        let conn = driver
            .connect("amqp://localhost:5672", &connect_options())
            .await
            .unwrap();
        let pool = ChannelPool::new(2, 500);
        pool.fill(&conn).await.unwrap();
        assert_eq!(pool.stats().size, 2);

        driver.last_connection().unwrap().channels()[0].set_open(false);
        assert_eq!(pool.cleanup_stale(), 1);
        assert_eq!(pool.stats().size, 1);
    }

    #[tokio::test]
    async fn recover_replaces_closed_entries() {
        let driver = MockDriver::new();
        let conn = driver
            .connect("amqp://localhost:5672", &connect_options())
            .await
            .unwrap();
        let pool = ChannelPool::new(2, 500);
        pool.fill(&conn).await.unwrap();

        driver.last_connection().unwrap().channels()[1].set_open(false);
        pool.recover(&conn, 3, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(pool.stats().size, 2);
    }
}
