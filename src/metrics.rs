// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Client Metrics
//!
//! Monotonic counters mutated by the publish, consume, error and reconnect
//! paths, observed by callers as point-in-time snapshots. Counters only
//! reset with a new client instance.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Internal counter block shared across the client.
#[derive(Debug, Default)]
pub(crate) struct Metrics {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    errors: AtomicU64,
    reconnections: AtomicU64,
    // Unix epoch milliseconds, 0 while no reconnect has happened
    last_reconnect_ms: AtomicU64,
    avg_processing_ms: AtomicU64,
}

impl Metrics {
    pub(crate) fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnection(&self) {
        self.reconnections.fetch_add(1, Ordering::Relaxed);
        self.last_reconnect_ms.store(epoch_ms(), Ordering::Relaxed);
    }

    /// Folds one observed processing duration into the running average as
    /// `(previous + elapsed) / 2`.
    pub(crate) fn record_processing_time(&self, elapsed_ms: u64) {
        let prev = self.avg_processing_ms.load(Ordering::Relaxed);
        self.avg_processing_ms
            .store((prev + elapsed_ms) / 2, Ordering::Relaxed);
    }

    pub(crate) fn sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub(crate) fn received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter.
    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        let last = self.last_reconnect_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            reconnections: self.reconnections.load(Ordering::Relaxed),
            last_reconnect_time_ms: if last == 0 { None } else { Some(last) },
            avg_processing_time_ms: self.avg_processing_ms.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the client counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub errors: u64,
    pub reconnections: u64,
    /// Unix epoch milliseconds of the last successful reconnect
    pub last_reconnect_time_ms: Option<u64>,
    pub avg_processing_time_ms: u64,
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
