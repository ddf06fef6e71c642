// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Cluster Node Registry
//!
//! Tracks the configured broker URLs together with their observed health and
//! orders them for connect attempts. A node is considered unhealthy after
//! three consecutive probe or connect failures and stays so until a probe
//! succeeds again. The registry owns the failover cursor used by the
//! round-robin strategy.

use crate::config::FailoverStrategy;
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use tokio::time::Instant;

/// Consecutive failures after which a node is marked unhealthy.
const UNHEALTHY_FAILURE_COUNT: u32 = 3;

/// Health record for one configured broker URL.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub url: String,
    pub healthy: bool,
    pub last_checked: Option<Instant>,
    pub failure_count: u32,
}

impl NodeStatus {
    fn new(url: String) -> Self {
        NodeStatus {
            url,
            healthy: true,
            last_checked: None,
            failure_count: 0,
        }
    }
}

/// Registry of cluster nodes with the failover cursor.
pub(crate) struct NodeRegistry {
    nodes: RwLock<Vec<NodeStatus>>,
    cursor: AtomicUsize,
    strategy: FailoverStrategy,
    priority: Vec<String>,
}

impl NodeRegistry {
    /// Creates a registry over the given URLs.
    ///
    /// With `shuffle` set the stored order is randomised once, before any
    /// selection happens.
    pub(crate) fn new(
        urls: Vec<String>,
        strategy: FailoverStrategy,
        priority: Vec<String>,
        shuffle: bool,
    ) -> Self {
        let mut urls = urls;
        if shuffle {
            urls.shuffle(&mut rand::thread_rng());
        }

        NodeRegistry {
            nodes: RwLock::new(urls.into_iter().map(NodeStatus::new).collect()),
            cursor: AtomicUsize::new(0),
            strategy,
            priority,
        }
    }

    /// Produces the ordered candidate list for one connect cycle and
    /// advances the failover cursor.
    ///
    /// Ordering: healthy nodes (all nodes when none are healthy), priority
    /// nodes first in their configured order, then the remainder arranged by
    /// the failover strategy.
    pub(crate) fn select_urls(&self) -> Vec<String> {
        let nodes = self.nodes.read().expect("node registry lock poisoned");

        let candidates: Vec<&NodeStatus> = {
            let healthy: Vec<&NodeStatus> = nodes.iter().filter(|node| node.healthy).collect();
            if healthy.is_empty() {
                nodes.iter().collect()
            } else {
                healthy
            }
        };

        let mut prioritised: Vec<String> = Vec::new();
        for url in &self.priority {
            if candidates.iter().any(|node| &node.url == url) {
                prioritised.push(url.clone());
            }
        }

        let mut rest: Vec<String> = candidates
            .iter()
            .map(|node| node.url.clone())
            .filter(|url| !prioritised.contains(url))
            .collect();

        let cursor = self.cursor.fetch_add(1, Ordering::Relaxed);
        match self.strategy {
            FailoverStrategy::Random => rest.shuffle(&mut rand::thread_rng()),
            FailoverStrategy::RoundRobin => {
                if !rest.is_empty() {
                    let len = rest.len();
                    rest.rotate_left(cursor % len);
                }
            }
        }

        prioritised.extend(rest);
        prioritised
    }

    /// Records a successful connect or probe for the URL.
    pub(crate) fn mark_healthy(&self, url: &str) {
        let mut nodes = self.nodes.write().expect("node registry lock poisoned");
        if let Some(node) = nodes.iter_mut().find(|node| node.url == url) {
            node.healthy = true;
            node.failure_count = 0;
            node.last_checked = Some(Instant::now());
        }
    }

    /// Records a failed connect or probe for the URL.
    pub(crate) fn mark_failure(&self, url: &str) {
        let mut nodes = self.nodes.write().expect("node registry lock poisoned");
        if let Some(node) = nodes.iter_mut().find(|node| node.url == url) {
            node.failure_count += 1;
            node.last_checked = Some(Instant::now());
            if node.failure_count >= UNHEALTHY_FAILURE_COUNT {
                node.healthy = false;
            }
        }
    }

    /// Copy of every node record, for probes and introspection.
    pub(crate) fn nodes(&self) -> Vec<NodeStatus> {
        self.nodes
            .read()
            .expect("node registry lock poisoned")
            .clone()
    }
}
