//! Forwarding counters

use serde::Serialize;
use sluice_core::FailureKind;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters shared by a proxy and its pool
#[derive(Debug, Default)]
pub struct ProxyStats {
    forwarded: AtomicU64,
    failures: [AtomicU64; 7],
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
}

impl ProxyStats {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, kind: FailureKind) {
        self.failures[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Failures recorded for one kind
    pub fn failures(&self, kind: FailureKind) -> u64 {
        self.failures[kind as usize].load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        let failures = FailureKind::ALL
            .iter()
            .map(|kind| (*kind, self.failures(*kind)))
            .filter(|(_, count)| *count > 0)
            .collect();

        StatsSnapshot {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            failures,
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`ProxyStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Upstream responses delivered to a sink
    pub forwarded: u64,
    /// Translated failures by kind (zero counts omitted)
    pub failures: BTreeMap<FailureKind, u64>,
    /// Upstream connections established
    pub connections_opened: u64,
    /// Upstream connections evicted or closed
    pub connections_closed: u64,
}

impl StatsSnapshot {
    /// Sum of all failures
    pub fn total_failures(&self) -> u64 {
        self.failures.values().sum()
    }
}
