//! Relay metrics for observability
//!
//! Counters are updated from the router, the transport and the sweeper, and
//! exposed over `/metrics` and `/health`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Relay-wide metrics
#[derive(Debug, Default)]
pub struct RelayMetrics {
    // Connection metrics
    /// Currently open WebSocket connections
    pub active_connections: AtomicU64,
    /// Total connections since relay start
    pub total_connections: AtomicU64,
    /// Connections removed by the liveness sweeper
    pub connections_evicted: AtomicU64,

    // Group metrics
    /// Empty groups dropped after their grace period
    pub groups_reclaimed: AtomicU64,
    /// Tabs appended to group histories (counted once per group)
    pub tabs_shared: AtomicU64,

    // Message metrics
    /// Envelopes received from clients
    pub messages_received: AtomicU64,
    /// Envelopes queued for delivery
    pub messages_sent: AtomicU64,
    /// Sends skipped because the recipient queue was full or closed
    pub send_failures: AtomicU64,
    /// Inbound frames that did not decode as an envelope
    pub malformed_messages: AtomicU64,

    /// Relay start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_evicted(&self) {
        self.connections_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn group_reclaimed(&self) {
        self.groups_reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tab_shared(&self) {
        self.tabs_shared.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_failed(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_message(&self) {
        self.malformed_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Point-in-time copy for `/metrics`.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
                evicted: self.connections_evicted.load(Ordering::Relaxed),
            },
            groups: GroupMetrics {
                reclaimed: self.groups_reclaimed.load(Ordering::Relaxed),
                tabs_shared: self.tabs_shared.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                sent: self.messages_sent.load(Ordering::Relaxed),
                send_failures: self.send_failures.load(Ordering::Relaxed),
                malformed: self.malformed_messages.load(Ordering::Relaxed),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub groups: GroupMetrics,
    pub messages: MessageMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
    pub evicted: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMetrics {
    pub reclaimed: u64,
    pub tabs_shared: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub received: u64,
    pub sent: u64,
    pub send_failures: u64,
    pub malformed: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub connections: u64,
    pub groups: usize,
    pub send_failures: u64,
    pub uptime_secs: u64,
}
