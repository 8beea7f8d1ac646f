//! Server metrics for observability
//!
//! Atomic counters updated from the relay, the sandbox controllers and the
//! WebSocket handler, exposed as a JSON snapshot.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently attached workspace sessions
    pub active_connections: AtomicU64,
    /// Total sessions since server start
    pub total_connections: AtomicU64,

    // Relay metrics
    /// Events enqueued to a subscriber
    pub messages_relayed: AtomicU64,
    /// Events dropped because a subscriber queue was full
    pub messages_dropped: AtomicU64,
    /// Frames received from clients
    pub messages_received: AtomicU64,

    // Sandbox metrics
    /// Runs started
    pub sandbox_runs: AtomicU64,
    /// Runs that failed during mount, install or start
    pub sandbox_failures: AtomicU64,
    /// Instances stopped by a later run
    pub sandbox_superseded: AtomicU64,

    // Error metrics
    pub websocket_errors: AtomicU64,
    pub store_errors: AtomicU64,

    start_time: Option<Instant>,
}

impl ServerMetrics {
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

    pub fn message_relayed(&self) {
        self.messages_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sandbox_run_started(&self) {
        self.sandbox_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sandbox_run_failed(&self) {
        self.sandbox_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sandbox_superseded(&self) {
        self.sandbox_superseded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn websocket_error(&self) {
        self.websocket_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                relayed: self.messages_relayed.load(Ordering::Relaxed),
                dropped: self.messages_dropped.load(Ordering::Relaxed),
            },
            sandbox: SandboxMetrics {
                runs: self.sandbox_runs.load(Ordering::Relaxed),
                failures: self.sandbox_failures.load(Ordering::Relaxed),
                superseded: self.sandbox_superseded.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                websocket: self.websocket_errors.load(Ordering::Relaxed),
                store: self.store_errors.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub messages: MessageMetrics,
    pub sandbox: SandboxMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub received: u64,
    pub relayed: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxMetrics {
    pub runs: u64,
    pub failures: u64,
    pub superseded: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub websocket: u64,
    pub store: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub sandboxes: SandboxHealth,
    pub connections: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxHealth {
    pub total: u64,
    pub running: u64,
}
