//! Connection counters.
//!
//! Each client owns one [`Metrics`] behind an `Arc`; the read loop, the
//! writer task and the session bump it with relaxed atomics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug)]
pub struct Metrics {
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub sync_dispatched: AtomicU64,
    pub rpc_dispatched: AtomicU64,
    /// Inbound messages dropped because routing them failed
    pub dispatch_errors: AtomicU64,
    pub heartbeats_sent: AtomicU64,
    pub heartbeat_replies: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            sync_dispatched: AtomicU64::new(0),
            rpc_dispatched: AtomicU64::new(0),
            dispatch_errors: AtomicU64::new(0),
            heartbeats_sent: AtomicU64::new(0),
            heartbeat_replies: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn frame_sent(&self, byte_count: u64) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn frame_received(&self, byte_count: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn sync_dispatched(&self) {
        self.sync_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rpc_dispatched(&self) {
        self.rpc_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dispatch_error(&self) {
        self.dispatch_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_sent(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_reply(&self) {
        self.heartbeat_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            sync_dispatched: self.sync_dispatched.load(Ordering::Relaxed),
            rpc_dispatched: self.rpc_dispatched.load(Ordering::Relaxed),
            dispatch_errors: self.dispatch_errors.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            heartbeat_replies: self.heartbeat_replies.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            frames_sent = snapshot.frames_sent,
            frames_received = snapshot.frames_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            sync_dispatched = snapshot.sync_dispatched,
            rpc_dispatched = snapshot.rpc_dispatched,
            dispatch_errors = snapshot.dispatch_errors,
            heartbeats_sent = snapshot.heartbeats_sent,
            heartbeat_replies = snapshot.heartbeat_replies,
            uptime_seconds = snapshot.uptime_seconds,
            "Connection metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub sync_dispatched: u64,
    pub rpc_dispatched: u64,
    pub dispatch_errors: u64,
    pub heartbeats_sent: u64,
    pub heartbeat_replies: u64,
    pub uptime_seconds: u64,
}

/// Logs how long the enclosing scope took when dropped.
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        debug!(
            operation = self.operation,
            duration_ms = self.start.elapsed().as_millis() as u64,
            "Operation completed"
        );
    }
}
