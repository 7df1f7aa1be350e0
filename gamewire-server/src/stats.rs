//! Server statistics and connection limits.

use crate::metrics::Metrics;
use crate::session::TransportKind;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Final state of one dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Replied,
    Void,
    Dropped,
    Failed,
    Rejected,
}

impl Outcome {
    pub fn label(self) -> &'static str {
        match self {
            Outcome::Replied => "replied",
            Outcome::Void => "void",
            Outcome::Dropped => "dropped",
            Outcome::Failed => "failed",
            Outcome::Rejected => "rejected",
        }
    }
}

/// Server statistics, mirrored into Prometheus when metrics are enabled.
#[derive(Default)]
pub struct ServerStats {
    connections_total: AtomicU64,
    connections_active: AtomicU64,
    messages_received: AtomicU64,
    protocol_errors: AtomicU64,
    heartbeats_sent: AtomicU64,
    replied: AtomicU64,
    void: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    metrics: Option<Arc<Metrics>>,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub messages_received: u64,
    pub protocol_errors: u64,
    pub heartbeats_sent: u64,
    pub replied: u64,
    pub void: u64,
    pub dropped: u64,
    pub failed: u64,
    pub rejected: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics: Some(metrics),
            ..Self::default()
        }
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    pub fn connection_opened(&self, kind: TransportKind) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.metrics {
            metrics
                .connections_total
                .with_label_values(&[kind.label()])
                .inc();
            metrics
                .connections_active
                .with_label_values(&[kind.label()])
                .inc();
        }
    }

    pub fn connection_closed(&self, kind: TransportKind) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.metrics {
            metrics
                .connections_active
                .with_label_values(&[kind.label()])
                .dec();
        }
    }

    pub fn message_received(&self, kind: TransportKind) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.metrics {
            metrics.messages_total.with_label_values(&[kind.label()]).inc();
        }
    }

    pub fn protocol_error(&self, kind: TransportKind) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.metrics {
            metrics
                .protocol_errors_total
                .with_label_values(&[kind.label()])
                .inc();
        }
    }

    pub fn heartbeat_sent(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.metrics {
            metrics.heartbeats_total.inc();
        }
    }

    pub fn outcome(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Replied => &self.replied,
            Outcome::Void => &self.void,
            Outcome::Dropped => &self.dropped,
            Outcome::Failed => &self.failed,
            Outcome::Rejected => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.metrics {
            metrics
                .dispatch_total
                .with_label_values(&[outcome.label()])
                .inc();
        }
    }

    pub fn handler_duration(&self, code: &str, elapsed: Duration) {
        if let Some(ref metrics) = self.metrics {
            metrics
                .handler_duration
                .with_label_values(&[code])
                .observe(elapsed.as_secs_f64());
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            replied: self.replied.load(Ordering::Relaxed),
            void: self.void.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Caps the number of open connections on one listener.
#[derive(Debug)]
pub struct ConnectionLimit {
    active: Arc<AtomicUsize>,
    max: usize,
}

/// A held connection slot, released on drop.
#[derive(Debug)]
pub struct ConnectionPermit {
    active: Arc<AtomicUsize>,
}

impl ConnectionLimit {
    pub fn new(max: usize) -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            max,
        }
    }

    /// Takes a slot, or returns `None` when the listener is full.
    pub fn try_acquire(&self) -> Option<ConnectionPermit> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .ok()
            .map(|_| ConnectionPermit {
                active: Arc::clone(&self.active),
            })
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}
