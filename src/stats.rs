//! Pipeline counters.
//!
//! Lock-free tallies of what flowed through one process, readable from any
//! task and printable on shutdown.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct PipelineStats {
    produced: AtomicU64,
    sent: AtomicU64,
    send_failures: AtomicU64,
    received: AtomicU64,
    alerts: AtomicU64,
    reconnects: AtomicU64,
    started_at: DateTime<Utc>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            produced: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            received: AtomicU64::new(0),
            alerts: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }

    pub fn record_produced(&self) {
        self.produced.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of one `Transport::send`.
    pub fn record_send(&self, ok: bool) {
        if ok {
            self.sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.send_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alert(&self) {
        self.alerts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            produced: self.produced.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            alerts: self.alerts.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
        }
    }

    pub fn summary(&self) -> String {
        let s = self.snapshot();
        format!(
            "Session Statistics:\n\
             - Events produced: {}\n\
             - Events sent: {}\n\
             - Send failures: {}\n\
             - Messages received: {}\n\
             - Alerts: {}\n\
             - Reconnects: {}\n\
             - Uptime: {} seconds",
            s.produced, s.sent, s.send_failures, s.received, s.alerts, s.reconnects, s.uptime_secs
        )
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub produced: u64,
    pub sent: u64,
    pub send_failures: u64,
    pub received: u64,
    pub alerts: u64,
    pub reconnects: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
}

pub type SharedStats = Arc<PipelineStats>;
