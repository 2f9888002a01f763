//! Per-connection traffic counters.
use crate::atomic::{AtomicU64, Ordering};

/// A snapshot of a connection's traffic counters.
///
/// Obtained from [`Client::statistics`](crate::core::Client::statistics).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    /// Number of `MSG`/`HMSG` frames parsed in the current connection
    /// generation.
    pub in_msgs: u64,
    /// Number of payload bytes received in the current connection
    /// generation.
    pub in_bytes: u64,
    /// Number of messages published.
    pub out_msgs: u64,
    /// Number of payload bytes published.
    pub out_bytes: u64,
    /// Number of times this client has reconnected.
    pub reconnects: u64,
}

/// Monotonically non-decreasing (within a connection generation) traffic
/// counters, shared between the connection task and `Client::statistics`.
#[derive(Debug, Default)]
pub(crate) struct Statistics {
    in_msgs: AtomicU64,
    in_bytes: AtomicU64,
    out_msgs: AtomicU64,
    out_bytes: AtomicU64,
    reconnects: AtomicU64,
}

impl Statistics {
    pub(crate) fn record_in(&self, bytes: u64) {
        self.in_msgs.fetch_add(1, Ordering::Relaxed);
        self.in_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_out(&self, bytes: u64) {
        self.out_msgs.fetch_add(1, Ordering::Relaxed);
        self.out_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            in_msgs: self.in_msgs.load(Ordering::Relaxed),
            in_bytes: self.in_bytes.load(Ordering::Relaxed),
            out_msgs: self.out_msgs.load(Ordering::Relaxed),
            out_bytes: self.out_bytes.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}
