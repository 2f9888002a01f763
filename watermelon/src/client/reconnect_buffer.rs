//! Byte-bounded admission control for publishes issued while reconnecting.
//!
//! The command channel shared with the handler task already carries the
//! actual messages across a reconnect (its receiver half survives inside
//! [`RecycledHandler`](crate::handler::RecycledHandler)); what's missing
//! without this is a limit on how much gets queued there while nobody's
//! polling it. This tracks payload bytes reserved for the current
//! reconnect window and refuses admission past the configured limit,
//! rather than letting the channel grow unbounded or silently blocking.

use crate::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub(crate) struct ReconnectBuffer {
    pending_bytes: AtomicU64,
    max_pending_bytes: u64,
}

impl ReconnectBuffer {
    pub(crate) fn new(max_pending_bytes: u64) -> Self {
        Self {
            pending_bytes: AtomicU64::new(0),
            max_pending_bytes: if max_pending_bytes == 0 {
                u64::MAX
            } else {
                max_pending_bytes
            },
        }
    }

    /// Try to reserve `len` bytes for a publish. Returns `false` without
    /// reserving anything if that would exceed the configured limit.
    pub(crate) fn reserve(&self, len: u64) -> bool {
        let mut current = self.pending_bytes.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(len);
            if next > self.max_pending_bytes {
                return false;
            }
            match self.pending_bytes.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Reopen the limit once reconnecting ends, successfully or not: the
    /// command channel now owns whatever was queued.
    pub(crate) fn reset(&self) {
        self.pending_bytes.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::ReconnectBuffer;

    #[test]
    fn reserve_respects_limit() {
        let buffer = ReconnectBuffer::new(10);
        assert!(buffer.reserve(6));
        assert!(buffer.reserve(4));
        assert!(!buffer.reserve(1));
    }

    #[test]
    fn reset_reopens_the_limit() {
        let buffer = ReconnectBuffer::new(10);
        assert!(buffer.reserve(10));
        assert!(!buffer.reserve(1));
        buffer.reset();
        assert!(buffer.reserve(10));
    }

    #[test]
    fn zero_means_unlimited() {
        let buffer = ReconnectBuffer::new(0);
        assert!(buffer.reserve(u64::MAX / 2));
        assert!(buffer.reserve(u64::MAX / 2));
    }
}
