//! The ordered list of candidate servers a [`Client`](crate::core::Client)
//! iterates while connecting and reconnecting.
use std::time::Instant;

use rand::seq::SliceRandom;
use watermelon_proto::ServerAddr;

/// A single candidate server, as tracked by the [`ServerPool`].
#[derive(Debug, Clone)]
pub(crate) struct ServerEntry {
    pub(crate) addr: ServerAddr,
    pub(crate) discovered_at: Option<Instant>,
    pub(crate) auth_attempts: u32,
}

impl ServerEntry {
    fn explicit(addr: ServerAddr) -> Self {
        Self {
            addr,
            discovered_at: None,
            auth_attempts: 0,
        }
    }

    fn discovered(addr: ServerAddr) -> Self {
        Self {
            addr,
            discovered_at: Some(Instant::now()),
            auth_attempts: 0,
        }
    }
}

/// An ordered, wrapping list of candidate servers.
///
/// Populated at [`ClientBuilder::connect`](crate::client::ClientBuilder)
/// time from the explicitly configured server list (optionally shuffled),
/// and grown afterwards as `INFO` frames advertise more discovered servers.
#[derive(Debug)]
pub(crate) struct ServerPool {
    entries: Vec<ServerEntry>,
    cursor: usize,
}

impl ServerPool {
    pub(crate) fn new(servers: Vec<ServerAddr>, randomize: bool) -> Self {
        let mut entries: Vec<ServerEntry> = servers.into_iter().map(ServerEntry::explicit).collect();
        if randomize {
            entries.shuffle(&mut rand::thread_rng());
        }
        Self { entries, cursor: 0 }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterate the pool starting from the current cursor, wrapping around
    /// exactly once (i.e. yields each entry at most once per call).
    pub(crate) fn iter_from_cursor(&self) -> impl Iterator<Item = &ServerEntry> {
        let len = self.entries.len();
        let cursor = self.cursor;
        (0..len).map(move |offset| &self.entries[(cursor + offset) % len])
    }

    /// Advance the cursor to just past `addr`, so the next connection
    /// attempt round starts with a different server first.
    pub(crate) fn advance_past(&mut self, addr: &ServerAddr) {
        if let Some(pos) = self.entries.iter().position(|entry| &entry.addr == addr) {
            self.cursor = (pos + 1) % self.entries.len().max(1);
        }
    }

    pub(crate) fn record_auth_attempt(&mut self, addr: &ServerAddr) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| &entry.addr == addr) {
            entry.auth_attempts += 1;
        }
    }

    /// Merge newly discovered server URLs (from `ServerInfo::connect_urls`)
    /// into the pool. Returns the subset of `urls` that were new, which
    /// drives the `discoveredServers` callback; empty means nothing changed.
    pub(crate) fn merge_discovered(&mut self, urls: &[ServerAddr]) -> Vec<ServerAddr> {
        let mut added = Vec::new();
        for url in urls {
            if !self.entries.iter().any(|entry| &entry.addr == url) {
                self.entries.push(ServerEntry::discovered(url.clone()));
                added.push(url.clone());
            }
        }
        added
    }

    pub(crate) fn snapshot(&self) -> Vec<ServerAddr> {
        self.entries.iter().map(|entry| entry.addr.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::ServerPool;
    use watermelon_proto::ServerAddr;

    fn addr(s: &str) -> ServerAddr {
        s.parse().unwrap()
    }

    #[test]
    fn merge_discovered_dedupes() {
        let mut pool = ServerPool::new(vec![addr("nats://a:4222")], false);
        assert_eq!(1, pool.len());

        assert_eq!(
            vec![addr("nats://b:4222")],
            pool.merge_discovered(&[addr("nats://a:4222"), addr("nats://b:4222")])
        );
        assert_eq!(2, pool.len());

        assert!(pool.merge_discovered(&[addr("nats://b:4222")]).is_empty());
        assert_eq!(2, pool.len());
    }

    #[test]
    fn iteration_wraps_from_cursor() {
        let mut pool = ServerPool::new(
            vec![addr("nats://a:4222"), addr("nats://b:4222"), addr("nats://c:4222")],
            false,
        );
        pool.advance_past(&addr("nats://a:4222"));

        let order: Vec<_> = pool
            .iter_from_cursor()
            .map(|entry| entry.addr.to_string())
            .collect();
        assert_eq!(
            vec![
                "nats://b:4222".to_owned(),
                "nats://c:4222".to_owned(),
                "nats://a:4222".to_owned(),
            ],
            order
        );
    }
}
