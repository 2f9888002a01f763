use std::sync::atomic::{AtomicU8, Ordering};

/// The connection state machine's states.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionStatus {
    /// An initial connection attempt (or a reconnect attempt) is underway.
    Connecting,
    /// Connected and able to publish/subscribe.
    Connected,
    /// Not connected; no reconnect attempt is currently in flight.
    Disconnected,
    /// Lost the connection and is iterating the server pool to reconnect.
    Reconnecting,
    /// [`Client::close`](crate::core::Client::close) has run to completion.
    Closed,
}

impl ConnectionStatus {
    fn encode(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Connected => 1,
            Self::Disconnected => 2,
            Self::Reconnecting => 3,
            Self::Closed => 4,
        }
    }

    fn decode(val: u8) -> Self {
        match val {
            1 => Self::Connected,
            2 => Self::Disconnected,
            3 => Self::Reconnecting,
            4 => Self::Closed,
            _ => Self::Connecting,
        }
    }
}

#[derive(Debug)]
pub(crate) struct RawConnectionStatus(AtomicU8);

impl RawConnectionStatus {
    pub(crate) fn new(initial: ConnectionStatus) -> Self {
        Self(AtomicU8::new(initial.encode()))
    }

    pub(crate) fn store(&self, status: ConnectionStatus) {
        self.0.store(status.encode(), Ordering::Release);
    }

    pub(crate) fn get(&self) -> ConnectionStatus {
        ConnectionStatus::decode(self.0.load(Ordering::Acquire))
    }
}
