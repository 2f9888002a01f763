//! FIFO pump invoking user callbacks off of the connection's hot path.
//!
//! User callbacks must never run on an I/O or timer task; every
//! `CallbackEvent` produced anywhere in the runtime is routed through this
//! single-consumer channel instead of being invoked in place.
use std::sync::{Arc, Mutex};

use tokio::{sync::mpsc, task::JoinHandle};

use crate::client::Callbacks;
use watermelon_proto::ServerAddr;

/// An event destined for one of the user's registered callbacks.
#[derive(Debug)]
pub(crate) enum CallbackEvent {
    Connected,
    Disconnected,
    Reconnected,
    Closed,
    DiscoveredServers(Vec<ServerAddr>),
    LameDuck,
    AsyncError(AsyncErrorKind),
    /// Sent once by [`CallbackPump::signal_shutdown`] after any
    /// legitimately-queued events, so the run loop drains everything ahead
    /// of it before exiting.
    Shutdown,
}

#[derive(Debug, Copy, Clone)]
pub(crate) enum AsyncErrorKind {
    SlowConsumer,
}

#[derive(Debug)]
pub(crate) struct CallbackPump {
    sender: mpsc::UnboundedSender<CallbackEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CallbackPump {
    pub(crate) fn spawn(callbacks: Arc<Callbacks>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(rx, callbacks));
        Self {
            sender: tx,
            task: Mutex::new(Some(task)),
        }
    }

    pub(crate) fn post(&self, event: CallbackEvent) {
        let _ = self.sender.send(event);
    }

    /// Ask the pump to stop once it has drained whatever's already queued.
    /// Non-blocking: safe to call from `Drop`.
    pub(crate) fn signal_shutdown(&self) {
        let _ = self.sender.send(CallbackEvent::Shutdown);
    }

    /// Wait for the pump task to exit. Call [`Self::signal_shutdown`] first.
    pub(crate) async fn join(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn run(mut events: mpsc::UnboundedReceiver<CallbackEvent>, callbacks: Arc<Callbacks>) {
    while let Some(event) = events.recv().await {
        match event {
            CallbackEvent::Connected => {
                if let Some(cb) = &callbacks.on_connected {
                    cb();
                }
            }
            CallbackEvent::Disconnected => {
                if let Some(cb) = &callbacks.on_disconnected {
                    cb();
                }
            }
            CallbackEvent::Reconnected => {
                if let Some(cb) = &callbacks.on_reconnected {
                    cb();
                }
            }
            CallbackEvent::Closed => {
                if let Some(cb) = &callbacks.on_closed {
                    cb();
                }
                break;
            }
            CallbackEvent::DiscoveredServers(servers) => {
                if let Some(cb) = &callbacks.on_discovered_servers {
                    cb(&servers);
                }
            }
            CallbackEvent::LameDuck => {
                if let Some(cb) = &callbacks.on_lame_duck {
                    cb();
                }
            }
            CallbackEvent::AsyncError(AsyncErrorKind::SlowConsumer) => {
                if let Some(cb) = &callbacks.on_async_error {
                    cb("slow consumer");
                }
            }
            CallbackEvent::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::{AsyncErrorKind, CallbackEvent, CallbackPump};
    use crate::client::Callbacks;

    #[tokio::test]
    async fn events_are_delivered_in_order() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut callbacks = Callbacks::default();
        let seen_connected = Arc::clone(&seen);
        callbacks.on_connected = Some(Box::new(move || seen_connected.lock().unwrap().push("connected")));
        let seen_disconnected = Arc::clone(&seen);
        callbacks.on_disconnected =
            Some(Box::new(move || seen_disconnected.lock().unwrap().push("disconnected")));
        let seen_reconnected = Arc::clone(&seen);
        callbacks.on_reconnected =
            Some(Box::new(move || seen_reconnected.lock().unwrap().push("reconnected")));
        let seen_async_error = Arc::clone(&seen);
        callbacks.on_async_error =
            Some(Box::new(move |_| seen_async_error.lock().unwrap().push("async_error")));

        let pump = CallbackPump::spawn(Arc::new(callbacks));
        pump.post(CallbackEvent::Connected);
        pump.post(CallbackEvent::Disconnected);
        pump.post(CallbackEvent::Reconnected);
        pump.post(CallbackEvent::AsyncError(AsyncErrorKind::SlowConsumer));

        // The pump is single-consumer FIFO, so give it a chance to drain
        // before asserting order.
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            vec!["connected", "disconnected", "reconnected", "async_error"],
            *seen.lock().unwrap()
        );
    }

    #[tokio::test]
    async fn missing_callback_is_a_noop() {
        let pump = CallbackPump::spawn(Arc::new(Callbacks::default()));
        pump.post(CallbackEvent::Connected);
        pump.post(CallbackEvent::LameDuck);
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
        // Nothing registered, nothing to assert beyond "didn't panic".
    }

    #[tokio::test]
    async fn closed_stops_the_pump_task() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_callback = Arc::clone(&fired);

        let mut callbacks = Callbacks::default();
        callbacks.on_closed = Some(Box::new(move || {
            fired_in_callback.fetch_add(1, Ordering::SeqCst);
        }));

        let pump = CallbackPump::spawn(Arc::new(callbacks));
        pump.post(CallbackEvent::Closed);
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
        assert_eq!(1, fired.load(Ordering::SeqCst));

        // Posting after `Closed` is silently dropped: the pump task exited.
        pump.post(CallbackEvent::Connected);
    }
}
