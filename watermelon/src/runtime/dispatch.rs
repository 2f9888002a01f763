//! The two message-delivery models a subscription can use.
//!
//! A subscription either owns a private channel that the user polls
//! directly (`PerSubscription`, the original per-subscription behavior,
//! exposed to users as a [`Stream`](futures_core::Stream) or via
//! [`Subscription::next_msg`](crate::subscription::Subscription::next_msg)),
//! or it is assigned round-robin to one of a fixed pool of worker tasks
//! that invoke a user-supplied closure serially (`SharedPool`).
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::{sync::mpsc, task::JoinHandle};
use watermelon_proto::{error::ServerError, ServerMessage, SubscriptionId};

use super::gc::GcQueue;

/// Selects which delivery model new subscriptions on a connection use by
/// default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryModel {
    /// Each subscription gets its own channel, polled directly by the user.
    PerSubscription,
    /// Subscriptions are assigned round-robin to a fixed pool of worker
    /// tasks that invoke a registered handler closure.
    SharedPool {
        /// Number of worker tasks in the pool.
        size: usize,
    },
}

impl Default for DeliveryModel {
    fn default() -> Self {
        Self::PerSubscription
    }
}

pub(crate) type SubscriptionHandler = Box<dyn FnMut(Result<ServerMessage, ServerError>) + Send>;

enum WorkerCommand {
    Register {
        id: SubscriptionId,
        handler: SubscriptionHandler,
        pending_bytes: Arc<AtomicU64>,
        pending_msgs: Arc<AtomicU64>,
    },
    Deliver {
        id: SubscriptionId,
        message: Result<ServerMessage, ServerError>,
    },
    Close {
        id: SubscriptionId,
        completion: Option<Box<dyn FnOnce() + Send>>,
    },
    Shutdown,
}

struct RegisteredHandler {
    handler: SubscriptionHandler,
    /// Mirrors the `Direct` delivery model's pending-bytes/pending-msgs
    /// counters; decremented here once the handler has actually consumed
    /// a message, so `Shared` subscribers get the same backpressure
    /// accounting as `Direct` ones.
    pending_bytes: Arc<AtomicU64>,
    pending_msgs: Arc<AtomicU64>,
}

struct Worker {
    sender: mpsc::UnboundedSender<WorkerCommand>,
    task: JoinHandle<()>,
}

/// A fixed-size, growable pool of delivery worker tasks.
pub(crate) struct WorkerPool {
    workers: Vec<Worker>,
    gc: Arc<GcQueue>,
    next: std::sync::atomic::AtomicUsize,
}

impl WorkerPool {
    pub(crate) fn new(size: usize, gc: Arc<GcQueue>) -> Self {
        let mut workers = Vec::with_capacity(size.max(1));
        for _ in 0..size.max(1) {
            workers.push(spawn_worker());
        }
        Self {
            workers,
            gc,
            next: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Grow the pool to at least `size` workers.
    pub(crate) fn grow_to(&mut self, size: usize) {
        while self.workers.len() < size {
            self.workers.push(spawn_worker());
        }
    }

    /// Assign a new subscription to the next worker, round-robin.
    pub(crate) fn assign(
        &self,
        id: SubscriptionId,
        handler: SubscriptionHandler,
        pending_bytes: Arc<AtomicU64>,
        pending_msgs: Arc<AtomicU64>,
    ) -> usize {
        let idx = self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % self.workers.len();
        let _ = self.workers[idx].sender.send(WorkerCommand::Register {
            id,
            handler,
            pending_bytes,
            pending_msgs,
        });
        idx
    }

    pub(crate) fn deliver(&self, worker: usize, id: SubscriptionId, message: ServerMessage) {
        let _ = self.workers[worker]
            .sender
            .send(WorkerCommand::Deliver { id, message: Ok(message) });
    }

    pub(crate) fn deliver_error(&self, worker: usize, id: SubscriptionId, error: ServerError) {
        let _ = self.workers[worker].sender.send(WorkerCommand::Deliver {
            id,
            message: Err(error),
        });
    }

    /// Close out a subscription on its worker. The handler's final drop
    /// happens on the worker task; if that drop would run while the worker
    /// still holds an internal structure locked, it's routed through the GC
    /// queue instead (see `runtime::gc`).
    pub(crate) fn close(&self, worker: usize, id: SubscriptionId, completion: Option<Box<dyn FnOnce() + Send>>) {
        let gc = Arc::clone(&self.gc);
        let boxed_completion: Option<Box<dyn FnOnce() + Send>> = completion.map(|completion| {
            let boxed: Box<dyn FnOnce() + Send> = Box::new(move || {
                if !gc.defer(completion) {
                    // Queue is gone (runtime shut down); nothing left to notify.
                }
            });
            boxed
        });
        let _ = self.workers[worker]
            .sender
            .send(WorkerCommand::Close { id, completion: boxed_completion });
    }

    /// Ask every worker task to stop. Non-blocking: safe to call from `Drop`.
    pub(crate) fn signal_shutdown(&self) {
        for worker in &self.workers {
            let _ = worker.sender.send(WorkerCommand::Shutdown);
        }
    }

    /// Take ownership of every worker's `JoinHandle`, leaving this pool
    /// empty. Callers await the returned handles outside of whatever lock
    /// guards this pool.
    pub(crate) fn take_tasks(&mut self) -> Vec<JoinHandle<()>> {
        self.workers.drain(..).map(|worker| worker.task).collect()
    }
}

fn spawn_worker() -> Worker {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_worker(rx));
    Worker { sender: tx, task }
}

async fn run_worker(mut commands: mpsc::UnboundedReceiver<WorkerCommand>) {
    let mut handlers: BTreeMap<SubscriptionId, RegisteredHandler> = BTreeMap::new();

    while let Some(command) = commands.recv().await {
        match command {
            WorkerCommand::Register {
                id,
                handler,
                pending_bytes,
                pending_msgs,
            } => {
                handlers.insert(
                    id,
                    RegisteredHandler {
                        handler,
                        pending_bytes,
                        pending_msgs,
                    },
                );
            }
            WorkerCommand::Deliver { id, message } => {
                if let Some(registered) = handlers.get_mut(&id) {
                    if let Ok(msg) = &message {
                        registered
                            .pending_bytes
                            .fetch_sub(msg.base.payload.len() as u64, Ordering::Relaxed);
                        registered.pending_msgs.fetch_sub(1, Ordering::Relaxed);
                    }
                    (registered.handler)(message);
                }
            }
            WorkerCommand::Close { id, completion } => {
                handlers.remove(&id);
                if let Some(completion) = completion {
                    completion();
                }
            }
            WorkerCommand::Shutdown => break,
        }
    }
}
