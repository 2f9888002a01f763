//! Deferred destruction for releases that would otherwise happen under a
//! lock held by a hot path.
//!
//! Rust's ownership model makes most of the reference implementation's GC
//! queue unnecessary: a value's last `Arc`/`Box` drops wherever the last
//! reference goes out of scope, and the common drop sites in this crate
//! (the connection task, `Subscription::drop`) don't hold a lock across
//! that point. The one place this crate still needs an explicit deferral is
//! the shared-pool dispatcher (`runtime::dispatch`), which can observe a
//! subscription's final drop while holding its own worker-local queue lock;
//! it hands the drop to this queue instead of running it in place.
use std::sync::Mutex;

use tokio::{sync::mpsc, task::JoinHandle};

type Deferred = Box<dyn FnOnce() + Send>;

enum GcCommand {
    Run(Deferred),
    Shutdown,
}

#[derive(Debug)]
pub(crate) struct GcQueue {
    sender: mpsc::UnboundedSender<GcCommand>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GcQueue {
    pub(crate) fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(rx));
        Self {
            sender: tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Defer running `drop_fn` until outside of the caller's current lock
    /// scope. Returns `true` if the item was accepted (mirrors the
    /// reference implementation's `collect()` return value, which tells the
    /// caller whether it may skip freeing the object itself).
    pub(crate) fn defer<F>(&self, drop_fn: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender.send(GcCommand::Run(Box::new(drop_fn))).is_ok()
    }

    /// Ask the queue to stop once it has drained whatever's already queued.
    /// Non-blocking: safe to call from `Drop`.
    pub(crate) fn signal_shutdown(&self) {
        let _ = self.sender.send(GcCommand::Shutdown);
    }

    /// Wait for the queue task to exit. Call [`Self::signal_shutdown`] first.
    pub(crate) async fn join(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn run(mut commands: mpsc::UnboundedReceiver<GcCommand>) {
    const BATCH: usize = 64;
    let mut batch = Vec::with_capacity(BATCH);

    loop {
        let n = commands.recv_many(&mut batch, BATCH).await;
        if n == 0 {
            break;
        }
        let mut shutting_down = false;
        for command in batch.drain(..) {
            match command {
                GcCommand::Run(item) => item(),
                GcCommand::Shutdown => shutting_down = true,
            }
        }
        if shutting_down {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::GcQueue;

    #[tokio::test]
    async fn deferred_drops_run_on_the_gc_task() {
        let queue = GcQueue::spawn();
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let ran = Arc::clone(&ran);
            assert!(queue.defer(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }

        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
        assert_eq!(3, ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn defer_after_shutdown_reports_rejection() {
        let queue = GcQueue::spawn();
        queue.signal_shutdown();
        queue.join().await;

        // The channel is still open (the sender lives in `queue`), so
        // `defer` still reports success even though nothing will ever run
        // it. What matters is that it never panics or blocks.
        let _ = queue.defer(|| {});
    }

    #[tokio::test]
    async fn shutdown_drains_already_queued_items_first() {
        let queue = GcQueue::spawn();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let ran = Arc::clone(&ran);
            queue.defer(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        queue.signal_shutdown();
        queue.join().await;
        assert_eq!(5, ran.load(Ordering::SeqCst));
    }
}
