//! The process-wide (or, in this crate, per-[`Client`](crate::core::Client))
//! runtime: timer wheel, async-callback pump, GC queue and delivery worker
//! pool.
//!
//! This is a singleton with an explicit `open`/`close` lifecycle and a
//! reference count, expressed as an `Arc<Runtime>` owned by the `Client`:
//! construction is `open`, the last `Arc` dropping is `close`.
//! [`Runtime::shutdown_and_wait`] is offered for callers that want the
//! blocking-join semantics of `closeAndWait` instead of relying on `Drop`.
use std::sync::{atomic::AtomicBool, Arc};

use tokio::task_local;

pub(crate) use self::callback_pump::{AsyncErrorKind, CallbackEvent, CallbackPump};
pub(crate) use self::dispatch::{SubscriptionHandler, WorkerPool};
pub use self::dispatch::DeliveryModel;
pub(crate) use self::gc::GcQueue;
pub(crate) use self::timer::{TimerHandle, TimerWheel};

mod callback_pump;
mod dispatch;
mod gc;
mod timer;

use crate::client::Callbacks;

task_local! {
    static INSIDE_RUNTIME_TASK: ();
}

/// Process-wide (or client-wide) helper state: timer wheel, async-callback
/// pump, GC queue and delivery worker pool.
#[derive(Debug)]
pub(crate) struct Runtime {
    pub(crate) timer: Arc<TimerWheel>,
    pub(crate) callbacks: CallbackPump,
    pub(crate) gc: Arc<GcQueue>,
    pub(crate) workers: std::sync::Mutex<WorkerPool>,
    shut_down: AtomicBool,
}

impl Runtime {
    /// `open()`: start the timer wheel, async-callback pump and GC queue,
    /// and size the delivery worker pool per `pool_size`.
    ///
    /// `spin_count` is accepted for interface parity with the reference
    /// implementation's `open(spinCount)` but is otherwise unused: tokio's
    /// scheduler doesn't spin-wait for initialization the way the C core's
    /// helper threads do.
    pub(crate) fn open(callbacks: Arc<Callbacks>, pool_size: usize) -> Arc<Self> {
        let gc = Arc::new(GcQueue::spawn());
        Arc::new(Self {
            timer: TimerWheel::spawn(),
            callbacks: CallbackPump::spawn(callbacks),
            workers: std::sync::Mutex::new(WorkerPool::new(pool_size.max(1), Arc::clone(&gc))),
            gc,
            shut_down: AtomicBool::new(false),
        })
    }

    /// `close()`: signal every helper task to stop. Idempotent, non-blocking.
    ///
    /// Returns [`ErrorKind::IllegalState`] instead of shutting down if
    /// called from inside one of this runtime's own helper tasks, mirroring
    /// the reference implementation's thread-key based guard against a
    /// helper thread joining itself.
    pub(crate) fn close(&self) -> Result<(), crate::error::Error> {
        if INSIDE_RUNTIME_TASK.try_with(|_| ()).is_ok() {
            return Err(crate::error::Error::new(crate::error::ErrorKind::IllegalState)
                .with_message("close() called from a runtime helper task")
                .bubble("Runtime::close"));
        }

        if self.shut_down.swap(true, std::sync::atomic::Ordering::AcqRel) {
            return Ok(());
        }
        self.timer.signal_shutdown();
        self.callbacks.signal_shutdown();
        self.gc.signal_shutdown();
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .signal_shutdown();
        Ok(())
    }

    /// `closeAndWait(timeoutMs)`: signal shutdown and wait for every helper
    /// task to actually join, so that after this returns `refs == 0` holds
    /// for real rather than by a fixed sleep. `timeout` of `None` waits
    /// indefinitely.
    pub(crate) async fn close_and_wait(&self, timeout: Option<std::time::Duration>) {
        let _ = self.close();
        let worker_tasks = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take_tasks();

        let join_all = async {
            self.timer.join().await;
            self.callbacks.join().await;
            self.gc.join().await;
            for task in worker_tasks {
                let _ = task.await;
            }
        };
        match timeout {
            Some(timeout) => {
                let _ = tokio::time::timeout(timeout, join_all).await;
            }
            None => join_all.await,
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
