//! A single task driving every interval timer in the runtime.
//!
//! Modeled after the spec's timer wheel: one worker, a deadline-ordered
//! collection of entries, reset/stop callable from any task. The intrusive
//! list of the reference implementation becomes a `BTreeMap` keyed by
//! `(deadline, seq)`, with `seq` standing in for the intrusive link order
//! when two timers share a deadline.
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Duration, Instant},
};

#[derive(Debug)]
enum Command {
    Schedule {
        id: u64,
        deadline: Instant,
        interval: Duration,
        fire: Arc<Mutex<Box<dyn FnMut() + Send>>>,
        stop: Option<Box<dyn FnOnce() + Send>>,
    },
    Reset {
        id: u64,
        interval: Duration,
    },
    Stop {
        id: u64,
    },
    /// Sent once by [`TimerWheel::signal_shutdown`]. Unlike dropping every
    /// sender, this reaches the run loop even while a [`TimerHandle`] clone
    /// outlives the wheel.
    Shutdown,
}

struct Entry {
    id: u64,
    interval: Duration,
    fire: Arc<Mutex<Box<dyn FnMut() + Send>>>,
    stop: Option<Box<dyn FnOnce() + Send>>,
}

/// A handle to a scheduled timer.
///
/// Dropping this handle does not stop the timer; call [`TimerHandle::stop`]
/// explicitly, matching the spec's "stop callable from any thread"
/// requirement without tying timer lifetime to handle lifetime.
#[derive(Debug, Clone)]
pub(crate) struct TimerHandle {
    id: u64,
    commands: mpsc::UnboundedSender<Command>,
}

impl TimerHandle {
    /// Rearm this timer to fire `interval` from now, and on every `interval`
    /// thereafter until stopped.
    pub(crate) fn reset(&self, interval: Duration) {
        let _ = self.commands.send(Command::Reset {
            id: self.id,
            interval,
        });
    }

    pub(crate) fn stop(&self) {
        let _ = self.commands.send(Command::Stop { id: self.id });
    }
}

/// The timer wheel's worker task handle.
#[derive(Debug)]
pub(crate) struct TimerWheel {
    commands: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TimerWheel {
    pub(crate) fn spawn() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(rx));
        Arc::new(Self {
            commands: tx,
            next_id: AtomicU64::new(0),
            task: Mutex::new(Some(task)),
        })
    }

    /// Schedule a new repeating timer, firing `fire` every `interval`
    /// starting `interval` from now. `stop` runs exactly once, after the
    /// timer is stopped and any in-flight `fire` callback has returned.
    pub(crate) fn schedule<F, S>(&self, interval: Duration, fire: F, stop: S) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
        S: FnOnce() + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.commands.send(Command::Schedule {
            id,
            deadline: Instant::now() + interval,
            interval,
            fire: Arc::new(Mutex::new(Box::new(fire))),
            stop: Some(Box::new(stop)),
        });
        TimerHandle {
            id,
            commands: self.commands.clone(),
        }
    }

    /// Ask the run loop to stop. Non-blocking: safe to call from `Drop`.
    pub(crate) fn signal_shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Wait for the run loop to exit, firing every pending `stop` callback
    /// on the way out. Call [`Self::signal_shutdown`] first.
    pub(crate) async fn join(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn run(mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut entries: BTreeMap<(Instant, u64), Entry> = BTreeMap::new();
    let mut ids: std::collections::HashMap<u64, Instant> = std::collections::HashMap::new();

    loop {
        let next_deadline = entries.keys().next().map(|(deadline, _)| *deadline);

        tokio::select! {
            biased;

            cmd = commands.recv() => {
                match cmd {
                    None => break,
                    Some(Command::Schedule { id, deadline, interval, fire, stop }) => {
                        ids.insert(id, deadline);
                        entries.insert((deadline, id), Entry { id, interval, fire, stop });
                    }
                    Some(Command::Reset { id, interval }) => {
                        if let Some(&old_deadline) = ids.get(&id) {
                            if let Some(mut entry) = entries.remove(&(old_deadline, id)) {
                                entry.interval = interval;
                                let deadline = Instant::now() + interval;
                                ids.insert(id, deadline);
                                entries.insert((deadline, id), entry);
                            }
                        }
                    }
                    Some(Command::Stop { id }) => {
                        if let Some(old_deadline) = ids.remove(&id) {
                            if let Some(entry) = entries.remove(&(old_deadline, id)) {
                                if let Some(stop) = entry.stop {
                                    stop();
                                }
                            }
                        }
                    }
                    Some(Command::Shutdown) => break,
                }
            }

            () = sleep_until_or_forever(next_deadline) => {
                let Some((&(deadline, id), _)) = entries.iter().next().map(|(k, v)| (k, v)) else {
                    continue;
                };
                let mut entry = entries.remove(&(deadline, id)).unwrap();
                ids.remove(&id);

                // Spawned detached so a slow fire callback can't stall
                // processing of `Reset`/`Stop` commands for other timers.
                let fire = Arc::clone(&entry.fire);
                tokio::spawn(async move {
                    (fire.lock().unwrap_or_else(|e| e.into_inner()))();
                });

                let next_deadline = Instant::now() + entry.interval;
                ids.insert(id, next_deadline);
                entries.insert((next_deadline, id), entry);
            }
        }
    }

    for (_, entry) in entries {
        if let Some(stop) = entry.stop {
            stop();
        }
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use tokio::time::Duration;

    use super::TimerWheel;

    #[tokio::test(start_paused = true)]
    async fn schedule_fires_on_every_interval() {
        let wheel = TimerWheel::spawn();
        let fires = Arc::new(AtomicUsize::new(0));
        let fires_in_callback = Arc::clone(&fires);

        let _handle = wheel.schedule(
            Duration::from_secs(1),
            move || {
                fires_in_callback.fetch_add(1, Ordering::SeqCst);
            },
            || {},
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(0, fires.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(1, fires.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(2, fires.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_reschedules_the_deadline_from_now() {
        let wheel = TimerWheel::spawn();
        let fires = Arc::new(AtomicUsize::new(0));
        let fires_in_callback = Arc::clone(&fires);

        let handle = wheel.schedule(
            Duration::from_secs(1),
            move || {
                fires_in_callback.fetch_add(1, Ordering::SeqCst);
            },
            || {},
        );

        tokio::time::sleep(Duration::from_millis(800)).await;
        handle.reset(Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(0, fires.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(1, fires.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_runs_the_stop_callback_and_suppresses_further_fires() {
        let wheel = TimerWheel::spawn();
        let fires = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let fires_in_callback = Arc::clone(&fires);
        let stopped_in_callback = Arc::clone(&stopped);

        let handle = wheel.schedule(
            Duration::from_secs(1),
            move || {
                fires_in_callback.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                stopped_in_callback.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(1, fires.load(Ordering::SeqCst));

        handle.stop();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(1, stopped.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(1, fires.load(Ordering::SeqCst));
    }
}
