//! Periodic poll tasks with explicit handles.
//!
//! Every scheduled task runs in its own loop, so a task never overlaps with
//! itself. Ticks are fixed-rate; a tick whose deadline passed while the
//! previous run was still in flight is dropped rather than queued. Failures are
//! logged and delay the next attempt with capped exponential backoff.
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type TaskFuture = BoxFuture<'static, Result<()>>;

/// One unit of periodic work.
pub trait PollTask: Send + Sync + 'static {
    fn run(&self) -> TaskFuture;
}

impl<F, Fut> PollTask for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn run(&self) -> TaskFuture {
        Box::pin(self())
    }
}

#[derive(Debug, Default)]
pub struct TaskStats {
    runs: AtomicU64,
    failures: AtomicU64,
    skipped: AtomicU64,
    in_flight: AtomicBool,
}

impl TaskStats {
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Ticks dropped because the previous run was still in flight.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct TaskHandle {
    id: u64,
    name: Arc<str>,
    cancel: CancellationToken,
    period: Arc<watch::Sender<Duration>>,
    stats: Arc<TaskStats>,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &TaskStats {
        &self.stats
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn interval(&self) -> Duration {
        *self.period.borrow()
    }

    /// Change the cadence. The next tick comes one new period from now.
    pub fn set_interval(&self, period: Duration) {
        let changed = self.period.send_if_modified(|current| {
            if *current == period {
                return false;
            }
            *current = period;
            true
        });
        if changed {
            debug!(task = %self.name, ?period, "poll interval changed");
        }
    }
}

struct Entry {
    handle: TaskHandle,
    join: JoinHandle<()>,
}

pub struct PollingScheduler {
    root: CancellationToken,
    tasks: Mutex<HashMap<u64, Entry>>,
    next_id: AtomicU64,
    max_backoff: Duration,
}

impl PollingScheduler {
    pub fn new(max_backoff: Duration) -> Self {
        Self {
            root: CancellationToken::new(),
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_backoff,
        }
    }

    /// Cancelled together with every task on shutdown.
    pub fn token(&self) -> CancellationToken {
        self.root.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Start running `task` every `period`, beginning immediately.
    pub fn schedule<T: PollTask>(&self, name: &str, period: Duration, task: T) -> TaskHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (period_tx, period_rx) = watch::channel(period);
        let handle = TaskHandle {
            id,
            name: Arc::from(name),
            cancel: self.root.child_token(),
            period: Arc::new(period_tx),
            stats: Arc::new(TaskStats::default()),
        };
        let join = tokio::spawn(drive(
            handle.clone(),
            Arc::new(task),
            period_rx,
            self.max_backoff,
        ));
        info!(task = name, ?period, "scheduled poll task");
        self.registry().insert(
            id,
            Entry {
                handle: handle.clone(),
                join,
            },
        );
        handle
    }

    /// No further invocation starts after this returns. A run already in
    /// flight completes on its own.
    pub fn cancel(&self, handle: &TaskHandle) {
        handle.cancel.cancel();
        self.registry().remove(&handle.id);
        debug!(task = %handle.name, "cancelled poll task");
    }

    pub fn cancel_all(&self) {
        self.root.cancel();
        self.registry().clear();
    }

    /// Cancel everything and wait for in-flight runs to finish.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let entries: Vec<Entry> = self.registry().drain().map(|(_, e)| e).collect();
        for entry in entries {
            if let Err(err) = entry.join.await {
                warn!(task = %entry.handle.name, ?err, "poll task ended abnormally");
            }
        }
        info!("scheduler shut down");
    }

    pub fn active(&self) -> Vec<TaskHandle> {
        self.registry().values().map(|e| e.handle.clone()).collect()
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Entry>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

fn ticker(start: Instant, period: Duration) -> time::Interval {
    let mut t = time::interval_at(start, period);
    t.set_missed_tick_behavior(MissedTickBehavior::Skip);
    t
}

/// Delay before retrying after `failures` consecutive failures: the period
/// doubled per failure, capped at `max_backoff` (but never below the period).
pub fn backoff_delay(period: Duration, failures: u32, max_backoff: Duration) -> Duration {
    if failures == 0 {
        return period;
    }
    let factor = 2u32.saturating_pow(failures.min(16));
    let cap = max_backoff.max(period);
    period.saturating_mul(factor).min(cap)
}

async fn drive(
    handle: TaskHandle,
    task: Arc<dyn PollTask>,
    mut period_rx: watch::Receiver<Duration>,
    max_backoff: Duration,
) {
    let cancel = handle.cancel.clone();
    let stats = handle.stats.clone();
    let mut period = *period_rx.borrow_and_update();
    let mut ticks = ticker(Instant::now(), period);
    let mut period_open = true;
    let mut busy_until: Option<Instant> = None;
    let mut failures: u32 = 0;

    loop {
        let fired_at = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = period_rx.changed(), if period_open => {
                if changed.is_err() {
                    period_open = false;
                } else {
                    period = *period_rx.borrow_and_update();
                    ticks = ticker(Instant::now() + period, period);
                }
                continue;
            }
            at = ticks.tick() => at,
        };

        if busy_until.is_some_and(|until| fired_at < until) {
            stats.skipped.fetch_add(1, Ordering::SeqCst);
            continue;
        }
        if cancel.is_cancelled() {
            break;
        }

        stats.in_flight.store(true, Ordering::SeqCst);
        let outcome = task.run().await;
        stats.in_flight.store(false, Ordering::SeqCst);
        stats.runs.fetch_add(1, Ordering::SeqCst);

        match outcome {
            Ok(()) => failures = 0,
            Err(err) => {
                failures = failures.saturating_add(1);
                stats.failures.fetch_add(1, Ordering::SeqCst);
                let delay = backoff_delay(period, failures, max_backoff);
                warn!(task = %handle.name, ?err, failures, ?delay, "poll task failed");
                let extra = delay.saturating_sub(period);
                if !extra.is_zero() {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = time::sleep(extra) => {}
                    }
                    ticks = ticker(Instant::now() + period, period);
                }
            }
        }
        busy_until = Some(Instant::now());
    }
    debug!(task = %handle.name, "poll loop exited");
}
