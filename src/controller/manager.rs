//! Keyed recurring task manager
//!
//! Runs an async action on a fixed interval until it is removed. Tasks are
//! identified by a string key: registering a key that already exists refreshes
//! the task's parameters instead of starting a second timer, which is what
//! lets concurrent callers waiting for the same thing share one poller.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument, Span};

use crate::{Error, Result};

/// The action a task runs on every tick
pub type TaskAction = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Parameters of a recurring task
#[derive(Clone)]
pub struct TaskParams {
    /// Delay between the end of one run and the start of the next
    pub interval: Duration,
    /// The work performed on each run
    pub action: TaskAction,
    /// Stop the task when the action fails with a permanent error
    pub stop_on_permanent_error: bool,
}

impl TaskParams {
    /// Create parameters for an action run every `interval`
    pub fn new<F, Fut>(interval: Duration, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            interval,
            action: Arc::new(move || Box::pin(action())),
            stop_on_permanent_error: false,
        }
    }

    /// Stop retrying once the action reports an error that cannot clear up
    pub fn stop_on_permanent_error(mut self, stop: bool) -> Self {
        self.stop_on_permanent_error = stop;
        self
    }
}

impl std::fmt::Debug for TaskParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskParams")
            .field("interval", &self.interval)
            .field("stop_on_permanent_error", &self.stop_on_permanent_error)
            .finish_non_exhaustive()
    }
}

/// Observed state of a recurring task
#[derive(Clone, Debug, Default)]
pub struct TaskStatus {
    /// Number of runs that returned `Ok`
    pub success_count: u64,
    /// Number of runs that returned `Err`
    pub failure_count: u64,
    /// Failures since the last success
    pub consecutive_failures: u64,
    /// The most recent failure
    pub last_error: Option<Arc<Error>>,
    /// When the action last succeeded
    pub last_success: Option<Instant>,
    /// The run loop has exited on its own (permanent error)
    pub stopped: bool,
}

impl TaskStatus {
    /// Whether at least one run has succeeded
    pub fn succeeded(&self) -> bool {
        self.success_count > 0
    }

    fn record(&mut self, outcome: Result<()>) {
        match outcome {
            Ok(()) => {
                self.success_count += 1;
                self.consecutive_failures = 0;
                self.last_success = Some(Instant::now());
            }
            Err(e) => {
                self.failure_count += 1;
                self.consecutive_failures += 1;
                self.last_error = Some(Arc::new(e));
            }
        }
    }
}

struct TaskEntry {
    /// Distinguishes a task from a later one registered under the same key
    id: u64,
    params: watch::Sender<TaskParams>,
    status: watch::Receiver<TaskStatus>,
    cancel: CancellationToken,
    waiters: Arc<AtomicUsize>,
}

/// Manager owning a set of keyed recurring tasks
///
/// Must be used from within a tokio runtime. Dropping the manager cancels all
/// of its tasks.
pub struct TaskManager {
    tasks: DashMap<String, TaskEntry>,
    next_id: AtomicU64,
    span: Span,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::with_span(info_span!("task_manager"))
    }

    /// Create an empty manager whose tasks log inside `span`
    pub fn with_span(span: Span) -> Self {
        Self {
            tasks: DashMap::new(),
            next_id: AtomicU64::new(0),
            span,
        }
    }

    /// Register a task, or refresh the parameters of the task already
    /// registered under `key`.
    ///
    /// A new task runs its action immediately and then every `interval`.
    /// Refreshing an existing task does not trigger an extra run; the new
    /// parameters apply from the next tick.
    pub fn upsert_task(&self, key: &str, params: TaskParams) {
        match self.tasks.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().status.borrow().stopped {
                    debug!(parent: &self.span, task = %key, "Restarting stopped task");
                    let entry = self.spawn(key, params);
                    occupied.insert(entry).cancel.cancel();
                } else {
                    debug!(parent: &self.span, task = %key, "Refreshing task parameters");
                    occupied.get().params.send_replace(params);
                }
            }
            Entry::Vacant(vacant) => {
                debug!(parent: &self.span, task = %key, interval = ?params.interval, "Starting task");
                vacant.insert(self.spawn(key, params));
            }
        }
    }

    /// Wait until the task under `key` succeeds once, then remove it.
    ///
    /// Returns [`Error::Timeout`] carrying the task's last failure if no run
    /// succeeds within `timeout`, and [`Error::TaskAborted`] if the task
    /// stopped on a permanent error. The task is removed on success, and on
    /// failure once no other caller is still waiting on it.
    pub async fn remove_on_success_and_wait(&self, key: &str, timeout: Duration) -> Result<()> {
        let (id, mut status, waiters) = {
            let entry = self
                .tasks
                .get(key)
                .ok_or_else(|| Error::task_not_found(key))?;
            (entry.id, entry.status.clone(), entry.waiters.clone())
        };
        waiters.fetch_add(1, Ordering::SeqCst);

        let waited = tokio::time::timeout(timeout, async {
            status
                .wait_for(|s| s.succeeded() || s.stopped)
                .await
                .map(|s| (s.succeeded(), s.last_error.clone()))
        })
        .await;

        let remaining = waiters.fetch_sub(1, Ordering::SeqCst) - 1;
        let outcome = match waited {
            Ok(Ok((true, _))) => Ok(()),
            Ok(Ok((false, last_error))) => Err(Error::task_aborted(
                key,
                last_error.map_or_else(
                    || "stopped without succeeding".to_string(),
                    |e| e.to_string(),
                ),
            )),
            Ok(Err(_)) => Err(Error::task_aborted(key, "task removed before it succeeded")),
            Err(_) => Err(Error::timeout(
                format!("task {}", key),
                timeout,
                status.borrow().last_error.clone(),
            )),
        };

        if outcome.is_ok() || remaining == 0 {
            self.remove_if_current(key, id);
        }
        outcome
    }

    /// Cancel and remove the task under `key`. Returns whether it existed.
    pub fn remove_task(&self, key: &str) -> bool {
        match self.tasks.remove(key) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                debug!(parent: &self.span, task = %key, "Removed task");
                true
            }
            None => false,
        }
    }

    /// Snapshot of the status of the task under `key`
    pub fn status(&self, key: &str) -> Option<TaskStatus> {
        self.tasks.get(key).map(|e| e.status.borrow().clone())
    }

    /// Whether a task is registered under `key`
    pub fn contains(&self, key: &str) -> bool {
        self.tasks.contains_key(key)
    }

    /// Number of registered tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no tasks are registered
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Cancel and remove every task
    pub fn shutdown(&self) {
        for entry in self.tasks.iter() {
            entry.cancel.cancel();
        }
        self.tasks.clear();
    }

    fn remove_if_current(&self, key: &str, id: u64) {
        if let Some((_, entry)) = self.tasks.remove_if(key, |_, e| e.id == id) {
            entry.cancel.cancel();
            debug!(parent: &self.span, task = %key, "Removed task");
        }
    }

    fn spawn(&self, key: &str, params: TaskParams) -> TaskEntry {
        let (params_tx, params_rx) = watch::channel(params);
        let (status_tx, status_rx) = watch::channel(TaskStatus::default());
        let cancel = CancellationToken::new();

        tokio::spawn(
            run_task(key.to_string(), params_rx, status_tx, cancel.clone())
                .instrument(self.span.clone()),
        );

        TaskEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            params: params_tx,
            status: status_rx,
            cancel,
            waiters: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        for entry in self.tasks.iter() {
            entry.cancel.cancel();
        }
    }
}

async fn run_task(
    key: String,
    params: watch::Receiver<TaskParams>,
    status: watch::Sender<TaskStatus>,
    cancel: CancellationToken,
) {
    loop {
        let current = params.borrow().clone();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = (current.action)() => outcome,
        };

        let stop = match &outcome {
            Ok(()) => false,
            Err(e) => current.stop_on_permanent_error && e.is_permanent(),
        };
        if stop {
            if let Err(e) = &outcome {
                warn!(task = %key, error = %e, "Task failed permanently, stopping");
            }
        }

        status.send_modify(|s| {
            s.record(outcome);
            s.stopped = stop;
        });
        if stop {
            break;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(current.interval) => {}
        }
    }
    debug!(task = %key, "Task exited");
}
