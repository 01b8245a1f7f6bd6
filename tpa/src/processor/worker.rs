//! Workers: single task-execution slots bound to one pipeline stage.
//!
//! A worker runs its [`WorkerTask`] once; the task loops internally and
//! suspends through [`Worker::sleep`] when there is nothing to do. Closing
//! the wake signal makes the next (or current) sleep return `false`, after
//! which the task returns and the worker is `Finished` for good.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::item::Stage;

/// Worker lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Working,
    Finished,
}

impl WorkerStatus {
    const fn to_u8(self) -> u8 {
        match self {
            WorkerStatus::Idle => 0,
            WorkerStatus::Working => 1,
            WorkerStatus::Finished => 2,
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => WorkerStatus::Idle,
            1 => WorkerStatus::Working,
            _ => WorkerStatus::Finished,
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Working => write!(f, "working"),
            WorkerStatus::Finished => write!(f, "finished"),
        }
    }
}

/// Two-state wake primitive: a notification plus a terminal closed flag.
///
/// A notification sent while nobody is waiting is kept (at most one) and
/// consumed by the next wait.
pub struct WakeSignal {
    notify: Notify,
    closed: CancellationToken,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self {
            notify: Notify::new(),
            closed: CancellationToken::new(),
        }
    }

    /// Signal without blocking.
    pub fn notify(&self) {
        self.notify.notify_one();
    }

    /// Close the signal. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        self.closed.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Wait for a notification. Returns `false` once the signal is closed.
    pub async fn wait(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => false,
            _ = self.notify.notified() => true,
        }
    }

    /// Like [`wait`](Self::wait), but also wakes when `period` elapses.
    pub async fn wait_timeout(&self, period: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => false,
            _ = self.notify.notified() => true,
            _ = tokio::time::sleep(period) => true,
        }
    }
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// The loop a worker executes.
///
/// Returning `Ok` means the worker was asked to stop. Returning `Err` is fatal
/// to this worker only: it is reported on the failure channel and the worker
/// is not restarted.
#[async_trait]
pub trait WorkerTask: Send + Sync + 'static {
    async fn run(&self, worker: &Worker) -> crate::Result<()>;
}

/// A worker stopped because its task returned an error.
#[derive(Debug, Clone)]
pub struct WorkerFailure {
    pub label: String,
    pub stage: Stage,
    pub error: String,
}

/// Point-in-time view of a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    pub label: String,
    pub stage: Stage,
    pub status: WorkerStatus,
}

/// A single task-execution slot.
pub struct Worker {
    label: String,
    stage: Stage,
    status: AtomicU8,
    wake: WakeSignal,
}

impl Worker {
    pub fn new(label: impl Into<String>, stage: Stage) -> Self {
        Self {
            label: label.into(),
            stage,
            status: AtomicU8::new(WorkerStatus::Idle.to_u8()),
            wake: WakeSignal::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            label: self.label.clone(),
            stage: self.stage,
            status: self.status(),
        }
    }

    /// Wake this worker if it is sleeping, or make its next sleep return at once.
    pub fn wake(&self) {
        self.wake.notify();
    }

    /// Close the wake signal. An in-flight task is not interrupted.
    pub fn close(&self) {
        if self.wake.close() {
            debug!(worker = %self.label, stage = %self.stage, "Closing worker wake signal");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.wake.is_closed()
    }

    fn set_status(&self, status: WorkerStatus) {
        self.status.store(status.to_u8(), Ordering::SeqCst);
    }

    /// Suspend until woken. Returns `false` if the worker should exit.
    pub async fn sleep(&self) -> bool {
        self.set_status(WorkerStatus::Idle);
        let alive = self.wake.wait().await;
        self.after_sleep(alive)
    }

    /// Suspend until woken or `period` elapses. Returns `false` if the worker should exit.
    pub async fn sleep_for(&self, period: Duration) -> bool {
        self.set_status(WorkerStatus::Idle);
        let alive = self.wake.wait_timeout(period).await;
        self.after_sleep(alive)
    }

    fn after_sleep(&self, alive: bool) -> bool {
        if alive {
            self.set_status(WorkerStatus::Working);
        } else {
            info!(worker = %self.label, "Wake signal closed, worker is exiting");
            self.set_status(WorkerStatus::Finished);
        }
        alive
    }

    /// Run `task` to completion, reporting a fatal error on `failures`.
    pub async fn run(
        self: Arc<Self>,
        task: Arc<dyn WorkerTask>,
        failures: mpsc::UnboundedSender<WorkerFailure>,
    ) {
        info!(worker = %self.label, stage = %self.stage, "Starting worker");
        self.set_status(WorkerStatus::Working);

        if let Err(e) = task.run(&self).await {
            error!(
                worker = %self.label,
                stage = %self.stage,
                error = %e,
                "Worker reported an error"
            );
            // Receiver gone means nobody is listening for failures.
            let _ = failures.send(WorkerFailure {
                label: self.label.clone(),
                stage: self.stage,
                error: e.to_string(),
            });
        }

        self.set_status(WorkerStatus::Finished);
        info!(worker = %self.label, stage = %self.stage, "Worker has stopped");
    }
}
