//! Worker pools: one group of workers per pipeline stage.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, trace};

use super::item::Stage;
use super::worker::{Worker, WorkerFailure, WorkerSnapshot, WorkerStatus, WorkerTask};

/// A group of workers bound to the same stage.
pub struct WorkerPool {
    stage: Stage,
    members: Vec<Arc<Worker>>,
    /// Round-robin cursor used when no member is idle.
    cursor: AtomicUsize,
    /// Task set for running members.
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    /// Create a pool of `size` workers for `stage`. Members are fixed from here on.
    pub fn new(stage: Stage, size: usize) -> Self {
        let members = (0..size)
            .map(|i| Arc::new(Worker::new(format!("{}-{}", stage, i), stage)))
            .collect();

        Self {
            stage,
            members,
            cursor: AtomicUsize::new(0),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[Arc<Worker>] {
        &self.members
    }

    pub fn snapshots(&self) -> Vec<WorkerSnapshot> {
        self.members.iter().map(|w| w.snapshot()).collect()
    }

    /// Spawn every member running `task`.
    pub fn start(&self, task: Arc<dyn WorkerTask>, failures: mpsc::UnboundedSender<WorkerFailure>) {
        info!(stage = %self.stage, workers = self.members.len(), "Starting worker pool");

        let mut tasks = self.tasks.lock();
        if let Some(ref mut join_set) = *tasks {
            for worker in &self.members {
                join_set.spawn(worker.clone().run(task.clone(), failures.clone()));
            }
        }
    }

    /// Wake an idle member.
    ///
    /// Never blocks. If no member is idle, a pending wake is left on one busy
    /// member so that it checks the queue again before it next sleeps.
    /// Returns whether an idle member was found.
    pub fn notify(&self) -> bool {
        if let Some(worker) = self
            .members
            .iter()
            .find(|w| w.status() == WorkerStatus::Idle)
        {
            trace!(stage = %self.stage, worker = %worker.label(), "Waking idle worker");
            worker.wake();
            return true;
        }

        // Finished members never sleep again, so a wake left on one is lost.
        let live: Vec<_> = self
            .members
            .iter()
            .filter(|w| w.status() != WorkerStatus::Finished)
            .collect();
        if !live.is_empty() {
            let i = self.cursor.fetch_add(1, Ordering::Relaxed) % live.len();
            trace!(stage = %self.stage, worker = %live[i].label(), "Leaving wake on busy worker");
            live[i].wake();
        }
        false
    }

    /// Close every member's wake signal. Running tasks are not interrupted.
    pub fn close(&self) {
        debug!(stage = %self.stage, "Closing worker pool");
        for worker in &self.members {
            worker.close();
        }
    }

    /// Wait for every member to finish.
    pub async fn join(&self) {
        // Take the join set out of the mutex before awaiting
        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!(stage = %self.stage, "Worker pool stopped");
    }
}

/// One pool per processing stage.
pub struct WorkerPools {
    pools: BTreeMap<Stage, WorkerPool>,
}

impl WorkerPools {
    pub fn new(sizes: impl IntoIterator<Item = (Stage, usize)>) -> Self {
        let pools = sizes
            .into_iter()
            .map(|(stage, size)| (stage, WorkerPool::new(stage, size)))
            .collect();
        Self { pools }
    }

    pub fn get(&self, stage: Stage) -> Option<&WorkerPool> {
        self.pools.get(&stage)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerPool> {
        self.pools.values()
    }

    /// Wake a worker in `stage`'s pool. Stages without a pool are ignored.
    pub fn notify(&self, stage: Stage) -> bool {
        match self.pools.get(&stage) {
            Some(pool) => pool.notify(),
            None => false,
        }
    }

    pub fn snapshots(&self) -> Vec<WorkerSnapshot> {
        self.pools.values().flat_map(WorkerPool::snapshots).collect()
    }

    pub fn close_all(&self) {
        for pool in self.pools.values() {
            pool.close();
        }
    }

    pub async fn join_all(&self) {
        for pool in self.pools.values() {
            pool.join().await;
        }
    }
}
