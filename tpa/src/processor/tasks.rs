//! The stage worker loop.
//!
//! Every processing stage runs the same loop: pick the first pending item
//! for the stage, claim it, hand it to the stage's [`StageHandler`], then
//! advance it and wake the next stage's pool. Losing a claim race just means
//! picking again.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use super::item::{ItemPatch, ItemStatus, QueueItem, Stage, TroubleDetail, TroubleKind};
use super::queue::Queue;
use super::worker::{Worker, WorkerTask};
use super::worker_pool::WorkerPools;
use crate::{Error, Result};

/// Why a stage could not process an item.
#[derive(Debug)]
pub enum StageFailure {
    /// Item-scoped: the item goes to `Trouble` and the worker carries on.
    Trouble(String),
    /// Worker-scoped: the item goes to `Trouble` and the worker stops.
    Fatal(Error),
}

impl StageFailure {
    pub fn trouble(message: impl Into<String>) -> Self {
        Self::Trouble(message.into())
    }
}

impl From<Error> for StageFailure {
    fn from(e: Error) -> Self {
        Self::Fatal(e)
    }
}

/// The payload of one pipeline stage.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// The stage this handler processes.
    fn stage(&self) -> Stage;

    /// Process a claimed item. The returned patch is applied when the item advances.
    async fn handle(&self, item: &QueueItem) -> std::result::Result<ItemPatch, StageFailure>;
}

/// Worker task driving one stage's handler.
pub struct StageTask {
    queue: Arc<Queue>,
    pools: Arc<WorkerPools>,
    handler: Arc<dyn StageHandler>,
}

impl StageTask {
    pub fn new(queue: Arc<Queue>, pools: Arc<WorkerPools>, handler: Arc<dyn StageHandler>) -> Self {
        Self {
            queue,
            pools,
            handler,
        }
    }

    /// Pick and claim the next pending item for `stage`, retrying on lost races.
    fn claim_next(&self, stage: Stage) -> Result<Option<QueueItem>> {
        loop {
            let Some(candidate) = self.queue.pick(stage, ItemStatus::Pending) else {
                return Ok(None);
            };

            match self.queue.assign(candidate.id) {
                Ok(item) => return Ok(Some(item)),
                Err(e) if e.is_assign_race() => {
                    debug!(item_id = %candidate.id, "Lost claim race, picking again");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Process one claimed item to the point where it is no longer held.
    async fn process(&self, worker: &Worker, item: QueueItem) -> Result<()> {
        let stage = worker.stage();
        let kind = TroubleKind::for_stage(stage)
            .ok_or_else(|| Error::Other(format!("no handler may run at stage {}", stage)))?;

        match self.handler.handle(&item).await {
            Ok(patch) => {
                let advanced = self.queue.advance_stage(item.id, patch)?;
                self.pools.notify(advanced.stage);
                Ok(())
            }
            Err(StageFailure::Trouble(message)) => {
                self.queue
                    .mark_trouble(item.id, TroubleDetail::new(kind, message))?;
                Ok(())
            }
            Err(StageFailure::Fatal(e)) => {
                error!(
                    worker = %worker.label(),
                    item_id = %item.id,
                    error = %e,
                    "Stage handler failed fatally"
                );
                // Never leave the item held by a worker that is about to stop.
                self.queue
                    .mark_trouble(item.id, TroubleDetail::new(kind, e.to_string()))?;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl WorkerTask for StageTask {
    async fn run(&self, worker: &Worker) -> Result<()> {
        let stage = worker.stage();
        loop {
            while !worker.is_closed() {
                let Some(item) = self.claim_next(stage)? else {
                    break;
                };
                debug!(worker = %worker.label(), item_id = %item.id, "Processing queue item");
                self.process(worker, item).await?;
            }

            if !worker.sleep().await {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::item::FileInfo;
    use crate::processor::worker::{WorkerFailure, WorkerStatus};
    use std::path::Path;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Rename;

    #[async_trait]
    impl StageHandler for Rename {
        fn stage(&self) -> Stage {
            Stage::Import
        }

        async fn handle(&self, item: &QueueItem) -> std::result::Result<ItemPatch, StageFailure> {
            if item.name.starts_with("bad") {
                return Err(StageFailure::trouble("bad file"));
            }
            if item.name.starts_with("fatal") {
                return Err(Error::Other("disk on fire".to_string()).into());
            }
            Ok(ItemPatch::new().with_name(item.name.to_uppercase()))
        }
    }

    fn setup() -> (Arc<Queue>, Arc<WorkerPools>, StageTask) {
        let queue = Arc::new(Queue::new());
        let pools = Arc::new(WorkerPools::new([(Stage::Import, 1), (Stage::Title, 1)]));
        let task = StageTask::new(queue.clone(), pools.clone(), Arc::new(Rename));
        (queue, pools, task)
    }

    async fn run_until_idle(
        queue: &Queue,
        task: StageTask,
        worker: Arc<Worker>,
    ) -> Option<WorkerFailure> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(worker.clone().run(Arc::new(task), tx));
        let _ = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let status = worker.status();
                let drained = queue.count(Stage::Import, ItemStatus::Pending) == 0
                    && status == WorkerStatus::Idle;
                if drained || status == WorkerStatus::Finished {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await;
        worker.close();
        handle.await.unwrap();
        rx.try_recv().ok()
    }

    #[tokio::test]
    async fn test_stage_task_advances_and_troubles() {
        let (queue, _pools, task) = setup();
        queue.ingest(Path::new("/in/good.mp4"), FileInfo::default());
        queue.ingest(Path::new("/in/bad.mp4"), FileInfo::default());

        let worker = Arc::new(Worker::new("import-0", Stage::Import));
        assert!(run_until_idle(&queue, task, worker).await.is_none());

        let items = queue.items();
        assert_eq!(items[0].name, "GOOD.MP4");
        assert_eq!(items[0].stage, Stage::Title);
        assert_eq!(items[0].status, ItemStatus::Pending);
        assert_eq!(items[1].stage, Stage::Import);
        assert_eq!(items[1].status, ItemStatus::Trouble);
        assert_eq!(items[1].trouble.as_ref().unwrap().kind, TroubleKind::Import);
    }

    #[tokio::test]
    async fn test_fatal_failure_stops_worker_and_releases_item() {
        let (queue, _pools, task) = setup();
        queue.ingest(Path::new("/in/fatal.mp4"), FileInfo::default());
        queue.ingest(Path::new("/in/later.mp4"), FileInfo::default());

        let worker = Arc::new(Worker::new("import-0", Stage::Import));
        let failure = run_until_idle(&queue, task, worker.clone())
            .await
            .unwrap();
        assert!(failure.error.contains("disk on fire"));
        assert_eq!(worker.status(), WorkerStatus::Finished);

        let items = queue.items();
        assert_eq!(items[0].status, ItemStatus::Trouble);
        // The worker stopped before reaching the second item.
        assert_eq!(items[1].status, ItemStatus::Pending);
    }
}
