//! The Processor: queue, stage pools and polling producer under one handle.
//!
//! Gateways hold a [`Processor`] and use it to read the queue, issue item
//! control commands and subscribe to updates. They should wait for
//! [`Processor::wait_ready`] before serving anything.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::item::{ItemId, QueueItem, Resolution, Stage};
use super::polling::PollingProducer;
use super::queue::Queue;
use super::tasks::{StageHandler, StageTask};
use super::update::{ProcessorUpdate, UpdateFanout, UpdateObserver};
use super::worker::{Worker, WorkerFailure, WorkerSnapshot};
use super::worker_pool::WorkerPools;
use crate::config::ProcessorConfig;
use crate::stages::default_handlers;
use crate::{Error, Result};

/// Label of the polling producer's worker.
const POLLER_LABEL: &str = "poller";

pub struct Processor {
    config: ProcessorConfig,
    queue: Arc<Queue>,
    updates: Arc<UpdateFanout>,
    pools: Arc<WorkerPools>,
    handlers: BTreeMap<Stage, Arc<dyn StageHandler>>,
    producer: Arc<PollingProducer>,
    poller: Arc<Worker>,
    poller_task: Mutex<Option<JoinHandle<()>>>,
    ready_tx: watch::Sender<bool>,
    failures_tx: mpsc::UnboundedSender<WorkerFailure>,
    failures_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerFailure>>>,
    started: AtomicBool,
}

impl Processor {
    /// Processor running the built-in stage handlers.
    pub fn new(config: ProcessorConfig) -> Result<Self> {
        let handlers = default_handlers(&config)?;
        Self::with_handlers(config, handlers)
    }

    /// Processor running `handlers`, exactly one per processing stage.
    pub fn with_handlers(
        config: ProcessorConfig,
        handlers: impl IntoIterator<Item = Arc<dyn StageHandler>>,
    ) -> Result<Self> {
        let mut by_stage = BTreeMap::new();
        for handler in handlers {
            let stage = handler.stage();
            if !Stage::PROCESSING.contains(&stage) {
                return Err(Error::config(format!("no handler may run at stage {}", stage)));
            }
            if by_stage.insert(stage, handler).is_some() {
                return Err(Error::config(format!("duplicate handler for stage {}", stage)));
            }
        }
        if let Some(missing) = Stage::PROCESSING.iter().find(|s| !by_stage.contains_key(*s)) {
            return Err(Error::config(format!("missing handler for stage {}", missing)));
        }

        let updates = Arc::new(UpdateFanout::new());
        let queue = Arc::new(Queue::with_observer(updates.clone()));
        let pools = Arc::new(WorkerPools::new(config.workers.sizes()));
        let producer = Arc::new(PollingProducer::new(
            queue.clone(),
            pools.clone(),
            config.source_dir.clone(),
            config.poll_interval(),
        ));
        let (ready_tx, _) = watch::channel(false);
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            queue,
            updates,
            pools,
            handlers: by_stage,
            producer,
            poller: Arc::new(Worker::new(POLLER_LABEL, Stage::first())),
            poller_task: Mutex::new(None),
            ready_tx,
            failures_tx,
            failures_rx: Mutex::new(Some(failures_rx)),
            started: AtomicBool::new(false),
        })
    }

    /// Populate the queue, then start every pool and the polling producer.
    ///
    /// The first poll runs before this returns; if it fails nothing is
    /// started and the error is returned.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Other("processor already started".to_string()));
        }

        info!(source_dir = %self.config.source_dir.display(), "Starting processor");
        let ingested = match self.producer.poll().await {
            Ok(ingested) => ingested,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        debug!(ingested, "Initial poll complete");

        for (stage, handler) in &self.handlers {
            let Some(pool) = self.pools.get(*stage) else {
                continue;
            };
            let task = Arc::new(StageTask::new(
                self.queue.clone(),
                self.pools.clone(),
                handler.clone(),
            ));
            pool.start(task, self.failures_tx.clone());
        }

        let poller = tokio::spawn(
            self.poller
                .clone()
                .run(self.producer.clone(), self.failures_tx.clone()),
        );
        *self.poller_task.lock() = Some(poller);

        self.ready_tx.send_replace(true);
        info!(items = self.queue.len(), "Processor ready");
        Ok(())
    }

    /// Wait until [`start`](Self::start) has completed.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready_tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub fn ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    /// Readiness as a watch channel, for collaborators that outlive a borrow.
    pub fn ready_signal(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Receive every item update from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessorUpdate> {
        self.updates.subscribe()
    }

    pub fn register_observer(&self, observer: Arc<dyn UpdateObserver>) {
        self.updates.register(observer);
    }

    /// Take the worker failure channel. Only the first call gets it.
    pub fn take_failures(&self) -> Option<mpsc::UnboundedReceiver<WorkerFailure>> {
        self.failures_rx.lock().take()
    }

    /// Wake a worker in `stage`'s pool.
    pub fn notify(&self, stage: Stage) -> bool {
        self.pools.notify(stage)
    }

    /// Make the polling producer run a tick now.
    pub fn rescan(&self) {
        debug!("Rescan requested");
        self.poller.wake();
    }

    /// Every stage worker plus the polling producer.
    pub fn workers(&self) -> Vec<WorkerSnapshot> {
        let mut workers = self.pools.snapshots();
        workers.push(self.poller.snapshot());
        workers
    }

    pub fn find_item(&self, id: ItemId) -> Option<QueueItem> {
        self.queue.find_by_id(id)
    }

    pub fn promote_item(&self, id: ItemId) -> Result<()> {
        self.queue.promote_item(id)?;
        Ok(())
    }

    pub fn pause_item(&self, id: ItemId) -> Result<QueueItem> {
        Ok(self.queue.pause_item(id)?)
    }

    pub fn cancel_item(&self, id: ItemId) -> Result<QueueItem> {
        Ok(self.queue.cancel_item(id)?)
    }

    /// Resume a paused item and wake its stage.
    pub fn resume_item(&self, id: ItemId) -> Result<QueueItem> {
        let item = self.queue.resume_item(id)?;
        self.pools.notify(item.stage);
        Ok(item)
    }

    /// Resolve a troubled item and wake its stage.
    pub fn resolve_trouble(&self, id: ItemId, resolution: Resolution) -> Result<QueueItem> {
        let item = self.queue.resolve_trouble(id, resolution)?;
        self.pools.notify(item.stage);
        Ok(item)
    }

    /// Stop the producer and every pool, waiting for in-flight items.
    pub async fn shutdown(&self) {
        info!("Shutting down processor");
        self.ready_tx.send_replace(false);

        self.poller.close();
        self.pools.close_all();

        let poller = self.poller_task.lock().take();
        if let Some(handle) = poller
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Polling producer task failed");
        }
        self.pools.join_all().await;

        info!("Processor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::item::{ItemPatch, ItemStatus};
    use crate::processor::tasks::StageFailure;
    use crate::processor::worker::WorkerStatus;
    use async_trait::async_trait;
    use std::time::Duration;

    struct PassThrough(Stage);

    #[async_trait]
    impl StageHandler for PassThrough {
        fn stage(&self) -> Stage {
            self.0
        }

        async fn handle(&self, _item: &QueueItem) -> std::result::Result<ItemPatch, StageFailure> {
            Ok(ItemPatch::new())
        }
    }

    fn pass_through() -> Vec<Arc<dyn StageHandler>> {
        Stage::PROCESSING
            .into_iter()
            .map(|s| Arc::new(PassThrough(s)) as Arc<dyn StageHandler>)
            .collect()
    }

    fn config(dir: &std::path::Path) -> ProcessorConfig {
        ProcessorConfig {
            source_dir: dir.to_path_buf(),
            poll_interval_secs: 3600,
            ..ProcessorConfig::default()
        }
    }

    #[test]
    fn test_handlers_must_cover_each_stage_once() {
        let cfg = ProcessorConfig::default();

        let mut missing = pass_through();
        missing.pop();
        assert!(Processor::with_handlers(cfg.clone(), missing).is_err());

        let mut duplicate = pass_through();
        duplicate.push(Arc::new(PassThrough(Stage::Title)));
        assert!(Processor::with_handlers(cfg.clone(), duplicate).is_err());

        let mut terminal = pass_through();
        terminal.push(Arc::new(PassThrough(Stage::Complete)));
        assert!(Processor::with_handlers(cfg.clone(), terminal).is_err());

        assert!(Processor::with_handlers(cfg, pass_through()).is_ok());
    }

    #[tokio::test]
    async fn test_start_populates_queue_before_ready() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.mp4"), b"a").unwrap();
        let processor = Processor::with_handlers(config(dir.path()), pass_through()).unwrap();
        assert!(!processor.ready());

        processor.start().await.unwrap();
        assert!(processor.ready());
        processor.wait_ready().await;
        assert_eq!(processor.queue().len(), 1);
        assert!(processor.start().await.is_err());

        tokio::time::timeout(Duration::from_secs(5), async {
            while processor.queue().count(Stage::Complete, ItemStatus::Completed) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        processor.shutdown().await;
        assert!(!processor.ready());
        assert_eq!(processor.workers().len(), 1 + 1 + 2 + 1 + 1);
    }

    #[tokio::test]
    async fn test_failed_first_poll_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("missing");
        let processor = Processor::with_handlers(config(&source), pass_through()).unwrap();
        assert!(processor.start().await.is_err());
        assert!(!processor.ready());
        assert!(processor.workers().iter().all(|w| w.status == WorkerStatus::Idle));

        // Once the source directory appears, start can be retried.
        std::fs::create_dir(&source).unwrap();
        std::fs::write(source.join("a.mp4"), b"a").unwrap();
        processor.start().await.unwrap();
        assert!(processor.ready());
        assert_eq!(processor.queue().len(), 1);
        processor.shutdown().await;
    }
}
