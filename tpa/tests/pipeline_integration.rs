use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use tpa::config::{ProcessorConfig, StageWorkers};
use tpa::processor::{
    ItemId, ItemMetadata, ItemPatch, ItemStatus, Processor, ProcessorUpdate, QueueError,
    QueueItem, Resolution, Stage, StageFailure, StageHandler, TitleInfo, TroubleKind,
    UpdateKind, UpdateObserver, WorkerStatus,
};

/// Stage handler whose behaviour is set per test.
struct Scripted {
    stage: Stage,
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
    trouble_when: Option<fn(&QueueItem) -> bool>,
    calls: Mutex<Vec<ItemId>>,
}

impl Scripted {
    fn new(stage: Stage) -> Self {
        Self {
            stage,
            delay: Duration::ZERO,
            gate: None,
            trouble_when: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn trouble_when(mut self, predicate: fn(&QueueItem) -> bool) -> Self {
        self.trouble_when = Some(predicate);
        self
    }

    fn calls(&self) -> Vec<ItemId> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl StageHandler for Scripted {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn handle(&self, item: &QueueItem) -> Result<ItemPatch, StageFailure> {
        self.calls.lock().push(item.id);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.trouble_when.is_some_and(|f| f(item)) {
            return Err(StageFailure::trouble("lookup failed"));
        }
        if self.stage == Stage::Title {
            return Ok(ItemPatch::new().with_name(item.name.to_uppercase()));
        }
        Ok(ItemPatch::new())
    }
}

struct Recorder(Mutex<Vec<ProcessorUpdate>>);

impl UpdateObserver for Recorder {
    fn on_update(&self, update: &ProcessorUpdate) {
        self.0.lock().push(update.clone());
    }
}

struct Pipeline {
    dir: TempDir,
    processor: Processor,
    handlers: BTreeMap<Stage, Arc<Scripted>>,
    updates: Arc<Recorder>,
}

impl Pipeline {
    fn handler(&self, stage: Stage) -> &Scripted {
        &self.handlers[&stage]
    }

    fn status(&self, id: u64) -> (Stage, ItemStatus) {
        let item = self.processor.find_item(ItemId::new(id)).unwrap();
        (item.stage, item.status)
    }

    fn completed(&self) -> usize {
        self.processor
            .queue()
            .count(Stage::Complete, ItemStatus::Completed)
    }
}

fn write_files(dir: &Path, names: &[String]) {
    for name in names {
        std::fs::write(dir.join(name), b"media").unwrap();
    }
}

fn numbered(count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("{:03}.mp4", i)).collect()
}

async fn start_pipeline(files: &[String], workers: StageWorkers, handlers: [Scripted; 4]) -> Pipeline {
    let dir = tempfile::tempdir().unwrap();
    write_files(dir.path(), files);

    let config = ProcessorConfig {
        source_dir: dir.path().to_path_buf(),
        poll_interval_secs: 3600,
        workers,
        ..ProcessorConfig::default()
    };

    let handlers: BTreeMap<Stage, Arc<Scripted>> = handlers
        .into_iter()
        .map(|h| (h.stage, Arc::new(h)))
        .collect();
    let processor = Processor::with_handlers(
        config,
        handlers
            .values()
            .map(|h| h.clone() as Arc<dyn StageHandler>)
            .collect::<Vec<_>>(),
    )
    .unwrap();

    let updates = Arc::new(Recorder(Mutex::new(Vec::new())));
    processor.register_observer(updates.clone());
    processor.start().await.unwrap();

    Pipeline {
        dir,
        processor,
        handlers,
        updates,
    }
}

fn plain_handlers() -> [Scripted; 4] {
    [
        Scripted::new(Stage::Import),
        Scripted::new(Stage::Title),
        Scripted::new(Stage::MetadataLookup),
        Scripted::new(Stage::Format),
    ]
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_item_runs_each_stage_exactly_once() {
    let files = numbered(40);
    let [import, title, metadata, format] = plain_handlers();
    let handlers = [
        import.delay(Duration::from_millis(1)),
        title,
        metadata.delay(Duration::from_millis(2)),
        format,
    ];
    let workers = StageWorkers {
        import: 3,
        title: 3,
        metadata: 4,
        format: 2,
    };
    let pipeline = start_pipeline(&files, workers, handlers).await;

    wait_until("all items to complete", || pipeline.completed() == files.len()).await;

    for stage in Stage::PROCESSING {
        let calls = pipeline.handler(stage).calls();
        let unique: HashSet<_> = calls.iter().copied().collect();
        assert_eq!(calls.len(), files.len(), "stage {}", stage);
        assert_eq!(unique.len(), files.len(), "stage {} ran an item twice", stage);
    }

    let item = pipeline.processor.find_item(ItemId::new(1)).unwrap();
    assert_eq!(item.name, "001.MP4");

    pipeline.processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn busy_single_worker_pool_strands_nothing() {
    let files = numbered(25);
    let [import, title, metadata, format] = plain_handlers();
    let handlers = [
        import,
        title.delay(Duration::from_millis(3)),
        metadata,
        format,
    ];
    let workers = StageWorkers {
        import: 4,
        title: 1,
        metadata: 1,
        format: 1,
    };
    let pipeline = start_pipeline(&files, workers, handlers).await;

    wait_until("all items to complete", || pipeline.completed() == files.len()).await;
    pipeline.processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn trouble_is_parked_and_resolved_at_the_same_stage() {
    let files = vec!["a.mp4".to_string(), "bad.mp4".to_string()];
    let [import, title, metadata, format] = plain_handlers();
    let handlers = [
        import,
        title,
        metadata.trouble_when(|item| item.name.starts_with("BAD") && item.metadata.is_none()),
        format,
    ];
    let pipeline = start_pipeline(&files, StageWorkers::default(), handlers).await;
    let bad = ItemId::new(2);

    wait_until("bad item to be in trouble", || {
        pipeline.status(2) == (Stage::MetadataLookup, ItemStatus::Trouble)
    })
    .await;
    wait_until("good item to complete", || pipeline.completed() == 1).await;

    let item = pipeline.processor.find_item(bad).unwrap();
    let detail = item.trouble.unwrap();
    assert_eq!(detail.kind, TroubleKind::MetadataLookup);
    assert_eq!(detail.message, "lookup failed");

    // A title can't answer a metadata problem.
    let err = pipeline
        .processor
        .resolve_trouble(
            bad,
            Resolution::SetTitle(TitleInfo {
                title: "Bad".to_string(),
                ..TitleInfo::default()
            }),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        tpa::Error::Queue(QueueError::ResolutionMismatch { .. })
    ));
    assert_eq!(pipeline.status(2), (Stage::MetadataLookup, ItemStatus::Trouble));

    // Troubled items cannot jump the queue.
    assert!(pipeline.processor.promote_item(bad).is_err());

    let resolved = pipeline
        .processor
        .resolve_trouble(
            bad,
            Resolution::SetMetadata(ItemMetadata {
                title: "Bad".to_string(),
                ..ItemMetadata::default()
            }),
        )
        .unwrap();
    assert_eq!(resolved.stage, Stage::MetadataLookup);
    assert!(resolved.trouble.is_none());

    wait_until("resolved item to complete", || pipeline.completed() == 2).await;

    let kinds_for_bad = || -> Vec<UpdateKind> {
        pipeline
            .updates
            .0
            .lock()
            .iter()
            .filter(|u| u.as_item().map(|i| i.id) == Some(bad))
            .map(|u| u.kind)
            .collect()
    };
    // Observers run just after the queue lock is released.
    wait_until("completion update", || {
        kinds_for_bad().last() == Some(&UpdateKind::Completed)
    })
    .await;
    let kinds = kinds_for_bad();
    assert!(kinds.contains(&UpdateKind::Trouble));
    assert!(kinds.contains(&UpdateKind::Resolved));

    pipeline.processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn controls_respect_priority_and_status() {
    let files = numbered(4);
    let gate = Arc::new(Semaphore::new(0));
    let [import, title, metadata, format] = plain_handlers();
    let handlers = [import.gated(gate.clone()), title, metadata, format];
    let pipeline = start_pipeline(&files, StageWorkers::default(), handlers).await;
    let processor = &pipeline.processor;

    wait_until("first item to be claimed", || {
        pipeline.status(1) == (Stage::Import, ItemStatus::Processing)
    })
    .await;

    // No preemption of in-flight work.
    assert!(processor.promote_item(ItemId::new(1)).is_err());
    assert!(processor.pause_item(ItemId::new(1)).is_err());
    assert!(processor.cancel_item(ItemId::new(1)).is_err());

    processor.cancel_item(ItemId::new(2)).unwrap();
    processor.pause_item(ItemId::new(3)).unwrap();
    processor.promote_item(ItemId::new(4)).unwrap();
    assert_eq!(processor.queue().index()[0].id, ItemId::new(4));

    gate.add_permits(16);
    wait_until("two items to complete", || pipeline.completed() == 2).await;
    assert_eq!(
        pipeline.handler(Stage::Import).calls(),
        vec![ItemId::new(1), ItemId::new(4)]
    );
    assert_eq!(pipeline.status(2), (Stage::Import, ItemStatus::Cancelled));
    assert_eq!(pipeline.status(3), (Stage::Import, ItemStatus::Paused));

    processor.resume_item(ItemId::new(3)).unwrap();
    wait_until("resumed item to complete", || pipeline.completed() == 3).await;
    assert_eq!(pipeline.status(2), (Stage::Import, ItemStatus::Cancelled));

    processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rescans_never_duplicate_items() {
    let pipeline = start_pipeline(&numbered(2), StageWorkers::default(), plain_handlers()).await;
    assert_eq!(pipeline.processor.queue().len(), 2);
    wait_until("initial items to complete", || pipeline.completed() == 2).await;

    pipeline.processor.rescan();
    write_files(pipeline.dir.path(), &["late.mkv".to_string()]);
    wait_until("late file to be ingested", || {
        pipeline.processor.rescan();
        pipeline.processor.queue().len() == 3
    })
    .await;
    wait_until("late file to complete", || pipeline.completed() == 3).await;

    for _ in 0..3 {
        pipeline.processor.rescan();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(pipeline.processor.queue().len(), 3);

    let ingested = pipeline
        .updates
        .0
        .lock()
        .iter()
        .filter(|u| u.kind == UpdateKind::Ingested)
        .count();
    assert_eq!(ingested, 3);

    pipeline.processor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_waits_for_in_flight_items() {
    let files = numbered(3);
    let [import, title, metadata, format] = plain_handlers();
    let handlers = [
        import,
        title,
        metadata,
        format.delay(Duration::from_millis(300)),
    ];
    let pipeline = start_pipeline(&files, StageWorkers::default(), handlers).await;
    let processor = &pipeline.processor;

    wait_until("an item to be formatting", || {
        processor.queue().count(Stage::Format, ItemStatus::Processing) == 1
    })
    .await;
    let in_flight = processor
        .queue()
        .pick(Stage::Format, ItemStatus::Processing)
        .unwrap()
        .id;

    processor.shutdown().await;

    assert!(
        processor
            .workers()
            .iter()
            .all(|w| w.status == WorkerStatus::Finished)
    );
    assert!(
        processor
            .queue()
            .items()
            .iter()
            .all(|i| i.status != ItemStatus::Processing)
    );
    let finished = processor.find_item(in_flight).unwrap();
    assert_eq!(finished.status, ItemStatus::Completed);
    assert!(!processor.ready());
}
