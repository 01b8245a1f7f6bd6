//! The polling producer.
//!
//! Walks the source directory on a fixed interval and feeds every discovered
//! file into the queue. Runs as a [`WorkerTask`] so it shares the worker's
//! wake and shutdown handling; waking the producer forces an early tick.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::item::{FileInfo, Stage};
use super::queue::Queue;
use super::worker::{Worker, WorkerTask};
use super::worker_pool::WorkerPools;
use crate::Result;
use crate::utils::fs::walk_files;

pub struct PollingProducer {
    queue: Arc<Queue>,
    pools: Arc<WorkerPools>,
    source_dir: PathBuf,
    interval: Duration,
}

impl PollingProducer {
    pub fn new(
        queue: Arc<Queue>,
        pools: Arc<WorkerPools>,
        source_dir: impl Into<PathBuf>,
        interval: Duration,
    ) -> Self {
        Self {
            queue,
            pools,
            source_dir: source_dir.into(),
            interval,
        }
    }

    pub fn source_dir(&self) -> &std::path::Path {
        &self.source_dir
    }

    /// Run one tick. Returns how many new items were ingested.
    ///
    /// An unreadable source directory abandons the tick with an error.
    pub async fn poll(&self) -> Result<usize> {
        let outcome = walk_files(&self.source_dir).await?;

        let mut ingested = 0;
        for file in &outcome.files {
            if self.queue.ingest(&file.path, FileInfo::from(&file.metadata)) {
                ingested += 1;
            }
        }

        if ingested > 0 {
            info!(
                source_dir = %self.source_dir.display(),
                ingested,
                skipped = outcome.skipped,
                "Ingested new files"
            );
            self.pools.notify(Stage::first());
        } else {
            debug!(
                source_dir = %self.source_dir.display(),
                seen = outcome.files.len(),
                "No new files"
            );
        }

        Ok(ingested)
    }
}

#[async_trait]
impl WorkerTask for PollingProducer {
    async fn run(&self, worker: &Worker) -> Result<()> {
        // The first tick has already run during startup.
        while worker.sleep_for(self.interval).await {
            if let Err(e) = self.poll().await {
                warn!(
                    worker = %worker.label(),
                    source_dir = %self.source_dir.display(),
                    error = %e,
                    "Polling tick abandoned"
                );
            }
        }
        Ok(())
    }
}
