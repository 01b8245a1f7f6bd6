//! The processing queue.
//!
//! The queue is the only shared mutable state in the scheduler. Items live in
//! a single vector whose order is the priority order; every operation takes
//! the same mutex, so `assign` is a compare-and-set: of any number of workers
//! racing on one pending item, exactly one wins and the rest receive a
//! [`QueueAssignError`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::item::{
    FileInfo, ItemId, ItemPatch, ItemStatus, ItemSummary, QueueItem, Resolution, Stage,
    TroubleDetail, TroubleKind,
};
use super::update::{ProcessorUpdate, UpdateKind, UpdateObserver};

/// Another actor claimed the item first. Expected under concurrency.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("queue item {id} was already claimed (status {status})")]
pub struct QueueAssignError {
    pub id: ItemId,
    pub status: ItemStatus,
}

/// Errors returned by queue operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error(transparent)]
    Assign(#[from] QueueAssignError),

    #[error("queue item {0} not found")]
    NotFound(ItemId),

    #[error("cannot {action} queue item {id} while it is {status}")]
    InvalidStatus {
        id: ItemId,
        status: ItemStatus,
        action: &'static str,
    },

    #[error("resolution '{resolution}' does not apply to {kind} trouble on queue item {id}")]
    ResolutionMismatch {
        id: ItemId,
        kind: TroubleKind,
        resolution: &'static str,
    },
}

impl QueueError {
    /// True for the benign assignment race.
    pub fn is_assign_race(&self) -> bool {
        matches!(self, QueueError::Assign(_))
    }
}

type QueueResult<T> = std::result::Result<T, QueueError>;

struct NoopObserver;

impl UpdateObserver for NoopObserver {
    fn on_update(&self, _update: &ProcessorUpdate) {}
}

#[derive(Default)]
struct QueueState {
    /// Items in priority order.
    items: Vec<QueueItem>,
    /// Last id handed out.
    last_id: u64,
    /// Source paths already ingested.
    sources: HashSet<PathBuf>,
}

impl QueueState {
    fn position(&self, id: ItemId) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }

    fn get_mut(&mut self, id: ItemId) -> QueueResult<&mut QueueItem> {
        self.items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or(QueueError::NotFound(id))
    }

    fn index(&self) -> Vec<ItemSummary> {
        self.items.iter().map(QueueItem::summary).collect()
    }
}

fn invalid(item: &QueueItem, action: &'static str) -> QueueError {
    QueueError::InvalidStatus {
        id: item.id,
        status: item.status,
        action,
    }
}

/// Ordered, lock-protected collection of queue items.
pub struct Queue {
    state: Mutex<QueueState>,
    observer: Arc<dyn UpdateObserver>,
}

impl Queue {
    /// Create an empty queue that reports updates nowhere.
    pub fn new() -> Self {
        Self::with_observer(Arc::new(NoopObserver))
    }

    /// Create an empty queue reporting every state change to `observer`.
    pub fn with_observer(observer: Arc<dyn UpdateObserver>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            observer,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Summaries of every item, in priority order.
    pub fn index(&self) -> Vec<ItemSummary> {
        self.state.lock().index()
    }

    /// Snapshots of every item, in priority order.
    pub fn items(&self) -> Vec<QueueItem> {
        self.state.lock().items.clone()
    }

    pub fn find_by_id(&self, id: ItemId) -> Option<QueueItem> {
        let state = self.state.lock();
        state.items.iter().find(|item| item.id == id).cloned()
    }

    /// First item, in priority order, at `stage` with `status`. Does not claim it.
    pub fn pick(&self, stage: Stage, status: ItemStatus) -> Option<QueueItem> {
        let state = self.state.lock();
        state
            .items
            .iter()
            .find(|item| item.stage == stage && item.status == status)
            .cloned()
    }

    /// Number of items at `stage` with `status`.
    pub fn count(&self, stage: Stage, status: ItemStatus) -> usize {
        let state = self.state.lock();
        state
            .items
            .iter()
            .filter(|item| item.stage == stage && item.status == status)
            .count()
    }

    /// Claim a pending item for processing.
    ///
    /// Fails with [`QueueError::Assign`] if the item is no longer pending.
    pub fn assign(&self, id: ItemId) -> QueueResult<QueueItem> {
        self.transition(id, |item| {
            if item.status != ItemStatus::Pending {
                return Err(QueueAssignError {
                    id: item.id,
                    status: item.status,
                }
                .into());
            }
            item.status = ItemStatus::Processing;
            debug!(item_id = %item.id, stage = %item.stage, "Assigned queue item");
            Ok(Some(UpdateKind::Assigned))
        })
    }

    /// Release a processing item into the next stage, applying `patch`.
    ///
    /// Advancing out of the last processing stage completes the item.
    /// Advancing an already completed item is a no-op.
    pub fn advance_stage(&self, id: ItemId, patch: ItemPatch) -> QueueResult<QueueItem> {
        self.transition(id, |item| {
            if item.status == ItemStatus::Completed {
                return Ok(None);
            }
            if item.status != ItemStatus::Processing {
                return Err(invalid(item, "advance"));
            }

            patch.apply(item);
            let next = item.stage.next();
            item.stage = next;
            if next.is_terminal() {
                item.status = ItemStatus::Completed;
                info!(item_id = %item.id, name = %item.name, "Queue item completed");
                Ok(Some(UpdateKind::Completed))
            } else {
                item.status = ItemStatus::Pending;
                debug!(item_id = %item.id, stage = %next, "Advanced queue item");
                Ok(Some(UpdateKind::Advanced))
            }
        })
    }

    /// Move a pending item to the front of the priority order.
    pub fn promote_item(&self, id: ItemId) -> QueueResult<()> {
        let index = {
            let mut state = self.state.lock();
            let pos = state.position(id).ok_or(QueueError::NotFound(id))?;
            if state.items[pos].status != ItemStatus::Pending {
                return Err(invalid(&state.items[pos], "promote"));
            }
            let mut item = state.items.remove(pos);
            item.touch();
            state.items.insert(0, item);
            state.index()
        };

        info!(item_id = %id, "Promoted queue item");
        self.emit(ProcessorUpdate::queue(UpdateKind::Promoted, index));
        Ok(())
    }

    /// Pause a pending or troubled item.
    pub fn pause_item(&self, id: ItemId) -> QueueResult<QueueItem> {
        self.transition(id, |item| {
            if !matches!(item.status, ItemStatus::Pending | ItemStatus::Trouble) {
                return Err(invalid(item, "pause"));
            }
            item.status = ItemStatus::Paused;
            item.trouble = None;
            info!(item_id = %item.id, "Paused queue item");
            Ok(Some(UpdateKind::Paused))
        })
    }

    /// Return a paused item to pending at its current stage.
    pub fn resume_item(&self, id: ItemId) -> QueueResult<QueueItem> {
        self.transition(id, |item| {
            if item.status != ItemStatus::Paused {
                return Err(invalid(item, "resume"));
            }
            item.status = ItemStatus::Pending;
            info!(item_id = %item.id, "Resumed queue item");
            Ok(Some(UpdateKind::Resumed))
        })
    }

    /// Cancel a pending or troubled item. In-flight items cannot be cancelled.
    pub fn cancel_item(&self, id: ItemId) -> QueueResult<QueueItem> {
        self.transition(id, |item| {
            if !matches!(item.status, ItemStatus::Pending | ItemStatus::Trouble) {
                return Err(invalid(item, "cancel"));
            }
            item.status = ItemStatus::Cancelled;
            item.trouble = None;
            info!(item_id = %item.id, "Cancelled queue item");
            Ok(Some(UpdateKind::Cancelled))
        })
    }

    /// Park a processing item in `Trouble` until someone resolves it.
    pub fn mark_trouble(&self, id: ItemId, detail: TroubleDetail) -> QueueResult<QueueItem> {
        self.transition(id, |item| {
            if item.status != ItemStatus::Processing {
                return Err(invalid(item, "mark trouble on"));
            }
            warn!(
                item_id = %item.id,
                stage = %item.stage,
                kind = %detail.kind,
                message = %detail.message,
                "Queue item needs attention"
            );
            item.status = ItemStatus::Trouble;
            item.trouble = Some(detail);
            Ok(Some(UpdateKind::Trouble))
        })
    }

    /// Resolve a troubled item, returning it to pending at the same stage.
    pub fn resolve_trouble(&self, id: ItemId, resolution: Resolution) -> QueueResult<QueueItem> {
        self.transition(id, |item| {
            let kind = item.trouble.as_ref().map(|detail| detail.kind);
            let Some(kind) = kind.filter(|_| item.status == ItemStatus::Trouble) else {
                return Err(invalid(item, "resolve"));
            };
            if !kind.accepts(&resolution) {
                return Err(QueueError::ResolutionMismatch {
                    id: item.id,
                    kind,
                    resolution: resolution.name(),
                });
            }

            let name = resolution.name();
            match resolution {
                Resolution::Retry => {}
                Resolution::SetTitle(info) => {
                    item.name = info.display_name();
                    item.title_info = Some(info);
                }
                Resolution::SetMetadata(metadata) => item.metadata = Some(metadata),
            }
            item.trouble = None;
            item.status = ItemStatus::Pending;
            info!(item_id = %item.id, stage = %item.stage, resolution = name, "Resolved queue item trouble");
            Ok(Some(UpdateKind::Resolved))
        })
    }

    /// Insert a new item for `path` unless one already exists for it.
    ///
    /// Returns whether an item was inserted.
    pub fn ingest(&self, path: &Path, info: FileInfo) -> bool {
        let item = {
            let mut state = self.state.lock();
            if state.sources.contains(path) {
                return false;
            }
            state.last_id += 1;
            let item = QueueItem::new(ItemId::new(state.last_id), path, info);
            state.sources.insert(path.to_path_buf());
            state.items.push(item.clone());
            item
        };

        info!(item_id = %item.id, path = %path.display(), "Ingested new queue item");
        self.emit(ProcessorUpdate::item(UpdateKind::Ingested, item));
        true
    }

    /// Run `f` against one item under the lock, then report the result.
    ///
    /// `f` returns the update to emit, or `None` for a no-op.
    fn transition<F>(&self, id: ItemId, f: F) -> QueueResult<QueueItem>
    where
        F: FnOnce(&mut QueueItem) -> QueueResult<Option<UpdateKind>>,
    {
        let (snapshot, kind) = {
            let mut state = self.state.lock();
            let item = state.get_mut(id)?;
            let kind = f(item)?;
            if kind.is_some() {
                item.touch();
            }
            (item.clone(), kind)
        };

        if let Some(kind) = kind {
            self.emit(ProcessorUpdate::item(kind, snapshot.clone()));
        }
        Ok(snapshot)
    }

    fn emit(&self, update: ProcessorUpdate) {
        self.observer.on_update(&update);
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}
