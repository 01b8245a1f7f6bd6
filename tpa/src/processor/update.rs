//! Item state change notifications.
//!
//! The queue reports every state change through an [`UpdateObserver`]. The
//! processor installs an [`UpdateFanout`] which forwards each update to the
//! registered observers and to a broadcast channel for gateways.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use super::item::{ItemSummary, QueueItem};

/// Broadcast channel capacity for updates.
const UPDATE_BROADCAST_CAPACITY: usize = 256;

/// What happened to the affected item(s).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Ingested,
    Assigned,
    Advanced,
    Completed,
    Promoted,
    Paused,
    Resumed,
    Cancelled,
    Trouble,
    Resolved,
}

/// The item, or the whole ordered collection, an update refers to.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "scope", content = "data", rename_all = "snake_case")]
pub enum UpdateTarget {
    Item(Box<QueueItem>),
    Queue(Vec<ItemSummary>),
}

/// A single state change.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessorUpdate {
    pub kind: UpdateKind,
    pub target: UpdateTarget,
}

impl ProcessorUpdate {
    pub fn item(kind: UpdateKind, item: QueueItem) -> Self {
        Self {
            kind,
            target: UpdateTarget::Item(Box::new(item)),
        }
    }

    pub fn queue(kind: UpdateKind, index: Vec<ItemSummary>) -> Self {
        Self {
            kind,
            target: UpdateTarget::Queue(index),
        }
    }

    /// The single item this update refers to, if any.
    pub fn as_item(&self) -> Option<&QueueItem> {
        match &self.target {
            UpdateTarget::Item(item) => Some(item.as_ref()),
            UpdateTarget::Queue(_) => None,
        }
    }
}

/// Receives item state changes.
///
/// Called outside the queue lock, but on the task that made the change, so
/// implementations must not block.
pub trait UpdateObserver: Send + Sync {
    fn on_update(&self, update: &ProcessorUpdate);
}

/// Fans updates out to registered observers and a broadcast channel.
pub struct UpdateFanout {
    observers: RwLock<Vec<Arc<dyn UpdateObserver>>>,
    tx: broadcast::Sender<ProcessorUpdate>,
}

impl UpdateFanout {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(UPDATE_BROADCAST_CAPACITY);
        Self {
            observers: RwLock::new(Vec::new()),
            tx,
        }
    }

    pub fn register(&self, observer: Arc<dyn UpdateObserver>) {
        self.observers.write().push(observer);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessorUpdate> {
        self.tx.subscribe()
    }
}

impl Default for UpdateFanout {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateObserver for UpdateFanout {
    fn on_update(&self, update: &ProcessorUpdate) {
        trace!(kind = ?update.kind, "Dispatching processor update");
        for observer in self.observers.read().iter() {
            observer.on_update(update);
        }
        // No subscribers is fine.
        let _ = self.tx.send(update.clone());
    }
}
