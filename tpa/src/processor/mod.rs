//! Pipeline scheduling core.
//!
//! Files found by the [`PollingProducer`] become [`QueueItem`]s in the
//! [`Queue`]. Each processing stage has a [`WorkerPool`]; its workers claim
//! pending items at their stage, run the stage's [`StageHandler`], advance
//! the item and wake the next stage's pool:
//!
//! ```text
//! poll -> ingest -> Import -> Title -> MetadataLookup -> Format -> Complete
//! ```
//!
//! A stage failure parks the item in `Trouble` at the same stage until a
//! [`Resolution`] returns it to `Pending`.

pub mod item;
pub mod manager;
pub mod polling;
pub mod queue;
pub mod tasks;
pub mod update;
pub mod worker;
pub mod worker_pool;

pub use item::{
    FileInfo, ItemId, ItemMetadata, ItemPatch, ItemStatus, ItemSummary, QueueItem, Resolution,
    Stage, TitleInfo, TroubleDetail, TroubleKind,
};
pub use manager::Processor;
pub use polling::PollingProducer;
pub use queue::{Queue, QueueAssignError, QueueError};
pub use tasks::{StageFailure, StageHandler, StageTask};
pub use update::{ProcessorUpdate, UpdateFanout, UpdateKind, UpdateObserver, UpdateTarget};
pub use worker::{WakeSignal, Worker, WorkerFailure, WorkerSnapshot, WorkerStatus, WorkerTask};
pub use worker_pool::{WorkerPool, WorkerPools};
