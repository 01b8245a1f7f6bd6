//! Queue item model.
//!
//! A [`QueueItem`] is owned by the [`Queue`](super::Queue). Everything handed
//! out of the queue is a snapshot; mutation always goes back through a named
//! queue operation.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique, monotonically assigned item identifier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(u64);

impl ItemId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ItemId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(Self)
    }
}

/// Pipeline stage. Declaration order is pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Import detection.
    Import,
    /// Title normalization.
    Title,
    /// Metadata lookup.
    MetadataLookup,
    /// Transcode / format.
    Format,
    /// Terminal stage. No pool is bound to it.
    Complete,
}

impl Stage {
    /// Every stage, in pipeline order.
    pub const ALL: [Stage; 5] = [
        Stage::Import,
        Stage::Title,
        Stage::MetadataLookup,
        Stage::Format,
        Stage::Complete,
    ];

    /// Stages that have a worker pool bound to them.
    pub const PROCESSING: [Stage; 4] = [
        Stage::Import,
        Stage::Title,
        Stage::MetadataLookup,
        Stage::Format,
    ];

    /// The stage newly ingested items start at.
    pub const fn first() -> Stage {
        Stage::Import
    }

    /// The following stage. `Complete` is its own successor.
    pub const fn next(self) -> Stage {
        match self {
            Stage::Import => Stage::Title,
            Stage::Title => Stage::MetadataLookup,
            Stage::MetadataLookup => Stage::Format,
            Stage::Format | Stage::Complete => Stage::Complete,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Stage::Complete)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Stage::Import => "import",
            Stage::Title => "title",
            Stage::MetadataLookup => "metadata_lookup",
            Stage::Format => "format",
            Stage::Complete => "complete",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Item status, overlaid on the current stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Processing,
    Paused,
    Trouble,
    Completed,
    Cancelled,
}

impl ItemStatus {
    /// Completed and cancelled items never change again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Cancelled)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Processing => "processing",
            ItemStatus::Paused => "paused",
            ItemStatus::Trouble => "trouble",
            ItemStatus::Completed => "completed",
            ItemStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Title information parsed from a source file name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitleInfo {
    /// Cleaned title.
    pub title: String,
    /// Whether the item is an episode of a series.
    pub episodic: bool,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub year: Option<u32>,
    /// Resolution tag such as `1080p`.
    pub resolution: Option<String>,
}

impl TitleInfo {
    /// Human readable display name, e.g. `Show S01E02` or `Film (1999)`.
    pub fn display_name(&self) -> String {
        match (self.season, self.episode) {
            (Some(season), Some(episode)) => {
                format!("{} S{:02}E{:02}", self.title, season, episode)
            }
            _ => match self.year {
                Some(year) => format!("{} ({})", self.title, year),
                None => self.title.clone(),
            },
        }
    }
}

/// Metadata resolved by the lookup stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub title: String,
    pub year: Option<u32>,
    pub runtime: Option<String>,
    pub plot: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    pub imdb_id: Option<String>,
}

/// Which stage raised the trouble, and therefore what may resolve it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TroubleKind {
    Import,
    Title,
    MetadataLookup,
    Format,
}

impl TroubleKind {
    /// Trouble kind for a processing stage. `Complete` cannot fail.
    pub const fn for_stage(stage: Stage) -> Option<TroubleKind> {
        match stage {
            Stage::Import => Some(TroubleKind::Import),
            Stage::Title => Some(TroubleKind::Title),
            Stage::MetadataLookup => Some(TroubleKind::MetadataLookup),
            Stage::Format => Some(TroubleKind::Format),
            Stage::Complete => None,
        }
    }

    /// Whether `resolution` is an acceptable answer to this trouble.
    pub fn accepts(self, resolution: &Resolution) -> bool {
        match resolution {
            Resolution::Retry => true,
            Resolution::SetTitle(_) => self == TroubleKind::Title,
            Resolution::SetMetadata(_) => self == TroubleKind::MetadataLookup,
        }
    }

    /// Names of the resolutions this kind accepts.
    pub fn expected_resolutions(self) -> &'static [&'static str] {
        match self {
            TroubleKind::Title => &["retry", "set_title"],
            TroubleKind::MetadataLookup => &["retry", "set_metadata"],
            TroubleKind::Import | TroubleKind::Format => &["retry"],
        }
    }
}

impl fmt::Display for TroubleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TroubleKind::Import => "import",
            TroubleKind::Title => "title",
            TroubleKind::MetadataLookup => "metadata_lookup",
            TroubleKind::Format => "format",
        };
        f.write_str(s)
    }
}

/// Failure attached to an item in `Trouble` status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TroubleDetail {
    pub kind: TroubleKind,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl TroubleDetail {
    pub fn new(kind: TroubleKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            raised_at: Utc::now(),
        }
    }

    pub fn expected_resolutions(&self) -> &'static [&'static str] {
        self.kind.expected_resolutions()
    }
}

/// Human supplied answer to a trouble.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Resolution {
    /// Run the same stage again unchanged.
    Retry,
    /// Use this title instead of parsing one.
    SetTitle(TitleInfo),
    /// Use this metadata instead of looking it up.
    SetMetadata(ItemMetadata),
}

impl Resolution {
    pub const fn name(&self) -> &'static str {
        match self {
            Resolution::Retry => "retry",
            Resolution::SetTitle(_) => "set_title",
            Resolution::SetMetadata(_) => "set_metadata",
        }
    }
}

/// Filesystem facts captured when a file is discovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
}

impl From<&std::fs::Metadata> for FileInfo {
    fn from(meta: &std::fs::Metadata) -> Self {
        Self { size: meta.len() }
    }
}

/// A unit of work moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: ItemId,
    /// Display name; rewritten by title normalization.
    pub name: String,
    pub source_path: PathBuf,
    pub file_size: u64,
    pub stage: Stage,
    pub status: ItemStatus,
    /// Present only while `status == Trouble`.
    pub trouble: Option<TroubleDetail>,
    pub title_info: Option<TitleInfo>,
    pub metadata: Option<ItemMetadata>,
    pub output_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    pub(crate) fn new(id: ItemId, source_path: &Path, info: FileInfo) -> Self {
        let now = Utc::now();
        let name = source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| source_path.to_string_lossy().into_owned());

        Self {
            id,
            name,
            source_path: source_path.to_path_buf(),
            file_size: info.size,
            stage: Stage::first(),
            status: ItemStatus::Pending,
            trouble: None,
            title_info: None,
            metadata: None,
            output_path: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn summary(&self) -> ItemSummary {
        ItemSummary {
            id: self.id,
            name: self.name.clone(),
            stage: self.stage,
            status: self.status,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Listing view of an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSummary {
    pub id: ItemId,
    pub name: String,
    pub stage: Stage,
    pub status: ItemStatus,
}

/// Changes produced by a stage, applied atomically when the item advances.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemPatch {
    pub name: Option<String>,
    pub title_info: Option<TitleInfo>,
    pub metadata: Option<ItemMetadata>,
    pub output_path: Option<PathBuf>,
}

impl ItemPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_title_info(mut self, info: TitleInfo) -> Self {
        self.title_info = Some(info);
        self
    }

    pub fn with_metadata(mut self, metadata: ItemMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub(crate) fn apply(self, item: &mut QueueItem) {
        if let Some(name) = self.name {
            item.name = name;
        }
        if let Some(info) = self.title_info {
            item.title_info = Some(info);
        }
        if let Some(metadata) = self.metadata {
            item.metadata = Some(metadata);
        }
        if let Some(path) = self.output_path {
            item.output_path = Some(path);
        }
    }
}
