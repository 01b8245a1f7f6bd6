//! Import detection: decides whether a discovered file is media we handle.

use async_trait::async_trait;
use tracing::debug;

use crate::config::ImportConfig;
use crate::processor::{ItemPatch, QueueItem, Stage, StageFailure, StageHandler};

pub struct ImportHandler {
    /// Lowercase, without the leading dot.
    extensions: Vec<String>,
}

impl ImportHandler {
    pub fn new(config: &ImportConfig) -> Self {
        let extensions = config
            .extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        Self { extensions }
    }

    fn accepts_extension(&self, ext: &str) -> bool {
        self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
    }
}

#[async_trait]
impl StageHandler for ImportHandler {
    fn stage(&self) -> Stage {
        Stage::Import
    }

    async fn handle(&self, item: &QueueItem) -> Result<ItemPatch, StageFailure> {
        let path = &item.source_path;

        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            StageFailure::trouble(format!("source file is not readable: {}", e))
        })?;
        if !metadata.is_file() {
            return Err(StageFailure::trouble("source is not a regular file"));
        }
        if metadata.len() == 0 {
            return Err(StageFailure::trouble("source file is empty"));
        }

        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if self.accepts_extension(ext) => {}
            Some(ext) => {
                return Err(StageFailure::trouble(format!(
                    "unsupported file extension '{}'",
                    ext
                )));
            }
            None => return Err(StageFailure::trouble("source file has no extension")),
        }

        debug!(item_id = %item.id, size = metadata.len(), "Import detected media file");
        Ok(ItemPatch::new())
    }
}
