//! Stage payloads.
//!
//! One [`StageHandler`] per processing stage. The processor only schedules
//! them; what each one does to an item lives here.

pub mod format;
pub mod import;
pub mod metadata;
pub mod title;

use std::sync::Arc;

pub use format::FormatHandler;
pub use import::ImportHandler;
pub use metadata::{MetadataHandler, MetadataProvider, MetadataQuery, OmdbProvider};
pub use title::{TitleHandler, parse_title};

use crate::Result;
use crate::config::ProcessorConfig;
use crate::processor::StageHandler;

/// The built-in handler for every processing stage.
pub fn default_handlers(config: &ProcessorConfig) -> Result<Vec<Arc<dyn StageHandler>>> {
    Ok(vec![
        Arc::new(ImportHandler::new(&config.import)),
        Arc::new(TitleHandler::new()),
        Arc::new(MetadataHandler::from_config(&config.metadata)?),
        Arc::new(FormatHandler::new(config.format.clone())),
    ])
}
