//! tpa: watches a source directory and drives each discovered media file
//! through import, title normalization, metadata lookup and formatting.

pub mod config;
pub mod error;
pub mod logging;
pub mod processor;
pub mod stages;
pub mod utils;

pub use error::{Error, Result};
