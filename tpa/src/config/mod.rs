//! Application configuration.
//!
//! Loaded from an optional TOML file, then overridden from `TPA_*`
//! environment variables. Every field has a default so an empty file (or no
//! file at all) is a valid configuration once a source directory is set.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::processor::Stage;
use crate::utils::fs::io_error;
use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "tpa=info";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub processor: ProcessorConfig,
    pub logging: LoggingSettings,
}

impl AppConfig {
    /// Read `path` as TOML, or start from defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| io_error("reading config file", path, e))?;
                Self::from_toml(&raw)?
            }
            None => Self::default(),
        };
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `TPA_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `TPA_*` overrides, resolving each key through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("TPA_SOURCE_DIR") {
            self.processor.source_dir = PathBuf::from(dir);
        }
        if let Some(secs) = lookup("TPA_POLL_INTERVAL_SECS") {
            self.processor.poll_interval_secs = secs.trim().parse().map_err(|_| {
                Error::config(format!("TPA_POLL_INTERVAL_SECS is not a number: {}", secs))
            })?;
        }
        if let Some(key) = lookup("TPA_OMDB_API_KEY") {
            self.processor.metadata.api_key = Some(key);
            self.processor.metadata.enabled = true;
        }
        if let Some(dir) = lookup("TPA_OUTPUT_DIR") {
            self.processor.format.output_dir = PathBuf::from(dir);
        }
        if let Some(filter) = lookup("TPA_LOG_FILTER") {
            self.logging.filter = filter;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.processor.validate()?;
        if self.logging.filter.trim().is_empty() {
            return Err(Error::config("logging.filter must not be empty"));
        }
        Ok(())
    }
}

/// Configuration consumed by the processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Directory walked by the polling producer.
    pub source_dir: PathBuf,
    pub poll_interval_secs: u64,
    pub workers: StageWorkers,
    pub import: ImportConfig,
    pub metadata: MetadataConfig,
    pub format: FormatConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::new(),
            poll_interval_secs: 5,
            workers: StageWorkers::default(),
            import: ImportConfig::default(),
            metadata: MetadataConfig::default(),
            format: FormatConfig::default(),
        }
    }
}

impl ProcessorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_dir.as_os_str().is_empty() {
            return Err(Error::config("processor.source_dir must be set"));
        }
        if self.poll_interval_secs == 0 {
            return Err(Error::config(
                "processor.poll_interval_secs must be greater than zero",
            ));
        }
        let workers = &self.workers;
        for (field, count) in [
            ("import", workers.import),
            ("title", workers.title),
            ("metadata", workers.metadata),
            ("format", workers.format),
        ] {
            if count == 0 {
                return Err(Error::config(format!(
                    "processor.workers.{} must be at least 1",
                    field
                )));
            }
        }
        if self.format.args.is_empty() {
            return Err(Error::config("processor.format.args must not be empty"));
        }
        if self.metadata.enabled && self.metadata.api_key.as_deref().is_none_or(str::is_empty) {
            return Err(Error::config(
                "processor.metadata.api_key is required when metadata lookup is enabled",
            ));
        }
        Ok(())
    }
}

/// Worker count per processing stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageWorkers {
    pub import: usize,
    pub title: usize,
    pub metadata: usize,
    pub format: usize,
}

impl Default for StageWorkers {
    fn default() -> Self {
        Self {
            import: 1,
            title: 1,
            metadata: 2,
            format: 1,
        }
    }
}

impl StageWorkers {
    /// Pool size for every processing stage, in pipeline order.
    pub fn sizes(&self) -> [(Stage, usize); 4] {
        [
            (Stage::Import, self.import),
            (Stage::Title, self.title),
            (Stage::MetadataLookup, self.metadata),
            (Stage::Format, self.format),
        ]
    }
}

/// Import detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Accepted file extensions, without the dot. Compared case-insensitively.
    pub extensions: Vec<String>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            extensions: ["mp4", "mkv", "avi", "mov", "m4v", "webm", "ts"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Metadata lookup settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: None,
            base_url: "https://www.omdbapi.com/".to_string(),
            timeout_secs: 10,
        }
    }
}

/// Format (transcode) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatConfig {
    pub ffmpeg_path: String,
    pub output_dir: PathBuf,
    /// Output container extension, without the dot.
    pub extension: String,
    /// Argument template. `{input}`, `{output}` and `{title}` are substituted.
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            output_dir: PathBuf::from("output"),
            extension: "mp4".to_string(),
            args: [
                "-hide_banner",
                "-nostdin",
                "-y",
                "-i",
                "{input}",
                "-map",
                "0",
                "-c",
                "copy",
                "-metadata",
                "title={title}",
                "{output}",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            timeout_secs: 6 * 60 * 60,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive. `RUST_LOG` takes precedence when set.
    pub filter: String,
    /// Directory for daily rolling log files. Console only when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    pub ansi: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            log_dir: None,
            ansi: true,
        }
    }
}
