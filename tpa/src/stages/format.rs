//! Format stage: runs the configured transcode command for an item.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::FormatConfig;
use crate::processor::{ItemPatch, QueueItem, Stage, StageFailure, StageHandler};
use crate::utils::filename::output_file_name;
use crate::utils::fs::ensure_parent_dir;

/// Lines of stderr kept for the trouble message.
const STDERR_TAIL_LINES: usize = 12;

pub struct FormatHandler {
    config: FormatConfig,
}

impl FormatHandler {
    pub fn new(config: FormatConfig) -> Self {
        Self { config }
    }

    /// Substitute `{input}`, `{output}` and `{title}` in each template argument.
    fn build_args(&self, input: &Path, output: &Path, title: &str) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        self.config
            .args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input)
                    .replace("{output}", &output)
                    .replace("{title}", title)
            })
            .collect()
    }

    async fn run(&self, args: &[String]) -> Result<(), StageFailure> {
        let program = &self.config.ffmpeg_path;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StageFailure::trouble(format!("failed to start {}: {}", program, e)))?;

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("stderr: {}", line);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                tail.into_iter().collect::<Vec<_>>().join("\n")
            })
        });

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(StageFailure::trouble(format!(
                    "failed to wait for {}: {}",
                    program, e
                )));
            }
            Err(_) => {
                error!(program = %program, timeout_secs = self.config.timeout_secs, "Command timed out");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill timed out command");
                }
                return Err(StageFailure::trouble(format!(
                    "{} timed out after {}s",
                    program, self.config.timeout_secs
                )));
            }
        };

        let tail = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            return Err(StageFailure::trouble(format!(
                "{} exited with {}: {}",
                program, status, tail
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StageHandler for FormatHandler {
    fn stage(&self) -> Stage {
        Stage::Format
    }

    async fn handle(&self, item: &QueueItem) -> Result<ItemPatch, StageFailure> {
        let title = item
            .title_info
            .as_ref()
            .map(|t| t.display_name())
            .unwrap_or_else(|| item.name.clone());
        let output = self
            .config
            .output_dir
            .join(output_file_name(&title, &self.config.extension));

        ensure_parent_dir(&output)
            .await
            .map_err(|e| StageFailure::trouble(e.to_string()))?;

        let args = self.build_args(&item.source_path, &output, &title);
        debug!(item_id = %item.id, program = %self.config.ffmpeg_path, ?args, "Running format command");

        let started = Instant::now();
        self.run(&args).await?;

        info!(
            item_id = %item.id,
            output = %output.display(),
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Format completed"
        );
        Ok(ItemPatch::new().with_output_path(output))
    }
}
