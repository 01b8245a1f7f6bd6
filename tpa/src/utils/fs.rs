//! Filesystem helpers shared across modules.
//!
//! These helpers attach operation + path context to IO errors and implement
//! the source directory walk used by the polling producer.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{Error, Result};

/// Convert an IO error into an application error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| io_error("creating directory", path, e))
}

/// Ensure the parent directory of a file path exists.
pub async fn ensure_parent_dir(path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    ensure_dir_all(parent).await
}

/// Whether the final component of `path` starts with a dot.
pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

/// A regular file found by [`walk_files`].
#[derive(Debug)]
pub struct WalkedFile {
    pub path: PathBuf,
    pub metadata: std::fs::Metadata,
}

/// Result of a directory walk.
#[derive(Debug, Default)]
pub struct WalkOutcome {
    pub files: Vec<WalkedFile>,
    /// Entries that could not be read and were left out.
    pub skipped: usize,
}

/// Recursively collect every non-directory entry below `root`.
///
/// Hidden entries are skipped along with everything beneath them. A symlink
/// to a file is returned like the file itself; symlinked directories are
/// never entered, so link cycles cannot repeat the walk. Failing to
/// read `root` itself is an error; any other unreadable entry is logged and
/// counted in [`WalkOutcome::skipped`]. Entries are returned in path order
/// within each directory.
pub async fn walk_files(root: &Path) -> Result<WalkOutcome> {
    let mut outcome = WalkOutcome::default();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let is_root = dir.as_path() == root;
        let entries = match read_dir_sorted(&dir).await {
            Ok(entries) => entries,
            Err(e) if is_root => return Err(e),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable directory");
                outcome.skipped += 1;
                continue;
            }
        };

        let mut subdirs = Vec::new();
        for path in entries {
            if is_hidden(&path) {
                continue;
            }

            let kind = match entry_metadata(&path).await {
                Ok(kind) => kind,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                    outcome.skipped += 1;
                    continue;
                }
            };

            match kind {
                EntryKind::Dir => subdirs.push(path),
                EntryKind::File(metadata) => outcome.files.push(WalkedFile { path, metadata }),
                EntryKind::LinkedDir => {
                    debug!(path = %path.display(), "Not descending into symlinked directory");
                }
            }
        }

        // Reversed so the stack visits subdirectories in path order.
        pending.extend(subdirs.into_iter().rev());
    }

    Ok(outcome)
}

enum EntryKind {
    Dir,
    LinkedDir,
    File(std::fs::Metadata),
}

/// Classify `path` without following directory symlinks.
async fn entry_metadata(path: &Path) -> Result<EntryKind> {
    let own = tokio::fs::symlink_metadata(path)
        .await
        .map_err(|e| io_error("reading metadata", path, e))?;
    if own.is_dir() {
        return Ok(EntryKind::Dir);
    }
    if !own.file_type().is_symlink() {
        return Ok(EntryKind::File(own));
    }

    let target = tokio::fs::metadata(path)
        .await
        .map_err(|e| io_error("resolving symlink", path, e))?;
    if target.is_dir() {
        Ok(EntryKind::LinkedDir)
    } else {
        Ok(EntryKind::File(target))
    }
}

async fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut reader = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| io_error("reading directory", dir, e))?;

    let mut paths = Vec::new();
    while let Some(entry) = reader
        .next_entry()
        .await
        .map_err(|e| io_error("reading directory", dir, e))?
    {
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}
