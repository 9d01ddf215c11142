//! Workspace snapshots for detecting files an agent produced.
//!
//! A snapshot is taken before and after a task; the diff lists files that
//! appeared or changed. Deletions are not tracked.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::debug;
use walkdir::{DirEntry, WalkDir};

use crate::error::{BridgeError, BridgeResult};

/// How deep below the root the walk descends.
pub const MAX_DEPTH: usize = 3;

/// Largest file handed back for delivery (30 MiB).
pub const MAX_DELIVERABLE_BYTES: u64 = 30 * 1024 * 1024;

/// Dependency and build caches that churn on every run.
pub const DEFAULT_IGNORED_DIRS: &[&str] =
    &["node_modules", "__pycache__", "venv", "target", "dist", "build"];

/// Size and modification time of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// Point-in-time map of file metadata under a root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    files: BTreeMap<PathBuf, FileStamp>,
}

impl Snapshot {
    pub fn from_entries(entries: impl IntoIterator<Item = (PathBuf, FileStamp)>) -> Self {
        Self {
            files: entries.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get(&self, path: &Path) -> Option<&FileStamp> {
        self.files.get(path)
    }
}

/// Files that appeared or changed between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub added: Vec<PathBuf>,
    pub changed: Vec<PathBuf>,
}

/// How a produced file relates to the pre-task workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChange {
    Added,
    Changed,
}

/// A file the agent created or modified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedFile {
    pub path: PathBuf,
    pub size: u64,
    pub change: FileChange,
}

impl ProducedFile {
    /// Reject files above `limit` bytes instead of truncating them.
    pub fn ensure_deliverable(&self, limit: u64) -> BridgeResult<&Path> {
        if self.size > limit {
            return Err(BridgeError::FileTooLarge {
                path: self.path.clone(),
                size: self.size,
                limit,
            });
        }
        Ok(&self.path)
    }
}

/// Captures and compares workspace snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotDiffer {
    ignored_dirs: Vec<String>,
    max_depth: usize,
}

impl Default for SnapshotDiffer {
    fn default() -> Self {
        Self {
            ignored_dirs: DEFAULT_IGNORED_DIRS.iter().map(|s| s.to_string()).collect(),
            max_depth: MAX_DEPTH,
        }
    }
}

impl SnapshotDiffer {
    pub fn new(ignored_dirs: Vec<String>) -> Self {
        Self {
            ignored_dirs,
            ..Self::default()
        }
    }

    fn keep(&self, entry: &DirEntry) -> bool {
        if entry.depth() == 0 {
            return true;
        }
        let name = entry.file_name().to_string_lossy();
        // Skip hidden files and directories
        if name.starts_with('.') {
            return false;
        }
        !(entry.file_type().is_dir() && self.ignored_dirs.iter().any(|d| d.as_str() == &*name))
    }

    /// Walk `root` and record every regular file. Unreadable entries are skipped.
    ///
    /// This is blocking filesystem work; async callers should run it on a
    /// blocking thread.
    pub fn capture(&self, root: &Path) -> Snapshot {
        let mut files = BTreeMap::new();

        for entry in WalkDir::new(root)
            .max_depth(self.max_depth)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| self.keep(e))
        {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!("Skipping unreadable path during snapshot: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            files.insert(
                entry.into_path(),
                FileStamp {
                    size: metadata.len(),
                    modified: metadata.modified().ok(),
                },
            );
        }

        debug!("Captured {} file(s) under {}", files.len(), root.display());
        Snapshot { files }
    }

    /// Paths new in `after` are added; shared paths whose size or mtime moved
    /// are changed. Both lists are sorted.
    pub fn diff(before: &Snapshot, after: &Snapshot) -> SnapshotDiff {
        let mut diff = SnapshotDiff::default();
        for (path, stamp) in &after.files {
            match before.files.get(path) {
                None => diff.added.push(path.clone()),
                Some(old) if old != stamp => diff.changed.push(path.clone()),
                Some(_) => {}
            }
        }
        diff
    }

    /// The diff joined with sizes from `after`, ready for delivery checks.
    pub fn produced_files(diff: &SnapshotDiff, after: &Snapshot) -> Vec<ProducedFile> {
        let tagged = diff
            .added
            .iter()
            .map(|p| (p, FileChange::Added))
            .chain(diff.changed.iter().map(|p| (p, FileChange::Changed)));
        tagged
            .filter_map(|(path, change)| {
                after.get(path).map(|stamp| ProducedFile {
                    path: path.clone(),
                    size: stamp.size,
                    change,
                })
            })
            .collect()
    }
}
