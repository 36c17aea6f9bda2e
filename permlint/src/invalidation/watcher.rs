//! Polling file watcher with per-path debouncing.
//!
//! [`FileWatcher::poll_at`] compares the watched files against the last
//! snapshot (modification time and length), feeds raw events into a
//! [`Debouncer`], and emits the events whose path has been quiet for the
//! debounce window. Events can also be recorded from an external notification
//! source with [`FileWatcher::record_event`].
//!
//! A `Modified` event is only emitted if the file's SHA-256 content hash
//! differs from the last one seen; `Created` and `Removed` are always emitted.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{Level, debug, instrument, trace};
use walkdir::WalkDir;

use crate::error::{PermlintError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

impl ChangeKind {
    /// Creation and removal are renames; they skip the content check.
    pub fn is_rename(&self) -> bool {
        matches!(self, ChangeKind::Created | ChangeKind::Removed)
    }

    /// Combines a pending event with a newer one for the same path.
    fn merge(self, newer: ChangeKind) -> ChangeKind {
        match (self, newer) {
            (ChangeKind::Created, ChangeKind::Modified) => ChangeKind::Created,
            (ChangeKind::Removed, ChangeKind::Created) => ChangeKind::Modified,
            (_, newer) => newer,
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Removed => "removed",
        })
    }
}

/// A confirmed change to a watched file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// Holds raw events until their path has been quiet for `window`.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    pending: HashMap<PathBuf, (ChangeKind, Instant)>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Records a raw event. Repeated events restart the path's quiet window.
    pub fn push(&mut self, path: PathBuf, kind: ChangeKind, now: Instant) {
        self.pending
            .entry(path)
            .and_modify(|(pending, seen)| {
                *pending = pending.merge(kind);
                *seen = now;
            })
            .or_insert((kind, now));
    }

    /// Removes and returns the events that have been quiet for the window,
    /// sorted by path.
    pub fn drain_ready(&mut self, now: Instant) -> Vec<(PathBuf, ChangeKind)> {
        let window = self.window;
        let mut ready: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, (_, seen))| now.saturating_duration_since(*seen) >= window)
            .map(|(path, _)| path.clone())
            .collect();
        ready.sort();
        ready
            .into_iter()
            .filter_map(|path| self.pending.remove(&path).map(|(kind, _)| (path, kind)))
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct FileState {
    modified: Option<SystemTime>,
    len: u64,
    /// Hash of the content last emitted or snapshotted.
    hash: Option<String>,
}

/// Polls watched files and directories for changes.
#[derive(Debug)]
pub struct FileWatcher {
    roots: HashMap<PathBuf, bool>,
    known: HashMap<PathBuf, FileState>,
    debouncer: Debouncer,
}

impl FileWatcher {
    pub fn new(debounce: Duration) -> Self {
        Self {
            roots: HashMap::new(),
            known: HashMap::new(),
            debouncer: Debouncer::new(debounce),
        }
    }

    /// Starts watching a file or directory. A path that does not exist yet is
    /// watched for creation.
    #[instrument(level = Level::TRACE, skip(self))]
    pub fn watch(&mut self, path: &Path, recursive: bool) -> Result<()> {
        if self.roots.contains_key(path) {
            return Ok(());
        }
        if let Err(source) = fs::metadata(path)
            && source.kind() != ErrorKind::NotFound
        {
            return Err(PermlintError::WatchError {
                path: path.to_path_buf(),
                source,
            });
        }

        for file in list_files(path, recursive) {
            if let Some(state) = snapshot(&file) {
                let hash = hash_file(&file);
                self.known.insert(file, FileState { hash, ..state });
            }
        }
        self.roots.insert(path.to_path_buf(), recursive);
        debug!(path = %path.display(), recursive, "watching");
        Ok(())
    }

    /// Stops watching `path` and forgets the files below it.
    pub fn unwatch(&mut self, path: &Path) -> bool {
        let removed = self.roots.remove(path).is_some();
        if removed {
            self.known.retain(|file, _| !file.starts_with(path));
        }
        removed
    }

    pub fn is_watching(&self, path: &Path) -> bool {
        self.roots.contains_key(path)
    }

    pub fn watched(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = self.roots.keys().cloned().collect();
        roots.sort();
        roots
    }

    /// Feeds an event from an external notification source.
    pub fn record_event(&mut self, path: impl Into<PathBuf>, kind: ChangeKind, now: Instant) {
        self.debouncer.push(path.into(), kind, now);
    }

    pub fn poll(&mut self) -> Vec<FileChange> {
        self.poll_at(Instant::now())
    }

    /// Scans the watched paths and returns the confirmed, debounced changes.
    pub fn poll_at(&mut self, now: Instant) -> Vec<FileChange> {
        self.scan(now);

        let mut changes = Vec::new();
        for (path, kind) in self.debouncer.drain_ready(now) {
            if let Some(change) = self.confirm(path, kind) {
                debug!(path = %change.path.display(), kind = %change.kind, "file changed");
                changes.push(change);
            }
        }
        changes
    }

    /// Compares the file system against the snapshot and records raw events.
    fn scan(&mut self, now: Instant) {
        let roots: Vec<(PathBuf, bool)> = self.roots.iter().map(|(p, r)| (p.clone(), *r)).collect();
        let mut seen = HashSet::new();

        for (root, recursive) in &roots {
            for file in list_files(root, *recursive) {
                let Some(current) = snapshot(&file) else {
                    continue;
                };
                match self.known.get_mut(&file) {
                    None => {
                        trace!(path = %file.display(), "raw create");
                        self.known.insert(file.clone(), current);
                        self.debouncer.push(file.clone(), ChangeKind::Created, now);
                    }
                    Some(known) if known.modified != current.modified || known.len != current.len => {
                        trace!(path = %file.display(), "raw modify");
                        known.modified = current.modified;
                        known.len = current.len;
                        self.debouncer.push(file.clone(), ChangeKind::Modified, now);
                    }
                    Some(_) => {}
                }
                seen.insert(file);
            }
        }

        let gone: Vec<PathBuf> = self
            .known
            .keys()
            .filter(|file| !seen.contains(*file))
            .cloned()
            .collect();
        for file in gone {
            trace!(path = %file.display(), "raw remove");
            self.known.remove(&file);
            self.debouncer.push(file, ChangeKind::Removed, now);
        }
    }

    /// Applies the content check to a debounced event.
    fn confirm(&mut self, path: PathBuf, kind: ChangeKind) -> Option<FileChange> {
        match kind {
            ChangeKind::Removed => {
                self.known.remove(&path);
            }
            ChangeKind::Created => {
                let hash = hash_file(&path);
                if let Some(state) = snapshot(&path) {
                    self.known.insert(path.clone(), FileState { hash, ..state });
                }
            }
            ChangeKind::Modified => {
                let hash = hash_file(&path);
                let previous = self.known.get(&path).and_then(|s| s.hash.clone());
                if hash.is_some() && hash == previous {
                    trace!(path = %path.display(), "content unchanged, event dropped");
                    return None;
                }
                match self.known.get_mut(&path) {
                    Some(state) => state.hash = hash,
                    None => {
                        if let Some(state) = snapshot(&path) {
                            self.known.insert(path.clone(), FileState { hash, ..state });
                        }
                    }
                }
            }
        }
        Some(FileChange { path, kind })
    }
}

/// Files under `path`: the path itself if it is a file, its entries if it is
/// a directory (all descendants when `recursive`).
fn list_files(path: &Path, recursive: bool) -> Vec<PathBuf> {
    if path.is_file() {
        return vec![path.to_path_buf()];
    }
    if !path.is_dir() {
        return Vec::new();
    }
    let depth = if recursive { usize::MAX } else { 1 };
    WalkDir::new(path)
        .max_depth(depth)
        .follow_links(false)
        .into_iter()
        .flatten()
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect()
}

fn snapshot(path: &Path) -> Option<FileState> {
    let metadata = fs::metadata(path).ok()?;
    Some(FileState {
        modified: metadata.modified().ok(),
        len: metadata.len(),
        hash: None,
    })
}

/// SHA-256 of the file content, `None` if it cannot be read.
pub fn hash_file(path: &Path) -> Option<String> {
    fs::read(path)
        .ok()
        .map(|bytes| format!("{:x}", Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const WINDOW: Duration = Duration::from_millis(100);

    #[test]
    fn test_debouncer_waits_for_quiet_window() {
        let mut debouncer = Debouncer::new(WINDOW);
        let start = Instant::now();
        let path = PathBuf::from("/a");

        debouncer.push(path.clone(), ChangeKind::Modified, start);
        debouncer.push(path.clone(), ChangeKind::Modified, start + Duration::from_millis(80));
        assert!(debouncer.drain_ready(start + Duration::from_millis(150)).is_empty());

        let ready = debouncer.drain_ready(start + Duration::from_millis(180));
        assert_eq!(ready, vec![(path, ChangeKind::Modified)]);
        assert_eq!(debouncer.pending(), 0);
    }

    #[test]
    fn test_debouncer_merges_kinds() {
        let mut debouncer = Debouncer::new(Duration::ZERO);
        let now = Instant::now();
        debouncer.push("/new".into(), ChangeKind::Created, now);
        debouncer.push("/new".into(), ChangeKind::Modified, now);
        debouncer.push("/gone".into(), ChangeKind::Modified, now);
        debouncer.push("/gone".into(), ChangeKind::Removed, now);

        let ready = debouncer.drain_ready(now);
        assert_eq!(
            ready,
            vec![
                (PathBuf::from("/gone"), ChangeKind::Removed),
                (PathBuf::from("/new"), ChangeKind::Created),
            ]
        );
    }

    #[test]
    fn test_detects_modification_after_debounce() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("settings.json");
        fs::write(&file, "{}").unwrap();

        let mut watcher = FileWatcher::new(WINDOW);
        watcher.watch(&file, false).unwrap();
        assert!(watcher.poll_at(Instant::now()).is_empty());

        fs::write(&file, r#"{"permissions": {}}"#).unwrap();
        let t0 = Instant::now();
        assert!(watcher.poll_at(t0).is_empty());

        let changes = watcher.poll_at(t0 + Duration::from_millis(200));
        assert_eq!(
            changes,
            vec![FileChange {
                path: file.clone(),
                kind: ChangeKind::Modified
            }]
        );
    }

    #[test]
    fn test_unchanged_content_is_dropped() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("settings.json");
        fs::write(&file, "{}").unwrap();

        let mut watcher = FileWatcher::new(Duration::ZERO);
        watcher.watch(&file, false).unwrap();

        let now = Instant::now();
        watcher.record_event(&file, ChangeKind::Modified, now);
        assert!(watcher.poll_at(now).is_empty());
    }

    #[test]
    fn test_create_and_remove_in_directory() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("conf");
        fs::create_dir_all(dir.join("nested")).unwrap();

        let mut watcher = FileWatcher::new(Duration::ZERO);
        watcher.watch(&dir, true).unwrap();

        let nested = dir.join("nested").join("a.json");
        fs::write(&nested, "{}").unwrap();
        let changes = watcher.poll_at(Instant::now());
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Created);
        assert_eq!(changes[0].path, nested);

        fs::remove_file(&nested).unwrap();
        let changes = watcher.poll_at(Instant::now());
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Removed);
    }

    #[test]
    fn test_non_recursive_ignores_nested_files() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("nested")).unwrap();

        let mut watcher = FileWatcher::new(Duration::ZERO);
        watcher.watch(temp.path(), false).unwrap();
        fs::write(temp.path().join("nested").join("a.json"), "{}").unwrap();
        assert!(watcher.poll_at(Instant::now()).is_empty());

        fs::write(temp.path().join("top.json"), "{}").unwrap();
        assert_eq!(watcher.poll_at(Instant::now()).len(), 1);
    }

    #[test]
    fn test_missing_path_watched_for_creation() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("later.json");

        let mut watcher = FileWatcher::new(Duration::ZERO);
        watcher.watch(&file, false).unwrap();
        assert!(watcher.poll_at(Instant::now()).is_empty());

        fs::write(&file, "{}").unwrap();
        let changes = watcher.poll_at(Instant::now());
        assert_eq!(changes[0].kind, ChangeKind::Created);
    }

    #[test]
    fn test_unwatch() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("a.json");
        fs::write(&file, "{}").unwrap();

        let mut watcher = FileWatcher::new(Duration::ZERO);
        watcher.watch(&file, false).unwrap();
        assert!(watcher.unwatch(&file));
        fs::write(&file, "{\"changed\": true}").unwrap();
        assert!(watcher.poll_at(Instant::now()).is_empty());
        assert!(watcher.watched().is_empty());
    }
}
