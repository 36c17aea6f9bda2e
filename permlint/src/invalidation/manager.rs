//! Coordinates dependency tracking, file watching and cache invalidation.
//!
//! Two paths lead to invalidation:
//!
//! - **File changes** are applied as soon as the watcher confirms them: every
//!   node that transitively depends on the changed path is invalidated.
//! - **Explicit requests** (`invalidate_tags`, `invalidate_pattern`,
//!   `invalidate_key`) are queued and applied together on [`flush`], which the
//!   background timer calls every flush interval.
//!
//! Dependency nodes containing `*` are key patterns (`config:*`); every other
//! node is an exact cache key. Exact keys are forgotten once they leave the
//! cache, so the graph only holds keys that can still be invalidated.
//!
//! A change to a file also reaches everything that depends on a directory
//! containing it.
//!
//! [`flush`]: InvalidationManager::flush

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{Level, debug, info, instrument, warn};

use super::graph::DependencyGraph;
use super::watcher::{ChangeKind, FileChange, FileWatcher};
use crate::cache::CacheInvalidator;
use crate::error::{PermlintError, Result};
use crate::events::Subscribers;
use crate::settings::InvalidationSettings;

/// A queued invalidation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationRequest {
    Key(String),
    Tags(Vec<String>),
    Pattern(String),
}

/// Events published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationEvent {
    /// A watched file changed and its dependents were invalidated.
    FileChanged {
        path: PathBuf,
        kind: ChangeKind,
        affected: Vec<String>,
        removed: usize,
    },
    /// Queued requests were applied.
    Flushed { requests: usize, removed: usize },
    /// Expired entries were purged.
    Expired { count: usize },
}

/// Stops and joins the timer thread when dropped.
pub struct InvalidationHandle {
    stop: Option<Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl InvalidationHandle {
    /// Stops the timer and waits for it to finish its current tick.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for InvalidationHandle {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

pub struct InvalidationManager {
    settings: InvalidationSettings,
    cache: Arc<dyn CacheInvalidator>,
    graph: Mutex<DependencyGraph>,
    watcher: Mutex<FileWatcher>,
    queue: Mutex<Vec<InvalidationRequest>>,
    subscribers: Subscribers<InvalidationEvent>,
}

impl fmt::Debug for InvalidationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationManager")
            .field("settings", &self.settings)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl InvalidationManager {
    pub fn new(cache: Arc<dyn CacheInvalidator>, settings: InvalidationSettings) -> Self {
        Self {
            watcher: Mutex::new(FileWatcher::new(settings.debounce())),
            settings,
            cache,
            graph: Mutex::new(DependencyGraph::new()),
            queue: Mutex::new(Vec::new()),
            subscribers: Subscribers::new(),
        }
    }

    pub fn settings(&self) -> &InvalidationSettings {
        &self.settings
    }

    /// Records that `dependent` (a key or key pattern) depends on `resource`.
    pub fn add_dependency(&self, dependent: &str, resource: &str) {
        if self.lock_graph().add_dependency(dependent, resource) {
            debug!(dependent, resource, "dependency added");
        }
    }

    /// Makes `key` depend on `path` and starts watching the path.
    #[instrument(level = Level::TRACE, skip(self))]
    pub fn track_file(&self, key: &str, path: &Path) -> Result<()> {
        self.add_dependency(key, &resource_name(path));
        self.watch(path)
    }

    /// Like [`track_file`](Self::track_file), but `key` replaces every
    /// exact key tracked for `path` so far. Used when the file's content
    /// changed and earlier keys describe content it no longer has.
    #[instrument(level = Level::TRACE, skip(self))]
    pub fn track_latest(&self, key: &str, path: &Path) -> Result<()> {
        let resource = resource_name(path);
        {
            let mut graph = self.lock_graph();
            for previous in graph.dependents_of(&resource) {
                if previous != key && !is_pattern(&previous) {
                    graph.remove_dependency(&previous, &resource);
                }
            }
            if graph.add_dependency(key, &resource) {
                debug!(dependent = key, resource = %resource, "dependency added");
            }
        }
        self.watch(path)
    }

    /// Forgets every dependency of `dependent`.
    pub fn remove_dependent(&self, dependent: &str) {
        self.lock_graph().remove_dependent(dependent);
    }

    pub fn dependents_of(&self, resource: &str) -> Vec<String> {
        self.lock_graph().dependents_of(resource)
    }

    /// Everything that transitively depends on `resource`.
    pub fn affected_by(&self, resource: &str) -> Vec<String> {
        self.lock_graph().affected_by(resource)
    }

    /// Watches a file or directory (recursively if configured).
    pub fn watch(&self, path: &Path) -> Result<()> {
        self.lock_watcher().watch(path, self.settings.recursive)
    }

    pub fn unwatch(&self, path: &Path) -> bool {
        self.lock_watcher().unwatch(path)
    }

    pub fn watched(&self) -> Vec<PathBuf> {
        self.lock_watcher().watched()
    }

    /// Feeds an event from an external notification source into the debouncer.
    pub fn record_event(&self, path: impl Into<PathBuf>, kind: ChangeKind) {
        self.lock_watcher().record_event(path, kind, Instant::now());
    }

    /// Queues invalidation of one key.
    pub fn invalidate_key(&self, key: impl Into<String>) -> usize {
        self.enqueue(InvalidationRequest::Key(key.into()))
    }

    /// Queues invalidation of every entry carrying any of `tags`.
    pub fn invalidate_tags<I, S>(&self, tags: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enqueue(InvalidationRequest::Tags(
            tags.into_iter().map(Into::into).collect(),
        ))
    }

    /// Queues invalidation of every key matching a `*` pattern.
    pub fn invalidate_pattern(&self, pattern: impl Into<String>) -> usize {
        self.enqueue(InvalidationRequest::Pattern(pattern.into()))
    }

    fn enqueue(&self, request: InvalidationRequest) -> usize {
        let mut queue = self.lock_queue();
        if !queue.contains(&request) {
            queue.push(request);
        }
        queue.len()
    }

    /// Number of queued requests.
    pub fn pending(&self) -> usize {
        self.lock_queue().len()
    }

    /// Applies every queued request. Returns the number of entries removed.
    #[instrument(level = Level::TRACE, skip(self))]
    pub fn flush(&self) -> usize {
        let requests: Vec<InvalidationRequest> = std::mem::take(&mut *self.lock_queue());
        if requests.is_empty() {
            return 0;
        }

        let removed: usize = requests
            .iter()
            .map(|request| match request {
                InvalidationRequest::Key(key) => usize::from(self.cache.invalidate_key(key)),
                InvalidationRequest::Tags(tags) => self.cache.invalidate_tags(tags),
                InvalidationRequest::Pattern(pattern) => self.cache.invalidate_pattern(pattern),
            })
            .sum();
        let pruned = self.prune_dependents();

        debug!(requests = requests.len(), removed, pruned, "invalidation queue flushed");
        self.subscribers.publish(InvalidationEvent::Flushed {
            requests: requests.len(),
            removed,
        });
        removed
    }

    /// Invalidates everything that depends on the changed path. Returns the
    /// number of cache entries removed.
    #[instrument(level = Level::TRACE, skip(self), fields(path = %change.path.display()))]
    pub fn handle_change(&self, change: &FileChange) -> usize {
        let affected = {
            let graph = self.lock_graph();
            let resources: Vec<String> = change
                .path
                .ancestors()
                .map(resource_name)
                .filter(|resource| graph.has_dependents(resource))
                .collect();
            graph.affected_by_any(resources.iter().map(String::as_str))
        };

        let removed: usize = affected
            .iter()
            .map(|node| {
                if is_pattern(node) {
                    self.cache.invalidate_pattern(node)
                } else {
                    usize::from(self.cache.invalidate_key(node))
                }
            })
            .sum();

        {
            let mut graph = self.lock_graph();
            for node in affected.iter().filter(|node| !is_pattern(node)) {
                graph.remove_dependent(node);
            }
        }

        info!(
            path = %change.path.display(),
            kind = %change.kind,
            affected = affected.len(),
            removed,
            "file change invalidated dependents"
        );
        self.subscribers.publish(InvalidationEvent::FileChanged {
            path: change.path.clone(),
            kind: change.kind,
            affected,
            removed,
        });
        removed
    }

    pub fn poll(&self) -> Vec<FileChange> {
        self.poll_at(Instant::now())
    }

    /// Polls the watcher and handles every confirmed change.
    pub fn poll_at(&self, now: Instant) -> Vec<FileChange> {
        let changes = self.lock_watcher().poll_at(now);
        for change in &changes {
            self.handle_change(change);
        }
        changes
    }

    /// Drops expired cache entries.
    pub fn purge_expired(&self) -> usize {
        let count = self.cache.purge_expired();
        if count > 0 {
            self.prune_dependents();
            self.subscribers.publish(InvalidationEvent::Expired { count });
        }
        count
    }

    /// Forgets exact keys that are no longer cached. Returns how many.
    fn prune_dependents(&self) -> usize {
        let mut graph = self.lock_graph();
        let stale: Vec<String> = graph
            .dependents()
            .into_iter()
            .filter(|node| !is_pattern(node) && !self.cache.contains_key(node))
            .collect();
        for node in &stale {
            graph.remove_dependent(node);
        }
        stale.len()
    }

    /// Number of dependency edges currently recorded.
    pub fn edge_count(&self) -> usize {
        self.lock_graph().edge_count()
    }

    pub fn subscribe(&self) -> Receiver<InvalidationEvent> {
        self.subscribers.subscribe()
    }

    /// Starts the timer thread: polls the watcher every poll interval, and
    /// flushes the queue and purges expired entries every flush interval.
    ///
    /// The timer only batches work; everything it does can also be driven by
    /// calling [`poll`](Self::poll) and [`flush`](Self::flush) directly.
    pub fn start(self: &Arc<Self>) -> Result<InvalidationHandle> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let weak: Weak<Self> = Arc::downgrade(self);
        let poll_interval = self.settings.poll_interval().max(Duration::from_millis(10));
        let flush_interval = self.settings.flush_interval().max(Duration::from_millis(10));
        let tick = poll_interval.min(flush_interval);

        let thread = thread::Builder::new()
            .name("permlint-invalidation".into())
            .spawn(move || {
                let mut last_poll = Instant::now();
                let mut last_flush = Instant::now();
                loop {
                    match stop_rx.recv_timeout(tick) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let Some(manager) = weak.upgrade() else {
                        break;
                    };
                    let now = Instant::now();
                    if now.duration_since(last_poll) >= poll_interval {
                        manager.poll_at(now);
                        last_poll = now;
                    }
                    if now.duration_since(last_flush) >= flush_interval {
                        manager.flush();
                        manager.purge_expired();
                        last_flush = now;
                    }
                }
            })
            .map_err(|source| PermlintError::SpawnError {
                name: "invalidation timer",
                source,
            })?;

        info!(
            poll_ms = poll_interval.as_millis() as u64,
            flush_ms = flush_interval.as_millis() as u64,
            "invalidation timer started"
        );
        Ok(InvalidationHandle {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Applies pending requests; used before shutdown so queued work is not
    /// lost.
    pub fn shutdown(&self) {
        let removed = self.flush();
        if removed > 0 {
            debug!(removed, "flushed pending invalidations on shutdown");
        }
    }

    fn lock_graph(&self) -> MutexGuard<'_, DependencyGraph> {
        self.graph.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_watcher(&self) -> MutexGuard<'_, FileWatcher> {
        self.watcher.lock().unwrap_or_else(|e| {
            warn!("watcher lock poisoned, recovering");
            e.into_inner()
        })
    }

    fn lock_queue(&self) -> MutexGuard<'_, Vec<InvalidationRequest>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn is_pattern(node: &str) -> bool {
    node.contains('*')
}

/// Graph node for a path: its components joined again, so `conf/` and
/// `conf` name the same resource.
fn resource_name(path: &Path) -> String {
    path.components()
        .collect::<PathBuf>()
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheManager, SetOptions};
    use crate::settings::CacheSettings;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (Arc<CacheManager<String>>, InvalidationManager) {
        let cache = Arc::new(CacheManager::new(CacheSettings::default()).unwrap());
        let settings = InvalidationSettings {
            debounce_ms: 0,
            ..InvalidationSettings::default()
        };
        let manager = InvalidationManager::new(cache.clone(), settings);
        (cache, manager)
    }

    #[test]
    fn test_explicit_requests_wait_for_flush() {
        let (cache, manager) = setup();
        cache.set("a", "1".into(), SetOptions::new().tag("t1"));
        cache.set("b", "2".into(), SetOptions::new().tag("t2"));
        let events = manager.subscribe();

        assert_eq!(manager.invalidate_tags(["t1"]), 1);
        assert_eq!(manager.invalidate_tags(["t1"]), 1);
        assert!(cache.contains("a"));

        assert_eq!(manager.flush(), 1);
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert_eq!(manager.pending(), 0);
        assert_eq!(
            events.try_recv().unwrap(),
            InvalidationEvent::Flushed {
                requests: 1,
                removed: 1
            }
        );
    }

    #[test]
    fn test_file_change_invalidates_transitive_dependents() {
        let (cache, manager) = setup();
        cache.set("config:main", "1".into(), SetOptions::new());
        cache.set("config:extra", "2".into(), SetOptions::new());
        cache.set("validation:1", "3".into(), SetOptions::new());
        cache.set("unrelated", "4".into(), SetOptions::new());

        manager.add_dependency("config:*", "/etc/settings.json");
        manager.add_dependency("validation:1", "config:*");

        let removed = manager.handle_change(&FileChange {
            path: PathBuf::from("/etc/settings.json"),
            kind: ChangeKind::Modified,
        });
        assert_eq!(removed, 3);
        assert!(cache.contains("unrelated"));
    }

    #[test]
    fn test_watched_file_change_flows_to_cache() {
        let (cache, manager) = setup();
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("settings.json");
        fs::write(&file, "{}").unwrap();

        cache.set("key", "value".into(), SetOptions::new());
        cache.set("other", "value".into(), SetOptions::new());
        manager.track_file("key", &file).unwrap();
        let events = manager.subscribe();

        fs::write(&file, r#"{"permissions": {"deny": ["exec"]}}"#).unwrap();
        let changes = manager.poll();
        assert_eq!(changes.len(), 1);
        assert!(!cache.contains("key"));
        assert!(cache.contains("other"));

        match events.try_recv().unwrap() {
            InvalidationEvent::FileChanged { affected, removed, .. } => {
                assert_eq!(affected, vec!["key".to_string()]);
                assert_eq!(removed, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_change_inside_watched_directory_reaches_its_dependents() {
        let (cache, manager) = setup();
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("conf");
        fs::create_dir(&dir).unwrap();
        let file = dir.join("a.json");
        fs::write(&file, "{}").unwrap();

        cache.set("dir-key", "value".into(), SetOptions::new());
        cache.set("other", "value".into(), SetOptions::new());
        manager.track_file("dir-key", &dir).unwrap();

        fs::write(&file, r#"{"permissions": {"allow": ["Read"]}}"#).unwrap();
        let changes = manager.poll();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, file);
        assert!(!cache.contains("dir-key"));
        assert!(cache.contains("other"));
    }

    #[test]
    fn test_directory_dependency_ignores_trailing_separator() {
        let (cache, manager) = setup();
        let temp = TempDir::new().unwrap();
        cache.set("key", "value".into(), SetOptions::new());
        let with_separator = PathBuf::from(format!("{}/", temp.path().display()));
        manager.track_file("key", &with_separator).unwrap();

        let removed = manager.handle_change(&FileChange {
            path: temp.path().join("nested").join("settings.json"),
            kind: ChangeKind::Created,
        });
        assert_eq!(removed, 1);
    }

    #[test]
    fn test_invalidated_keys_leave_the_graph() {
        let (cache, manager) = setup();
        cache.set("key", "value".into(), SetOptions::new());
        manager.add_dependency("config:*", "/etc/settings.json");
        manager.add_dependency("key", "/etc/settings.json");

        manager.handle_change(&FileChange {
            path: PathBuf::from("/etc/settings.json"),
            kind: ChangeKind::Modified,
        });
        assert_eq!(manager.dependents_of("/etc/settings.json"), vec!["config:*"]);
    }

    #[test]
    fn test_track_latest_replaces_earlier_keys() {
        let (cache, manager) = setup();
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("settings.json");
        fs::write(&file, "{}").unwrap();
        manager.add_dependency("config:*", &file.to_string_lossy());

        for i in 0..50 {
            let key = format!("key-{i}");
            cache.set(&key, "value".into(), SetOptions::new());
            manager.track_latest(&key, &file).unwrap();
        }
        assert_eq!(
            manager.dependents_of(&file.to_string_lossy()),
            vec!["config:*", "key-49"]
        );
        assert_eq!(manager.edge_count(), 2);
    }

    #[test]
    fn test_flush_forgets_keys_removed_by_tag() {
        let (cache, manager) = setup();
        cache.set("a", "1".into(), SetOptions::new().tag("t"));
        cache.set("b", "2".into(), SetOptions::new());
        manager.add_dependency("a", "/a.json");
        manager.add_dependency("b", "/b.json");

        manager.invalidate_tags(["t"]);
        assert_eq!(manager.flush(), 1);
        assert!(manager.dependents_of("/a.json").is_empty());
        assert_eq!(manager.dependents_of("/b.json"), vec!["b"]);
    }

    #[test]
    fn test_timer_flushes_queue() {
        let cache = Arc::new(CacheManager::<String>::new(CacheSettings::default()).unwrap());
        let manager = Arc::new(InvalidationManager::new(
            cache.clone(),
            InvalidationSettings {
                flush_interval_ms: 20,
                poll_interval_ms: 20,
                ..InvalidationSettings::default()
            },
        ));
        cache.set("a", "1".into(), SetOptions::new().tag("t"));
        manager.invalidate_tags(["t"]);

        let handle = manager.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.pending() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        handle.stop();

        assert_eq!(manager.pending(), 0);
        assert!(!cache.contains("a"));
    }

    #[test]
    fn test_remove_dependent() {
        let (_cache, manager) = setup();
        manager.add_dependency("key", "/a");
        manager.remove_dependent("key");
        assert!(manager.dependents_of("/a").is_empty());
    }
}
