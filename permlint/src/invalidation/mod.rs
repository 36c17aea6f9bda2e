//! Dependency-driven cache invalidation.

pub mod graph;
pub mod manager;
pub mod watcher;

pub use graph::DependencyGraph;
pub use manager::{InvalidationEvent, InvalidationHandle, InvalidationManager, InvalidationRequest};
pub use watcher::{ChangeKind, Debouncer, FileChange, FileWatcher};
