//! In-memory directory tree: construction, serialization and diff (spec §4.1).

pub mod node;
pub mod watched;

pub use node::{DiffSets, FileNode, Mtime, NodeKind};
pub use watched::{FsEvent, RenameOutcome, WatchedTree};

// vim: ts=4
