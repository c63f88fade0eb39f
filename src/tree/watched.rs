//! `WatchedTree`: the live, OS-watched mirror of a directory (spec §4.2, §9).
//!
//! The original pairs each directory with a raw inotify watch descriptor and
//! a process-wide `wd -> node` map so a bare kernel event can be routed back
//! to its node in O(1). `notify` doesn't expose a descriptor that means
//! anything across its backends (inotify/FSEvents/ReadDirectoryChangesW), so
//! here the canonicalized directory path itself is the "handle" -- it is
//! still the thing a raw event arrives annotated with, and it is still
//! unique per live directory.
//!
//! Nodes live in an arena (`Vec<Option<Slot>>`) rather than owning each other
//! directly: a move re-parents a subtree by rewriting indices, which a
//! `Box`/`Rc` tree cannot do without either cloning or interior mutability
//! everywhere. This mirrors the arena note in the source design (§9).

use crate::error::SyncError;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::node::is_hidden;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

struct Slot {
	parent: Option<NodeId>,
	name: String,
	full_path: PathBuf,
	is_dir: bool,
	children: BTreeMap<String, NodeId>,
}

/// A filesystem change translated out of the raw `notify::Event` stream and
/// already resolved against the arena (spec §4.2's four event kinds, plus
/// the paired rename the original gets from matching MOVED_FROM/MOVED_TO on
/// cookie).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
	Created { path: PathBuf, is_dir: bool },
	Written { path: PathBuf },
	Removed { path: PathBuf },
	Renamed { from: PathBuf, to: PathBuf },
}

/// A MOVED_FROM half waiting for its MOVED_TO pair (spec §9). Expires after
/// `PENDING_MOVE_TTL` and is reported as a plain removal, matching the
/// original's handling of a move whose destination is outside the watched
/// tree.
struct PendingMoveFrom {
	path: PathBuf,
	at: Instant,
}

const PENDING_MOVE_TTL: Duration = Duration::from_secs(5);

/// Result of [`WatchedTree::apply_rename`]: either the subtree was really
/// re-parented, or the source wasn't known and it was linked in as a fresh
/// creation instead (spec §4.5).
#[derive(Debug)]
pub enum RenameOutcome {
	Moved,
	TreatedAsCreate(Vec<(PathBuf, bool)>),
}

pub struct WatchedTree {
	root: PathBuf,
	arena: Vec<Option<Slot>>,
	root_id: NodeId,
	handle_to_node: HashMap<PathBuf, NodeId>,
	watcher: RecommendedWatcher,
	raw_events: mpsc::UnboundedReceiver<notify::Result<Event>>,
	pending_moves: HashMap<usize, PendingMoveFrom>,
	/// Paths whose very next raw event should be swallowed rather than
	/// reported, because the change was applied by this process itself in
	/// response to a remote command (spec §4.2's feedback-loop guard).
	filtered: HashSet<PathBuf>,
}

impl WatchedTree {
	/// Walk `root` from disk, registering a non-recursive watch on every
	/// directory as it is linked into the arena -- watch registration and
	/// arena linkage happen in the same synchronous call, satisfying the
	/// invariant that the handle map is never observed out of sync with the
	/// tree (spec §4.2 invariant 3).
	pub fn new(root: PathBuf) -> Result<WatchedTree, SyncError> {
		let root = std::fs::canonicalize(&root)?;
		let (tx, rx) = mpsc::unbounded_channel();
		let watcher = RecommendedWatcher::new(
			move |res| {
				// Runs on notify's own backend thread; an unbounded sender
				// never blocks it.
				let _ = tx.send(res);
			},
			notify::Config::default(),
		)
		.map_err(|e| SyncError::InvariantBreach { message: format!("failed to start watcher: {}", e) })?;

		let mut tree = WatchedTree {
			root: root.clone(),
			arena: Vec::new(),
			root_id: NodeId(0),
			handle_to_node: HashMap::new(),
			watcher,
			raw_events: rx,
			pending_moves: HashMap::new(),
			filtered: HashSet::new(),
		};
		let root_id = tree.scan_into(root.clone(), None, String::new())?;
		tree.root_id = root_id;
		Ok(tree)
	}

	fn alloc(&mut self, slot: Slot) -> NodeId {
		let id = NodeId(self.arena.len());
		self.arena.push(Some(slot));
		id
	}

	fn slot(&self, id: NodeId) -> &Slot {
		self.arena[id.0].as_ref().expect("dangling NodeId")
	}

	fn slot_mut(&mut self, id: NodeId) -> &mut Slot {
		self.arena[id.0].as_mut().expect("dangling NodeId")
	}

	pub fn full_path(&self, id: NodeId) -> &Path {
		&self.slot(id).full_path
	}

	pub fn is_dir(&self, id: NodeId) -> bool {
		self.slot(id).is_dir
	}

	pub fn root_id(&self) -> NodeId {
		self.root_id
	}

	fn scan_into(&mut self, path: PathBuf, parent: Option<NodeId>, name: String) -> Result<NodeId, SyncError> {
		let meta = std::fs::symlink_metadata(&path)?;
		let is_dir = meta.is_dir();
		let id = self.alloc(Slot {
			parent,
			name,
			full_path: path.clone(),
			is_dir,
			children: BTreeMap::new(),
		});
		if is_dir {
			self.watcher
				.watch(&path, RecursiveMode::NonRecursive)
				.map_err(|e| SyncError::InvariantBreach { message: format!("watch {}: {}", path.display(), e) })?;
			self.handle_to_node.insert(path.clone(), id);

			let mut entries: Vec<_> = std::fs::read_dir(&path)?.collect::<Result<_, _>>()?;
			entries.sort_by_key(|e| e.file_name());
			for entry in entries {
				let entry_path = entry.path();
				if is_hidden(&entry_path) {
					continue;
				}
				let entry_meta = std::fs::symlink_metadata(&entry_path)?;
				if !entry_meta.is_dir() && !entry_meta.is_file() {
					continue;
				}
				let child_name = entry.file_name().to_string_lossy().into_owned();
				let child_id = self.scan_into(entry_path, Some(id), child_name.clone())?;
				self.slot_mut(id).children.insert(child_name, child_id);
			}
		}
		Ok(id)
	}

	fn node_for_path(&self, path: &Path) -> Option<NodeId> {
		let rel = path.strip_prefix(&self.root).ok()?;
		let mut current = self.root_id;
		for component in super::node::components(rel) {
			current = *self.slot(current).children.get(&component)?;
		}
		Some(current)
	}

	fn parent_dir_of(&self, path: &Path) -> Option<NodeId> {
		let parent_path = path.parent()?;
		self.handle_to_node.get(parent_path).copied().or_else(|| self.node_for_path(parent_path))
	}

	/// Register a path change applied locally (e.g. writing a downloaded
	/// file) so the watcher's own notification of it is dropped instead of
	/// re-entering the sync engine as if a user had made it.
	pub fn filter_next_event_for(&mut self, path: PathBuf) {
		self.filtered.insert(path);
	}

	fn take_filtered(&mut self, path: &Path) -> bool {
		self.filtered.remove(path)
	}

	/// Link a freshly created node into the arena and, if it's a directory,
	/// watch it -- called after the engine has applied a `Created` event to
	/// disk state, so later events under a new directory resolve correctly.
	pub fn link_created(&mut self, path: &Path, is_dir: bool) -> Result<(), SyncError> {
		let parent = self.parent_dir_of(path).ok_or_else(|| SyncError::InvariantBreach {
			message: format!("created path has no known parent: {}", path.display()),
		})?;
		let name = path
			.file_name()
			.ok_or_else(|| SyncError::InvariantBreach { message: "created path has no file name".to_string() })?
			.to_string_lossy()
			.into_owned();
		if self.slot(parent).children.contains_key(&name) {
			return Ok(());
		}
		let id = self.alloc(Slot {
			parent: Some(parent),
			name: name.clone(),
			full_path: path.to_path_buf(),
			is_dir,
			children: BTreeMap::new(),
		});
		if is_dir {
			self.watcher
				.watch(path, RecursiveMode::NonRecursive)
				.map_err(|e| SyncError::InvariantBreach { message: format!("watch {}: {}", path.display(), e) })?;
			self.handle_to_node.insert(path.to_path_buf(), id);
		}
		self.slot_mut(parent).children.insert(name, id);
		Ok(())
	}

	/// Link a freshly created directory and everything already inside it --
	/// needed when a subtree arrives atomically (a directory moved in from
	/// outside the watched tree shows up to `notify` as one `Create` event on
	/// the top directory, with no separate event for the files it already
	/// contains). Returns every descendant found, directories before the
	/// files within them, so the caller can `mkdir`-announce each directory
	/// and `POST`-and-stream each file (spec §4.5's fresh-creation fallback).
	/// The top directory itself (`path`) is not included; the caller already
	/// knows about it from the triggering event.
	pub fn link_created_subtree(&mut self, path: &Path, is_dir: bool) -> Result<Vec<(PathBuf, bool)>, SyncError> {
		if !is_dir {
			self.link_created(path, false)?;
			return Ok(Vec::new());
		}
		let parent = self.parent_dir_of(path).ok_or_else(|| SyncError::InvariantBreach {
			message: format!("created path has no known parent: {}", path.display()),
		})?;
		let name = path
			.file_name()
			.ok_or_else(|| SyncError::InvariantBreach { message: "created path has no file name".to_string() })?
			.to_string_lossy()
			.into_owned();
		if self.slot(parent).children.contains_key(&name) {
			return Ok(Vec::new());
		}
		let id = self.scan_into(path.to_path_buf(), Some(parent), name.clone())?;
		self.slot_mut(parent).children.insert(name, id);
		let mut descendants = Vec::new();
		self.collect_descendants(id, &mut descendants);
		Ok(descendants)
	}

	fn collect_descendants(&self, id: NodeId, out: &mut Vec<(PathBuf, bool)>) {
		let slot = self.slot(id);
		if !slot.is_dir {
			return;
		}
		for child in slot.children.values() {
			let child_slot = self.slot(*child);
			out.push((child_slot.full_path.clone(), child_slot.is_dir));
			self.collect_descendants(*child, out);
		}
	}

	/// Unlink a node (and, depth-first, its whole subtree) and stop watching
	/// any directories within it.
	pub fn unlink_removed(&mut self, path: &Path) {
		let Some(id) = self.node_for_path(path) else {
			warn!(path = %path.display(), "unlink: no known node, skipping");
			return;
		};
		if let Some(parent) = self.slot(id).parent {
			let name = self.slot(id).name.clone();
			self.slot_mut(parent).children.remove(&name);
		}
		self.unwatch_subtree(id);
	}

	fn unwatch_subtree(&mut self, id: NodeId) {
		let (is_dir, full_path, child_ids): (bool, PathBuf, Vec<NodeId>) = {
			let slot = self.slot(id);
			(slot.is_dir, slot.full_path.clone(), slot.children.values().copied().collect())
		};
		for child in child_ids {
			self.unwatch_subtree(child);
		}
		if is_dir {
			let _ = self.watcher.unwatch(&full_path);
			self.handle_to_node.remove(&full_path);
		}
		self.arena[id.0] = None;
	}

	/// Re-parent a subtree under a new path, depth-first rewatching every
	/// directory it contains so `handle_to_node` and each `full_path` stay
	/// correct (spec §4.2 move handling). Any existing occupant of `to` is
	/// removed first, the same way the tree model's `move` replaces one.
	///
	/// If `from` isn't a node this tree already knows about -- the source was
	/// outside the watched tree, or a `RenameMode::Both` event raced a prior
	/// unlink -- there is nothing to re-parent, so this falls back to the
	/// same fresh-creation handling as an unmatched `MOVED_TO` (spec §4.5):
	/// the caller gets every descendant back and is expected to announce a
	/// `POST` for each rather than a `MOVE`.
	pub fn apply_rename(&mut self, from: &Path, to: &Path) -> Result<RenameOutcome, SyncError> {
		if self.node_for_path(to).is_some() {
			self.unlink_removed(to);
		}
		let Some(id) = self.node_for_path(from) else {
			warn!(path = %from.display(), "rename: source not known, treating as create");
			let is_dir = std::fs::symlink_metadata(to).map(|m| m.is_dir()).unwrap_or(false);
			let descendants = self.link_created_subtree(to, is_dir)?;
			return Ok(RenameOutcome::TreatedAsCreate(descendants));
		};
		if let Some(parent) = self.slot(id).parent {
			let name = self.slot(id).name.clone();
			self.slot_mut(parent).children.remove(&name);
		}
		let new_parent = self.parent_dir_of(to).ok_or_else(|| SyncError::InvariantBreach {
			message: format!("rename target has no known parent: {}", to.display()),
		})?;
		let new_name = to
			.file_name()
			.ok_or_else(|| SyncError::InvariantBreach { message: "rename target has no file name".to_string() })?
			.to_string_lossy()
			.into_owned();
		self.rewrite_paths(id, to.to_path_buf(), new_name.clone())?;
		self.slot_mut(id).parent = Some(new_parent);
		self.slot_mut(new_parent).children.insert(new_name, id);
		Ok(RenameOutcome::Moved)
	}

	fn rewrite_paths(&mut self, id: NodeId, new_full_path: PathBuf, new_name: String) -> Result<(), SyncError> {
		let (is_dir, old_full_path, child_names): (bool, PathBuf, Vec<String>) = {
			let slot = self.slot(id);
			(slot.is_dir, slot.full_path.clone(), slot.children.keys().cloned().collect())
		};
		if is_dir {
			let _ = self.watcher.unwatch(&old_full_path);
			self.handle_to_node.remove(&old_full_path);
			self.watcher
				.watch(&new_full_path, RecursiveMode::NonRecursive)
				.map_err(|e| SyncError::InvariantBreach { message: format!("rewatch {}: {}", new_full_path.display(), e) })?;
			self.handle_to_node.insert(new_full_path.clone(), id);
		}
		{
			let slot = self.slot_mut(id);
			slot.full_path = new_full_path.clone();
			slot.name = new_name;
		}
		for child_name in child_names {
			let child_id = self.slot(id).children[&child_name];
			self.rewrite_paths(child_id, new_full_path.join(&child_name), child_name)?;
		}
		Ok(())
	}

	/// Block on the next translated event, sweeping any pending moves that
	/// have aged out first. Returns `None` only if the watcher's channel has
	/// closed (backend thread died).
	pub async fn next_event(&mut self) -> Option<FsEvent> {
		loop {
			if let Some(expired) = self.sweep_expired_pending_move() {
				return Some(expired);
			}
			let sweep_at = self
				.pending_moves
				.values()
				.map(|p| p.at + PENDING_MOVE_TTL)
				.min();
			let raw = match sweep_at {
				Some(deadline) => {
					let now = Instant::now();
					let sleep = deadline.saturating_duration_since(now);
					tokio::select! {
						raw = self.raw_events.recv() => raw,
						_ = tokio::time::sleep(sleep) => continue,
					}
				}
				None => self.raw_events.recv().await,
			};
			let raw = raw?;
			let event = match raw {
				Ok(event) => event,
				Err(e) => {
					warn!(error = %e, "watcher error");
					continue;
				}
			};
			if let Some(translated) = self.translate(event) {
				return Some(translated);
			}
		}
	}

	fn sweep_expired_pending_move(&mut self) -> Option<FsEvent> {
		let now = Instant::now();
		let expired_key = self
			.pending_moves
			.iter()
			.find(|(_, p)| now.duration_since(p.at) >= PENDING_MOVE_TTL)
			.map(|(k, _)| *k)?;
		let pending = self.pending_moves.remove(&expired_key)?;
		debug!(path = %pending.path.display(), "pending move expired, treating as removal");
		Some(FsEvent::Removed { path: pending.path })
	}

	fn translate(&mut self, event: Event) -> Option<FsEvent> {
		match event.kind {
			EventKind::Create(_) => {
				let path = event.paths.into_iter().next()?;
				if is_hidden(&path) || self.take_filtered(&path) {
					return None;
				}
				let is_dir = std::fs::symlink_metadata(&path).map(|m| m.is_dir()).unwrap_or(false);
				Some(FsEvent::Created { path, is_dir })
			}
			EventKind::Remove(_) => {
				let path = event.paths.into_iter().next()?;
				if is_hidden(&path) || self.take_filtered(&path) {
					return None;
				}
				Some(FsEvent::Removed { path })
			}
			EventKind::Modify(ModifyKind::Data(_)) => {
				let path = event.paths.into_iter().next()?;
				if is_hidden(&path) || self.take_filtered(&path) {
					return None;
				}
				Some(FsEvent::Written { path })
			}
			EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
				let mut paths = event.paths.into_iter();
				let from = paths.next()?;
				let to = paths.next()?;
				if is_hidden(&from) && is_hidden(&to) {
					return None;
				}
				Some(FsEvent::Renamed { from, to })
			}
			EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
				let path = event.paths.into_iter().next()?;
				if is_hidden(&path) {
					return None;
				}
				if let Some(tracker) = event.attrs.tracker() {
					self.pending_moves.insert(tracker, PendingMoveFrom { path, at: Instant::now() });
				}
				None
			}
			EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
				let to = event.paths.into_iter().next()?;
				if let Some(tracker) = event.attrs.tracker() {
					if let Some(pending) = self.pending_moves.remove(&tracker) {
						return Some(FsEvent::Renamed { from: pending.path, to });
					}
				}
				if is_hidden(&to) || self.take_filtered(&to) {
					return None;
				}
				let is_dir = std::fs::symlink_metadata(&to).map(|m| m.is_dir()).unwrap_or(false);
				Some(FsEvent::Created { path: to, is_dir })
			}
			_ => None,
		}
	}
}


// vim: ts=4
