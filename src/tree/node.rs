//! `FileNode`: the tree model itself (spec §3, §4.1).

use crate::error::SyncError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, warn};

/// Seconds since the Unix epoch -- the only timestamp unit that crosses the
/// wire (spec §4.1's `mTime`, §3's `mtime`).
pub type Mtime = i64;

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
	/// Invariant (§3): `children` non-empty implies `is_dir`; encoded here
	/// by directories *being* the variant that owns a children map at all.
	Dir(BTreeMap<String, FileNode>),
	File,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileNode {
	pub kind: NodeKind,
	pub mtime: Mtime,
}

/// The four disjoint path sets a diff produces (spec §3, §4.1).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffSets {
	pub remote_adds: Vec<(PathBuf, bool)>,
	pub local_adds: Vec<(PathBuf, bool)>,
	pub newer_remote: Vec<(PathBuf, bool)>,
	pub newer_local: Vec<(PathBuf, bool)>,
}

/// Split a relative path into single path components, the same unit
/// `add`/`delete`/`diff` key their maps on. Never empty, never `.`/`..`
/// (spec §3's invariant on map keys) -- `Component::Normal` is the only
/// kind that can appear in a path built by this crate.
pub fn components(path: &Path) -> Vec<String> {
	path.components()
		.filter_map(|c| match c {
			Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
			_ => None,
		})
		.collect()
}

fn mtime_of(meta: &std::fs::Metadata) -> Mtime {
	meta.modified()
		.ok()
		.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
		.map(|d| d.as_secs() as Mtime)
		.unwrap_or(0)
}

pub fn now() -> Mtime {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as Mtime).unwrap_or(0)
}

/// A path is invisible to the sync engine if its own filename starts with
/// `.` or ends in `.downtemp` (spec §4.2, §6's "filenames starting with
/// `.`..."). This looks only at the final component, not every ancestor: an
/// absolute path routinely sits under a hidden directory the OS or a test
/// harness chose (e.g. `tempfile`'s `/tmp/.tmpXXXXXX/`), and that ancestor
/// has nothing to do with whether an entry *inside* the synced tree is
/// meant to be invisible to it.
pub fn is_hidden(path: &Path) -> bool {
	let Some(name) = path.file_name() else { return false };
	let name = name.to_string_lossy();
	name.starts_with('.') || name.ends_with(".downtemp")
}

impl FileNode {
	pub fn new_dir(mtime: Mtime) -> FileNode {
		FileNode { kind: NodeKind::Dir(BTreeMap::new()), mtime }
	}

	pub fn new_file(mtime: Mtime) -> FileNode {
		FileNode { kind: NodeKind::File, mtime }
	}

	pub fn is_dir(&self) -> bool {
		matches!(self.kind, NodeKind::Dir(_))
	}

	pub fn children(&self) -> Option<&BTreeMap<String, FileNode>> {
		match &self.kind {
			NodeKind::Dir(children) => Some(children),
			NodeKind::File => None,
		}
	}

	fn children_mut(&mut self) -> Option<&mut BTreeMap<String, FileNode>> {
		match &mut self.kind {
			NodeKind::Dir(children) => Some(children),
			NodeKind::File => None,
		}
	}

	/// Recursively read a real directory (spec §4.1 `scan`). Anything that
	/// isn't a regular file or a directory (symlinks, sockets, ...) is
	/// rejected per the Non-goals; `.`-prefixed and `.downtemp` entries are
	/// invisible to the engine and skipped here too.
	pub fn scan(path: &Path) -> Result<FileNode, SyncError> {
		let meta = std::fs::symlink_metadata(path)?;
		if meta.is_dir() {
			let mut children = BTreeMap::new();
			for entry in std::fs::read_dir(path)? {
				let entry = entry?;
				let entry_path = entry.path();
				if is_hidden(&entry_path) {
					continue;
				}
				let entry_meta = std::fs::symlink_metadata(&entry_path)?;
				if !entry_meta.is_dir() && !entry_meta.is_file() {
					warn!(path = %entry_path.display(), "skipping non-regular, non-directory entry");
					continue;
				}
				let name = entry.file_name().to_string_lossy().into_owned();
				children.insert(name, FileNode::scan(&entry_path)?);
			}
			Ok(FileNode { kind: NodeKind::Dir(children), mtime: mtime_of(&meta) })
		} else if meta.is_file() {
			Ok(FileNode { kind: NodeKind::File, mtime: mtime_of(&meta) })
		} else {
			Err(SyncError::InvariantBreach {
				message: format!("{} is neither a file nor a directory", path.display()),
			})
		}
	}

	/// Reconstruct exactly the tree a previous `serialize()` produced
	/// (spec §4.1, testable property §8.1).
	pub fn from_snapshot(value: &Value) -> Result<FileNode, SyncError> {
		let bad = |msg: &str| SyncError::Protocol(format!("malformed tree snapshot: {}", msg));
		let is_dir = value.get("is_dir").and_then(Value::as_bool).ok_or_else(|| bad("is_dir"))?;
		let mtime = value.get("mtime").and_then(Value::as_i64).ok_or_else(|| bad("mtime"))?;
		let children_value = value.get("children").ok_or_else(|| bad("children"))?;
		let size =
			children_value.get("size").and_then(Value::as_u64).ok_or_else(|| bad("children.size"))?;

		let mut children = BTreeMap::new();
		for i in 0..size {
			let name = children_value
				.get(format!("name{}", i))
				.and_then(Value::as_str)
				.ok_or_else(|| bad("children.nameN"))?
				.to_string();
			let child_value =
				children_value.get(i.to_string()).ok_or_else(|| bad("children.N"))?;
			children.insert(name, FileNode::from_snapshot(child_value)?);
		}

		let kind = if is_dir { NodeKind::Dir(children) } else { NodeKind::File };
		Ok(FileNode { kind, mtime })
	}

	/// Serialize to the snapshot shape spec §4.1 mandates: child order is
	/// irrelevant on the wire because the receiver re-sorts by inserting
	/// into a `BTreeMap`.
	pub fn serialize(&self) -> Value {
		let empty = BTreeMap::new();
		let children = self.children().unwrap_or(&empty);
		let mut children_value = serde_json::Map::new();
		children_value.insert("size".to_string(), Value::from(children.len()));
		for (i, (name, child)) in children.iter().enumerate() {
			children_value.insert(format!("name{}", i), Value::from(name.clone()));
			children_value.insert(i.to_string(), child.serialize());
		}
		serde_json::json!({
			"is_dir": self.is_dir(),
			"mtime": self.mtime,
			"children": children_value,
		})
	}

	/// Create any missing intermediate directories (with `mtime`), then
	/// place a leaf at the tail component, replacing it if it exists
	/// (spec §4.1 `add`).
	pub fn add(&mut self, path: &[String], is_dir: bool, mtime: Mtime) -> Result<(), SyncError> {
		let Some((leaf, parents)) = path.split_last() else {
			return Err(SyncError::InvariantBreach { message: "add: empty path".to_string() });
		};
		let mut node = self;
		for name in parents {
			let children = node.children_mut().ok_or_else(|| SyncError::InvariantBreach {
				message: format!("add: {} is not a directory", name),
			})?;
			node = children
				.entry(name.clone())
				.or_insert_with(|| FileNode::new_dir(mtime));
			if !node.is_dir() {
				return Err(SyncError::InvariantBreach {
					message: format!("add: {} exists and is not a directory", name),
				});
			}
		}
		let children = node.children_mut().ok_or_else(|| SyncError::InvariantBreach {
			message: "add: parent is not a directory".to_string(),
		})?;
		let leaf_node =
			if is_dir { FileNode::new_dir(mtime) } else { FileNode::new_file(mtime) };
		children.insert(leaf.clone(), leaf_node);
		Ok(())
	}

	/// Locate by walking components; fail silently if missing, per spec
	/// §4.1 `delete` ("fail silently after logging").
	pub fn delete(&mut self, path: &[String]) -> bool {
		let Some((leaf, parents)) = path.split_last() else {
			return false;
		};
		let mut node = self;
		for name in parents {
			match node.children_mut().and_then(|c| c.get_mut(name)) {
				Some(child) => node = child,
				None => {
					warn!(path = ?path, "delete: missing parent directory, skipping");
					return false;
				}
			}
		}
		match node.children_mut() {
			Some(children) => children.remove(leaf).is_some(),
			None => {
				warn!(path = ?path, "delete: parent is not a directory, skipping");
				false
			}
		}
	}

	fn find_mut(&mut self, path: &[String]) -> Option<&mut FileNode> {
		let mut node = self;
		for name in path {
			node = node.children_mut()?.get_mut(name)?;
		}
		Some(node)
	}

	/// Detach the subtree named `src_name` under `self` and attach it under
	/// `dst_parent` with `dst_name`, preserving its contents (spec §4.1
	/// `move`). Any prior occupant of `dst_name` is silently replaced, the
	/// same way `add` replaces an existing leaf.
	pub fn move_child(
		&mut self,
		src_parent: &[String],
		src_name: &str,
		dst_parent: &[String],
		dst_name: &str,
	) -> Result<(), SyncError> {
		let moved = {
			let parent = if src_parent.is_empty() {
				self as &mut FileNode
			} else {
				self.find_mut(src_parent).ok_or_else(|| SyncError::InvariantBreach {
					message: format!("move: unknown source parent {:?}", src_parent),
				})?
			};
			let children = parent.children_mut().ok_or_else(|| SyncError::InvariantBreach {
				message: "move: source parent is not a directory".to_string(),
			})?;
			children.remove(src_name).ok_or_else(|| SyncError::InvariantBreach {
				message: format!("move: {} not found under source parent", src_name),
			})?
		};

		let dst = if dst_parent.is_empty() {
			self as &mut FileNode
		} else {
			self.find_mut(dst_parent).ok_or_else(|| SyncError::InvariantBreach {
				message: format!("move: unknown target parent {:?}", dst_parent),
			})?
		};
		let children = dst.children_mut().ok_or_else(|| SyncError::InvariantBreach {
			message: "move: target parent is not a directory".to_string(),
		})?;
		children.insert(dst_name.to_string(), moved);
		Ok(())
	}

	/// Recursive diff against `other` (spec §4.1 `diff`): `self` is the
	/// local side, `other` is the remote side. O(n₁+n₂) merge-walk relying
	/// on `BTreeMap`'s key order, which is a byte-wise total order on
	/// `String` and therefore locale-independent.
	pub fn diff(&self, other: &FileNode, out: &mut DiffSets, base: &Path) {
		let empty = BTreeMap::new();
		let mine = self.children().unwrap_or(&empty);
		let theirs = other.children().unwrap_or(&empty);

		let mut mine_iter = mine.iter().peekable();
		let mut theirs_iter = theirs.iter().peekable();

		loop {
			match (mine_iter.peek(), theirs_iter.peek()) {
				(Some((mn, _)), Some((tn, _))) if mn == tn => {
					let (name, my_child) = mine_iter.next().unwrap();
					let (_, their_child) = theirs_iter.next().unwrap();
					let child_path = base.join(name);
					if my_child.is_dir() != their_child.is_dir() {
						error!(path = %child_path.display(), "directory/file name conflict, skipping");
					} else if my_child.is_dir() {
						my_child.diff(their_child, out, &child_path);
					} else if my_child.mtime < their_child.mtime {
						out.newer_remote.push((child_path, false));
					} else if my_child.mtime > their_child.mtime {
						out.newer_local.push((child_path, false));
					}
				}
				(Some((mn, _)), Some((tn, _))) if mn < tn => {
					let (name, my_child) = mine_iter.next().unwrap();
					my_child.collect_all(&mut out.local_adds, &base.join(name));
				}
				(Some(_), Some(_)) => {
					let (name, their_child) = theirs_iter.next().unwrap();
					their_child.collect_all(&mut out.remote_adds, &base.join(name));
				}
				(Some((name, my_child)), None) => {
					my_child.collect_all(&mut out.local_adds, &base.join(name));
					mine_iter.next();
				}
				(None, Some((name, their_child))) => {
					their_child.collect_all(&mut out.remote_adds, &base.join(name));
					theirs_iter.next();
				}
				(None, None) => break,
			}
		}
	}

	fn collect_all(&self, out: &mut Vec<(PathBuf, bool)>, path: &Path) {
		out.push((path.to_path_buf(), self.is_dir()));
		if let Some(children) = self.children() {
			for (name, child) in children {
				child.collect_all(out, &path.join(name));
			}
		}
	}

	/// Indented debug dump (carried over from the original's `print()`,
	/// exposed by the `dump` CLI affordance). Not wired into any protocol
	/// path.
	pub fn dump(&self, out: &mut String, name: &str, depth: usize) {
		out.push_str(&" ".repeat(depth * 2));
		out.push_str(name);
		out.push_str(if self.is_dir() { "/" } else { "" });
		out.push_str(&format!("  (mtime={})\n", self.mtime));
		if let Some(children) = self.children() {
			for (child_name, child) in children {
				child.dump(out, child_name, depth + 1);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn p(s: &str) -> Vec<String> {
		components(Path::new(s))
	}

	#[test]
	fn snapshot_round_trip_preserves_structure() {
		let mut tree = FileNode::new_dir(100);
		tree.add(&p("a.txt"), false, 1).unwrap();
		tree.add(&p("d/b.txt"), false, 2).unwrap();
		tree.add(&p("d/e/c.txt"), false, 3).unwrap();

		let snapshot = tree.serialize();
		let restored = FileNode::from_snapshot(&snapshot).unwrap();
		assert_eq!(tree, restored);
	}

	#[test]
	fn add_creates_missing_intermediate_directories() {
		let mut tree = FileNode::new_dir(0);
		tree.add(&p("a/b/c.txt"), false, 5).unwrap();
		let a = tree.children().unwrap().get("a").unwrap();
		assert!(a.is_dir());
		assert_eq!(a.mtime, 5);
		let b = a.children().unwrap().get("b").unwrap();
		assert!(b.is_dir());
		let c = b.children().unwrap().get("c.txt").unwrap();
		assert!(!c.is_dir());
	}

	#[test]
	fn add_replaces_existing_leaf() {
		let mut tree = FileNode::new_dir(0);
		tree.add(&p("a.txt"), false, 1).unwrap();
		tree.add(&p("a.txt"), false, 2).unwrap();
		assert_eq!(tree.children().unwrap().get("a.txt").unwrap().mtime, 2);
	}

	#[test]
	fn delete_missing_path_fails_silently() {
		let mut tree = FileNode::new_dir(0);
		assert!(!tree.delete(&p("nope.txt")));
	}

	#[test]
	fn move_preserves_subtree_contents() {
		let mut tree = FileNode::new_dir(0);
		tree.add(&p("u/x.txt"), false, 1).unwrap();
		tree.add(&p("v"), true, 0).unwrap();
		tree.move_child(&[], "u", &[], "w").unwrap();
		assert!(tree.children().unwrap().get("u").is_none());
		let w = tree.children().unwrap().get("w").unwrap();
		assert!(w.children().unwrap().contains_key("x.txt"));
	}

	#[test]
	fn diff_produces_disjoint_sets() {
		let mut local = FileNode::new_dir(0);
		local.add(&p("only_local.txt"), false, 1).unwrap();
		local.add(&p("both.txt"), false, 100).unwrap();
		local.add(&p("stale.txt"), false, 5).unwrap();

		let mut remote = FileNode::new_dir(0);
		remote.add(&p("only_remote.txt"), false, 1).unwrap();
		remote.add(&p("both.txt"), false, 50).unwrap();
		remote.add(&p("stale.txt"), false, 500).unwrap();

		let mut out = DiffSets::default();
		local.diff(&remote, &mut out, Path::new(""));

		assert_eq!(out.local_adds, vec![(PathBuf::from("only_local.txt"), false)]);
		assert_eq!(out.remote_adds, vec![(PathBuf::from("only_remote.txt"), false)]);
		assert_eq!(out.newer_local, vec![(PathBuf::from("both.txt"), false)]);
		assert_eq!(out.newer_remote, vec![(PathBuf::from("stale.txt"), false)]);
	}

	#[test]
	fn diff_recurses_into_matching_directories() {
		let mut local = FileNode::new_dir(0);
		local.add(&p("d/only_local.txt"), false, 1).unwrap();

		let mut remote = FileNode::new_dir(0);
		remote.add(&p("d/only_remote.txt"), false, 1).unwrap();

		let mut out = DiffSets::default();
		local.diff(&remote, &mut out, Path::new(""));
		assert_eq!(out.local_adds, vec![(PathBuf::from("d/only_local.txt"), false)]);
		assert_eq!(out.remote_adds, vec![(PathBuf::from("d/only_remote.txt"), false)]);
	}

	#[test]
	fn diff_adds_entire_subtree_for_directory_only_on_one_side() {
		let mut local = FileNode::new_dir(0);
		local.add(&p("d/a.txt"), false, 1).unwrap();
		local.add(&p("d/e/b.txt"), false, 1).unwrap();
		let remote = FileNode::new_dir(0);

		let mut out = DiffSets::default();
		local.diff(&remote, &mut out, Path::new(""));
		assert_eq!(
			out.local_adds,
			vec![
				(PathBuf::from("d"), true),
				(PathBuf::from("d/a.txt"), false),
				(PathBuf::from("d/e"), true),
				(PathBuf::from("d/e/b.txt"), false),
			]
		);
	}

	#[test]
	fn names_differing_only_in_case_are_distinct() {
		let mut local = FileNode::new_dir(0);
		local.add(&p("Readme.txt"), false, 1).unwrap();
		let mut remote = FileNode::new_dir(0);
		remote.add(&p("readme.txt"), false, 1).unwrap();

		let mut out = DiffSets::default();
		local.diff(&remote, &mut out, Path::new(""));
		assert_eq!(out.local_adds, vec![(PathBuf::from("Readme.txt"), false)]);
		assert_eq!(out.remote_adds, vec![(PathBuf::from("readme.txt"), false)]);
	}

	#[test]
	fn is_hidden_flags_dotfiles_and_downtemp() {
		assert!(is_hidden(Path::new("a/.hidden")));
		assert!(is_hidden(Path::new("a/file.txt.downtemp")));
		assert!(!is_hidden(Path::new("a/file.txt")));
	}

	#[test]
	fn is_hidden_ignores_hidden_ancestor_directories() {
		// A synced root living under e.g. `/tmp/.tmpXXXXXX/` or `~/.config/...`
		// must not make every entry beneath it invisible.
		assert!(!is_hidden(Path::new("/tmp/.tmpABC123/root/visible.txt")));
		assert!(is_hidden(Path::new("/tmp/.tmpABC123/root/.hidden.txt")));
	}
}

// vim: ts=4
