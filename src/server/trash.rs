//! Server-side delete trash (spec §4.6, §6).
//!
//! A `DELETE` applied by the server never unlinks the target outright: it is
//! renamed under `<root>/.transh/<original-relative-path>`, preserving the
//! full relative path (not just the basename) so two files with the same
//! name in different directories don't collide in the trash the way a flat
//! trash directory would. Grounded in the donor's `delete.rs`
//! `DeleteHandler::trash_path_for`, generalized from a flat, filename-only
//! trash to one that mirrors the source tree's shape, since spec.md names
//! the full relative path in the trash destination.

use crate::error::SyncError;
use std::path::{Path, PathBuf};

pub const TRASH_DIR_NAME: &str = ".transh";

pub fn trash_path(root: &Path, rel_path: &str) -> PathBuf {
	root.join(TRASH_DIR_NAME).join(rel_path)
}

/// Move `root.join(rel_path)` into the trash, creating intermediate trash
/// directories and overwriting any prior occupant of the destination. Falls
/// back to a plain remove if the rename itself fails (e.g. the source turns
/// out to be a directory the destination can't be overwritten across, or a
/// loose file the trash can't otherwise absorb) -- deleting still succeeds,
/// it just isn't recoverable from `.transh` afterwards (spec §4.6).
pub async fn move_to_trash(root: &Path, rel_path: &str) -> Result<(), SyncError> {
	let source = root.join(rel_path);
	let dest = trash_path(root, rel_path);

	if let Some(parent) = dest.parent() {
		tokio::fs::create_dir_all(parent).await?;
	}
	if let Ok(existing) = tokio::fs::metadata(&dest).await {
		if existing.is_dir() {
			tokio::fs::remove_dir_all(&dest).await?;
		} else {
			tokio::fs::remove_file(&dest).await?;
		}
	}

	match tokio::fs::rename(&source, &dest).await {
		Ok(()) => Ok(()),
		Err(_) => remove_plain(&source).await,
	}
}

async fn remove_plain(path: &Path) -> Result<(), SyncError> {
	let meta = tokio::fs::metadata(path).await?;
	if meta.is_dir() {
		tokio::fs::remove_dir_all(path).await?;
	} else {
		tokio::fs::remove_file(path).await?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	#[tokio::test]
	async fn delete_moves_file_under_transh_preserving_relative_path() {
		let dir = tempdir().unwrap();
		tokio::fs::create_dir_all(dir.path().join("a/b")).await.unwrap();
		tokio::fs::write(dir.path().join("a/b/c.txt"), b"hi").await.unwrap();

		move_to_trash(dir.path(), "a/b/c.txt").await.unwrap();

		assert!(!dir.path().join("a/b/c.txt").exists());
		let trashed = dir.path().join(".transh/a/b/c.txt");
		assert_eq!(tokio::fs::read(&trashed).await.unwrap(), b"hi");
	}

	#[tokio::test]
	async fn delete_overwrites_existing_trash_occupant() {
		let dir = tempdir().unwrap();
		tokio::fs::create_dir_all(dir.path().join(".transh")).await.unwrap();
		tokio::fs::write(dir.path().join(".transh/c.txt"), b"stale").await.unwrap();
		tokio::fs::write(dir.path().join("c.txt"), b"fresh").await.unwrap();

		move_to_trash(dir.path(), "c.txt").await.unwrap();

		assert_eq!(tokio::fs::read(dir.path().join(".transh/c.txt")).await.unwrap(), b"fresh");
	}

	#[tokio::test]
	async fn delete_moves_a_whole_directory_subtree() {
		let dir = tempdir().unwrap();
		tokio::fs::create_dir_all(dir.path().join("d")).await.unwrap();
		tokio::fs::write(dir.path().join("d/x.txt"), b"x").await.unwrap();

		move_to_trash(dir.path(), "d").await.unwrap();

		assert!(!dir.path().join("d").exists());
		assert_eq!(tokio::fs::read(dir.path().join(".transh/d/x.txt")).await.unwrap(), b"x");
	}
}

// vim: ts=4
