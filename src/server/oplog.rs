//! Offline operation log (spec §4.7, §9): changes a disconnected device
//! missed, replayed in order the next time it reconnects.
//!
//! One JSON file per device under `<root>/.syn_oplog/<device_id>.json`,
//! written with the same temp-then-rename pattern `crate::config` uses --
//! a log that loses its tail to a crash is worse than one that is simply
//! absent, since a missing log degrades to "nothing happened" rather than
//! a replay gap in the middle.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
	Update { path: String, is_dir: bool, m_time: i64 },
	Delete { path: String },
	Move { source: String, target: String },
}

fn oplog_dir(root: &Path) -> PathBuf {
	root.join(".syn_oplog")
}

fn oplog_path(root: &Path, device_id: u32) -> PathBuf {
	oplog_dir(root).join(format!("{}.json", device_id))
}

/// Append one operation to `device_id`'s log, creating it if this is the
/// first thing it has missed.
pub async fn append(root: &Path, device_id: u32, op: Operation) -> Result<(), SyncError> {
	let mut log = load(root, device_id).await?;
	log.push(op);
	save(root, device_id, &log).await
}

pub async fn load(root: &Path, device_id: u32) -> Result<Vec<Operation>, SyncError> {
	let path = oplog_path(root, device_id);
	match tokio::fs::read_to_string(&path).await {
		Ok(contents) => serde_json::from_str(&contents)
			.map_err(|e| SyncError::Config { message: format!("{}: {}", path.display(), e) }),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
		Err(e) => Err(SyncError::Io(e)),
	}
}

async fn save(root: &Path, device_id: u32, log: &[Operation]) -> Result<(), SyncError> {
	let dir = oplog_dir(root);
	tokio::fs::create_dir_all(&dir).await?;
	let path = oplog_path(root, device_id);
	let tmp = path.with_extension("json.tmp");
	tokio::fs::write(&tmp, serde_json::to_string(log)?).await?;
	tokio::fs::rename(&tmp, &path).await?;
	Ok(())
}

/// Drop the log once its operations have been replayed to the reconnected
/// device.
pub async fn clear(root: &Path, device_id: u32) -> Result<(), SyncError> {
	let path = oplog_path(root, device_id);
	match tokio::fs::remove_file(&path).await {
		Ok(()) => Ok(()),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
		Err(e) => Err(SyncError::Io(e)),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	#[tokio::test]
	async fn operations_accumulate_in_order_and_clear_on_replay() {
		let dir = tempdir().unwrap();
		append(dir.path(), 7, Operation::Delete { path: "a.txt".to_string() }).await.unwrap();
		append(
			dir.path(),
			7,
			Operation::Update { path: "b.txt".to_string(), is_dir: false, m_time: 5 },
		)
		.await
		.unwrap();

		let log = load(dir.path(), 7).await.unwrap();
		assert_eq!(
			log,
			vec![
				Operation::Delete { path: "a.txt".to_string() },
				Operation::Update { path: "b.txt".to_string(), is_dir: false, m_time: 5 },
			]
		);

		clear(dir.path(), 7).await.unwrap();
		assert_eq!(load(dir.path(), 7).await.unwrap(), Vec::new());
	}
}

// vim: ts=4
