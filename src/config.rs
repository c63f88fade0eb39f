//! Persisted device-identity state.
//!
//! `<root>/.syn_config.json` holds different shapes on the two sides
//! (spec §6): the server's monotone device-id registry, or the client's
//! single remembered device id. Both follow the donor's `state.rs`
//! load/save pattern: read-if-exists, write via a temp file renamed into
//! place so a crash mid-write never truncates the file a concurrently
//! starting process is about to read.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = ".syn_config.json";

/// Server-side device-id registry (spec §4.7, §6).
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
	pub max_device_id: u32,
	pub device_ids: Vec<u32>,
}

impl ServerConfig {
	/// Allocate a fresh device id, registering it and bumping the watermark.
	///
	/// Invariant (data model table, §3): `max_device_id` is always `>=`
	/// every issued id, and `device_ids` contains every id ever issued.
	pub fn allocate_device_id(&mut self) -> u32 {
		self.max_device_id += 1;
		let id = self.max_device_id;
		self.device_ids.push(id);
		id
	}

	pub fn is_registered(&self, id: u32) -> bool {
		self.device_ids.contains(&id)
	}

	pub fn register(&mut self, id: u32) {
		if !self.device_ids.contains(&id) {
			self.device_ids.push(id);
		}
		if id > self.max_device_id {
			self.max_device_id = id;
		}
	}

	pub async fn load_or_default(root: &Path) -> Result<Self, SyncError> {
		load_or_default(root).await
	}

	pub async fn save(&self, root: &Path) -> Result<(), SyncError> {
		save(root, self).await
	}
}

/// Client-side persisted identity (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
	pub device_id: u32,
}

impl ClientConfig {
	pub async fn load_or_default(root: &Path) -> Result<Self, SyncError> {
		load_or_default(root).await
	}

	pub async fn save(&self, root: &Path) -> Result<(), SyncError> {
		save(root, self).await
	}
}

fn config_path(root: &Path) -> PathBuf {
	root.join(CONFIG_FILE_NAME)
}

async fn load_or_default<T>(root: &Path) -> Result<T, SyncError>
where
	T: Default + for<'de> Deserialize<'de>,
{
	let path = config_path(root);
	match tokio::fs::read_to_string(&path).await {
		Ok(contents) => serde_json::from_str(&contents)
			.map_err(|e| SyncError::Config { message: format!("{}: {}", path.display(), e) }),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
		Err(e) => Err(SyncError::Io(e)),
	}
}

async fn save<T>(root: &Path, value: &T) -> Result<(), SyncError>
where
	T: Serialize,
{
	let path = config_path(root);
	let json = serde_json::to_string_pretty(value)?;
	let tmp = path.with_extension("json.tmp");
	tokio::fs::write(&tmp, json).await?;
	tokio::fs::rename(&tmp, &path).await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn server_config_round_trips_through_disk() {
		let dir = tempfile::tempdir().unwrap();
		let mut cfg = ServerConfig::default();
		let a = cfg.allocate_device_id();
		let b = cfg.allocate_device_id();
		assert_eq!((a, b), (1, 2));
		cfg.save(dir.path()).await.unwrap();

		let loaded = ServerConfig::load_or_default(dir.path()).await.unwrap();
		assert_eq!(loaded, cfg);
		assert!(loaded.is_registered(1));
		assert!(!loaded.is_registered(3));
	}

	#[tokio::test]
	async fn missing_config_file_yields_default() {
		let dir = tempfile::tempdir().unwrap();
		let loaded = ClientConfig::load_or_default(dir.path()).await.unwrap();
		assert_eq!(loaded, ClientConfig::default());
	}
}

// vim: ts=4
