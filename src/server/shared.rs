//! State shared by every connection task on the server side (spec §4.7).

use crate::config::ServerConfig;
use crate::protocol::{CommandContent, Envelope};
use crate::server::oplog::{self, Operation};
use crate::tree::FileNode;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

pub struct ServerShared {
	pub root: PathBuf,
	pub config: Mutex<ServerConfig>,
	pub tree: Mutex<FileNode>,
	connections: Mutex<HashMap<u32, mpsc::UnboundedSender<Envelope>>>,
}

impl ServerShared {
	pub fn new(root: PathBuf, config: ServerConfig, tree: FileNode) -> Arc<ServerShared> {
		Arc::new(ServerShared {
			root,
			config: Mutex::new(config),
			tree: Mutex::new(tree),
			connections: Mutex::new(HashMap::new()),
		})
	}

	pub async fn register_connection(&self, device_id: u32, tx: mpsc::UnboundedSender<Envelope>) {
		self.connections.lock().await.insert(device_id, tx);
	}

	pub async fn unregister_connection(&self, device_id: u32) {
		self.connections.lock().await.remove(&device_id);
	}

	/// Send `op` to every other registered device: live, if it has a
	/// connection right now, or into its offline log otherwise (spec §4.7's
	/// fan-out/offline-log split).
	pub async fn fan_out(&self, op: Operation, exclude_device: u32) {
		let device_ids = self.config.lock().await.device_ids.clone();
		let connections = self.connections.lock().await;
		for device_id in device_ids {
			if device_id == exclude_device {
				continue;
			}
			match connections.get(&device_id) {
				Some(tx) => {
					if tx.send(operation_to_envelope(&op)).is_err() {
						warn!(device_id, "connection channel closed, logging instead");
						if let Err(e) = oplog::append(&self.root, device_id, op.clone()).await {
							warn!(device_id, error = %e, "failed to log operation for offline device");
						}
					}
				}
				None => {
					if let Err(e) = oplog::append(&self.root, device_id, op.clone()).await {
						warn!(device_id, error = %e, "failed to log operation for offline device");
					}
				}
			}
		}
	}
}

pub fn operation_to_envelope(op: &Operation) -> Envelope {
	match op {
		Operation::Update { path, is_dir, m_time } => Envelope::command(CommandContent::Post {
			path: path.clone(),
			is_dir: *is_dir,
			m_time: *m_time,
		}),
		Operation::Delete { path } => Envelope::command(CommandContent::Delete { path: path.clone() }),
		Operation::Move { source, target } => {
			Envelope::command(CommandContent::Move { source: source.clone(), target: target.clone() })
		}
	}
}

// vim: ts=4
