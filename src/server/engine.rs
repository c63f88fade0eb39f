//! Server entry point: accept loop over the authoritative tree (spec §4.6).
//!
//! Unlike the client, the server has no filesystem watch of its own: every
//! mutation of its tree and disk state originates from a command a
//! connected client sent (spec §2's server engine owns the authoritative
//! tree, the connection set, the device registry and the offline log --
//! nothing about watching its own directory). Watching the server's root
//! directly would have to reinvent the client's filtered-paths feedback
//! guard for every command `server::connection` already applies to disk;
//! since no peer needs the server to pick up out-of-band edits, it's
//! simpler and correct to have exactly one writer -- the connection that
//! received the command -- touch the tree and the filesystem together.

use crate::config::ServerConfig;
use crate::error::SyncError;
use crate::server::connection;
use crate::server::shared::ServerShared;
use crate::tree::FileNode;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

pub async fn run(port: u16, root: PathBuf) -> Result<(), SyncError> {
	let listener = TcpListener::bind(("0.0.0.0", port)).await?;
	info!(port, root = %root.display(), "server listening");
	serve(listener, root).await
}

/// Accept loop over an already-bound listener, split out from [`run`] so
/// tests can bind an ephemeral port and learn its address before serving.
pub async fn serve(listener: TcpListener, root: PathBuf) -> Result<(), SyncError> {
	tokio::fs::create_dir_all(&root).await?;
	let config = ServerConfig::load_or_default(&root).await?;
	let tree = FileNode::scan(&root)?;
	let shared = ServerShared::new(root, config, tree);

	loop {
		let (socket, peer) = listener.accept().await?;
		let shared = Arc::clone(&shared);
		tokio::spawn(connection::handle(socket, peer, shared));
	}
}

// vim: ts=4
