//! End-to-end sync scenarios driven over a real loopback `TcpListener`
//! (spec §8). Each test spins up a real `server::serve` task and one or two
//! real `client::run` tasks against temporary directories and waits for the
//! filesystem on the other side to converge.

use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(15);

async fn start_server(root: &Path) -> std::net::SocketAddr {
	let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
	let addr = listener.local_addr().unwrap();
	let root = root.to_path_buf();
	tokio::spawn(async move {
		let _ = syncd::server::serve(listener, root).await;
	});
	addr
}

fn start_client(addr: std::net::SocketAddr, root: &Path) {
	let root = root.to_path_buf();
	tokio::spawn(async move {
		let _ = syncd::client::run(addr.ip().to_string(), addr.port(), root).await;
	});
}

/// Poll `check` until it returns true or `CONVERGENCE_TIMEOUT` elapses.
async fn wait_until(mut check: impl FnMut() -> bool) {
	tokio::time::timeout(CONVERGENCE_TIMEOUT, async {
		loop {
			if check() {
				return;
			}
			tokio::time::sleep(POLL_INTERVAL).await;
		}
	})
	.await
	.expect("condition never became true within the timeout");
}

#[tokio::test]
async fn initial_sync_pushes_existing_server_file_to_new_client() {
	let server_dir = TempDir::new().unwrap();
	let client_dir = TempDir::new().unwrap();
	std::fs::write(server_dir.path().join("hello.txt"), b"hello from server").unwrap();

	let addr = start_server(server_dir.path()).await;
	start_client(addr, client_dir.path());

	let want = client_dir.path().join("hello.txt");
	wait_until(|| std::fs::read(&want).map(|c| c == b"hello from server").unwrap_or(false)).await;
}

#[tokio::test]
async fn initial_sync_pulls_existing_client_file_up_to_server() {
	let server_dir = TempDir::new().unwrap();
	let client_dir = TempDir::new().unwrap();
	std::fs::write(client_dir.path().join("local.txt"), b"made on the client").unwrap();

	let addr = start_server(server_dir.path()).await;
	start_client(addr, client_dir.path());

	let want = server_dir.path().join("local.txt");
	wait_until(|| std::fs::read(&want).map(|c| c == b"made on the client").unwrap_or(false)).await;
}

#[tokio::test]
async fn file_created_after_connecting_propagates_to_the_server() {
	let server_dir = TempDir::new().unwrap();
	let client_dir = TempDir::new().unwrap();

	let addr = start_server(server_dir.path()).await;
	start_client(addr, client_dir.path());

	// Give the handshake a moment to finish before creating new content, so
	// this exercises the live watch path rather than the initial diff.
	tokio::time::sleep(Duration::from_millis(300)).await;
	std::fs::write(client_dir.path().join("new.txt"), b"written live").unwrap();

	let want = server_dir.path().join("new.txt");
	wait_until(|| std::fs::read(&want).map(|c| c == b"written live").unwrap_or(false)).await;
}

#[tokio::test]
async fn deleting_a_synced_file_removes_it_on_the_server_and_trashes_it() {
	let server_dir = TempDir::new().unwrap();
	let client_dir = TempDir::new().unwrap();
	std::fs::write(client_dir.path().join("doomed.txt"), b"bye").unwrap();

	let addr = start_server(server_dir.path()).await;
	start_client(addr, client_dir.path());

	let server_copy = server_dir.path().join("doomed.txt");
	wait_until(|| server_copy.exists()).await;

	std::fs::remove_file(client_dir.path().join("doomed.txt")).unwrap();

	wait_until(|| !server_copy.exists()).await;
	let trashed = server_dir.path().join(".transh/doomed.txt");
	wait_until(|| std::fs::read(&trashed).map(|c| c == b"bye").unwrap_or(false)).await;
}

#[tokio::test]
async fn renaming_a_synced_file_moves_it_on_the_server() {
	let server_dir = TempDir::new().unwrap();
	let client_dir = TempDir::new().unwrap();
	std::fs::write(client_dir.path().join("old_name.txt"), b"content").unwrap();

	let addr = start_server(server_dir.path()).await;
	start_client(addr, client_dir.path());

	wait_until(|| server_dir.path().join("old_name.txt").exists()).await;

	std::fs::rename(client_dir.path().join("old_name.txt"), client_dir.path().join("new_name.txt")).unwrap();

	let renamed = server_dir.path().join("new_name.txt");
	wait_until(|| std::fs::read(&renamed).map(|c| c == b"content").unwrap_or(false)).await;
	assert!(!server_dir.path().join("old_name.txt").exists());
}

#[tokio::test]
async fn a_directory_created_with_files_already_inside_syncs_the_whole_subtree() {
	// Simulates a subtree arriving atomically (e.g. moved in from outside
	// the watched root): by the time the watcher notices, the directory and
	// its contents already exist on disk in one step.
	let server_dir = TempDir::new().unwrap();
	let client_dir = TempDir::new().unwrap();

	let addr = start_server(server_dir.path()).await;
	start_client(addr, client_dir.path());
	tokio::time::sleep(Duration::from_millis(300)).await;

	let staged = client_dir.path().join(".staged_subtree");
	std::fs::create_dir_all(staged.join("nested")).unwrap();
	std::fs::write(staged.join("top.txt"), b"top").unwrap();
	std::fs::write(staged.join("nested/deep.txt"), b"deep").unwrap();
	std::fs::rename(&staged, client_dir.path().join("subtree")).unwrap();

	wait_until(|| std::fs::read(server_dir.path().join("subtree/top.txt")).map(|c| c == b"top").unwrap_or(false))
		.await;
	wait_until(|| {
		std::fs::read(server_dir.path().join("subtree/nested/deep.txt")).map(|c| c == b"deep").unwrap_or(false)
	})
	.await;
}

#[tokio::test]
async fn two_clients_converge_a_change_through_the_server() {
	let server_dir = TempDir::new().unwrap();
	let client_a = TempDir::new().unwrap();
	let client_b = TempDir::new().unwrap();

	let addr = start_server(server_dir.path()).await;
	start_client(addr, client_a.path());
	start_client(addr, client_b.path());
	tokio::time::sleep(Duration::from_millis(300)).await;

	std::fs::write(client_a.path().join("shared.txt"), b"from a").unwrap();

	let want = client_b.path().join("shared.txt");
	wait_until(|| std::fs::read(&want).map(|c| c == b"from a").unwrap_or(false)).await;
}

#[tokio::test]
async fn conflicting_mtimes_at_initial_sync_resolve_to_the_newer_copy() {
	let server_dir = TempDir::new().unwrap();
	let client_dir = TempDir::new().unwrap();

	std::fs::write(server_dir.path().join("doc.txt"), b"old server copy").unwrap();
	// Backdate the server's copy well into the past so the client's, written
	// with a real wall-clock mtime a moment later, is unambiguously newer.
	filetime::set_file_mtime(server_dir.path().join("doc.txt"), filetime::FileTime::from_unix_time(1, 0)).unwrap();
	std::fs::write(client_dir.path().join("doc.txt"), b"new client copy").unwrap();

	let addr = start_server(server_dir.path()).await;
	start_client(addr, client_dir.path());

	let want = server_dir.path().join("doc.txt");
	wait_until(|| std::fs::read(&want).map(|c| c == b"new client copy").unwrap_or(false)).await;
}

#[tokio::test]
async fn offline_device_reconnects_and_replays_the_oplog_before_any_new_diff() {
	let server_dir = TempDir::new().unwrap();
	let client_a_dir = TempDir::new().unwrap();
	let client_b_dir = TempDir::new().unwrap();

	std::fs::write(client_a_dir.path().join("doomed.txt"), b"going away").unwrap();

	let addr = start_server(server_dir.path()).await;

	let client_a_root = client_a_dir.path().to_path_buf();
	let a_handle = tokio::spawn(async move {
		let _ = syncd::client::run(addr.ip().to_string(), addr.port(), client_a_root).await;
	});

	// Wait for client A's initial handshake to land its file on the server
	// and its device id to be confirmed and persisted (INITEND).
	wait_until(|| server_dir.path().join("doomed.txt").exists()).await;
	wait_until(|| client_a_dir.path().join(".syn_config.json").exists()).await;

	// Take client A offline by killing its task outright, the way a network
	// drop or a sleeping laptop would -- no clean disconnect.
	a_handle.abort();
	tokio::time::sleep(Duration::from_millis(300)).await;

	start_client(addr, client_b_dir.path());
	wait_until(|| client_b_dir.path().join("doomed.txt").exists()).await;

	// While A is offline, B creates a new file and deletes an existing one.
	// Both operations land in A's offline log on the server (spec §4.6/§4.7)
	// instead of being delivered live.
	std::fs::write(client_b_dir.path().join("arrived_while_offline.txt"), b"new content").unwrap();
	wait_until(|| server_dir.path().join("arrived_while_offline.txt").exists()).await;
	std::fs::remove_file(client_b_dir.path().join("doomed.txt")).unwrap();
	wait_until(|| !server_dir.path().join("doomed.txt").exists()).await;

	// Reconnect client A against the same root. Its on-disk tree is stale:
	// it still has `doomed.txt` and is missing `arrived_while_offline.txt`,
	// so its REQUESTSYN will report `doomed.txt` as present. If the oplog
	// were replayed after that diff instead of before, the server would read
	// `doomed.txt` as a remote_add and ask the reconnecting client to push it
	// back, resurrecting a file the server already deleted.
	start_client(addr, client_a_dir.path());

	let arrived = client_a_dir.path().join("arrived_while_offline.txt");
	wait_until(|| std::fs::read(&arrived).map(|c| c == b"new content").unwrap_or(false)).await;

	tokio::time::sleep(Duration::from_millis(500)).await;
	assert!(!client_a_dir.path().join("doomed.txt").exists(), "deleted file must not be resurrected on the client");
	assert!(!server_dir.path().join("doomed.txt").exists(), "deleted file must not be resurrected on the server");
}

#[tokio::test]
async fn a_malformed_command_code_is_dropped_and_the_connection_survives() {
	use futures::{SinkExt, StreamExt};
	use syncd::codec::EnvelopeCodec;
	use syncd::protocol::{Command, CommandContent, Envelope};
	use syncd::tree::FileNode;
	use tokio::net::TcpStream;
	use tokio_util::codec::Framed;

	let server_dir = TempDir::new().unwrap();
	let addr = start_server(server_dir.path()).await;

	let socket = TcpStream::connect(addr).await.unwrap();
	let mut framed = Framed::new(socket, EnvelopeCodec::default());

	framed.send(Envelope::command(CommandContent::RequestInit { device_id: 0 })).await.unwrap();
	let empty_tree = FileNode::new_dir(0).serialize();
	framed.send(Envelope::command(CommandContent::RequestSyn { tree: empty_tree })).await.unwrap();
	loop {
		match framed.next().await.unwrap().unwrap() {
			Envelope::Command { command, .. } if Command::from_code(command) == Some(Command::InitEnd) => break,
			_ => continue,
		}
	}

	// An out-of-range command code (spec §4.3: "reserve values 0..7; other
	// values are logged and ignored") must be dropped without tearing down
	// the connection.
	framed.send(Envelope::Command { command: 99, content: serde_json::Value::Null }).await.unwrap();

	// A heartbeat right after it must still be accepted, proving the
	// connection is still alive and reading frames normally.
	framed.send(Envelope::command(CommandContent::Heartbeat { send_time: 1234 })).await.unwrap();

	// Drive a real operation through the same connection to confirm it keeps
	// working, not just that the socket hasn't been closed yet.
	framed
		.send(Envelope::command(CommandContent::Post { path: "after.txt".to_string(), is_dir: false, m_time: 1 }))
		.await
		.unwrap();
	framed.send(Envelope::data("after.txt", 5, 1, b"hello")).await.unwrap();

	let want = server_dir.path().join("after.txt");
	wait_until(|| std::fs::read(&want).map(|c| c == b"hello").unwrap_or(false)).await;
}

#[tokio::test]
async fn a_multi_chunk_file_transfers_intact() {
	let server_dir = TempDir::new().unwrap();
	let client_dir = TempDir::new().unwrap();
	// A few chunks' worth at the protocol's 64 KiB block size.
	let big = vec![0x5au8; 64 * 1024 * 3 + 1000];
	std::fs::write(client_dir.path().join("big.bin"), &big).unwrap();

	let addr = start_server(server_dir.path()).await;
	start_client(addr, client_dir.path());

	let want = server_dir.path().join("big.bin");
	wait_until(|| std::fs::read(&want).map(|c| c == big).unwrap_or(false)).await;
}
