//! One client connection: handshake, live command loop, file transfer
//! (spec §4.3, §4.7).

use crate::codec::EnvelopeCodec;
use crate::error::SyncError;
use crate::protocol::{Command, CommandContent, Envelope};
use crate::server::oplog;
use crate::server::shared::{operation_to_envelope, ServerShared};
use crate::transfer::{ConnectionContext, RecvStream, SendStream};
use crate::tree::node::{components, now};
use crate::tree::FileNode;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{info, warn};

/// A device is dropped if no frame -- heartbeat or otherwise -- arrives
/// within this long: twice the client's 10s heartbeat interval (spec §4.7's
/// reaper, "threshold = 2x", left disarmed in the source but enabled here
/// per §9's open-question resolution).
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(20);

pub async fn handle(socket: TcpStream, peer: std::net::SocketAddr, shared: Arc<ServerShared>) {
	let mut framed = Framed::new(socket, EnvelopeCodec::default());

	let device_id = match handshake_init(&mut framed, &shared).await {
		Ok(id) => id,
		Err(e) => {
			warn!(%peer, error = %e, "handshake failed");
			return;
		}
	};
	info!(%peer, device_id, "device connected");

	let (tx, mut rx) = mpsc::unbounded_channel();
	shared.register_connection(device_id, tx).await;

	// Replay this device's offline log before REQUESTSYN is even read (spec
	// §4.6): the client's REQUESTSYN carries its stale on-disk tree, so a
	// diff computed before replay would see a server-side delete made while
	// this device was offline as a remote_add and ask the client to push the
	// file straight back, resurrecting it ahead of the oplog's own DELETE.
	replay_offline_log(&mut framed, &shared, device_id).await;

	if let Err(e) = handshake_syn(&mut framed, &shared, device_id).await {
		warn!(%peer, device_id, error = %e, "handshake failed");
		shared.unregister_connection(device_id).await;
		return;
	}

	let mut ctx = ConnectionContext::new();
	let mut timeout = tokio::time::interval(HEARTBEAT_TIMEOUT);
	timeout.tick().await;

	loop {
		let send_fut = async {
			match ctx.current_send() {
				Some(stream) => stream.next_frame().await,
				None => std::future::pending().await,
			}
		};
		tokio::select! {
			frame = framed.next() => {
				match frame {
					Some(Ok(envelope)) => {
						timeout.reset();
						if let Err(e) = handle_envelope(&mut framed, &shared, &mut ctx, device_id, envelope).await {
							warn!(%peer, device_id, error = %e, "error handling frame");
						}
					}
					Some(Err(e)) => {
						warn!(%peer, device_id, error = %e, "frame decode error, dropping connection");
						break;
					}
					None => break,
				}
			}
			outbound = rx.recv() => {
				match outbound {
					Some(envelope) => {
						if let Envelope::Command { content, .. } = &envelope {
							if let Ok(CommandContent::Post { path, is_dir: false, m_time }) =
								CommandContent::decode(Command::Post, content.clone())
							{
								if ctx.has_pending_sends() {
									warn!(device_id, path, "outbound send queue already busy, queuing behind it");
								}
								if let Ok(stream) = SendStream::open(&shared.root, &path, m_time).await {
									ctx.queue_send(stream);
								}
							}
						}
						if framed.send(envelope).await.is_err() {
							break;
						}
					}
					None => {}
				}
			}
			frame_result = send_fut => {
				match frame_result {
					Ok(Some(envelope)) => {
						if framed.send(envelope).await.is_err() {
							break;
						}
					}
					Ok(None) => ctx.pop_finished_send(),
					Err(e) => {
						warn!(device_id, error = %e, "send stream failed, abandoning it");
						ctx.pop_finished_send();
					}
				}
			}
			_ = timeout.tick() => {
				warn!(%peer, device_id, "heartbeat timeout, dropping connection");
				break;
			}
		}
	}

	shared.unregister_connection(device_id).await;
	info!(%peer, device_id, "device disconnected");
}

/// Reads REQUESTINIT and allocates or confirms the device id. Does not touch
/// REQUESTSYN: the offline log must be replayed (see `replay_offline_log`)
/// before REQUESTSYN is read, per spec §4.6.
async fn handshake_init(
	framed: &mut Framed<TcpStream, EnvelopeCodec>,
	shared: &Arc<ServerShared>,
) -> Result<u32, SyncError> {
	let first = framed
		.next()
		.await
		.ok_or_else(|| SyncError::Protocol("connection closed before REQUESTINIT".to_string()))??;
	let requested_id = match first {
		Envelope::Command { command, content } if Command::from_code(command) == Some(Command::RequestInit) => {
			match CommandContent::decode(Command::RequestInit, content)? {
				CommandContent::RequestInit { device_id } => device_id,
				_ => unreachable!(),
			}
		}
		_ => return Err(SyncError::Protocol("expected REQUESTINIT".to_string())),
	};

	let device_id = {
		let mut config = shared.config.lock().await;
		if requested_id == 0 || !config.is_registered(requested_id) {
			let id = if requested_id == 0 { config.allocate_device_id() } else { requested_id };
			config.register(id);
			config.save(&shared.root).await?;
			id
		} else {
			requested_id
		}
	};

	Ok(device_id)
}

/// Reads REQUESTSYN, diffs against the authoritative tree, and completes the
/// handshake with per-path POST/GET and a final INITEND. Called only after
/// `replay_offline_log` has drained this device's pending operations, so the
/// tree diffed here already reflects anything the server did while the
/// device was offline.
async fn handshake_syn(
	framed: &mut Framed<TcpStream, EnvelopeCodec>,
	shared: &Arc<ServerShared>,
	device_id: u32,
) -> Result<(), SyncError> {
	let second = framed
		.next()
		.await
		.ok_or_else(|| SyncError::Protocol("connection closed before REQUESTSYN".to_string()))??;
	let client_tree = match second {
		Envelope::Command { command, content } if Command::from_code(command) == Some(Command::RequestSyn) => {
			match CommandContent::decode(Command::RequestSyn, content)? {
				CommandContent::RequestSyn { tree } => FileNode::from_snapshot(&tree)?,
				_ => unreachable!(),
			}
		}
		_ => return Err(SyncError::Protocol("expected REQUESTSYN".to_string())),
	};

	let diff = {
		let server_tree = shared.tree.lock().await;
		let mut diff = crate::tree::DiffSets::default();
		server_tree.diff(&client_tree, &mut diff, std::path::Path::new(""));
		diff
	};

	// `local_adds`/`newer_local`: the server's copy is the one to push.
	for (path, is_dir) in diff.local_adds.into_iter().chain(diff.newer_local) {
		send_post(framed, &shared.root, &path, is_dir).await?;
	}
	// `remote_adds`: a directory that only exists on the client can't be
	// pulled with GET (there's nothing to open a RecvStream for), so create
	// it locally and broadcast it as a POST instead, same as a live mkdir
	// would be. Files, and anything newer on the remote side, are GET'd.
	for (path, is_dir) in diff.remote_adds {
		let path_str = path.to_string_lossy().into_owned();
		if is_dir {
			tokio::fs::create_dir_all(shared.root.join(&path)).await?;
			apply_local_update(shared, device_id, &path_str, true, now()).await?;
		} else {
			framed.send(Envelope::command(CommandContent::Get { path: path_str })).await?;
		}
	}
	for (path, _) in diff.newer_remote {
		framed
			.send(Envelope::command(CommandContent::Get { path: path.to_string_lossy().into_owned() }))
			.await?;
	}

	framed.send(Envelope::command(CommandContent::InitEnd { device_id })).await?;
	Ok(())
}

/// Reads a file's mtime off disk, falling back to the current time if the
/// filesystem can't report one (e.g. a platform without mtime support).
async fn disk_mtime(full_path: &std::path::Path) -> i64 {
	tokio::fs::metadata(full_path)
		.await
		.ok()
		.and_then(|meta| meta.modified().ok())
		.and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
		.map(|d| d.as_secs() as i64)
		.unwrap_or_else(now)
}

async fn send_post(
	framed: &mut Framed<TcpStream, EnvelopeCodec>,
	root: &std::path::Path,
	path: &std::path::Path,
	is_dir: bool,
) -> Result<(), SyncError> {
	let full_path = root.join(path);
	tokio::fs::metadata(&full_path).await?;
	let m_time = disk_mtime(&full_path).await;
	framed
		.send(Envelope::command(CommandContent::Post {
			path: path.to_string_lossy().into_owned(),
			is_dir,
			m_time,
		}))
		.await?;
	// The handshake sends POSTs straight off the handshake's own framed
	// sink rather than through `ConnectionContext`'s queue: the data frames
	// that follow are written inline, right here, before the next POST.
	if !is_dir {
		let mut stream = SendStream::open(root, &path.to_string_lossy(), m_time).await?;
		while let Some(frame) = stream.next_frame().await? {
			framed.send(frame).await?;
		}
	}
	Ok(())
}

async fn replay_offline_log(
	framed: &mut Framed<TcpStream, EnvelopeCodec>,
	shared: &Arc<ServerShared>,
	device_id: u32,
) {
	let log = match oplog::load(&shared.root, device_id).await {
		Ok(log) => log,
		Err(e) => {
			warn!(device_id, error = %e, "failed to load offline log");
			return;
		}
	};
	for op in &log {
		match op {
			oplog::Operation::Update { path, is_dir: false, .. } => {
				// A bare POST with no data frames leaves the RecvStream it
				// opens on the other end waiting forever. Stream the bytes
				// inline, same as `send_post` does for the live handshake.
				if let Err(e) = send_post(framed, &shared.root, std::path::Path::new(path), false).await {
					warn!(device_id, path, error = %e, "failed to replay file update, skipping");
				}
			}
			_ => {
				let _ = framed.send(operation_to_envelope(op)).await;
			}
		}
	}
	if let Err(e) = oplog::clear(&shared.root, device_id).await {
		warn!(device_id, error = %e, "failed to clear offline log after replay");
	}
}

async fn handle_envelope(
	framed: &mut Framed<TcpStream, EnvelopeCodec>,
	shared: &Arc<ServerShared>,
	ctx: &mut ConnectionContext,
	device_id: u32,
	envelope: Envelope,
) -> Result<(), SyncError> {
	match envelope {
		Envelope::Command { command, content } => {
			let Some(command) = Command::from_code(command) else {
				warn!(command, "ignoring out-of-range command code");
				return Ok(());
			};
			let content = CommandContent::decode(command, content)?;
			apply_remote_command(framed, shared, ctx, device_id, content).await
		}
		Envelope::Data { path, size, m_time: _, content } => {
			let block = base64::engine::general_purpose::STANDARD
				.decode(content)
				.map_err(|e| SyncError::Protocol(format!("bad base64 in data frame: {}", e)))?;
			let Some(recv) = ctx.recv_mut(&path) else {
				// No RecvStream means no preceding POST was seen for this
				// path -- a late arrival after abort, or a stray frame.
				// Spec §7: log and drop, don't start a new write.
				warn!(device_id, path, "data frame for unknown transfer, dropping");
				return Ok(());
			};
			recv.write_block(size, &block).await.map_err(|e| SyncError::Protocol(format!("{}", e)))?;
			if recv.is_complete() {
				let recv = ctx.take_recv(&path).expect("present");
				let m_time = recv.m_time();
				recv.finish().await.map_err(|e| SyncError::Protocol(format!("{}", e)))?;
				apply_local_update(shared, device_id, &path, false, m_time).await?;
			}
			Ok(())
		}
	}
}

async fn apply_remote_command(
	framed: &mut Framed<TcpStream, EnvelopeCodec>,
	shared: &Arc<ServerShared>,
	ctx: &mut ConnectionContext,
	device_id: u32,
	content: CommandContent,
) -> Result<(), SyncError> {
	match content {
		CommandContent::Post { path, is_dir: true, m_time } => {
			tokio::fs::create_dir_all(shared.root.join(&path)).await?;
			apply_local_update(shared, device_id, &path, true, m_time).await
		}
		CommandContent::Post { path, is_dir: false, m_time } => {
			// Open the RecvStream now, not lazily on the first `data` frame
			// (spec §4.4), so an unmatched/late `data` frame has nothing to
			// attach to and is dropped instead of starting a fresh write.
			let stream = RecvStream::begin(&shared.root, &path, m_time)
				.await
				.map_err(|e| SyncError::Protocol(format!("{}", e)))?;
			ctx.begin_recv(path, stream);
			Ok(())
		}
		CommandContent::Delete { path } => {
			if tokio::fs::metadata(shared.root.join(&path)).await.is_ok() {
				crate::server::trash::move_to_trash(&shared.root, &path).await?;
			}
			shared.tree.lock().await.delete(&components(std::path::Path::new(&path)));
			shared
				.fan_out(oplog::Operation::Delete { path: path.clone() }, device_id)
				.await;
			Ok(())
		}
		CommandContent::Move { source, target } => {
			let src_full = shared.root.join(&source);
			let dst_full = shared.root.join(&target);
			if let Some(parent) = dst_full.parent() {
				tokio::fs::create_dir_all(parent).await?;
			}
			tokio::fs::rename(&src_full, &dst_full).await?;
			apply_move(shared, &source, &target).await?;
			shared
				.fan_out(oplog::Operation::Move { source: source.clone(), target: target.clone() }, device_id)
				.await;
			Ok(())
		}
		CommandContent::Get { path } => {
			// A peer's own diff disagreed with ours (clock skew, a write that
			// landed between its REQUESTSYN and our last scan) and it's asking
			// mid-session for a file it thinks we have. Same shape as the
			// handshake's per-path push: POST announces it, then the bytes.
			let full_path = shared.root.join(&path);
			if tokio::fs::metadata(&full_path).await.is_err() {
				warn!(device_id, path, "GET for a path we don't have, ignoring");
				return Ok(());
			}
			let m_time = disk_mtime(&full_path).await;
			framed
				.send(Envelope::command(CommandContent::Post { path: path.clone(), is_dir: false, m_time }))
				.await?;
			if let Ok(stream) = SendStream::open(&shared.root, &path, m_time).await {
				ctx.queue_send(stream);
			}
			Ok(())
		}
		CommandContent::Heartbeat { .. } => Ok(()),
		CommandContent::RequestInit { .. } | CommandContent::RequestSyn { .. } | CommandContent::InitEnd { .. } => {
			Err(SyncError::Protocol("handshake command received outside handshake".to_string()))
		}
	}
}

async fn apply_local_update(
	shared: &Arc<ServerShared>,
	device_id: u32,
	path: &str,
	is_dir: bool,
	m_time: i64,
) -> Result<(), SyncError> {
	shared.tree.lock().await.add(&components(std::path::Path::new(path)), is_dir, m_time)?;
	shared
		.fan_out(oplog::Operation::Update { path: path.to_string(), is_dir, m_time }, device_id)
		.await;
	Ok(())
}

async fn apply_move(shared: &Arc<ServerShared>, source: &str, target: &str) -> Result<(), SyncError> {
	let source_components = components(std::path::Path::new(source));
	let target_components = components(std::path::Path::new(target));
	let (Some((src_name, src_parent)), Some((dst_name, dst_parent))) =
		(source_components.split_last(), target_components.split_last())
	else {
		return Err(SyncError::InvariantBreach { message: "move with empty path".to_string() });
	};
	shared.tree.lock().await.move_child(src_parent, src_name, dst_parent, dst_name)
}

// vim: ts=4
