//! Client entry point: connect-with-retry, handshake, and the live
//! watch/sync loop against a single server (spec §4.2, §4.6).

use crate::codec::EnvelopeCodec;
use crate::config::ClientConfig;
use crate::error::SyncError;
use crate::protocol::{Command, CommandContent, Envelope};
use crate::settle::SettleQueue;
use crate::transfer::{ConnectionContext, RecvStream, SendStream};
use crate::tree::node::now;
use crate::tree::{FileNode, FsEvent, RenameOutcome, WatchedTree};
use base64::Engine;
use futures::{SinkExt, StreamExt};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const WRITE_SETTLE_WINDOW: Duration = Duration::from_secs(5);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub async fn run(host: String, port: u16, root: PathBuf) -> Result<(), SyncError> {
	tokio::fs::create_dir_all(&root).await?;
	loop {
		match connect(&host, port).await {
			Ok(socket) => {
				info!(%host, port, "connected to server");
				if let Err(e) = run_session(socket, &root).await {
					warn!(error = %e, "session ended, reconnecting");
				}
			}
			Err(e) => {
				warn!(%host, port, error = %e, "connect failed, retrying");
			}
		}
		tokio::time::sleep(RECONNECT_DELAY).await;
	}
}

async fn connect(host: &str, port: u16) -> Result<TcpStream, SyncError> {
	Ok(TcpStream::connect((host, port)).await?)
}

async fn run_session(socket: TcpStream, root: &Path) -> Result<(), SyncError> {
	let mut framed = Framed::new(socket, EnvelopeCodec::default());
	let mut config = ClientConfig::load_or_default(root).await?;
	let local_tree = FileNode::scan(root)?;

	framed
		.send(Envelope::command(CommandContent::RequestInit { device_id: config.device_id }))
		.await?;
	framed
		.send(Envelope::command(CommandContent::RequestSyn { tree: local_tree.serialize() }))
		.await?;

	let mut watched = WatchedTree::new(root.to_path_buf())?;
	let mut settling = SettleQueue::new(WRITE_SETTLE_WINDOW);
	let mut ctx = ConnectionContext::new();
	let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

	loop {
		let settle_sleep = match settling.next_deadline() {
			Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)),
			None => tokio::time::sleep(Duration::from_secs(3600)),
		};
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
						if let Err(e) =
							handle_envelope(&mut framed, root, &mut watched, &mut ctx, &mut config, envelope).await
						{
							warn!(error = %e, "error handling frame from server");
						}
					}
					Some(Err(e)) => return Err(e),
					None => return Err(SyncError::Protocol("server closed connection".to_string())),
				}
			}
			event = watched.next_event() => {
				match event {
					Some(event) => handle_local_event(&mut framed, root, &mut watched, &mut settling, event).await?,
					None => { error!("watcher channel closed"); return Ok(()); }
				}
			}
			_ = settle_sleep => {
				for path in settling.drain_settled() {
					announce_file(&mut framed, root, &path).await?;
				}
			}
			frame_result = send_fut => {
				match frame_result {
					Ok(Some(envelope)) => framed.send(envelope).await?,
					Ok(None) => ctx.pop_finished_send(),
					Err(e) => {
						warn!(error = %e, "send stream failed, abandoning it");
						ctx.pop_finished_send();
					}
				}
			}
			_ = heartbeat.tick() => {
				framed.send(Envelope::command(CommandContent::Heartbeat { send_time: now() })).await?;
			}
		}
	}
}

async fn handle_local_event(
	framed: &mut Framed<TcpStream, EnvelopeCodec>,
	root: &Path,
	watched: &mut WatchedTree,
	settling: &mut SettleQueue,
	event: FsEvent,
) -> Result<(), SyncError> {
	match event {
		FsEvent::Created { path, is_dir: true } => {
			let descendants = watched.link_created_subtree(&path, true)?;
			announce_dir(framed, root, &path).await?;
			for (descendant, is_dir) in descendants {
				announce_dir_or_touch(framed, root, &descendant, is_dir, settling).await?;
			}
		}
		FsEvent::Created { path, is_dir: false } => {
			watched.link_created(&path, false)?;
			settling.touch(path);
		}
		FsEvent::Written { path } => settling.touch(path),
		FsEvent::Removed { path } => {
			settling.forget(&path);
			watched.unlink_removed(&path);
			if let Some(rel) = relative_to(root, &path) {
				framed.send(Envelope::command(CommandContent::Delete { path: rel })).await?;
			}
		}
		FsEvent::Renamed { from, to } => {
			settling.forget(&from);
			match watched.apply_rename(&from, &to)? {
				RenameOutcome::Moved => {
					if let (Some(rel_from), Some(rel_to)) = (relative_to(root, &from), relative_to(root, &to)) {
						framed
							.send(Envelope::command(CommandContent::Move { source: rel_from, target: rel_to }))
							.await?;
					}
				}
				RenameOutcome::TreatedAsCreate(descendants) => {
					let is_dir = std::fs::symlink_metadata(&to).map(|m| m.is_dir()).unwrap_or(false);
					announce_dir_or_touch(framed, root, &to, is_dir, settling).await?;
					for (descendant, is_dir) in descendants {
						announce_dir_or_touch(framed, root, &descendant, is_dir, settling).await?;
					}
				}
			}
		}
	}
	Ok(())
}

fn relative_to(root: &Path, path: &Path) -> Option<String> {
	path.strip_prefix(root).ok().map(|p| p.to_string_lossy().into_owned())
}

async fn announce_dir(
	framed: &mut Framed<TcpStream, EnvelopeCodec>,
	root: &Path,
	path: &Path,
) -> Result<(), SyncError> {
	let Some(rel) = relative_to(root, path) else { return Ok(()) };
	framed
		.send(Envelope::command(CommandContent::Post { path: rel, is_dir: true, m_time: now() }))
		.await
}

/// `POST` a directory immediately, or queue a file for the usual settle
/// window -- shared by plain directory creation and the fresh-creation
/// fallback, since both need to walk a whole subtree the same way.
async fn announce_dir_or_touch(
	framed: &mut Framed<TcpStream, EnvelopeCodec>,
	root: &Path,
	path: &Path,
	is_dir: bool,
	settling: &mut SettleQueue,
) -> Result<(), SyncError> {
	if is_dir {
		announce_dir(framed, root, path).await
	} else {
		settling.touch(path.to_path_buf());
		Ok(())
	}
}

async fn announce_file(
	framed: &mut Framed<TcpStream, EnvelopeCodec>,
	root: &Path,
	path: &Path,
) -> Result<(), SyncError> {
	let Some(rel) = relative_to(root, path) else { return Ok(()) };
	let meta = match tokio::fs::metadata(path).await {
		Ok(meta) => meta,
		Err(_) => return Ok(()), // removed again before it settled
	};
	let m_time = meta
		.modified()
		.ok()
		.and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
		.map(|d| d.as_secs() as i64)
		.unwrap_or_else(now);
	framed
		.send(Envelope::command(CommandContent::Post { path: rel.clone(), is_dir: false, m_time }))
		.await?;
	let mut stream = SendStream::open(root, &rel, m_time)
		.await
		.map_err(|e| SyncError::Protocol(format!("{}", e)))?;
	while let Some(frame) = stream.next_frame().await.map_err(|e| SyncError::Protocol(format!("{}", e)))? {
		framed.send(frame).await?;
	}
	Ok(())
}

async fn handle_envelope(
	framed: &mut Framed<TcpStream, EnvelopeCodec>,
	root: &Path,
	watched: &mut WatchedTree,
	ctx: &mut ConnectionContext,
	config: &mut ClientConfig,
	envelope: Envelope,
) -> Result<(), SyncError> {
	match envelope {
		Envelope::Command { command, content } => {
			let Some(command) = Command::from_code(command) else {
				warn!(command, "ignoring out-of-range command code");
				return Ok(());
			};
			let content = CommandContent::decode(command, content)?;
			match content {
				CommandContent::InitEnd { device_id } => {
					if config.device_id != device_id {
						config.device_id = device_id;
						config.save(root).await?;
					}
					info!(device_id, "initial sync complete");
					Ok(())
				}
				CommandContent::Post { path, is_dir: true, m_time: _ } => {
					let full_path = root.join(&path);
					watched.filter_next_event_for(full_path.clone());
					tokio::fs::create_dir_all(&full_path).await?;
					watched.link_created(&full_path, true)?;
					Ok(())
				}
				CommandContent::Post { path, is_dir: false, m_time } => {
					// Open the `RecvStream` now, not on the first `data` frame
					// (spec §4.4): a stray/late `data` frame for a path with no
					// live entry has nothing to attach to and is dropped in the
					// `Data` arm below.
					let full_path = root.join(&path);
					watched.filter_next_event_for(full_path.clone());
					let stream = RecvStream::begin(root, &path, m_time)
						.await
						.map_err(|e| SyncError::Protocol(format!("{}", e)))?;
					ctx.begin_recv(path, stream);
					Ok(())
				}
				CommandContent::Delete { path } => {
					let full_path = root.join(&path);
					watched.filter_next_event_for(full_path.clone());
					if tokio::fs::metadata(&full_path).await.is_ok() {
						if tokio::fs::metadata(&full_path).await?.is_dir() {
							tokio::fs::remove_dir_all(&full_path).await?;
						} else {
							tokio::fs::remove_file(&full_path).await?;
						}
					}
					watched.unlink_removed(&full_path);
					Ok(())
				}
				CommandContent::Move { source, target } => {
					let src_full = root.join(&source);
					let dst_full = root.join(&target);
					watched.filter_next_event_for(src_full.clone());
					watched.filter_next_event_for(dst_full.clone());
					if let Some(parent) = dst_full.parent() {
						tokio::fs::create_dir_all(parent).await?;
					}
					tokio::fs::rename(&src_full, &dst_full).await?;
					watched.apply_rename(&src_full, &dst_full)?;
					Ok(())
				}
				CommandContent::Get { path } => {
					// A bare `data` frame with no preceding `POST` is dropped by
					// the peer (no `RecvStream` to attach to) -- announce the
					// file the same way `announce_file` and a broadcast `POST` do
					// before queuing the bytes behind it.
					let full_path = root.join(&path);
					let m_time = match tokio::fs::metadata(&full_path).await {
						Ok(meta) => meta
							.modified()
							.ok()
							.and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
							.map(|d| d.as_secs() as i64)
							.unwrap_or_else(now),
						Err(_) => return Ok(()), // file is gone; nothing to serve
					};
					framed
						.send(Envelope::command(CommandContent::Post {
							path: path.clone(),
							is_dir: false,
							m_time,
						}))
						.await?;
					if let Ok(stream) = SendStream::open(root, &path, m_time).await {
						ctx.queue_send(stream);
					}
					Ok(())
				}
				CommandContent::Heartbeat { .. } => Ok(()),
				CommandContent::RequestInit { .. } | CommandContent::RequestSyn { .. } => {
					Err(SyncError::Protocol("server sent a client-only command".to_string()))
				}
			}
		}
		Envelope::Data { path, size, m_time: _, content } => {
			let block = base64::engine::general_purpose::STANDARD
				.decode(content)
				.map_err(|e| SyncError::Protocol(format!("bad base64 in data frame: {}", e)))?;
			let Some(recv) = ctx.recv_mut(&path) else {
				// No RecvStream means no preceding POST was seen for this path --
				// a late arrival after abort, or a stray frame. Spec §7: log and
				// drop, don't start a new write.
				warn!(path, "data frame for unknown transfer, dropping");
				return Ok(());
			};
			recv.write_block(size, &block).await.map_err(|e| SyncError::Protocol(format!("{}", e)))?;
			if recv.is_complete() {
				let recv = ctx.take_recv(&path).expect("present");
				recv.finish().await.map_err(|e| SyncError::Protocol(format!("{}", e)))?;
				watched.link_created(&root.join(&path), false)?;
			}
			Ok(())
		}
	}
}

// vim: ts=4
