//! `SendStream`/`RecvStream`: one file's worth of chunked transfer (spec §4.4).
//!
//! A `POST` command announces a file; the `data` frames that follow it carry
//! the bytes in fixed-size blocks, the last one short if the file's size
//! isn't a multiple of `CHUNK_SIZE`. Both directions key the in-flight state
//! by the relative path, since a connection can be ferrying several files at
//! once in each direction (§4.4, §9).

use crate::error::TransferError;
use crate::protocol::Envelope;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, warn};

/// Plaintext block size a `data` frame carries (spec §4.4). Base64 and the
/// length-delimited frame header both sit on top of this.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// The temp-file suffix a file is written under until it is fully received,
/// and which the tree model and the watcher both treat as invisible.
pub const DOWNTEMP_SUFFIX: &str = ".downtemp";

pub fn downtemp_path(final_path: &Path) -> PathBuf {
	let mut name = final_path.as_os_str().to_os_string();
	name.push(DOWNTEMP_SUFFIX);
	PathBuf::from(name)
}

/// One file being read off local disk and handed out as `data` frames.
pub struct SendStream {
	path: String,
	m_time: i64,
	file: File,
	size: u64,
	sent: u64,
	/// A zero-byte file must still produce exactly one (empty) frame so the
	/// receiver has something to `finish()` on; `sent >= size` alone can't
	/// distinguish "not started" from "done" when `size == 0`.
	started: bool,
}

impl SendStream {
	pub async fn open(root: &Path, rel_path: &str, m_time: i64) -> Result<SendStream, TransferError> {
		let full_path = root.join(rel_path);
		let file = File::open(&full_path).await?;
		let size = file.metadata().await?.len();
		Ok(SendStream { path: rel_path.to_string(), m_time, file, size, sent: 0, started: false })
	}

	pub fn path(&self) -> &str {
		&self.path
	}

	pub fn is_done(&self) -> bool {
		self.started && self.sent >= self.size
	}

	/// Read and return the next `data` frame, or `None` once the whole file
	/// has been sent (spec §4.4's "short final chunk").
	pub async fn next_frame(&mut self) -> Result<Option<Envelope>, TransferError> {
		if self.is_done() {
			return Ok(None);
		}
		let remaining = self.size - self.sent;
		let want = remaining.min(CHUNK_SIZE as u64) as usize;
		let mut buf = vec![0u8; want];
		self.file.read_exact(&mut buf).await?;
		self.sent += want as u64;
		self.started = true;
		debug!(path = %self.path, sent = self.sent, size = self.size, "sent chunk");
		Ok(Some(Envelope::data(self.path.clone(), self.size, self.m_time, &buf)))
	}
}

/// One file being written to `<path>.downtemp` until its last chunk arrives,
/// then atomically renamed into place (spec §4.4).
///
/// `size` isn't known until the first `data` frame arrives -- the wire
/// `POST` content is `{path, isDir, mTime}` only (spec §6); `size` is
/// declared per-frame instead (spec §4.3, §8 invariant 6). The stream is
/// still opened on `POST`, per spec §4.4 ("On receiving a `POST` of a
/// regular file, open a `RecvStream`"), so a `data` frame for a path with no
/// preceding `POST` has nothing to attach to and is dropped rather than
/// starting a fresh write.
pub struct RecvStream {
	rel_path: String,
	full_path: PathBuf,
	downtemp_path: PathBuf,
	file: File,
	m_time: i64,
	size: Option<u64>,
	received: u64,
}

impl RecvStream {
	/// Begin receiving `rel_path`. Per spec §9's resolution of concurrent
	/// writers: if a `.downtemp` for this path already exists, the new
	/// transfer is rejected rather than silently clobbering the one in
	/// flight.
	pub async fn begin(root: &Path, rel_path: &str, m_time: i64) -> Result<RecvStream, TransferError> {
		let full_path = root.join(rel_path);
		let downtemp_path = downtemp_path(&full_path);
		if tokio::fs::metadata(&downtemp_path).await.is_ok() {
			return Err(TransferError::Io(std::io::Error::new(
				std::io::ErrorKind::AlreadyExists,
				format!("transfer already in progress for {}", rel_path),
			)));
		}
		if let Some(parent) = full_path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		let file = File::create(&downtemp_path).await?;
		Ok(RecvStream {
			rel_path: rel_path.to_string(),
			full_path,
			downtemp_path,
			file,
			m_time,
			size: None,
			received: 0,
		})
	}

	pub fn path(&self) -> &str {
		&self.rel_path
	}

	/// The mtime announced by the `POST` that opened this transfer, for
	/// callers that need to record it (e.g. the authoritative tree) once
	/// `finish()` has consumed `self`.
	pub fn m_time(&self) -> i64 {
		self.m_time
	}

	/// False until a `data` frame has declared this transfer's size, so a
	/// zero-byte file isn't considered complete before its one (empty) frame
	/// has actually arrived.
	pub fn is_complete(&self) -> bool {
		matches!(self.size, Some(size) if self.received >= size)
	}

	/// Write one incoming block at its declared offset. `size` is the total
	/// transfer size this frame declares; every frame for one transfer
	/// carries the same value, so only the first one is recorded. Blocks may
	/// in principle arrive for a size mismatch (a stale `POST`); that is
	/// detected here rather than trusted from the wire.
	pub async fn write_block(&mut self, size: u64, block: &[u8]) -> Result<(), TransferError> {
		self.size = Some(size);
		if self.received + block.len() as u64 > size {
			warn!(path = %self.rel_path, "data frame overruns announced size, truncating");
		}
		let offset = self.received;
		self.file.seek(SeekFrom::Start(offset)).await?;
		self.file.write_all(block).await?;
		self.received += block.len() as u64;
		Ok(())
	}

	/// Rename `.downtemp` into place and set its mtime to the value carried
	/// by the originating `POST`, mirroring local disk state onto what the
	/// tree model will record (spec §4.1/§4.4: mtime is only ever mutated on
	/// completion, never while a transfer is in flight).
	pub async fn finish(mut self) -> Result<PathBuf, TransferError> {
		self.file.flush().await?;
		tokio::fs::rename(&self.downtemp_path, &self.full_path).await?;
		let mtime = filetime_from_unix(self.m_time);
		let full_path = self.full_path.clone();
		tokio::task::spawn_blocking(move || filetime::set_file_mtime(&full_path, mtime))
			.await
			.map_err(|e| TransferError::Io(std::io::Error::other(e)))??;
		Ok(self.full_path)
	}
}

fn filetime_from_unix(seconds: i64) -> filetime::FileTime {
	filetime::FileTime::from_unix_time(seconds, 0)
}


// vim: ts=4
