//! Per-connection transfer bookkeeping (spec §4.4, §7).
//!
//! One `ConnectionContext` lives as long as the socket it belongs to.
//! Outbound files queue up FIFO -- the original only ever streams one file
//! at a time per connection, finishing it before starting the next, so a
//! plain `VecDeque` models that queue exactly. Inbound files are instead
//! keyed by path, because `data` frames for several paths can arrive
//! interleaved from a peer that itself has more than one send in flight.

use crate::transfer::{RecvStream, SendStream};
use std::collections::{HashMap, VecDeque};

#[derive(Default)]
pub struct ConnectionContext {
	outbound: VecDeque<SendStream>,
	inbound: HashMap<String, RecvStream>,
}

impl ConnectionContext {
	pub fn new() -> ConnectionContext {
		ConnectionContext::default()
	}

	pub fn queue_send(&mut self, stream: SendStream) {
		self.outbound.push_back(stream);
	}

	pub fn current_send(&mut self) -> Option<&mut SendStream> {
		self.outbound.front_mut()
	}

	/// Drop the head of the outbound queue once it has sent its last chunk.
	pub fn pop_finished_send(&mut self) {
		if self.outbound.front().map(SendStream::is_done).unwrap_or(false) {
			self.outbound.pop_front();
		}
	}

	pub fn has_pending_sends(&self) -> bool {
		!self.outbound.is_empty()
	}

	pub fn begin_recv(&mut self, path: String, stream: RecvStream) {
		self.inbound.insert(path, stream);
	}

	pub fn recv_mut(&mut self, path: &str) -> Option<&mut RecvStream> {
		self.inbound.get_mut(path)
	}

	pub fn take_recv(&mut self, path: &str) -> Option<RecvStream> {
		self.inbound.remove(path)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	#[tokio::test]
	async fn outbound_queue_is_fifo_and_drains_on_completion() {
		let dir = tempdir().unwrap();
		tokio::fs::write(dir.path().join("a.txt"), b"a").await.unwrap();
		tokio::fs::write(dir.path().join("b.txt"), b"b").await.unwrap();

		let mut ctx = ConnectionContext::new();
		ctx.queue_send(SendStream::open(dir.path(), "a.txt", 0).await.unwrap());
		ctx.queue_send(SendStream::open(dir.path(), "b.txt", 0).await.unwrap());

		assert_eq!(ctx.current_send().unwrap().path(), "a.txt");
		ctx.current_send().unwrap().next_frame().await.unwrap();
		ctx.pop_finished_send();
		assert_eq!(ctx.current_send().unwrap().path(), "b.txt");
	}

	#[tokio::test]
	async fn inbound_transfers_are_keyed_by_path() {
		let dir = tempdir().unwrap();
		let mut ctx = ConnectionContext::new();
		ctx.begin_recv("a.txt".to_string(), RecvStream::begin(dir.path(), "a.txt", 0).await.unwrap());
		assert!(ctx.recv_mut("a.txt").is_some());
		assert!(ctx.recv_mut("b.txt").is_none());
		assert!(ctx.take_recv("a.txt").is_some());
		assert!(ctx.recv_mut("a.txt").is_none());
	}
}

// vim: ts=4
