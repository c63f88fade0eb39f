//! Debounce filesystem writes before treating them as finished (spec §4.2,
//! §9): a file is only announced once no further write has touched it for
//! `window` -- otherwise every intermediate `write()` a program makes while
//! saving a file would race off a separate, truncated transfer.
//!
//! Both the client and server watch loops run one of these over their own
//! tree; a rename or delete of a path still pending settlement cancels it
//! rather than letting a stale announcement follow.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub struct SettleQueue {
	window: Duration,
	pending: HashMap<PathBuf, Instant>,
}

impl SettleQueue {
	pub fn new(window: Duration) -> SettleQueue {
		SettleQueue { window, pending: HashMap::new() }
	}

	pub fn touch(&mut self, path: PathBuf) {
		self.pending.insert(path, Instant::now());
	}

	pub fn forget(&mut self, path: &Path) {
		self.pending.remove(path);
	}

	pub fn is_empty(&self) -> bool {
		self.pending.is_empty()
	}

	/// Earliest instant at which something in the queue could be ready,
	/// for sizing a `tokio::time::sleep` alongside other event sources.
	pub fn next_deadline(&self) -> Option<Instant> {
		self.pending.values().min().map(|&at| at + self.window)
	}

	/// Remove and return every path idle for at least `window`.
	pub fn drain_settled(&mut self) -> Vec<PathBuf> {
		let now = Instant::now();
		let window = self.window;
		let settled: Vec<PathBuf> = self
			.pending
			.iter()
			.filter(|(_, &at)| now.duration_since(at) >= window)
			.map(|(path, _)| path.clone())
			.collect();
		for path in &settled {
			self.pending.remove(path);
		}
		settled
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::thread::sleep;

	#[test]
	fn paths_settle_only_after_the_window_elapses() {
		let mut queue = SettleQueue::new(Duration::from_millis(20));
		queue.touch(PathBuf::from("a.txt"));
		assert!(queue.drain_settled().is_empty());
		sleep(Duration::from_millis(30));
		assert_eq!(queue.drain_settled(), vec![PathBuf::from("a.txt")]);
	}

	#[test]
	fn forgetting_a_path_cancels_its_pending_settlement() {
		let mut queue = SettleQueue::new(Duration::from_millis(10));
		queue.touch(PathBuf::from("a.txt"));
		queue.forget(Path::new("a.txt"));
		sleep(Duration::from_millis(15));
		assert!(queue.drain_settled().is_empty());
	}
}

// vim: ts=4
