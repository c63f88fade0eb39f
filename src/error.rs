//! Error types for the sync engine.

use std::fmt;
use std::io;

/// Top-level error for anything the engines can fail at.
#[derive(Debug)]
pub enum SyncError {
	/// I/O error talking to the filesystem or the socket.
	Io(io::Error),

	/// A frame's JSON payload didn't parse, or didn't match the shape the
	/// command code implied.
	Protocol(String),

	/// `.syn_config.json` was missing a field or had the wrong type.
	Config { message: String },

	/// A node the code expected to exist (e.g. the parent of a path being
	/// added) was missing. Per spec this is treated as a bug: log it, abort
	/// handling of the one event that triggered it, and do not retry.
	InvariantBreach { message: String },
}

impl fmt::Display for SyncError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SyncError::Io(e) => write!(f, "I/O error: {}", e),
			SyncError::Protocol(message) => write!(f, "protocol error: {}", message),
			SyncError::Config { message } => write!(f, "config error: {}", message),
			SyncError::InvariantBreach { message } => write!(f, "invariant breach: {}", message),
		}
	}
}

impl std::error::Error for SyncError {}

impl From<io::Error> for SyncError {
	fn from(e: io::Error) -> Self {
		SyncError::Io(e)
	}
}

impl From<serde_json::Error> for SyncError {
	fn from(e: serde_json::Error) -> Self {
		SyncError::Protocol(e.to_string())
	}
}

/// Errors specific to one in-flight file transfer.
///
/// Kept separate from `SyncError` because a transfer failure must only ever
/// abort the one stream it belongs to (§7 "transient filesystem"); it must
/// never propagate to the connection or the scheduler.
#[derive(Debug)]
pub enum TransferError {
	Io(io::Error),
	UnknownPath { path: String },
}

impl fmt::Display for TransferError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TransferError::Io(e) => write!(f, "transfer I/O error: {}", e),
			TransferError::UnknownPath { path } => {
				write!(f, "data frame for unknown path: {}", path)
			}
		}
	}
}

impl std::error::Error for TransferError {}

impl From<io::Error> for TransferError {
	fn from(e: io::Error) -> Self {
		TransferError::Io(e)
	}
}

// vim: ts=4
