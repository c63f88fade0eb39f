//! Tracing setup shared by the `server` and `client` subcommands.
//!
//! ```bash
//! RUST_LOG=debug syncd server 9000 ./shared
//! RUST_LOG=syncd::server=trace,syncd::client=debug syncd client host 9000 ./shared
//! ```

use std::path::Path;

pub use tracing::{debug, error, info, trace, warn};

/// Guard returned by the file-log path; keep it alive for the process
/// lifetime or the background writer thread is dropped and logs stop.
pub struct LogGuard(#[allow(dead_code)] Option<tracing_appender::non_blocking::WorkerGuard>);

fn env_filter() -> tracing_subscriber::EnvFilter {
	tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Initialize the global tracing subscriber.
///
/// `file_log_dir` is `Some(dir)` when the CLI's `--file-log` flag (spec's
/// `[filelog]` positional) is set: logs then go to a non-blocking rolling
/// file appender under `dir` instead of stderr.
pub fn init_tracing(file_log_dir: Option<&Path>) -> LogGuard {
	match file_log_dir {
		None => {
			tracing_subscriber::fmt()
				.with_env_filter(env_filter())
				.with_writer(std::io::stderr)
				.init();
			LogGuard(None)
		}
		Some(dir) => {
			let file_appender = tracing_appender::rolling::daily(dir, "syncd.log");
			let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
			tracing_subscriber::fmt()
				.with_env_filter(env_filter())
				.with_ansi(false)
				.with_writer(non_blocking)
				.init();
			LogGuard(Some(guard))
		}
	}
}

// vim: ts=4
