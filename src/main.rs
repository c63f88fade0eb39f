use clap::{Parser, Subcommand};
use std::path::PathBuf;
use syncd::logging;

#[derive(Parser)]
#[command(name = "syncd", version, author, about = "Hub-and-spoke filesystem synchronizer")]
struct Cli {
	#[command(subcommand)]
	command: Mode,

	/// Write logs to a daily-rolling file under this directory instead of stderr.
	#[arg(long = "file-log", global = true, value_name = "DIR")]
	file_log: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Mode {
	/// Run as the authoritative server.
	Server {
		port: u16,
		dir: PathBuf,
	},
	/// Run as a client device syncing against a server.
	Client {
		host: String,
		port: u16,
		dir: PathBuf,
	},
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let cli = Cli::parse();
	let _guard = logging::init_tracing(cli.file_log.as_deref());

	match cli.command {
		Mode::Server { port, dir } => syncd::server::run(port, dir).await?,
		Mode::Client { host, port, dir } => syncd::client::run(host, port, dir).await?,
	}
	Ok(())
}

// vim: ts=4
