//! The closed command-code set (spec §4.3, §6).

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
	RequestInit = 0,
	RequestSyn = 1,
	InitEnd = 2,
	Get = 3,
	Post = 4,
	Delete = 5,
	Move = 6,
	Heartbeat = 7,
}

impl Command {
	/// Decode a raw command code. Values outside the closed `0..=7` set are
	/// not an error by themselves -- the caller logs and drops the frame
	/// (§4.3 "reserve values 0..7; other values are logged and ignored").
	pub fn from_code(code: i64) -> Option<Command> {
		match code {
			0 => Some(Command::RequestInit),
			1 => Some(Command::RequestSyn),
			2 => Some(Command::InitEnd),
			3 => Some(Command::Get),
			4 => Some(Command::Post),
			5 => Some(Command::Delete),
			6 => Some(Command::Move),
			7 => Some(Command::Heartbeat),
			_ => None,
		}
	}

	pub fn code(self) -> i64 {
		self as i64
	}
}

impl fmt::Display for Command {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Command::RequestInit => "REQUESTINIT",
			Command::RequestSyn => "REQUESTSYN",
			Command::InitEnd => "INITEND",
			Command::Get => "GET",
			Command::Post => "POST",
			Command::Delete => "DELETE",
			Command::Move => "MOVE",
			Command::Heartbeat => "HEARTBEAT",
		};
		write!(f, "{}", name)
	}
}


// vim: ts=4
