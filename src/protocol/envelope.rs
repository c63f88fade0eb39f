//! JSON envelope schema (spec §4.3).
//!
//! Two envelope shapes travel over the same length-prefixed channel,
//! distinguished by `type`: `"command"` carries one of the eight closed
//! commands (§6), `"data"` carries one base64 block of a file being
//! streamed (§4.4).

use super::command::Command;
use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
	Command { command: i64, content: Value },
	Data {
		path: String,
		size: u64,
		#[serde(rename = "mTime")]
		m_time: i64,
		content: String,
	},
}

/// A decoded, typed command payload. `Envelope::Command.content` is a bare
/// `serde_json::Value` on the wire because its shape depends on the command
/// code; this is what it decodes to once that code is known.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandContent {
	RequestInit { device_id: u32 },
	RequestSyn { tree: Value },
	InitEnd { device_id: u32 },
	Get { path: String },
	Post { path: String, is_dir: bool, m_time: i64 },
	Delete { path: String },
	Move { source: String, target: String },
	Heartbeat { send_time: i64 },
}

#[derive(Serialize, Deserialize)]
struct GetContent {
	path: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostContent {
	path: String,
	is_dir: bool,
	#[serde(rename = "mTime")]
	m_time: i64,
}

#[derive(Serialize, Deserialize)]
struct MoveContent {
	source: String,
	target: String,
}

#[derive(Serialize, Deserialize)]
struct HeartbeatContent {
	#[serde(rename = "sendTime")]
	send_time: i64,
}

impl CommandContent {
	pub fn command(&self) -> Command {
		match self {
			CommandContent::RequestInit { .. } => Command::RequestInit,
			CommandContent::RequestSyn { .. } => Command::RequestSyn,
			CommandContent::InitEnd { .. } => Command::InitEnd,
			CommandContent::Get { .. } => Command::Get,
			CommandContent::Post { .. } => Command::Post,
			CommandContent::Delete { .. } => Command::Delete,
			CommandContent::Move { .. } => Command::Move,
			CommandContent::Heartbeat { .. } => Command::Heartbeat,
		}
	}

	fn to_value(&self) -> Value {
		match self {
			CommandContent::RequestInit { device_id } => Value::from(*device_id),
			CommandContent::RequestSyn { tree } => tree.clone(),
			CommandContent::InitEnd { device_id } => Value::from(*device_id),
			CommandContent::Get { path } => {
				serde_json::to_value(GetContent { path: path.clone() }).expect("GetContent serializes")
			}
			CommandContent::Post { path, is_dir, m_time } => serde_json::to_value(PostContent {
				path: path.clone(),
				is_dir: *is_dir,
				m_time: *m_time,
			})
			.expect("PostContent serializes"),
			CommandContent::Delete { path } => Value::from(path.clone()),
			CommandContent::Move { source, target } => serde_json::to_value(MoveContent {
				source: source.clone(),
				target: target.clone(),
			})
			.expect("MoveContent serializes"),
			CommandContent::Heartbeat { send_time } => {
				serde_json::to_value(HeartbeatContent { send_time: *send_time })
					.expect("HeartbeatContent serializes")
			}
		}
	}

	/// Decode `content` according to the already-known command code.
	pub fn decode(command: Command, content: Value) -> Result<CommandContent, SyncError> {
		let err = |e: serde_json::Error| SyncError::Protocol(format!("{}: {}", command, e));
		Ok(match command {
			Command::RequestInit => {
				let device_id = content.as_u64().ok_or_else(|| {
					SyncError::Protocol("REQUESTINIT content must be an integer".to_string())
				})? as u32;
				CommandContent::RequestInit { device_id }
			}
			Command::RequestSyn => CommandContent::RequestSyn { tree: content },
			Command::InitEnd => {
				let device_id = content.as_u64().ok_or_else(|| {
					SyncError::Protocol("INITEND content must be an integer".to_string())
				})? as u32;
				CommandContent::InitEnd { device_id }
			}
			Command::Get => {
				let c: GetContent = serde_json::from_value(content).map_err(err)?;
				CommandContent::Get { path: c.path }
			}
			Command::Post => {
				let c: PostContent = serde_json::from_value(content).map_err(err)?;
				CommandContent::Post { path: c.path, is_dir: c.is_dir, m_time: c.m_time }
			}
			Command::Delete => {
				let path = content
					.as_str()
					.ok_or_else(|| SyncError::Protocol("DELETE content must be a string".to_string()))?
					.to_string();
				CommandContent::Delete { path }
			}
			Command::Move => {
				let c: MoveContent = serde_json::from_value(content).map_err(err)?;
				CommandContent::Move { source: c.source, target: c.target }
			}
			Command::Heartbeat => {
				let c: HeartbeatContent = serde_json::from_value(content).map_err(err)?;
				CommandContent::Heartbeat { send_time: c.send_time }
			}
		})
	}
}

impl Envelope {
	pub fn command(content: CommandContent) -> Envelope {
		Envelope::Command { command: content.command().code(), content: content.to_value() }
	}

	pub fn data(path: impl Into<String>, size: u64, m_time: i64, block: &[u8]) -> Envelope {
		use base64::Engine;
		Envelope::Data {
			path: path.into(),
			size,
			m_time,
			content: base64::engine::general_purpose::STANDARD.encode(block),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn post_content_round_trips_with_camel_case_wire_names() {
		let env = Envelope::command(CommandContent::Post {
			path: "a/b.txt".to_string(),
			is_dir: false,
			m_time: 1234,
		});
		let json = serde_json::to_string(&env).unwrap();
		assert!(json.contains("\"isDir\":false"));
		assert!(json.contains("\"mTime\":1234"));

		let decoded: Envelope = serde_json::from_str(&json).unwrap();
		match decoded {
			Envelope::Command { command, content } => {
				assert_eq!(command, Command::Post.code());
				let parsed = CommandContent::decode(Command::Post, content).unwrap();
				assert_eq!(
					parsed,
					CommandContent::Post {
						path: "a/b.txt".to_string(),
						is_dir: false,
						m_time: 1234
					}
				);
			}
			_ => panic!("expected a command envelope"),
		}
	}

	#[test]
	fn delete_content_is_a_bare_path_string() {
		let env = Envelope::command(CommandContent::Delete { path: "x".to_string() });
		let json = serde_json::to_string(&env).unwrap();
		assert!(json.contains("\"content\":\"x\""));
	}

	#[test]
	fn data_frame_base64_encodes_the_block() {
		let env = Envelope::data("a.txt", 5, 0, b"hello");
		match env {
			Envelope::Data { content, .. } => assert_eq!(content, "aGVsbG8="),
			_ => panic!("expected a data envelope"),
		}
	}

	#[test]
	fn unknown_command_code_is_not_a_parse_error() {
		let env = Envelope::Command { command: 99, content: Value::Null };
		match env {
			Envelope::Command { command, .. } => assert!(Command::from_code(command).is_none()),
			_ => unreachable!(),
		}
	}
}

// vim: ts=4
