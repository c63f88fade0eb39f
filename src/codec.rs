//! Frame codec: length-prefixed bytes (external collaborator, §1) carrying
//! one JSON `Envelope` (§4.3) per frame.
//!
//! The framing itself -- a 32-bit big-endian length header followed by that
//! many bytes of payload -- is `tokio_util::codec::LengthDelimitedCodec`'s
//! job; this module only teaches it the envelope's ceiling and layers JSON
//! (de)serialization on top, the way a `tokio_util::codec::Framed` stream
//! is meant to be composed.

use crate::error::SyncError;
use crate::protocol::Envelope;
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// 64 KiB plaintext blocks, base64 expansion (~4/3) plus JSON/envelope
/// overhead comfortably fit well inside 256 KiB; round up generously so a
/// legitimate final short chunk is never the thing that trips the ceiling.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

pub struct EnvelopeCodec {
	inner: LengthDelimitedCodec,
}

impl Default for EnvelopeCodec {
	fn default() -> Self {
		EnvelopeCodec {
			inner: LengthDelimitedCodec::builder()
				.max_frame_length(MAX_FRAME_LEN)
				.big_endian()
				.length_field_length(4)
				.new_codec(),
		}
	}
}

impl Decoder for EnvelopeCodec {
	type Item = Envelope;
	type Error = SyncError;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, SyncError> {
		match self.inner.decode(src).map_err(SyncError::Io)? {
			Some(frame) => {
				let envelope: Envelope = serde_json::from_slice(&frame)?;
				Ok(Some(envelope))
			}
			None => Ok(None),
		}
	}
}

impl Encoder<Envelope> for EnvelopeCodec {
	type Error = SyncError;

	fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), SyncError> {
		let json = serde_json::to_vec(&item)?;
		self.inner.encode(Bytes::from(json), dst).map_err(SyncError::Io)
	}
}


// vim: ts=4
