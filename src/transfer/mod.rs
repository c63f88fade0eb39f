//! File transfer: chunked streaming over the envelope channel (spec §4.4).

pub mod context;
pub mod stream;

pub use context::ConnectionContext;
pub use stream::{RecvStream, SendStream, CHUNK_SIZE};

// vim: ts=4
