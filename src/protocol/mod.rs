//! Wire protocol: command table (§6) and the JSON envelope schema (§4.3).
//!
//! The protocol layer only describes *shapes*; putting bytes on the wire is
//! `crate::codec`'s job, layered on top of `tokio_util`'s length-delimited
//! framing (the external byte-framing codec named in §1).

pub mod command;
pub mod envelope;

pub use command::Command;
pub use envelope::{CommandContent, Envelope};

// vim: ts=4
