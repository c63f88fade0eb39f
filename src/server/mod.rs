//! Server side: accept loop, per-connection handshake and live sync, the
//! delete trash, and the offline operation log (spec §4.7).

pub mod connection;
pub mod engine;
pub mod oplog;
pub mod shared;
pub mod trash;

pub use engine::{run, serve};

// vim: ts=4
