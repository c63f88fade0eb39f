//! Client side: connect-with-retry, handshake, and the live watch/sync loop
//! against a single server (spec §4.2, §4.6).

pub mod engine;

pub use engine::run;

// vim: ts=4
