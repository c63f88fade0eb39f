//! # syncd -- hub-and-spoke filesystem synchronizer
//!
//! A central server holds the authoritative copy of a directory tree; any
//! number of client devices mirror it, converging shortly after either side
//! changes. Clients never talk to each other directly -- every change
//! passes through the server, which fans it out to (or logs it for) every
//! other registered device.
//!
//! ## Quick start
//!
//! ```bash
//! syncd server 9000 ./shared
//! syncd client host.example.com 9000 ./shared
//! ```

#![deny(unsafe_code)]
#![warn(dead_code)]

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod settle;
pub mod transfer;
pub mod tree;

pub use error::{SyncError, TransferError};

// vim: ts=4
