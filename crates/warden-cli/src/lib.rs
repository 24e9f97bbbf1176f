//! warden-cli - client library for the warden remote command service
//!
//! Provides [`client::WardenClient`], which connects to a warden
//! daemon, performs the mutual authentication handshake, and runs
//! commands over the protected channel. The `warden` binary is a thin
//! wrapper over this library.

pub mod client;

pub use client::{ClientError, CommandReply, WardenClient};
