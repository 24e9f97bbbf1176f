//! warden-daemon - authenticated remote command execution daemon
//!
//! This library provides the server side of the warden protocol: each
//! client connection is driven by a per-connection session state machine
//! that establishes a security context, authorizes every command request
//! against the loaded policy, supervises the resulting child process,
//! and relays its output and exit status back over the protected
//! channel.
//!
//! # Modules
//!
//! - [`acl`]: access control engine evaluating rules against requests
//! - [`config`]: TOML daemon configuration and policy construction
//! - [`executor`]: child process supervision and output relay
//! - [`server`]: accept loop and connection limits
//! - [`session`]: per-connection state machine
//!
//! # Concurrency Model
//!
//! All I/O is readiness-driven through the async runtime: sessions are
//! tasks, not threads, and suspend by returning control to the reactor
//! at every read, write, and child-process event. The `wardend` binary
//! runs the whole daemon on a current-thread runtime; the loaded policy
//! and keyring are immutable snapshots shared read-only across sessions.

pub mod acl;
pub mod config;
pub mod executor;
pub mod server;
pub mod session;
