//! Wire protocol and framing.
//!
//! This module implements the warden wire protocol: an outer token
//! envelope carried over the transport, and the inner protocol messages
//! exchanged once a security context protects the connection.
//!
//! # Architecture
//!
//! The protocol stack is organized in layers:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Protocol Messages                │  COMMAND/OUTPUT/STATUS/...
//! ├─────────────────────────────────────────┤
//! │         Security Context                 │  wrap/unwrap (secure)
//! ├─────────────────────────────────────────┤
//! │         Token Framing                    │  [flags][length][payload]
//! ├─────────────────────────────────────────┤
//! │         TCP Transport                    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Module Overview
//!
//! - [`error`]: protocol error types ([`ProtocolError`], [`ProtocolResult`])
//! - [`framing`]: re-entrant length-prefixed token codec ([`TokenCodec`])
//! - [`messages`]: protocol message types and per-generation encoding
//!
//! # Wire Format
//!
//! Every token on the wire is length-prefixed:
//!
//! ```text
//! +-----------+----------------------+------------------+
//! | Flags (1) | Length (4 bytes, BE) | Payload          |
//! +-----------+----------------------+------------------+
//! ```
//!
//! Context tokens carry plaintext handshake envelopes; data tokens carry
//! payloads produced by the security context's `wrap`. Two protocol
//! generations exist for the inner messages: version 1 is the legacy
//! single-command form with one aggregated reply, version 2 multiplexes
//! streamed output and supports multiple sequential commands per
//! connection. The generation is fixed by the first client handshake
//! message and never changes for the connection's lifetime.
//!
//! # Security Considerations
//!
//! - Token length is validated BEFORE allocation (prevents memory
//!   exhaustion from hostile length prefixes)
//! - Handshake tokens have a stricter size limit than data tokens
//! - Argument counts and sizes are bounded during command decoding

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{
    MAX_COMMAND_ARGS, MAX_COMMAND_DATA, MAX_HANDSHAKE_TOKEN_SIZE, MAX_OUTPUT_DATA, MAX_TOKEN_SIZE,
    ProtocolError, ProtocolResult, V1_MAX_OUTPUT,
};
pub use framing::{Token, TokenCodec, TokenKind};
pub use messages::{
    AggregateReply, ErrorCode, Message, ProtocolVersion, StreamId, decode_command_v1,
    encode_command_v1,
};
