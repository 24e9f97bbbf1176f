//! Protocol error types and wire limits.
//!
//! This module provides structured error types for protocol-level
//! failures, enabling callers to distinguish between failure modes, plus
//! the size limits enforced by the codec.
//!
//! # Error Hierarchy
//!
//! - [`ProtocolError`]: top-level error for all protocol operations
//! - Variants cover framing, message decoding, and I/O failures
//!
//! # Security Considerations
//!
//! Size limits exist to bound the memory a hostile or broken peer can
//! make the server allocate. They are checked against the length prefix
//! before any payload allocation happens.

use std::io;

use thiserror::Error;

/// Maximum token size in bytes (1 MiB).
///
/// Tokens are capped to prevent memory exhaustion attacks; the length
/// prefix is validated against this bound before allocation.
pub const MAX_TOKEN_SIZE: usize = 1024 * 1024;

/// Maximum handshake token size in bytes (64 KiB).
///
/// Handshake tokens have a stricter limit than data tokens so that an
/// unauthenticated peer cannot consume significant memory or parsing CPU
/// before completing authentication.
pub const MAX_HANDSHAKE_TOKEN_SIZE: usize = 64 * 1024;

/// Maximum number of arguments in a single command.
pub const MAX_COMMAND_ARGS: usize = 4 * 1024;

/// Maximum size of a command message payload (64 KiB).
pub const MAX_COMMAND_DATA: usize = 64 * 1024;

/// Maximum data payload of a single OUTPUT message.
///
/// Sized so that an OUTPUT message (version, type, stream, and length
/// header) fits within one command-sized token.
pub const MAX_OUTPUT_DATA: usize = MAX_COMMAND_DATA - 1 - 1 - 1 - 4;

/// Maximum aggregated output a version 1 reply can carry.
///
/// The legacy reply prefixes the data with a 4-byte status and 4-byte
/// length; output beyond this bound is discarded, matching the protocol
/// generation's single-reply semantics.
pub const V1_MAX_OUTPUT: usize = MAX_COMMAND_DATA - 4 - 4;

/// Protocol errors for framing and message decoding.
///
/// # Error Classification
///
/// - **Framing errors**: hostile or corrupt token envelopes
/// - **Decoding errors**: structurally invalid inner messages
/// - **Connection errors**: I/O and connection lifecycle issues
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Token exceeds the maximum allowed size.
    ///
    /// Detected from the length prefix BEFORE allocation.
    #[error("token too large: {size} bytes exceeds maximum {max} bytes")]
    TokenTooLarge {
        /// Actual size from the length prefix.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Token or message structure is invalid.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// Description of the framing error.
        reason: String,
    },

    /// The stream ended in the middle of a token.
    #[error("truncated token: {remaining} trailing bytes at end of stream")]
    Truncated {
        /// Bytes left in the buffer when the stream ended.
        remaining: usize,
    },

    /// Inner message carries an unsupported protocol version byte.
    #[error("unsupported protocol version {version}")]
    UnsupportedVersion {
        /// Version byte observed on the wire.
        version: u8,
    },

    /// Inner message carries an unknown message type.
    #[error("unknown message type {value}")]
    UnknownMessageType {
        /// Type byte observed on the wire.
        value: u8,
    },

    /// Command carries more arguments than the server accepts.
    #[error("too many arguments: {count} exceeds maximum {max}")]
    TooManyArguments {
        /// Claimed argument count.
        count: usize,
        /// Maximum allowed argument count.
        max: usize,
    },

    /// Command payload is structurally invalid.
    #[error("invalid command: {reason}")]
    InvalidCommand {
        /// Description of the problem.
        reason: String,
    },

    /// Underlying I/O error from the transport.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Create an invalid-frame error.
    #[must_use]
    pub fn invalid_frame(reason: impl Into<String>) -> Self {
        Self::InvalidFrame {
            reason: reason.into(),
        }
    }

    /// Create an invalid-command error.
    #[must_use]
    pub fn invalid_command(reason: impl Into<String>) -> Self {
        Self::InvalidCommand {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error indicates a protocol violation.
    ///
    /// Protocol violations indicate a broken or hostile peer; the
    /// connection should be terminated after notifying the peer if the
    /// channel can still carry a message.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::TokenTooLarge { .. }
                | Self::InvalidFrame { .. }
                | Self::Truncated { .. }
                | Self::UnsupportedVersion { .. }
        )
    }

    /// Returns `true` if the command cycle can continue on an
    /// established connection after this error is reported to the peer.
    ///
    /// Malformed commands are rejected with an error message but do not
    /// force the connection closed; envelope-level corruption does.
    #[must_use]
    pub const fn is_command_rejection(&self) -> bool {
        matches!(
            self,
            Self::UnknownMessageType { .. }
                | Self::TooManyArguments { .. }
                | Self::InvalidCommand { .. }
        )
    }
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
