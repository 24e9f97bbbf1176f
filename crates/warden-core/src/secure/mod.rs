//! Security context layer.
//!
//! This module establishes and operates the per-connection security
//! association: a mutual challenge/response handshake over preshared
//! keys, followed by wrap/unwrap protection of every protocol message.
//!
//! # Handshake Sequence
//!
//! ```text
//! Client                                         Server
//!   |                                               |
//!   |  -- ClientHello { version, principal,         |
//!   |                   client_nonce, protection }->|
//!   |                                               |
//!   |  <-- ServerChallenge { server_nonce } --------|
//!   |                                               |
//!   |  -- ClientProof { proof } ------------------->|
//!   |                                               |
//!   |  <-- ServerProof { proof } -------------------|
//!   |      OR                                       |
//!   |  <-- Reject { code, message } ----------------|
//!   |                                               |
//! ```
//!
//! Both proofs are HMAC-SHA256 over the two nonces under the principal's
//! preshared key, with distinct domain labels per direction; the server
//! proof gives the client mutual assurance. Directional session keys are
//! derived from the same material, so a completed handshake yields a
//! [`SecureChannel`] on each side.
//!
//! # Module Overview
//!
//! - [`handshake`]: handshake envelopes and the server/client state
//!   machines with the three-outcome step result
//! - [`channel`]: established channel with wrap/unwrap and sequence
//!   number enforcement
//! - [`keyring`]: preshared key storage
//!
//! # Security Considerations
//!
//! - Proof verification is constant-time
//! - An unknown principal is carried through the handshake against a
//!   decoy key so the rejection does not reveal which check failed
//! - Handshake failures never yield partial trust; the connection is
//!   closed after an optional Reject envelope
//! - Post-establishment wrap/unwrap failures are protocol violations

pub mod channel;
pub mod handshake;
pub mod keyring;

use thiserror::Error;

pub use channel::{ProtectionLevel, SecureChannel};
pub use handshake::{
    ClientHandshake, ClientStep, HandshakeMessage, HandshakeStep, RejectCode, ServerHandshake,
    parse_handshake_message, reject_for, serialize_handshake_message,
};
pub use keyring::{KEY_LEN, Keyring, KeyringError, SecretKey};

/// Errors from security context establishment and channel protection.
#[derive(Debug, Error)]
pub enum SecurityError {
    /// Token or envelope could not be parsed.
    #[error("malformed security token: {reason}")]
    MalformedToken {
        /// Description of the parse failure.
        reason: String,
    },

    /// Peer requested a protocol generation this side does not speak.
    #[error("unsupported protocol version {requested}")]
    UnsupportedVersion {
        /// Version requested by the peer.
        requested: u8,
    },

    /// Authentication failed.
    ///
    /// Deliberately indistinct between an unknown principal and a bad
    /// proof so a probing peer learns nothing from the failure mode.
    #[error("access denied")]
    AccessDenied,

    /// The peer rejected our handshake.
    #[error("handshake rejected ({code}): {message}")]
    Rejected {
        /// Reason code from the Reject envelope.
        code: RejectCode,
        /// Human-readable message from the peer.
        message: String,
    },

    /// Handshake message arrived out of sequence.
    #[error("unexpected handshake message: {reason}")]
    UnexpectedMessage {
        /// What was received versus expected.
        reason: String,
    },

    /// A wrapped token failed integrity verification.
    #[error("token failed integrity verification")]
    IntegrityFailure,

    /// A wrapped token arrived out of sequence (replay or reorder).
    #[error("token sequence mismatch: expected {expected}, got {got}")]
    SequenceMismatch {
        /// Sequence number this side expected next.
        expected: u64,
        /// Sequence number carried by the token.
        got: u64,
    },

    /// The security context can no longer protect traffic.
    #[error("security context expired")]
    ContextExpired,
}

impl SecurityError {
    /// Create a malformed-token error.
    #[must_use]
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedToken {
            reason: reason.into(),
        }
    }

    /// Create an unexpected-message error.
    #[must_use]
    pub fn unexpected(reason: impl Into<String>) -> Self {
        Self::UnexpectedMessage {
            reason: reason.into(),
        }
    }

    /// Returns `true` for failures of an established channel.
    ///
    /// These are protocol violations: the connection is closed without
    /// attempting further traffic, since the channel itself is suspect.
    #[must_use]
    pub const fn is_channel_failure(&self) -> bool {
        matches!(
            self,
            Self::IntegrityFailure | Self::SequenceMismatch { .. } | Self::ContextExpired
        )
    }
}

/// Result type for security operations.
pub type SecurityResult<T> = Result<T, SecurityError>;
