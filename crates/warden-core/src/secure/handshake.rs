//! Security context handshake.
//!
//! This module implements the mutual challenge/response handshake that
//! establishes a [`SecureChannel`] between client and server. Handshake
//! envelopes travel as JSON inside context tokens; everything after the
//! handshake is binary and wrapped.
//!
//! Both state machines expose an explicit three-outcome step result:
//! a step either yields a continuation token (`NeedMore`/`Send`),
//! completes the context (`Ready`), or fails. The session loop keeps
//! stepping until one of the terminal outcomes; there is no hidden
//! retry.
//!
//! # Version Negotiation
//!
//! The `ClientHello` is the first client message and fixes the protocol
//! generation for the connection's lifetime. The server rejects
//! generations it does not speak with a `Reject { unsupported_version }`
//! envelope carrying its own supported generation.
//!
//! # Security Considerations
//!
//! - Handshake envelopes are size-capped before parsing
//! - Unknown JSON fields are rejected (`deny_unknown_fields`)
//! - An unknown principal proceeds against a decoy key and fails at the
//!   proof step with the same generic rejection as a wrong key
//! - Proofs are verified in constant time

use bytes::Bytes;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::{Choice, ConstantTimeEq};
use tracing::debug;

use crate::protocol::error::MAX_HANDSHAKE_TOKEN_SIZE;
use crate::protocol::messages::ProtocolVersion;

use super::channel::{ProtectionLevel, Role, SecureChannel};
use super::keyring::{Keyring, SecretKey};
use super::{SecurityError, SecurityResult};

type HmacSha256 = Hmac<Sha256>;

/// Length of handshake nonces in bytes.
pub const NONCE_LEN: usize = 32;

/// Client's opening envelope.
///
/// The first message on every connection; fixes the protocol generation
/// and names the principal to authenticate as.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ClientHello {
    /// Protocol generation requested for this connection.
    pub protocol_version: u8,

    /// Principal name the client claims; proven by the later proof.
    pub principal: String,

    /// Hex-encoded client nonce.
    pub client_nonce: String,

    /// Requested protection level for the established channel.
    #[serde(default)]
    pub protection: ProtectionLevel,
}

/// Server's challenge in response to a hello.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServerChallenge {
    /// Hex-encoded server nonce.
    pub server_nonce: String,
}

/// Client's proof of key possession.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ClientProof {
    /// Hex-encoded HMAC over both nonces under the preshared key.
    pub proof: String,
}

/// Server's proof of key possession, completing mutual authentication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServerProof {
    /// Hex-encoded HMAC over both nonces under the preshared key.
    pub proof: String,
}

/// Handshake rejection; the connection closes after this envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Reject {
    /// Reason code for the rejection.
    pub code: RejectCode,

    /// Human-readable error message.
    pub message: String,

    /// Server's supported protocol generation, for version mismatches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<u8>,
}

/// Reason codes for handshake rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    /// Requested protocol generation is not supported.
    UnsupportedVersion,

    /// Authentication failed (unknown principal or bad proof).
    AccessDenied,

    /// Envelope was structurally invalid.
    Malformed,
}

impl std::fmt::Display for RejectCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedVersion => write!(f, "unsupported_version"),
            Self::AccessDenied => write!(f, "access_denied"),
            Self::Malformed => write!(f, "malformed"),
        }
    }
}

/// Handshake envelope, tagged for serialization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeMessage {
    /// Client hello.
    ClientHello(ClientHello),
    /// Server challenge.
    ServerChallenge(ServerChallenge),
    /// Client proof.
    ClientProof(ClientProof),
    /// Server proof.
    ServerProof(ServerProof),
    /// Rejection.
    Reject(Reject),
}

/// Parses a handshake envelope from raw token payload.
///
/// # Errors
///
/// Returns `MalformedToken` if the payload exceeds the handshake size
/// limit or does not parse as a known envelope.
pub fn parse_handshake_message(payload: &[u8]) -> SecurityResult<HandshakeMessage> {
    if payload.len() > MAX_HANDSHAKE_TOKEN_SIZE {
        return Err(SecurityError::malformed("handshake token too large"));
    }
    serde_json::from_slice(payload)
        .map_err(|e| SecurityError::malformed(format!("invalid handshake envelope: {e}")))
}

/// Serializes a handshake envelope to token payload bytes.
///
/// # Errors
///
/// Returns `MalformedToken` if serialization fails.
pub fn serialize_handshake_message(message: &HandshakeMessage) -> SecurityResult<Bytes> {
    serde_json::to_vec(message)
        .map(Bytes::from)
        .map_err(|e| SecurityError::malformed(format!("cannot serialize envelope: {e}")))
}

/// Builds the Reject envelope a server should send for an error, if the
/// error warrants notifying the peer at all.
///
/// Channel failures return `None`: once the context itself is suspect,
/// nothing further is sent.
#[must_use]
pub fn reject_for(error: &SecurityError) -> Option<HandshakeMessage> {
    let reject = match error {
        SecurityError::UnsupportedVersion { .. } => Reject {
            code: RejectCode::UnsupportedVersion,
            message: format!(
                "protocol version not supported, server supports up to version {}",
                ProtocolVersion::V2.as_u8()
            ),
            server_version: Some(ProtocolVersion::V2.as_u8()),
        },
        SecurityError::AccessDenied => Reject {
            code: RejectCode::AccessDenied,
            message: "access denied".to_string(),
            server_version: None,
        },
        SecurityError::MalformedToken { .. } | SecurityError::UnexpectedMessage { .. } => Reject {
            code: RejectCode::Malformed,
            message: "invalid handshake message".to_string(),
            server_version: None,
        },
        _ => return None,
    };
    Some(HandshakeMessage::Reject(reject))
}

/// Outcome of one server handshake step.
#[derive(Debug)]
pub enum HandshakeStep {
    /// Handshake continues; send this token and await the next one.
    NeedMore(Bytes),
    /// Handshake complete; send the final token, then use the channel.
    Ready {
        /// Established channel for the connection.
        channel: SecureChannel,
        /// Final outbound token (the server proof).
        reply: Bytes,
    },
}

/// Server-side handshake state.
enum ServerState {
    AwaitingHello,
    AwaitingProof {
        principal: String,
        key: SecretKey,
        genuine: bool,
        client_nonce: [u8; NONCE_LEN],
        server_nonce: [u8; NONCE_LEN],
        protection: ProtectionLevel,
    },
    Completed,
    Failed,
}

/// Server-side handshake driver.
///
/// Consumes inbound context tokens via [`step`](Self::step) until the
/// context is ready or establishment fails.
pub struct ServerHandshake {
    keyring: std::sync::Arc<Keyring>,
    state: ServerState,
    negotiated_version: Option<ProtocolVersion>,
}

impl ServerHandshake {
    /// Creates a handshake driver over the given keyring.
    #[must_use]
    pub fn new(keyring: std::sync::Arc<Keyring>) -> Self {
        Self {
            keyring,
            state: ServerState::AwaitingHello,
            negotiated_version: None,
        }
    }

    /// Returns the protocol generation fixed by the client hello.
    #[must_use]
    pub const fn negotiated_version(&self) -> Option<ProtocolVersion> {
        self.negotiated_version
    }

    /// Processes one inbound context token.
    ///
    /// # Errors
    ///
    /// All errors are non-retriable for the connection. Use
    /// [`reject_for`] to derive the optional Reject envelope to send
    /// before closing.
    pub fn step(&mut self, payload: &[u8]) -> SecurityResult<HandshakeStep> {
        match std::mem::replace(&mut self.state, ServerState::Failed) {
            ServerState::AwaitingHello => self.process_hello(payload),
            ServerState::AwaitingProof {
                principal,
                key,
                genuine,
                client_nonce,
                server_nonce,
                protection,
            } => self.process_proof(
                payload,
                &principal,
                &key,
                genuine,
                &client_nonce,
                &server_nonce,
                protection,
            ),
            ServerState::Completed | ServerState::Failed => Err(SecurityError::unexpected(
                "handshake already concluded on this connection",
            )),
        }
    }

    fn process_hello(&mut self, payload: &[u8]) -> SecurityResult<HandshakeStep> {
        let hello = match parse_handshake_message(payload)? {
            HandshakeMessage::ClientHello(hello) => hello,
            other => {
                return Err(SecurityError::unexpected(format!(
                    "expected client hello, got {}",
                    envelope_name(&other)
                )));
            },
        };

        let Some(version) = ProtocolVersion::from_u8(hello.protocol_version) else {
            return Err(SecurityError::UnsupportedVersion {
                requested: hello.protocol_version,
            });
        };
        self.negotiated_version = Some(version);
        debug!(
            principal = %hello.principal,
            protocol = %version,
            protection = %hello.protection,
            "received client hello"
        );

        let client_nonce = decode_nonce(&hello.client_nonce)?;
        let mut server_nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut server_nonce);

        // An unknown principal proceeds against a decoy key so the
        // rejection happens at the proof step with the same generic
        // failure as a wrong key.
        let (key, genuine) = match self.keyring.lookup(&hello.principal) {
            Some(key) => (key.clone(), true),
            None => (SecretKey::generate(), false),
        };

        let challenge = HandshakeMessage::ServerChallenge(ServerChallenge {
            server_nonce: hex::encode(server_nonce),
        });
        let reply = serialize_handshake_message(&challenge)?;

        self.state = ServerState::AwaitingProof {
            principal: hello.principal,
            key,
            genuine,
            client_nonce,
            server_nonce,
            protection: hello.protection,
        };
        Ok(HandshakeStep::NeedMore(reply))
    }

    #[allow(clippy::too_many_arguments)]
    fn process_proof(
        &mut self,
        payload: &[u8],
        principal: &str,
        key: &SecretKey,
        genuine: bool,
        client_nonce: &[u8; NONCE_LEN],
        server_nonce: &[u8; NONCE_LEN],
        protection: ProtectionLevel,
    ) -> SecurityResult<HandshakeStep> {
        let proof = match parse_handshake_message(payload)? {
            HandshakeMessage::ClientProof(proof) => proof,
            other => {
                return Err(SecurityError::unexpected(format!(
                    "expected client proof, got {}",
                    envelope_name(&other)
                )));
            },
        };

        let presented = hex::decode(&proof.proof)
            .map_err(|_| SecurityError::malformed("proof is not valid hex"))?;
        let expected = compute_proof(key, b"client-auth", client_nonce, server_nonce);

        let valid = expected.ct_eq(presented.as_slice()) & Choice::from(u8::from(genuine));
        if valid.unwrap_u8() != 1 {
            return Err(SecurityError::AccessDenied);
        }

        let server_proof = compute_proof(key, b"server-auth", client_nonce, server_nonce);
        let reply = serialize_handshake_message(&HandshakeMessage::ServerProof(ServerProof {
            proof: hex::encode(server_proof),
        }))?;

        let channel = SecureChannel::establish(
            Role::Server,
            key,
            client_nonce,
            server_nonce,
            protection,
            principal,
        );

        self.state = ServerState::Completed;
        Ok(HandshakeStep::Ready { channel, reply })
    }
}

impl std::fmt::Debug for ServerHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            ServerState::AwaitingHello => "awaiting_hello",
            ServerState::AwaitingProof { .. } => "awaiting_proof",
            ServerState::Completed => "completed",
            ServerState::Failed => "failed",
        };
        f.debug_struct("ServerHandshake")
            .field("state", &state)
            .field("negotiated_version", &self.negotiated_version)
            .finish()
    }
}

/// Outcome of one client handshake step.
#[derive(Debug)]
pub enum ClientStep {
    /// Handshake continues; send this token and await the next one.
    Send(Bytes),
    /// Handshake complete; the channel is ready for traffic.
    Ready(SecureChannel),
}

/// Client-side handshake state.
enum ClientState {
    AwaitingChallenge,
    AwaitingServerProof {
        server_nonce: [u8; NONCE_LEN],
    },
    Completed,
    Failed,
}

/// Client-side handshake driver.
pub struct ClientHandshake {
    principal: String,
    key: SecretKey,
    version: ProtocolVersion,
    protection: ProtectionLevel,
    client_nonce: [u8; NONCE_LEN],
    state: ClientState,
}

impl ClientHandshake {
    /// Creates a handshake driver for the given principal and key.
    #[must_use]
    pub fn new(
        principal: impl Into<String>,
        key: SecretKey,
        version: ProtocolVersion,
        protection: ProtectionLevel,
    ) -> Self {
        let mut client_nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut client_nonce);
        Self {
            principal: principal.into(),
            key,
            version,
            protection,
            client_nonce,
            state: ClientState::AwaitingChallenge,
        }
    }

    /// Builds the opening hello token.
    ///
    /// # Errors
    ///
    /// Returns `MalformedToken` if serialization fails.
    pub fn initial_token(&self) -> SecurityResult<Bytes> {
        serialize_handshake_message(&HandshakeMessage::ClientHello(ClientHello {
            protocol_version: self.version.as_u8(),
            principal: self.principal.clone(),
            client_nonce: hex::encode(self.client_nonce),
            protection: self.protection,
        }))
    }

    /// Processes one inbound context token.
    ///
    /// # Errors
    ///
    /// Returns `Rejected` if the server sent a Reject envelope, and the
    /// usual parse/sequence errors otherwise. All errors are
    /// non-retriable for the connection.
    pub fn step(&mut self, payload: &[u8]) -> SecurityResult<ClientStep> {
        let message = match parse_handshake_message(payload)? {
            HandshakeMessage::Reject(reject) => {
                self.state = ClientState::Failed;
                return Err(SecurityError::Rejected {
                    code: reject.code,
                    message: reject.message,
                });
            },
            other => other,
        };

        match std::mem::replace(&mut self.state, ClientState::Failed) {
            ClientState::AwaitingChallenge => {
                let HandshakeMessage::ServerChallenge(challenge) = message else {
                    return Err(SecurityError::unexpected(format!(
                        "expected server challenge, got {}",
                        envelope_name(&message)
                    )));
                };
                let server_nonce = decode_nonce(&challenge.server_nonce)?;
                let proof =
                    compute_proof(&self.key, b"client-auth", &self.client_nonce, &server_nonce);
                let reply =
                    serialize_handshake_message(&HandshakeMessage::ClientProof(ClientProof {
                        proof: hex::encode(proof),
                    }))?;
                self.state = ClientState::AwaitingServerProof { server_nonce };
                Ok(ClientStep::Send(reply))
            },
            ClientState::AwaitingServerProof { server_nonce } => {
                let HandshakeMessage::ServerProof(proof) = message else {
                    return Err(SecurityError::unexpected(format!(
                        "expected server proof, got {}",
                        envelope_name(&message)
                    )));
                };
                let presented = hex::decode(&proof.proof)
                    .map_err(|_| SecurityError::malformed("proof is not valid hex"))?;
                let expected =
                    compute_proof(&self.key, b"server-auth", &self.client_nonce, &server_nonce);
                if expected.ct_eq(presented.as_slice()).unwrap_u8() != 1 {
                    return Err(SecurityError::AccessDenied);
                }

                let channel = SecureChannel::establish(
                    Role::Client,
                    &self.key,
                    &self.client_nonce,
                    &server_nonce,
                    self.protection,
                    "server",
                );
                self.state = ClientState::Completed;
                Ok(ClientStep::Ready(channel))
            },
            ClientState::Completed | ClientState::Failed => Err(SecurityError::unexpected(
                "handshake already concluded on this connection",
            )),
        }
    }
}

impl std::fmt::Debug for ClientHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            ClientState::AwaitingChallenge => "awaiting_challenge",
            ClientState::AwaitingServerProof { .. } => "awaiting_server_proof",
            ClientState::Completed => "completed",
            ClientState::Failed => "failed",
        };
        f.debug_struct("ClientHandshake")
            .field("principal", &self.principal)
            .field("version", &self.version)
            .field("state", &state)
            .finish_non_exhaustive()
    }
}

fn envelope_name(message: &HandshakeMessage) -> &'static str {
    match message {
        HandshakeMessage::ClientHello(_) => "client_hello",
        HandshakeMessage::ServerChallenge(_) => "server_challenge",
        HandshakeMessage::ClientProof(_) => "client_proof",
        HandshakeMessage::ServerProof(_) => "server_proof",
        HandshakeMessage::Reject(_) => "reject",
    }
}

fn decode_nonce(encoded: &str) -> SecurityResult<[u8; NONCE_LEN]> {
    let raw = hex::decode(encoded).map_err(|_| SecurityError::malformed("nonce is not hex"))?;
    raw.try_into()
        .map_err(|_| SecurityError::malformed("nonce has wrong length"))
}

fn compute_proof(
    key: &SecretKey,
    label: &[u8],
    client_nonce: &[u8],
    server_nonce: &[u8],
) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
    mac.update(label);
    mac.update(client_nonce);
    mac.update(server_nonce);
    mac.finalize().into_bytes().into()
}
