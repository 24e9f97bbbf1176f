//! Established secure channel: wrap/unwrap with sequence enforcement.
//!
//! A [`SecureChannel`] exists only as the product of a completed
//! handshake. It holds one directional state per flow (send and
//! receive), each with its own derived keys and a strictly monotonic
//! sequence number.
//!
//! # Token Format
//!
//! ```text
//! [seq:8 BE][body][tag:32]
//! ```
//!
//! The tag is HMAC-SHA256 over the sequence number and body under the
//! direction's authentication key (encrypt-then-MAC). At the `Private`
//! protection level the body is the plaintext XORed with an HMAC-SHA256
//! counter-mode keystream; at `Integrity` the body travels in the clear
//! but remains authenticated.
//!
//! # Security Considerations
//!
//! - Tags are verified in constant time before any decryption
//! - Sequence numbers reject replayed and reordered tokens
//! - Sequence exhaustion expires the context rather than wrapping

use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::keyring::{KEY_LEN, SecretKey};
use super::{SecurityError, SecurityResult};

type HmacSha256 = Hmac<Sha256>;

/// Length of the authentication tag.
const TAG_LEN: usize = 32;

/// Length of the sequence number prefix.
const SEQ_LEN: usize = 8;

/// Negotiated protection level for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionLevel {
    /// Authenticate every token without encrypting the body.
    Integrity,
    /// Authenticate and encrypt every token.
    #[default]
    Private,
}

impl std::fmt::Display for ProtectionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integrity => write!(f, "integrity"),
            Self::Private => write!(f, "private"),
        }
    }
}

/// Which side of the handshake this channel belongs to.
///
/// Decides how the directional key pairs map onto send and receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

/// Per-direction key material and sequence state.
struct Direction {
    cipher_key: SecretKey,
    auth_key: SecretKey,
    seq: u64,
}

impl Direction {
    fn next_seq(&mut self) -> SecurityResult<u64> {
        if self.seq == u64::MAX {
            return Err(SecurityError::ContextExpired);
        }
        let seq = self.seq;
        self.seq += 1;
        Ok(seq)
    }
}

/// Established security association bound to one connection.
///
/// Exactly one exists per connection; it is never shared and is
/// destroyed with the connection.
pub struct SecureChannel {
    peer: String,
    protection: ProtectionLevel,
    send: Direction,
    recv: Direction,
}

impl SecureChannel {
    /// Builds the channel from handshake material.
    ///
    /// Both sides call this with the same base key and nonces; the role
    /// swaps the directional keys so each side's send direction is the
    /// other's receive direction.
    pub(crate) fn establish(
        role: Role,
        base: &SecretKey,
        client_nonce: &[u8],
        server_nonce: &[u8],
        protection: ProtectionLevel,
        peer: impl Into<String>,
    ) -> Self {
        let c2s = Direction {
            cipher_key: derive_key(base, b"c2s-cipher", client_nonce, server_nonce),
            auth_key: derive_key(base, b"c2s-auth", client_nonce, server_nonce),
            seq: 0,
        };
        let s2c = Direction {
            cipher_key: derive_key(base, b"s2c-cipher", client_nonce, server_nonce),
            auth_key: derive_key(base, b"s2c-auth", client_nonce, server_nonce),
            seq: 0,
        };
        let (send, recv) = match role {
            Role::Client => (c2s, s2c),
            Role::Server => (s2c, c2s),
        };
        Self {
            peer: peer.into(),
            protection,
            send,
            recv,
        }
    }

    /// Returns the authenticated peer principal name.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Returns the negotiated protection level.
    #[must_use]
    pub const fn protection(&self) -> ProtectionLevel {
        self.protection
    }

    /// Protects a plaintext payload for sending.
    ///
    /// # Errors
    ///
    /// Returns `ContextExpired` if the send sequence space is exhausted.
    pub fn wrap(&mut self, plaintext: &[u8]) -> SecurityResult<Bytes> {
        let seq = self.send.next_seq()?;

        let mut body = plaintext.to_vec();
        if self.protection == ProtectionLevel::Private {
            apply_keystream(&self.send.cipher_key, seq, &mut body);
        }

        let tag = compute_tag(&self.send.auth_key, seq, &body);

        let mut token = BytesMut::with_capacity(SEQ_LEN + body.len() + TAG_LEN);
        token.put_u64(seq);
        token.extend_from_slice(&body);
        token.extend_from_slice(&tag);
        Ok(token.freeze())
    }

    /// Verifies and recovers the plaintext of a received token.
    ///
    /// # Errors
    ///
    /// - `MalformedToken` if the token is shorter than its envelope
    /// - `SequenceMismatch` for replayed or reordered tokens
    /// - `IntegrityFailure` if the tag does not verify
    pub fn unwrap(&mut self, token: &[u8]) -> SecurityResult<Vec<u8>> {
        if token.len() < SEQ_LEN + TAG_LEN {
            return Err(SecurityError::malformed("wrapped token too short"));
        }
        let mut seq_bytes = [0u8; SEQ_LEN];
        seq_bytes.copy_from_slice(&token[..SEQ_LEN]);
        let seq = u64::from_be_bytes(seq_bytes);

        if seq != self.recv.seq {
            return Err(SecurityError::SequenceMismatch {
                expected: self.recv.seq,
                got: seq,
            });
        }

        let body = &token[SEQ_LEN..token.len() - TAG_LEN];
        let tag = &token[token.len() - TAG_LEN..];
        let expected = compute_tag(&self.recv.auth_key, seq, body);
        if expected.ct_eq(tag).unwrap_u8() != 1 {
            return Err(SecurityError::IntegrityFailure);
        }

        // Tag verified; the sequence number is now consumed.
        self.recv.seq += 1;

        let mut plaintext = body.to_vec();
        if self.protection == ProtectionLevel::Private {
            apply_keystream(&self.recv.cipher_key, seq, &mut plaintext);
        }
        Ok(plaintext)
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("peer", &self.peer)
            .field("protection", &self.protection)
            .field("send_seq", &self.send.seq)
            .field("recv_seq", &self.recv.seq)
            .finish_non_exhaustive()
    }
}

/// Derives a subkey with HMAC-SHA256 over a domain label and nonces.
pub(crate) fn derive_key(
    base: &SecretKey,
    label: &[u8],
    client_nonce: &[u8],
    server_nonce: &[u8],
) -> SecretKey {
    let mut mac = HmacSha256::new_from_slice(base.as_bytes()).expect("HMAC accepts any key length");
    mac.update(label);
    mac.update(client_nonce);
    mac.update(server_nonce);
    let digest: [u8; KEY_LEN] = mac.finalize().into_bytes().into();
    SecretKey::from_bytes(digest)
}

/// XORs `data` with the HMAC counter-mode keystream for `seq`.
fn apply_keystream(key: &SecretKey, seq: u64, data: &mut [u8]) {
    let mut block_index: u32 = 0;
    for chunk in data.chunks_mut(KEY_LEN) {
        let mut mac =
            HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
        mac.update(&seq.to_be_bytes());
        mac.update(&block_index.to_be_bytes());
        let block = mac.finalize().into_bytes();
        for (byte, pad) in chunk.iter_mut().zip(block.iter()) {
            *byte ^= pad;
        }
        block_index += 1;
    }
}

/// Computes the authentication tag over a sequence number and body.
fn compute_tag(key: &SecretKey, seq: u64, body: &[u8]) -> [u8; TAG_LEN] {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
    mac.update(&seq.to_be_bytes());
    mac.update(body);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_pair(protection: ProtectionLevel) -> (SecureChannel, SecureChannel) {
        let base = SecretKey::generate();
        let client_nonce = [1u8; 32];
        let server_nonce = [2u8; 32];
        let client = SecureChannel::establish(
            Role::Client,
            &base,
            &client_nonce,
            &server_nonce,
            protection,
            "warden-server",
        );
        let server = SecureChannel::establish(
            Role::Server,
            &base,
            &client_nonce,
            &server_nonce,
            protection,
            "alice",
        );
        (client, server)
    }

    #[test]
    fn test_wrap_unwrap_round_trip() {
        for protection in [ProtectionLevel::Integrity, ProtectionLevel::Private] {
            let (mut client, mut server) = channel_pair(protection);
            for payload in [&b""[..], b"hi", &[0u8; 1000][..]] {
                let token = client.wrap(payload).unwrap();
                assert_eq!(server.unwrap(&token).unwrap(), payload);

                let token = server.wrap(payload).unwrap();
                assert_eq!(client.unwrap(&token).unwrap(), payload);
            }
        }
    }

    #[test]
    fn test_private_level_hides_plaintext() {
        let (mut client, _server) = channel_pair(ProtectionLevel::Private);
        let plaintext = b"secret command line";
        let token = client.wrap(plaintext).unwrap();
        let body = &token[SEQ_LEN..token.len() - TAG_LEN];
        assert_ne!(body, plaintext);
    }

    #[test]
    fn test_integrity_level_leaves_plaintext_visible() {
        let (mut client, _server) = channel_pair(ProtectionLevel::Integrity);
        let plaintext = b"visible but authenticated";
        let token = client.wrap(plaintext).unwrap();
        let body = &token[SEQ_LEN..token.len() - TAG_LEN];
        assert_eq!(body, plaintext);
    }

    #[test]
    fn test_tampered_token_fails_integrity() {
        let (mut client, mut server) = channel_pair(ProtectionLevel::Private);
        let mut token = client.wrap(b"payload").unwrap().to_vec();
        let middle = token.len() / 2;
        token[middle] ^= 0x01;
        assert!(matches!(
            server.unwrap(&token),
            Err(SecurityError::IntegrityFailure)
        ));
    }

    #[test]
    fn test_replayed_token_rejected() {
        let (mut client, mut server) = channel_pair(ProtectionLevel::Private);
        let token = client.wrap(b"one").unwrap();
        server.unwrap(&token).unwrap();
        assert!(matches!(
            server.unwrap(&token),
            Err(SecurityError::SequenceMismatch {
                expected: 1,
                got: 0
            })
        ));
    }

    #[test]
    fn test_reordered_tokens_rejected() {
        let (mut client, mut server) = channel_pair(ProtectionLevel::Private);
        let first = client.wrap(b"one").unwrap();
        let second = client.wrap(b"two").unwrap();
        assert!(matches!(
            server.unwrap(&second),
            Err(SecurityError::SequenceMismatch { .. })
        ));
        // The in-order token still verifies after the failed attempt.
        assert_eq!(server.unwrap(&first).unwrap(), b"one");
    }

    #[test]
    fn test_short_token_is_malformed() {
        let (_client, mut server) = channel_pair(ProtectionLevel::Private);
        assert!(matches!(
            server.unwrap(&[0u8; 10]),
            Err(SecurityError::MalformedToken { .. })
        ));
    }

    #[test]
    fn test_directions_are_independent() {
        // A side cannot unwrap its own output: send and receive use
        // distinct directional keys even at matching sequence numbers.
        let (mut client, _server) = channel_pair(ProtectionLevel::Private);
        let token = client.wrap(b"cross").unwrap();
        assert!(matches!(
            client.unwrap(&token),
            Err(SecurityError::IntegrityFailure)
        ));
    }

    #[test]
    fn test_peer_and_protection_accessors() {
        let (client, server) = channel_pair(ProtectionLevel::Private);
        assert_eq!(client.peer(), "warden-server");
        assert_eq!(server.peer(), "alice");
        assert_eq!(server.protection(), ProtectionLevel::Private);
    }
}
