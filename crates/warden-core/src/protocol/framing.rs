//! Length-prefixed token codec.
//!
//! Every token on the wire is `[flags:1][length:4 BE][payload]`. The
//! codec is re-entrant over an accumulating buffer: a partial token
//! yields `None` (more bytes needed) rather than blocking, and the
//! length prefix is validated against the configured maximum before any
//! payload allocation.
//!
//! The codec starts in the handshake phase with the stricter
//! [`MAX_HANDSHAKE_TOKEN_SIZE`] limit and is upgraded to the full
//! [`MAX_TOKEN_SIZE`] limit once the security context is established.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::error::{MAX_HANDSHAKE_TOKEN_SIZE, MAX_TOKEN_SIZE, ProtocolError};

/// Size of the token header (flags byte plus length prefix).
const HEADER_LEN: usize = 1 + 4;

/// Flag byte for context (handshake) tokens.
const FLAG_CONTEXT: u8 = 0x02;

/// Flag byte for data (wrapped) tokens.
const FLAG_DATA: u8 = 0x04;

/// Kind of a token, from its flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Handshake token carrying a plaintext security-context envelope.
    Context,
    /// Data token carrying a payload protected by the security context.
    Data,
}

impl TokenKind {
    /// Returns the wire flag byte for this kind.
    #[must_use]
    pub const fn flag_byte(self) -> u8 {
        match self {
            Self::Context => FLAG_CONTEXT,
            Self::Data => FLAG_DATA,
        }
    }

    /// Parses a wire flag byte.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::InvalidFrame` for unknown flag bytes.
    pub fn from_flag_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            FLAG_CONTEXT => Ok(Self::Context),
            FLAG_DATA => Ok(Self::Data),
            other => Err(ProtocolError::invalid_frame(format!(
                "unknown token flags 0x{other:02x}"
            ))),
        }
    }
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Context => write!(f, "context"),
            Self::Data => write!(f, "data"),
        }
    }
}

/// One token as read from or written to the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Token kind from the flag byte.
    pub kind: TokenKind,
    /// Raw token payload.
    pub payload: Bytes,
}

impl Token {
    /// Creates a context token.
    #[must_use]
    pub fn context(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: TokenKind::Context,
            payload: payload.into(),
        }
    }

    /// Creates a data token.
    #[must_use]
    pub fn data(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: TokenKind::Data,
            payload: payload.into(),
        }
    }
}

/// Re-entrant codec for the token envelope.
#[derive(Debug)]
pub struct TokenCodec {
    /// Maximum accepted payload size for the current phase.
    max_payload: usize,
}

impl TokenCodec {
    /// Creates a codec in the handshake phase (strict size limit).
    #[must_use]
    pub const fn handshake() -> Self {
        Self {
            max_payload: MAX_HANDSHAKE_TOKEN_SIZE,
        }
    }

    /// Upgrades the codec to the full data-phase size limit.
    ///
    /// Called once the security context is established.
    pub fn upgrade_to_data_limit(&mut self) {
        self.max_payload = MAX_TOKEN_SIZE;
    }

    /// Returns the currently enforced payload limit.
    #[must_use]
    pub const fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl Default for TokenCodec {
    fn default() -> Self {
        Self::handshake()
    }
}

impl Decoder for TokenCodec {
    type Item = Token;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Token>, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[1..HEADER_LEN]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        // Validate against the phase limit before reserving any space.
        if length > self.max_payload {
            return Err(ProtocolError::TokenTooLarge {
                size: length,
                max: self.max_payload,
            });
        }

        if src.len() < HEADER_LEN + length {
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }

        let kind = TokenKind::from_flag_byte(src[0])?;
        src.advance(HEADER_LEN);
        let payload = src.split_to(length).freeze();

        Ok(Some(Token { kind, payload }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Token>, ProtocolError> {
        match self.decode(src)? {
            Some(token) => Ok(Some(token)),
            None if src.is_empty() => Ok(None),
            None => Err(ProtocolError::Truncated {
                remaining: src.len(),
            }),
        }
    }
}

impl Encoder<Token> for TokenCodec {
    type Error = ProtocolError;

    fn encode(&mut self, token: Token, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if token.payload.len() > self.max_payload {
            return Err(ProtocolError::TokenTooLarge {
                size: token.payload.len(),
                max: self.max_payload,
            });
        }
        // Payload length fits u32 because max_payload does.
        #[allow(clippy::cast_possible_truncation)]
        let length = token.payload.len() as u32;

        dst.reserve(HEADER_LEN + token.payload.len());
        dst.put_u8(token.kind.flag_byte());
        dst.put_u32(length);
        dst.extend_from_slice(&token.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_token(token: Token) -> BytesMut {
        let mut codec = TokenCodec::handshake();
        let mut buf = BytesMut::new();
        codec.encode(token, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_round_trip() {
        let token = Token::context(&b"hello"[..]);
        let mut buf = encode_token(token.clone());

        let mut codec = TokenCodec::handshake();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, token);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_feed_one_byte_at_a_time() {
        let token = Token::data(&b"streamed payload"[..]);
        let wire = encode_token(token.clone());

        let mut codec = TokenCodec::handshake();
        let mut buf = BytesMut::new();
        let mut decoded = None;
        for (i, byte) in wire.iter().enumerate() {
            buf.put_u8(*byte);
            match codec.decode(&mut buf).unwrap() {
                Some(t) => {
                    assert_eq!(i, wire.len() - 1, "decoded before the final byte");
                    decoded = Some(t);
                },
                None => assert!(i < wire.len() - 1),
            }
        }
        assert_eq!(decoded, Some(token));
    }

    #[test]
    fn test_two_tokens_in_one_buffer() {
        let first = Token::context(&b"one"[..]);
        let second = Token::data(&b"two"[..]);
        let mut buf = encode_token(first.clone());
        buf.extend_from_slice(&encode_token(second.clone()));

        let mut codec = TokenCodec::handshake();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(second));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_oversized_length_rejected_before_allocation() {
        let mut buf = BytesMut::new();
        buf.put_u8(FLAG_DATA);
        buf.put_u32(u32::MAX);

        let mut codec = TokenCodec::handshake();
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::TokenTooLarge { .. }));
    }

    #[test]
    fn test_handshake_limit_stricter_than_data_limit() {
        let payload = vec![0u8; MAX_HANDSHAKE_TOKEN_SIZE + 1];
        let mut buf = BytesMut::new();
        buf.put_u8(FLAG_DATA);
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);

        let mut codec = TokenCodec::handshake();
        assert!(matches!(
            codec.decode(&mut buf.clone()),
            Err(ProtocolError::TokenTooLarge { .. })
        ));

        codec.upgrade_to_data_limit();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload.len(), payload.len());
    }

    #[test]
    fn test_unknown_flags_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x80);
        buf.put_u32(0);

        let mut codec = TokenCodec::handshake();
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFrame { .. }));
    }

    #[test]
    fn test_truncated_at_eof() {
        let wire = encode_token(Token::data(&b"cut short"[..]));
        let mut buf = BytesMut::from(&wire[..wire.len() - 2]);

        let mut codec = TokenCodec::handshake();
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { .. }));
    }

    #[test]
    fn test_empty_payload() {
        let token = Token::context(Bytes::new());
        let mut buf = encode_token(token.clone());

        let mut codec = TokenCodec::handshake();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(token));
    }
}
