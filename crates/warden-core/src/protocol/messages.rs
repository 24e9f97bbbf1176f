//! Protocol message types and per-generation encoding.
//!
//! Messages travel inside the payload produced by the security context's
//! `wrap`. Protocol generation 2 tags every message with a version and
//! type byte:
//!
//! ```text
//! [version:1][type:1][body]
//!
//! COMMAND body: [keep_alive:1][argc:4 BE][(arg_len:4 BE, arg_bytes)*]
//! OUTPUT  body: [stream:1][len:4 BE][data]
//! STATUS  body: [status:1]
//! ERROR   body: [code:4 BE][len:4 BE][message]
//! QUIT    body: (empty)
//! ```
//!
//! Protocol generation 1 is the legacy single-shot form: the command
//! token body is the bare argument vector with no version or type
//! header, and the single reply aggregates all output as
//! `[status:4 BE][len:4 BE][data]`.

use bytes::{BufMut, Bytes, BytesMut};

use super::error::{MAX_COMMAND_ARGS, ProtocolError, ProtocolResult};

/// Wire value of the current protocol generation.
const VERSION_2: u8 = 2;

const TYPE_COMMAND: u8 = 1;
const TYPE_QUIT: u8 = 2;
const TYPE_OUTPUT: u8 = 3;
const TYPE_STATUS: u8 = 4;
const TYPE_ERROR: u8 = 5;

/// Protocol generation negotiated for a connection.
///
/// Fixed by the first client handshake message and immutable for the
/// connection's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// Legacy single-command generation with one aggregated reply.
    V1,
    /// Current generation: sequential commands and streamed output.
    V2,
}

impl ProtocolVersion {
    /// Returns the wire value of this generation.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }

    /// Parses a wire value.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Output stream tag for multiplexed child output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamId {
    /// Child standard output.
    Stdout,
    /// Child standard error.
    Stderr,
}

impl StreamId {
    /// Returns the wire value of this stream tag.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Stdout => 1,
            Self::Stderr => 2,
        }
    }

    /// Parses a wire value.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// Stable reason codes carried by ERROR messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    /// Internal server failure.
    Internal = 1,
    /// Invalid token format.
    BadToken = 2,
    /// Unknown message type.
    UnknownMessage = 3,
    /// Invalid command format.
    BadCommand = 4,
    /// Structurally empty command.
    UnknownCommand = 5,
    /// Access denied by policy.
    AccessDenied = 6,
    /// Argument count exceeds the server limit.
    TooManyArgs = 7,
    /// Argument data exceeds the server limit.
    TooMuchData = 8,
    /// Message type not valid in the current state.
    UnexpectedMessage = 9,
}

impl ErrorCode {
    /// Returns the wire value of this code.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Parses a wire value.
    #[must_use]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Internal),
            2 => Some(Self::BadToken),
            3 => Some(Self::UnknownMessage),
            4 => Some(Self::BadCommand),
            5 => Some(Self::UnknownCommand),
            6 => Some(Self::AccessDenied),
            7 => Some(Self::TooManyArgs),
            8 => Some(Self::TooMuchData),
            9 => Some(Self::UnexpectedMessage),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Internal => "internal_error",
            Self::BadToken => "bad_token",
            Self::UnknownMessage => "unknown_message",
            Self::BadCommand => "bad_command",
            Self::UnknownCommand => "unknown_command",
            Self::AccessDenied => "access_denied",
            Self::TooManyArgs => "too_many_args",
            Self::TooMuchData => "too_much_data",
            Self::UnexpectedMessage => "unexpected_message",
        };
        write!(f, "{name}")
    }
}

/// One protocol message (generation 2 framing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Command request from the client.
    Command {
        /// Whether the client wants to run further commands afterwards.
        keep_alive: bool,
        /// Raw argument vector; the first entry is the command word.
        args: Vec<Vec<u8>>,
    },
    /// Client is done with the connection.
    Quit,
    /// One chunk of child output.
    Output {
        /// Stream the bytes were read from.
        stream: StreamId,
        /// Output bytes, in production order for this stream.
        data: Bytes,
    },
    /// Exit status concluding a command cycle.
    Status {
        /// Mapped exit status.
        code: u8,
    },
    /// Failure report with a stable reason code.
    Error {
        /// Stable reason code.
        code: ErrorCode,
        /// Human-readable description.
        message: String,
    },
}

impl Message {
    /// Encodes this message in generation 2 framing.
    #[must_use]
    pub fn encode_v2(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(VERSION_2);
        match self {
            Self::Command { keep_alive, args } => {
                buf.put_u8(TYPE_COMMAND);
                buf.put_u8(u8::from(*keep_alive));
                encode_args(&mut buf, args);
            },
            Self::Quit => buf.put_u8(TYPE_QUIT),
            Self::Output { stream, data } => {
                buf.put_u8(TYPE_OUTPUT);
                buf.put_u8(stream.as_u8());
                // Chunk sizes are bounded well below u32::MAX.
                #[allow(clippy::cast_possible_truncation)]
                buf.put_u32(data.len() as u32);
                buf.extend_from_slice(data);
            },
            Self::Status { code } => {
                buf.put_u8(TYPE_STATUS);
                buf.put_u8(*code);
            },
            Self::Error { code, message } => {
                buf.put_u8(TYPE_ERROR);
                buf.put_u32(code.as_u32());
                #[allow(clippy::cast_possible_truncation)]
                buf.put_u32(message.len() as u32);
                buf.extend_from_slice(message.as_bytes());
            },
        }
        buf.freeze()
    }

    /// Decodes a generation 2 message from an unwrapped payload.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedVersion` for a foreign version byte,
    /// `UnknownMessageType` for an unknown type byte, and `InvalidFrame`
    /// or `InvalidCommand` for structural problems in the body.
    pub fn decode_v2(payload: &[u8]) -> ProtocolResult<Self> {
        let mut reader = Reader::new(payload);
        let version = reader.u8("message version")?;
        if version != VERSION_2 {
            return Err(ProtocolError::UnsupportedVersion { version });
        }
        let message_type = reader.u8("message type")?;
        let message = match message_type {
            TYPE_COMMAND => {
                let keep_alive = reader.u8("keep-alive flag")? != 0;
                let args = decode_args(&mut reader)?;
                Self::Command { keep_alive, args }
            },
            TYPE_QUIT => Self::Quit,
            TYPE_OUTPUT => {
                let stream = reader.u8("stream id")?;
                let stream = StreamId::from_u8(stream).ok_or_else(|| {
                    ProtocolError::invalid_frame(format!("unknown stream id {stream}"))
                })?;
                let len = reader.u32("output length")? as usize;
                let data = reader.take(len, "output data")?;
                Self::Output {
                    stream,
                    data: Bytes::copy_from_slice(data),
                }
            },
            TYPE_STATUS => Self::Status {
                code: reader.u8("status")?,
            },
            TYPE_ERROR => {
                let code = reader.u32("error code")?;
                let code = ErrorCode::from_u32(code).ok_or_else(|| {
                    ProtocolError::invalid_frame(format!("unknown error code {code}"))
                })?;
                let len = reader.u32("error message length")? as usize;
                let raw = reader.take(len, "error message")?;
                let message = String::from_utf8(raw.to_vec()).map_err(|_| {
                    ProtocolError::invalid_frame("error message is not valid UTF-8")
                })?;
                Self::Error { code, message }
            },
            other => return Err(ProtocolError::UnknownMessageType { value: other }),
        };
        reader.finish()?;
        Ok(message)
    }
}

/// Aggregated reply of the legacy protocol generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateReply {
    /// Exit status, or -1 for errors and signal death.
    pub status: i32,
    /// Combined output of both child streams, in read order.
    pub data: Bytes,
}

impl AggregateReply {
    /// Encodes the reply as `[status:4][len:4][data]`.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.data.len());
        buf.put_i32(self.status);
        // Aggregated output is capped far below u32::MAX.
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(self.data.len() as u32);
        buf.extend_from_slice(&self.data);
        buf.freeze()
    }

    /// Decodes a legacy reply.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFrame` if the payload is shorter than its header
    /// or its declared data length.
    pub fn decode(payload: &[u8]) -> ProtocolResult<Self> {
        let mut reader = Reader::new(payload);
        let status = reader.u32("reply status")? as i32;
        let len = reader.u32("reply length")? as usize;
        let data = reader.take(len, "reply data")?;
        let reply = Self {
            status,
            data: Bytes::copy_from_slice(data),
        };
        reader.finish()?;
        Ok(reply)
    }
}

/// Encodes a legacy command token body (bare argument vector).
#[must_use]
pub fn encode_command_v1(args: &[Vec<u8>]) -> Bytes {
    let mut buf = BytesMut::new();
    encode_args(&mut buf, args);
    buf.freeze()
}

/// Decodes a legacy command token body.
///
/// # Errors
///
/// Same failure modes as the generation 2 command body.
pub fn decode_command_v1(payload: &[u8]) -> ProtocolResult<Vec<Vec<u8>>> {
    let mut reader = Reader::new(payload);
    let args = decode_args(&mut reader)?;
    reader.finish()?;
    Ok(args)
}

fn encode_args(buf: &mut BytesMut, args: &[Vec<u8>]) {
    // Bounded by MAX_COMMAND_ARGS at the decode side and by the session
    // caps at the encode side.
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32(args.len() as u32);
    for arg in args {
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(arg.len() as u32);
        buf.extend_from_slice(arg);
    }
}

/// Parses the packed argument vector `[argc][(len, bytes)*]`.
///
/// Each argument's claimed length is checked against the remaining
/// payload before it is copied, and the final count must match argc
/// exactly with no trailing bytes.
fn decode_args(reader: &mut Reader<'_>) -> ProtocolResult<Vec<Vec<u8>>> {
    let argc = reader.u32("argument count")? as usize;
    if argc > MAX_COMMAND_ARGS {
        return Err(ProtocolError::TooManyArguments {
            count: argc,
            max: MAX_COMMAND_ARGS,
        });
    }
    if reader.remaining() < argc.saturating_mul(4) {
        return Err(ProtocolError::invalid_command(
            "payload shorter than claimed argument count",
        ));
    }
    let mut args = Vec::with_capacity(argc);
    for _ in 0..argc {
        let len = reader.u32("argument length")? as usize;
        let arg = reader
            .take(len, "argument data")
            .map_err(|_| ProtocolError::invalid_command("argument extends past payload"))?;
        args.push(arg.to_vec());
    }
    if reader.remaining() != 0 {
        return Err(ProtocolError::invalid_command(
            "trailing bytes after final argument",
        ));
    }
    Ok(args)
}

/// Cursor over a message payload with descriptive underrun errors.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    const fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u8(&mut self, what: &str) -> ProtocolResult<u8> {
        let bytes = self.take(1, what)?;
        Ok(bytes[0])
    }

    fn u32(&mut self, what: &str) -> ProtocolResult<u32> {
        let bytes = self.take(4, what)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(bytes);
        Ok(u32::from_be_bytes(raw))
    }

    fn take(&mut self, len: usize, what: &str) -> ProtocolResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::invalid_frame(format!(
                "payload too short reading {what}"
            )));
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn finish(&self) -> ProtocolResult<()> {
        if self.remaining() != 0 {
            return Err(ProtocolError::invalid_frame(format!(
                "{} trailing bytes after message",
                self.remaining()
            )));
        }
        Ok(())
    }
}
