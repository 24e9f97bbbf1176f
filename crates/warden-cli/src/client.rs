//! Protocol client for the warden daemon.
//!
//! [`WardenClient`] connects over TCP, performs the handshake, and runs
//! commands on the protected channel. Both protocol generations are
//! supported: generation 2 streams output as it arrives, generation 1
//! performs one command and receives one aggregated reply.
//!
//! # Example
//!
//! ```rust,ignore
//! use warden_cli::WardenClient;
//! use warden_core::protocol::ProtocolVersion;
//! use warden_core::secure::ProtectionLevel;
//!
//! let mut client = WardenClient::connect("host:4373", "alice", key).await?;
//! let reply = client.call(&[b"backup".to_vec(), b"run".to_vec()], false).await?;
//! println!("status {}", reply.status);
//! ```

use std::io;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;
use tracing::debug;
use warden_core::protocol::{
    AggregateReply, ErrorCode, Message, ProtocolError, ProtocolVersion, StreamId, Token,
    TokenCodec, TokenKind, encode_command_v1,
};
use warden_core::secure::{
    ClientHandshake, ClientStep, ProtectionLevel, SecretKey, SecureChannel, SecurityError,
};

/// Error type for client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The daemon is not reachable at the given address.
    #[error("cannot reach server: {0}")]
    Unreachable(io::Error),

    /// I/O failure mid-session.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Framing or message decoding failure.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Handshake or channel protection failure.
    #[error("security error: {0}")]
    Security(#[from] SecurityError),

    /// The server reported an error for the command.
    #[error("server error ({code}): {message}")]
    Remote {
        /// Stable reason code.
        code: ErrorCode,
        /// Server-provided description.
        message: String,
    },

    /// The server sent something that does not fit the protocol state.
    #[error("unexpected server message: {0}")]
    UnexpectedMessage(String),

    /// The server closed the connection mid-exchange.
    #[error("connection closed by server")]
    ConnectionClosed,
}

/// Collected result of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    /// Mapped exit status.
    pub status: i32,
    /// Standard output bytes (all output, for generation 1).
    pub stdout: Vec<u8>,
    /// Standard error bytes (empty for generation 1).
    pub stderr: Vec<u8>,
}

/// Connected, authenticated client.
pub struct WardenClient {
    framed: Framed<TcpStream, TokenCodec>,
    channel: SecureChannel,
    version: ProtocolVersion,
}

impl WardenClient {
    /// Connects with the current protocol generation and private
    /// protection.
    ///
    /// # Errors
    ///
    /// Returns `Unreachable` if the TCP connection fails and the usual
    /// handshake errors otherwise.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        principal: impl Into<String>,
        key: SecretKey,
    ) -> Result<Self, ClientError> {
        Self::connect_with(
            addr,
            principal,
            key,
            ProtocolVersion::V2,
            ProtectionLevel::Private,
        )
        .await
    }

    /// Connects with an explicit protocol generation and protection
    /// level.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`connect`](Self::connect).
    pub async fn connect_with(
        addr: impl ToSocketAddrs,
        principal: impl Into<String>,
        key: SecretKey,
        version: ProtocolVersion,
        protection: ProtectionLevel,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await.map_err(ClientError::Unreachable)?;
        let _ = stream.set_nodelay(true);
        let mut framed = Framed::new(stream, TokenCodec::handshake());

        let mut handshake = ClientHandshake::new(principal, key, version, protection);
        framed
            .send(Token::context(handshake.initial_token()?))
            .await?;

        let channel = loop {
            let token = next_token(&mut framed).await?;
            if token.kind != TokenKind::Context {
                return Err(SecurityError::unexpected(
                    "data token during handshake",
                )
                .into());
            }
            match handshake.step(&token.payload)? {
                ClientStep::Send(reply) => framed.send(Token::context(reply)).await?,
                ClientStep::Ready(channel) => break channel,
            }
        };
        framed.codec_mut().upgrade_to_data_limit();
        debug!(protocol = %version, "connected");

        Ok(Self {
            framed,
            channel,
            version,
        })
    }

    /// Returns the negotiated protocol generation.
    #[must_use]
    pub const fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Runs a command and collects its output.
    ///
    /// `keep_alive` requests that the connection stay open for further
    /// commands (generation 2 only; generation 1 connections always
    /// close after their single command).
    ///
    /// # Errors
    ///
    /// Returns `Remote` if the server reports an error for the command.
    pub async fn call(
        &mut self,
        args: &[Vec<u8>],
        keep_alive: bool,
    ) -> Result<CommandReply, ClientError> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let status = self
            .call_streamed(args, keep_alive, |stream, data| match stream {
                StreamId::Stdout => stdout.extend_from_slice(data),
                StreamId::Stderr => stderr.extend_from_slice(data),
            })
            .await?;
        Ok(CommandReply {
            status,
            stdout,
            stderr,
        })
    }

    /// Runs a command, delivering output chunks as they arrive.
    ///
    /// Returns the command's mapped exit status.
    ///
    /// # Errors
    ///
    /// Returns `Remote` if the server reports an error for the command.
    pub async fn call_streamed(
        &mut self,
        args: &[Vec<u8>],
        keep_alive: bool,
        mut on_output: impl FnMut(StreamId, &[u8]),
    ) -> Result<i32, ClientError> {
        match self.version {
            ProtocolVersion::V1 => {
                let reply = self.call_v1(args).await?;
                if !reply.data.is_empty() {
                    on_output(StreamId::Stdout, &reply.data);
                }
                Ok(reply.status)
            },
            ProtocolVersion::V2 => {
                self.send_message(&Message::Command {
                    keep_alive,
                    args: args.to_vec(),
                })
                .await?;
                loop {
                    match self.recv_message().await? {
                        Message::Output { stream, data } => on_output(stream, &data),
                        Message::Status { code } => return Ok(i32::from(code)),
                        Message::Error { code, message } => {
                            return Err(ClientError::Remote { code, message });
                        },
                        other => {
                            return Err(ClientError::UnexpectedMessage(format!("{other:?}")));
                        },
                    }
                }
            },
        }
    }

    /// Ends a generation 2 conversation politely.
    ///
    /// # Errors
    ///
    /// Returns transport errors from sending the quit message.
    pub async fn quit(mut self) -> Result<(), ClientError> {
        if self.version == ProtocolVersion::V2 {
            self.send_message(&Message::Quit).await?;
        }
        Ok(())
    }

    async fn call_v1(&mut self, args: &[Vec<u8>]) -> Result<AggregateReply, ClientError> {
        let token = self.channel.wrap(&encode_command_v1(args))?;
        self.framed.send(Token::data(token)).await?;

        let token = next_token(&mut self.framed).await?;
        if token.kind != TokenKind::Data {
            return Err(SecurityError::unexpected("context token after establishment").into());
        }
        let plaintext = self.channel.unwrap(&token.payload)?;
        Ok(AggregateReply::decode(&plaintext)?)
    }

    async fn send_message(&mut self, message: &Message) -> Result<(), ClientError> {
        let token = self.channel.wrap(&message.encode_v2())?;
        self.framed.send(Token::data(token)).await?;
        Ok(())
    }

    async fn recv_message(&mut self) -> Result<Message, ClientError> {
        let token = next_token(&mut self.framed).await?;
        if token.kind != TokenKind::Data {
            return Err(SecurityError::unexpected("context token after establishment").into());
        }
        let plaintext = self.channel.unwrap(&token.payload)?;
        Ok(Message::decode_v2(&plaintext)?)
    }
}

impl std::fmt::Debug for WardenClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WardenClient")
            .field("version", &self.version)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

async fn next_token(framed: &mut Framed<TcpStream, TokenCodec>) -> Result<Token, ClientError> {
    match framed.next().await {
        None => Err(ClientError::ConnectionClosed),
        Some(Err(error)) => Err(error.into()),
        Some(Ok(token)) => Ok(token),
    }
}
