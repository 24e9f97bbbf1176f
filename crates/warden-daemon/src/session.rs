//! Per-connection session state machine.
//!
//! One [`Session`] exists per client connection and composes the other
//! layers: it drives the security handshake to completion, decodes
//! protocol messages, authorizes command requests against the policy,
//! runs authorized commands through the executor, and relays output,
//! status, and errors back over the protected channel.
//!
//! # States
//!
//! ```text
//! Handshaking ──ready──> Ready ──command──> Executing
//!      │                   ▲                    │
//!      │fail               └──────v2 loop───────┘
//!      ▼                           │
//!   Closing <──quit/error/timeout──┘
//!      │
//!      ▼
//!   Closed
//! ```
//!
//! Version 1 connections run exactly one command cycle and close;
//! version 2 connections return to `Ready` after each command while the
//! keep-alive flag is set. Suspension points (awaiting tokens, awaiting
//! child output, awaiting socket writability) all return control to the
//! reactor; the session is advanced only by readiness events.
//!
//! # Error Propagation
//!
//! Only transport/codec corruption and security failures terminate the
//! connection. Authorization denials, spawn failures, and malformed
//! commands are reported as error messages and, on version 2, leave the
//! connection in `Ready`. Nothing an unauthorized peer sends can crash
//! the server.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use warden_core::policy::{CommandRequest, Policy, Rule};
use warden_core::protocol::{
    AggregateReply, ErrorCode, MAX_COMMAND_DATA, Message, ProtocolError, ProtocolVersion, StreamId,
    Token, TokenCodec, TokenKind, decode_command_v1,
};
use warden_core::secure::{
    HandshakeStep, Keyring, SecureChannel, SecurityError, ServerHandshake, reject_for,
    serialize_handshake_message,
};

use crate::acl::{AclEngine, Decision};
use crate::executor::{CommandExecutor, ExecutorError, OutputSink};

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Consuming security context tokens.
    Handshaking,
    /// Awaiting a command on an established channel.
    Ready,
    /// Supervising a running command.
    Executing,
    /// Tearing down: child released, context destroyed.
    Closing,
    /// Terminal.
    Closed,
}

/// Errors that terminate a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Framing or message-level protocol failure.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Security context failure.
    #[error("security error: {0}")]
    Security(#[from] SecurityError),

    /// The peer went away mid-session.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// No traffic within the configured idle timeout.
    #[error("idle timeout after {0:?}")]
    IdleTimeout(Duration),
}

/// Immutable state shared by every session of one server.
pub struct SessionShared {
    /// Preshared key material for the handshake.
    pub keyring: Arc<Keyring>,
    /// Loaded policy snapshot.
    pub policy: Arc<Policy>,
    /// Executor configuration.
    pub executor: CommandExecutor,
    /// Idle timeout applied to every read.
    pub idle_timeout: Duration,
}

/// A client connection prior to security context establishment.
pub struct Session {
    framed: Framed<TcpStream, TokenCodec>,
    peer_addr: SocketAddr,
    shared: Arc<SessionShared>,
    state: SessionState,
}

impl Session {
    /// Wraps an accepted connection.
    #[must_use]
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, shared: Arc<SessionShared>) -> Self {
        Self {
            framed: Framed::new(stream, TokenCodec::handshake()),
            peer_addr,
            shared,
            state: SessionState::Handshaking,
        }
    }

    /// Drives the session to completion.
    ///
    /// Consumes the session; the connection is closed on return. The
    /// error, if any, describes why the connection was terminated.
    pub async fn run(self) -> Result<(), SessionError> {
        debug_assert_eq!(self.state, SessionState::Handshaking);
        let peer_addr = self.peer_addr;
        let established = match self.handshake().await {
            Ok(established) => established,
            Err(error) => {
                debug!(peer = %peer_addr, %error, "handshake failed");
                return Err(error);
            },
        };
        established.run().await
    }

    /// Consumes context tokens until the channel is ready.
    async fn handshake(mut self) -> Result<Established, SessionError> {
        let mut handshake = ServerHandshake::new(Arc::clone(&self.shared.keyring));
        loop {
            let token = next_token(
                &mut self.framed,
                self.shared.idle_timeout,
            )
            .await?;
            if token.kind != TokenKind::Context {
                let error = SecurityError::unexpected("data token before context establishment");
                self.send_reject(&error).await;
                return Err(error.into());
            }

            match handshake.step(&token.payload) {
                Ok(HandshakeStep::NeedMore(reply)) => {
                    self.framed.send(Token::context(reply)).await?;
                },
                Ok(HandshakeStep::Ready { channel, reply }) => {
                    self.framed.send(Token::context(reply)).await?;
                    // Negotiation happened in the hello this handshake
                    // just accepted.
                    let version = handshake
                        .negotiated_version()
                        .unwrap_or(ProtocolVersion::V2);
                    self.framed.codec_mut().upgrade_to_data_limit();
                    info!(
                        peer = %self.peer_addr,
                        principal = channel.peer(),
                        protection = %channel.protection(),
                        protocol = %version,
                        "session established"
                    );
                    return Ok(Established {
                        framed: self.framed,
                        channel,
                        version,
                        peer_addr: self.peer_addr,
                        shared: self.shared,
                        engine: AclEngine::new(),
                        state: SessionState::Ready,
                    });
                },
                Err(error) => {
                    self.send_reject(&error).await;
                    return Err(error.into());
                },
            }
        }
    }

    /// Best-effort rejection notice; failures to send are ignored since
    /// the connection is being torn down anyway.
    async fn send_reject(&mut self, error: &SecurityError) {
        if let Some(reject) = reject_for(error) {
            if let Ok(payload) = serialize_handshake_message(&reject) {
                let _ = self.framed.send(Token::context(payload)).await;
            }
        }
    }
}

/// A session with an established security context.
struct Established {
    framed: Framed<TcpStream, TokenCodec>,
    channel: SecureChannel,
    version: ProtocolVersion,
    peer_addr: SocketAddr,
    shared: Arc<SessionShared>,
    engine: AclEngine,
    state: SessionState,
}

impl Established {
    async fn run(mut self) -> Result<(), SessionError> {
        let result = match self.version {
            ProtocolVersion::V1 => self.run_v1().await,
            ProtocolVersion::V2 => self.run_v2().await,
        };
        self.transition(SessionState::Closing);
        // Dropping the framed transport closes the socket; any child
        // still running was released by its command cycle. The security
        // context dies with the session.
        self.transition(SessionState::Closed);
        result
    }

    fn transition(&mut self, next: SessionState) {
        debug!(peer = %self.peer_addr, from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    /// Version 2 message loop: sequential commands until quit, loss of
    /// keep-alive, or failure.
    async fn run_v2(&mut self) -> Result<(), SessionError> {
        loop {
            self.transition(SessionState::Ready);
            let token = match next_token(&mut self.framed, self.shared.idle_timeout).await {
                Ok(token) => token,
                Err(SessionError::ConnectionClosed) => return Ok(()),
                Err(SessionError::IdleTimeout(t)) => {
                    info!(peer = %self.peer_addr, "closing idle connection after {t:?}");
                    return Ok(());
                },
                Err(error) => return Err(error),
            };
            if token.kind != TokenKind::Data {
                return Err(SecurityError::unexpected(
                    "context token on established connection",
                )
                .into());
            }

            let plaintext = match self.channel.unwrap(&token.payload) {
                Ok(plaintext) => plaintext,
                Err(error) => {
                    // The channel itself is suspect: log and close
                    // without trusting it to carry a further message.
                    warn!(peer = %self.peer_addr, %error, "unwrap failed; closing");
                    return Err(error.into());
                },
            };

            if plaintext.len() > MAX_COMMAND_DATA {
                self.send_error(ErrorCode::TooMuchData, "Too much data").await?;
                continue;
            }

            let message = match Message::decode_v2(&plaintext) {
                Ok(message) => message,
                Err(error) => {
                    let code = error_code_for(&error);
                    self.send_error(code, &error.to_string()).await?;
                    if error.is_command_rejection() {
                        continue;
                    }
                    return Err(error.into());
                },
            };

            match message {
                Message::Command { keep_alive, args } => {
                    self.handle_command(args).await?;
                    if !keep_alive {
                        return Ok(());
                    }
                },
                Message::Quit => {
                    debug!(peer = %self.peer_addr, "quit received");
                    return Ok(());
                },
                Message::Output { .. } | Message::Status { .. } | Message::Error { .. } => {
                    self.send_error(ErrorCode::UnexpectedMessage, "Unexpected message")
                        .await?;
                },
            }
        }
    }

    /// Version 1 cycle: exactly one command, one aggregated reply.
    async fn run_v1(&mut self) -> Result<(), SessionError> {
        self.transition(SessionState::Ready);
        let token = match next_token(&mut self.framed, self.shared.idle_timeout).await {
            Ok(token) => token,
            Err(SessionError::ConnectionClosed) => return Ok(()),
            Err(error) => return Err(error),
        };
        if token.kind != TokenKind::Data {
            return Err(
                SecurityError::unexpected("context token on established connection").into(),
            );
        }
        let plaintext = self.channel.unwrap(&token.payload).map_err(|error| {
            warn!(peer = %self.peer_addr, %error, "unwrap failed; closing");
            error
        })?;

        if plaintext.len() > MAX_COMMAND_DATA {
            return self.send_v1_error("Too much data").await;
        }
        let args = match decode_command_v1(&plaintext) {
            Ok(args) => args,
            Err(error) => return self.send_v1_error(&error.to_string()).await,
        };

        let request = match self.resolve_request(args) {
            Ok(request) => request,
            Err(reason) => return self.send_v1_error(&reason.message).await,
        };

        let policy = Arc::clone(&self.shared.policy);
        let Some(rule) = lookup_rule(&policy, &request) else {
            self.log_denial(&request, "no policy rule");
            return self.send_v1_error("Access denied").await;
        };
        if let Err(reason) = validate_argument_nuls(&request, rule) {
            return self.send_v1_error(&reason.message).await;
        }
        let decision = self.engine.check(rule, &request).await;
        if let Decision::Deny(reason) = decision {
            self.log_denial(&request, &reason.to_string());
            return self.send_v1_error("Access denied").await;
        }

        self.transition(SessionState::Executing);
        let executor = self.shared.executor.clone();
        let peer = self.peer_addr.ip().to_string();
        let outcome = executor.run_collected(rule, &request, &peer).await;
        match outcome {
            Ok((status, data)) => {
                self.send_v1_reply(AggregateReply {
                    status,
                    data: Bytes::from(data),
                })
                .await
            },
            Err(error) if error.is_spawn_failure() => {
                warn!(peer = %self.peer_addr, %error, "spawn failed");
                self.send_v1_error(&error.to_string()).await
            },
            Err(error) => Err(io_session_error(error)),
        }
    }

    /// Handles one v2 command cycle; errors returned here terminate the
    /// connection, everything else is reported to the peer.
    async fn handle_command(&mut self, args: Vec<Vec<u8>>) -> Result<(), SessionError> {
        let request = match self.resolve_request(args) {
            Ok(request) => request,
            Err(reason) => {
                return self.send_error(reason.code, &reason.message).await;
            },
        };

        let policy = Arc::clone(&self.shared.policy);
        let Some(rule) = lookup_rule(&policy, &request) else {
            self.log_denial(&request, "no policy rule");
            return self.send_error(ErrorCode::AccessDenied, "Access denied").await;
        };
        if let Err(reason) = validate_argument_nuls(&request, rule) {
            return self.send_error(reason.code, &reason.message).await;
        }

        let decision = self.engine.check(rule, &request).await;
        if let Decision::Deny(reason) = decision {
            self.log_denial(&request, &reason.to_string());
            return self.send_error(ErrorCode::AccessDenied, "Access denied").await;
        }

        info!(
            peer = %self.peer_addr,
            principal = %request.principal,
            command = %request.command,
            subcommand = request.subcommand.as_deref().unwrap_or(""),
            "running command"
        );

        self.transition(SessionState::Executing);
        let executor = self.shared.executor.clone();
        let peer = self.peer_addr.ip().to_string();
        let outcome = executor.run_streamed(rule, &request, &peer, self).await;
        match outcome {
            Ok(status) => {
                let code = u8::try_from(status).unwrap_or(u8::MAX);
                self.send_message(&Message::Status { code }).await
            },
            Err(error) if error.is_spawn_failure() => {
                warn!(peer = %self.peer_addr, %error, "spawn failed");
                self.send_error(ErrorCode::Internal, &error.to_string()).await
            },
            Err(error) => Err(io_session_error(error)),
        }
    }

    /// Builds the command request from a raw argument vector.
    ///
    /// The command and subcommand words must be UTF-8 and free of NUL
    /// octets; remaining arguments are validated against the rule later,
    /// once the stdin routing is known.
    fn resolve_request(&self, args: Vec<Vec<u8>>) -> Result<CommandRequest, Rejection> {
        if args.is_empty() {
            return Err(Rejection {
                code: ErrorCode::UnknownCommand,
                message: "Unknown command".to_string(),
            });
        }
        let command = parse_word(&args[0], "command")?;
        let subcommand = match args.get(1) {
            Some(word) => Some(parse_word(word, "subcommand")?),
            None => None,
        };
        Ok(CommandRequest {
            principal: self.channel.peer().to_string(),
            command,
            subcommand,
            args,
        })
    }

    fn log_denial(&self, request: &CommandRequest, reason: &str) {
        info!(
            peer = %self.peer_addr,
            principal = %request.principal,
            command = %request.command,
            subcommand = request.subcommand.as_deref().unwrap_or(""),
            reason,
            "access denied"
        );
    }

    /// Wraps and sends one protocol message.
    async fn send_message(&mut self, message: &Message) -> Result<(), SessionError> {
        let token = self.channel.wrap(&message.encode_v2())?;
        self.framed.send(Token::data(token)).await?;
        Ok(())
    }

    async fn send_error(&mut self, code: ErrorCode, message: &str) -> Result<(), SessionError> {
        self.send_message(&Message::Error {
            code,
            message: message.to_string(),
        })
        .await
    }

    async fn send_v1_reply(&mut self, reply: AggregateReply) -> Result<(), SessionError> {
        let token = self.channel.wrap(&reply.encode())?;
        self.framed.send(Token::data(token)).await?;
        Ok(())
    }

    /// Legacy error reply: status -1 with the message as data.
    async fn send_v1_error(&mut self, message: &str) -> Result<(), SessionError> {
        self.send_v1_reply(AggregateReply {
            status: -1,
            data: Bytes::from(format!("{message}\n")),
        })
        .await
    }
}

/// Output sink wiring executor chunks through the session's channel.
///
/// Awaiting the framed send is what gives the executor backpressure: an
/// unwritable socket suspends here, which pauses reads from the child.
#[async_trait]
impl OutputSink for Established {
    async fn send_output(&mut self, stream: StreamId, data: Bytes) -> io::Result<()> {
        self.send_message(&Message::Output { stream, data })
            .await
            .map_err(io::Error::other)
    }
}

/// A command rejection reported to the peer without closing.
struct Rejection {
    code: ErrorCode,
    message: String,
}

fn parse_word(raw: &[u8], what: &str) -> Result<String, Rejection> {
    if raw.contains(&0) {
        return Err(Rejection {
            code: ErrorCode::BadCommand,
            message: format!("Invalid command token: {what} contains NUL octet"),
        });
    }
    String::from_utf8(raw.to_vec()).map_err(|_| Rejection {
        code: ErrorCode::BadCommand,
        message: format!("Invalid command token: {what} is not valid UTF-8"),
    })
}

/// Arguments may contain NUL octets only when routed to stdin.
fn validate_argument_nuls(request: &CommandRequest, rule: &Rule) -> Result<(), Rejection> {
    use warden_core::policy::StdinArg;

    let stdin_index = match rule.stdin_arg {
        None => None,
        Some(StdinArg::Last) => request.args.len().checked_sub(1).filter(|i| *i >= 1),
        Some(StdinArg::Index(n)) => Some(n),
    };
    for (index, arg) in request.args.iter().enumerate().skip(2) {
        if Some(index) == stdin_index {
            continue;
        }
        if arg.contains(&0) {
            return Err(Rejection {
                code: ErrorCode::BadCommand,
                message: format!("Invalid command token: argument {index} contains NUL octet"),
            });
        }
    }
    Ok(())
}

fn lookup_rule<'a>(policy: &'a Policy, request: &CommandRequest) -> Option<&'a Rule> {
    policy.lookup(&request.command, request.subcommand.as_deref())
}

/// Maps decode failures onto wire error codes.
fn error_code_for(error: &ProtocolError) -> ErrorCode {
    match error {
        ProtocolError::UnknownMessageType { .. } => ErrorCode::UnknownMessage,
        ProtocolError::TooManyArguments { .. } => ErrorCode::TooManyArgs,
        ProtocolError::InvalidCommand { .. } => ErrorCode::BadCommand,
        ProtocolError::UnsupportedVersion { .. } | ProtocolError::InvalidFrame { .. } => {
            ErrorCode::BadToken
        },
        _ => ErrorCode::Internal,
    }
}

fn io_session_error(error: ExecutorError) -> SessionError {
    match error {
        ExecutorError::Io(e) => SessionError::Protocol(ProtocolError::Io(e)),
        other => SessionError::Protocol(ProtocolError::Io(io::Error::other(other))),
    }
}

/// Reads the next token, mapping stream end and idle expiry.
async fn next_token(
    framed: &mut Framed<TcpStream, TokenCodec>,
    idle_timeout: Duration,
) -> Result<Token, SessionError> {
    match timeout(idle_timeout, framed.next()).await {
        Err(_elapsed) => Err(SessionError::IdleTimeout(idle_timeout)),
        Ok(None) => Err(SessionError::ConnectionClosed),
        Ok(Some(Err(error))) => Err(error.into()),
        Ok(Some(Ok(token))) => Ok(token),
    }
}
