//! Command executor: child process supervision and output relay.
//!
//! The executor owns one child process per authorized command: it
//! spawns the rule's program, feeds any stdin-designated argument to the
//! child, relays stdout and stderr as chunked output through an
//! [`OutputSink`], and surfaces the exit status.
//!
//! # Signal and Descriptor Hygiene
//!
//! - Rust's startup leaves SIGPIPE ignored in this process; the child's
//!   disposition is reset to default before exec so it observes normal
//!   broken-pipe behavior rather than silently succeeding writes to a
//!   closed peer.
//! - A child with no input data gets its stdin opened on the null
//!   device, so reads see immediate end-of-file instead of blocking on
//!   an open-but-silent pipe.
//! - Children are killed on drop: tearing down a session forcibly
//!   releases any still-running child.
//!
//! # Backpressure and Termination
//!
//! Output is read one bounded chunk at a time and each chunk is awaited
//! into the sink before the next read, so an unwritable client socket
//! pauses reading from the child instead of buffering without bound.
//!
//! Child exit and pipe end-of-file are demultiplexed as independent
//! events: once the direct child reports exit, remaining pipe output is
//! drained only as long as it keeps arriving promptly. A background
//! grandchild holding the pipes open cannot stall the command cycle
//! past the drain window.

use std::ffi::OsStr;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use nix::sys::signal::{SigHandler, Signal};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, warn};
use warden_core::identity::ENV_PRINCIPAL;
use warden_core::policy::{CommandRequest, Rule, StdinArg};
use warden_core::protocol::{MAX_OUTPUT_DATA, StreamId, V1_MAX_OUTPUT};

/// Environment variable carrying the client address to the child.
pub const ENV_ADDR: &str = "WARDEN_ADDR";

/// Environment variable carrying the command word to the child.
pub const ENV_COMMAND: &str = "WARDEN_COMMAND";

/// How long to keep polling for residual output after the child exits.
const DEFAULT_DRAIN_POLL: Duration = Duration::from_millis(200);

/// Errors from spawning or pumping a command.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The rule's program does not exist.
    #[error("executable not found: {path}")]
    NotFound {
        /// Program path from the rule.
        path: PathBuf,
    },

    /// The rule's program is not executable by the daemon.
    #[error("permission denied executing {path}")]
    PermissionDenied {
        /// Program path from the rule.
        path: PathBuf,
    },

    /// Process or pipe creation failed.
    #[error("cannot spawn process: {source}")]
    Resource {
        /// Underlying I/O error.
        source: io::Error,
    },

    /// I/O failure while relaying data.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ExecutorError {
    /// Returns `true` for failures to start the child at all.
    ///
    /// Spawn failures are reported to the client as an error message,
    /// never a partial status, and leave the connection usable.
    #[must_use]
    pub const fn is_spawn_failure(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::PermissionDenied { .. } | Self::Resource { .. }
        )
    }
}

/// Consumer of relayed child output.
///
/// The executor awaits every chunk into the sink before reading more
/// from the child; the sink's own backpressure bounds memory use.
#[async_trait]
pub trait OutputSink: Send {
    /// Delivers one chunk of child output.
    async fn send_output(&mut self, stream: StreamId, data: Bytes) -> io::Result<()>;
}

/// Executes authorized commands as supervised child processes.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    chunk_size: usize,
    drain_poll: Duration,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self {
            chunk_size: MAX_OUTPUT_DATA,
            drain_poll: DEFAULT_DRAIN_POLL,
        }
    }
}

impl CommandExecutor {
    /// Creates an executor with default chunking.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the output chunk ceiling.
    #[must_use]
    pub const fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Overrides the post-exit drain poll interval.
    #[must_use]
    pub const fn with_drain_poll(mut self, drain_poll: Duration) -> Self {
        self.drain_poll = drain_poll;
        self
    }

    /// Runs a command, streaming output chunks into the sink.
    ///
    /// Returns the mapped exit status: the child's exit code, or
    /// `128 + signal` for signal death.
    ///
    /// # Errors
    ///
    /// Spawn failures ([`ExecutorError::is_spawn_failure`]) mean no
    /// process ran; `Io` means relaying failed mid-command.
    pub async fn run_streamed<S: OutputSink>(
        &self,
        rule: &Rule,
        request: &CommandRequest,
        peer_addr: &str,
        sink: &mut S,
    ) -> Result<i32, ExecutorError> {
        let (child, input) = self.spawn(rule, request, peer_addr)?;
        self.pump(child, input, sink).await
    }

    /// Runs a command, aggregating both streams into one buffer.
    ///
    /// Used for the legacy protocol generation: output beyond the
    /// single-reply cap is read and discarded rather than truncating
    /// the child.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`run_streamed`](Self::run_streamed).
    pub async fn run_collected(
        &self,
        rule: &Rule,
        request: &CommandRequest,
        peer_addr: &str,
    ) -> Result<(i32, Vec<u8>), ExecutorError> {
        let mut sink = CollectSink {
            buf: Vec::new(),
            cap: V1_MAX_OUTPUT,
        };
        let status = self.run_streamed(rule, request, peer_addr, &mut sink).await?;
        Ok((status, sink.buf))
    }

    /// Spawns the rule's program for a request.
    fn spawn(
        &self,
        rule: &Rule,
        request: &CommandRequest,
        peer_addr: &str,
    ) -> Result<(Child, Option<Vec<u8>>), ExecutorError> {
        let (argv, input) = build_argv(rule, request);

        let mut command = Command::new(&rule.program);
        command
            .args(argv.iter().map(|arg| OsStr::from_bytes(arg)))
            .env(ENV_PRINCIPAL, &request.principal)
            .env(ENV_ADDR, peer_addr)
            .env(ENV_COMMAND, &request.command)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                // No input data: the child reads immediate end-of-file.
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        unsafe {
            command.pre_exec(|| {
                // Rust startup leaves SIGPIPE ignored; the child must
                // observe the default disposition.
                // SAFETY: signal(2) is async-signal-safe between fork
                // and exec.
                unsafe { nix::sys::signal::signal(Signal::SIGPIPE, SigHandler::SigDfl) }
                    .map(|_| ())
                    .map_err(|errno| io::Error::from_raw_os_error(errno as i32))
            });
        }

        let child = command.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ExecutorError::NotFound {
                path: rule.program.clone(),
            },
            io::ErrorKind::PermissionDenied => ExecutorError::PermissionDenied {
                path: rule.program.clone(),
            },
            _ => ExecutorError::Resource { source: e },
        })?;

        debug!(
            program = %rule.program.display(),
            pid = child.id().unwrap_or(0),
            "spawned command"
        );
        Ok((child, input))
    }

    /// Relays child I/O until the command concludes.
    ///
    /// The loop demultiplexes stdout/stderr readiness, stdin progress,
    /// and child exit; it leaves as soon as the direct child has exited,
    /// after which still-open pipes are drained only while output keeps
    /// arriving within the drain window.
    async fn pump<S: OutputSink>(
        &self,
        mut child: Child,
        input: Option<Vec<u8>>,
        sink: &mut S,
    ) -> Result<i32, ExecutorError> {
        let mut stdout = child.stdout.take().ok_or_else(|| ExecutorError::Resource {
            source: io::Error::other("child stdout was not piped"),
        })?;
        let mut stderr = child.stderr.take().ok_or_else(|| ExecutorError::Resource {
            source: io::Error::other("child stderr was not piped"),
        })?;
        let mut stdin_writer = child.stdin.take();
        let input = input.unwrap_or_default();
        let mut written = 0usize;
        if input.is_empty() {
            // Nothing to feed; close the write end straight away.
            stdin_writer = None;
        }
        let mut input_open = stdin_writer.is_some();

        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut out_buf = vec![0u8; self.chunk_size];
        let mut err_buf = vec![0u8; self.chunk_size];

        let exit_status: ExitStatus = loop {
            tokio::select! {
                read = stdout.read(&mut out_buf), if stdout_open => {
                    match read {
                        Ok(0) => stdout_open = false,
                        Ok(n) => {
                            sink.send_output(StreamId::Stdout, Bytes::copy_from_slice(&out_buf[..n]))
                                .await?;
                        },
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                        Err(e) => return Err(e.into()),
                    }
                },
                read = stderr.read(&mut err_buf), if stderr_open => {
                    match read {
                        Ok(0) => stderr_open = false,
                        Ok(n) => {
                            sink.send_output(StreamId::Stderr, Bytes::copy_from_slice(&err_buf[..n]))
                                .await?;
                        },
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                        Err(e) => return Err(e.into()),
                    }
                },
                wrote = write_stdin(stdin_writer.as_mut(), &input, written), if input_open => {
                    match wrote {
                        Ok(0) => {
                            stdin_writer = None;
                            input_open = false;
                        },
                        Ok(n) => {
                            written += n;
                            if written >= input.len() {
                                // Close the pipe so the child sees EOF.
                                stdin_writer = None;
                                input_open = false;
                            }
                        },
                        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                            // The child stopped reading; that is its
                            // prerogative, not an error.
                            stdin_writer = None;
                            input_open = false;
                        },
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                        Err(e) => return Err(e.into()),
                    }
                },
                status = child.wait() => break status?,
            }
        };

        // The direct child has exited. Pipes may hold residual output,
        // and a forked grandchild may keep them open indefinitely; read
        // only while data keeps arriving promptly.
        if stdout_open {
            self.drain(&mut stdout, StreamId::Stdout, &mut out_buf, sink)
                .await?;
        }
        if stderr_open {
            self.drain(&mut stderr, StreamId::Stderr, &mut err_buf, sink)
                .await?;
        }

        Ok(map_status(exit_status))
    }

    /// Drains residual output after child exit.
    ///
    /// Stops at end-of-file or as soon as one drain window elapses with
    /// no output, whichever comes first.
    async fn drain<R: AsyncRead + Unpin, S: OutputSink>(
        &self,
        reader: &mut R,
        stream: StreamId,
        buf: &mut [u8],
        sink: &mut S,
    ) -> Result<(), ExecutorError> {
        loop {
            match timeout(self.drain_poll, reader.read(buf)).await {
                Err(_elapsed) => {
                    debug!(%stream, "output pipe still open after child exit; concluding");
                    return Ok(());
                },
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(n)) => {
                    sink.send_output(stream, Bytes::copy_from_slice(&buf[..n]))
                        .await?;
                },
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {},
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }
}

/// Writes the next slice of stdin data, or parks if there is no writer.
async fn write_stdin(
    writer: Option<&mut tokio::process::ChildStdin>,
    input: &[u8],
    written: usize,
) -> io::Result<usize> {
    match writer {
        Some(writer) => writer.write(&input[written..]).await,
        // Unreachable under the select guard; never resolves.
        None => std::future::pending().await,
    }
}

/// Splits the request's argument vector into child argv and stdin data.
///
/// The command word itself is never part of the child argv (the rule's
/// program decides its own name), and at most one argument is routed to
/// standard input per the rule.
fn build_argv(rule: &Rule, request: &CommandRequest) -> (Vec<Vec<u8>>, Option<Vec<u8>>) {
    let stdin_index = match rule.stdin_arg {
        None => None,
        Some(StdinArg::Last) => request.args.len().checked_sub(1).filter(|index| *index >= 1),
        Some(StdinArg::Index(n)) => (n >= 1 && n < request.args.len()).then_some(n),
    };

    let mut argv = Vec::with_capacity(request.args.len().saturating_sub(1));
    let mut input = None;
    for (index, arg) in request.args.iter().enumerate().skip(1) {
        if Some(index) == stdin_index {
            input = Some(arg.clone());
        } else {
            argv.push(arg.clone());
        }
    }
    (argv, input)
}

/// Maps an exit status onto the wire encoding.
fn map_status(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        code
    } else if let Some(sig) = status.signal() {
        // Reserved range encoding signal death.
        128 + sig
    } else {
        warn!("child exit status had neither code nor signal");
        -1
    }
}

/// Sink aggregating both streams up to a cap, discarding the surplus.
struct CollectSink {
    buf: Vec<u8>,
    cap: usize,
}

#[async_trait]
impl OutputSink for CollectSink {
    async fn send_output(&mut self, _stream: StreamId, data: Bytes) -> io::Result<()> {
        let room = self.cap.saturating_sub(self.buf.len());
        let take = room.min(data.len());
        self.buf.extend_from_slice(&data[..take]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Instant;

    use super::*;

    /// Sink recording every chunk for assertions.
    #[derive(Default)]
    struct RecordingSink {
        chunks: Vec<(StreamId, Bytes)>,
    }

    impl RecordingSink {
        fn stream_bytes(&self, stream: StreamId) -> Vec<u8> {
            self.chunks
                .iter()
                .filter(|(s, _)| *s == stream)
                .flat_map(|(_, data)| data.iter().copied())
                .collect()
        }
    }

    #[async_trait]
    impl OutputSink for RecordingSink {
        async fn send_output(&mut self, stream: StreamId, data: Bytes) -> io::Result<()> {
            self.chunks.push((stream, data));
            Ok(())
        }
    }

    fn shell_rule() -> Rule {
        Rule {
            command: "test".to_string(),
            subcommand: None,
            program: PathBuf::from("/bin/sh"),
            stdin_arg: None,
            acl: vec![],
        }
    }

    fn shell_request(script: &str) -> CommandRequest {
        CommandRequest {
            principal: "alice".to_string(),
            command: "test".to_string(),
            subcommand: None,
            args: vec![b"test".to_vec(), b"-c".to_vec(), script.as_bytes().to_vec()],
        }
    }

    async fn run_shell(script: &str) -> (i32, RecordingSink) {
        let executor = CommandExecutor::new();
        let rule = shell_rule();
        let request = shell_request(script);
        let mut sink = RecordingSink::default();
        let status = executor
            .run_streamed(&rule, &request, "127.0.0.1", &mut sink)
            .await
            .unwrap();
        (status, sink)
    }

    #[tokio::test]
    async fn test_echo_stdout() {
        let (status, sink) = run_shell("echo hi").await;
        assert_eq!(status, 0);
        assert_eq!(sink.stream_bytes(StreamId::Stdout), b"hi\n");
        assert!(sink.stream_bytes(StreamId::Stderr).is_empty());
    }

    #[tokio::test]
    async fn test_stderr_routed_separately() {
        let (status, sink) = run_shell("echo out; echo err >&2").await;
        assert_eq!(status, 0);
        assert_eq!(sink.stream_bytes(StreamId::Stdout), b"out\n");
        assert_eq!(sink.stream_bytes(StreamId::Stderr), b"err\n");
    }

    #[tokio::test]
    async fn test_exit_code_surfaces() {
        let (status, _sink) = run_shell("exit 42").await;
        assert_eq!(status, 42);
    }

    #[tokio::test]
    async fn test_signal_death_maps_to_reserved_range() {
        let (status, _sink) = run_shell("kill -TERM $$").await;
        assert_eq!(status, 128 + 15);
    }

    #[tokio::test]
    async fn test_output_order_preserved_per_stream() {
        let (status, sink) =
            run_shell("i=0; while [ $i -lt 200 ]; do echo line$i; i=$((i+1)); done").await;
        assert_eq!(status, 0);
        let expected: Vec<u8> = (0..200)
            .flat_map(|i| format!("line{i}\n").into_bytes())
            .collect();
        assert_eq!(sink.stream_bytes(StreamId::Stdout), expected);
    }

    #[tokio::test]
    async fn test_no_input_means_immediate_eof() {
        // cat with closed stdin must finish immediately, not block.
        let start = Instant::now();
        let (status, sink) = run_shell("cat").await;
        assert_eq!(status, 0);
        assert!(sink.stream_bytes(StreamId::Stdout).is_empty());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_stdin_argument_spliced_and_delivered() {
        let executor = CommandExecutor::new();
        let rule = Rule {
            command: "store".to_string(),
            subcommand: None,
            program: PathBuf::from("/bin/cat"),
            stdin_arg: Some(StdinArg::Last),
            acl: vec![],
        };
        let request = CommandRequest {
            principal: "alice".to_string(),
            command: "store".to_string(),
            subcommand: None,
            args: vec![b"store".to_vec(), b"payload\nwith lines\n".to_vec()],
        };
        let mut sink = RecordingSink::default();
        let status = executor
            .run_streamed(&rule, &request, "127.0.0.1", &mut sink)
            .await
            .unwrap();
        assert_eq!(status, 0);
        assert_eq!(sink.stream_bytes(StreamId::Stdout), b"payload\nwith lines\n");
    }

    #[tokio::test]
    async fn test_early_exit_with_lingering_grandchild() {
        // The child exits immediately but leaves a background sleep
        // holding the output pipe open. The command must conclude within
        // the drain window, not after the grandchild.
        let start = Instant::now();
        let (status, sink) = run_shell("echo started; sleep 30 & exit 0").await;
        assert_eq!(status, 0);
        assert_eq!(sink.stream_bytes(StreamId::Stdout), b"started\n");
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "command cycle waited on the grandchild"
        );
    }

    #[tokio::test]
    async fn test_child_sigpipe_disposition_is_default() {
        // The daemon process ignores SIGPIPE; the child must not
        // inherit that. SigIgn bit 12 (signal 13) must be clear.
        let (status, sink) = run_shell("grep SigIgn /proc/self/status").await;
        assert_eq!(status, 0);
        let line = String::from_utf8(sink.stream_bytes(StreamId::Stdout)).unwrap();
        let mask = line
            .split_whitespace()
            .nth(1)
            .and_then(|hex| u64::from_str_radix(hex, 16).ok())
            .expect("SigIgn line parses");
        assert_eq!(
            mask & (1 << 12),
            0,
            "child inherited an ignored SIGPIPE: {line}"
        );
    }

    #[tokio::test]
    async fn test_spawn_not_found() {
        let executor = CommandExecutor::new();
        let rule = Rule {
            command: "ghost".to_string(),
            subcommand: None,
            program: PathBuf::from("/nonexistent/warden-test-binary"),
            stdin_arg: None,
            acl: vec![],
        };
        let request = CommandRequest {
            principal: "alice".to_string(),
            command: "ghost".to_string(),
            subcommand: None,
            args: vec![b"ghost".to_vec()],
        };
        let mut sink = RecordingSink::default();
        let err = executor
            .run_streamed(&rule, &request, "127.0.0.1", &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::NotFound { .. }));
        assert!(err.is_spawn_failure());
    }

    #[tokio::test]
    async fn test_child_environment_contract() {
        let (status, sink) =
            run_shell(r#"printf '%s|%s|%s' "$WARDEN_USER" "$WARDEN_ADDR" "$WARDEN_COMMAND""#).await;
        assert_eq!(status, 0);
        assert_eq!(
            sink.stream_bytes(StreamId::Stdout),
            b"alice|127.0.0.1|test"
        );
    }

    #[tokio::test]
    async fn test_collected_output_caps_and_discards() {
        let executor = CommandExecutor::new();
        let rule = shell_rule();
        // Emit well past the aggregate cap.
        let request = shell_request(
            "i=0; while [ $i -lt 2000 ]; do printf '%064d\\n' $i; i=$((i+1)); done",
        );
        let (status, data) = executor
            .run_collected(&rule, &request, "127.0.0.1")
            .await
            .unwrap();
        assert_eq!(status, 0);
        assert_eq!(data.len(), V1_MAX_OUTPUT);
    }

    #[test]
    fn test_build_argv_splices_stdin_index() {
        let rule = Rule {
            command: "put".to_string(),
            subcommand: None,
            program: PathBuf::from("/bin/true"),
            stdin_arg: Some(StdinArg::Index(2)),
            acl: vec![],
        };
        let request = CommandRequest {
            principal: "alice".to_string(),
            command: "put".to_string(),
            subcommand: None,
            args: vec![
                b"put".to_vec(),
                b"name".to_vec(),
                b"DATA".to_vec(),
                b"tail".to_vec(),
            ],
        };
        let (argv, input) = build_argv(&rule, &request);
        assert_eq!(argv, vec![b"name".to_vec(), b"tail".to_vec()]);
        assert_eq!(input, Some(b"DATA".to_vec()));
    }

    #[test]
    fn test_build_argv_stdin_index_out_of_range_is_ignored() {
        let rule = Rule {
            command: "put".to_string(),
            subcommand: None,
            program: PathBuf::from("/bin/true"),
            stdin_arg: Some(StdinArg::Index(5)),
            acl: vec![],
        };
        let request = CommandRequest {
            principal: "alice".to_string(),
            command: "put".to_string(),
            subcommand: None,
            args: vec![b"put".to_vec(), b"only".to_vec()],
        };
        let (argv, input) = build_argv(&rule, &request);
        assert_eq!(argv, vec![b"only".to_vec()]);
        assert_eq!(input, None);
    }
}
