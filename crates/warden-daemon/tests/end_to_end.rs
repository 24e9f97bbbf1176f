//! End-to-end tests over a real in-process daemon and client.
//!
//! Each test binds a daemon on an ephemeral port, connects with the
//! client library, and exercises a full command cycle through the
//! handshake, authorization, execution, and relay layers.

use std::io::Write;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use warden_cli::{ClientError, WardenClient};
use warden_core::policy::{AclEntry, Policy, Rule, StdinArg};
use warden_core::protocol::{ErrorCode, ProtocolVersion, StreamId};
use warden_core::secure::{Keyring, ProtectionLevel, SecretKey};
use warden_daemon::server::{ServerConfig, WardenServer};

const PRINCIPAL: &str = "alice";

struct TestDaemon {
    addr: SocketAddr,
    key: SecretKey,
}

impl TestDaemon {
    async fn start(policy: Policy) -> Self {
        Self::start_with_idle(policy, Duration::from_secs(60)).await
    }

    async fn start_with_idle(policy: Policy, idle_timeout: Duration) -> Self {
        let key = SecretKey::generate();
        let mut keyring = Keyring::new();
        keyring.insert(PRINCIPAL, key.clone());

        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap())
            .with_idle_timeout(idle_timeout);
        let server = WardenServer::bind(config, keyring, policy).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        Self { addr, key }
    }

    async fn connect(&self) -> WardenClient {
        WardenClient::connect(self.addr, PRINCIPAL, self.key.clone())
            .await
            .unwrap()
    }

    async fn connect_with(
        &self,
        version: ProtocolVersion,
        protection: ProtectionLevel,
    ) -> WardenClient {
        WardenClient::connect_with(self.addr, PRINCIPAL, self.key.clone(), version, protection)
            .await
            .unwrap()
    }
}

fn rule(command: &str, program: impl Into<PathBuf>, acl: Vec<AclEntry>) -> Rule {
    Rule {
        command: command.to_string(),
        subcommand: None,
        program: program.into(),
        stdin_arg: None,
        acl,
    }
}

fn allow_alice() -> Vec<AclEntry> {
    vec![AclEntry::Principal(PRINCIPAL.to_string())]
}

fn write_script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "#!/bin/sh\n{body}").unwrap();
    let mut perms = file.metadata().unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn args(words: &[&str]) -> Vec<Vec<u8>> {
    words.iter().map(|w| w.as_bytes().to_vec()).collect()
}

#[tokio::test]
async fn echo_command_streams_output_and_status() {
    let policy = Policy::new(vec![rule("echo", "/bin/echo", allow_alice())]);
    let daemon = TestDaemon::start(policy).await;

    let mut client = daemon.connect().await;
    let reply = client.call(&args(&["echo", "hi"]), false).await.unwrap();

    assert_eq!(reply.status, 0);
    assert_eq!(reply.stdout, b"hi\n");
    assert!(reply.stderr.is_empty());
}

#[tokio::test]
async fn absent_command_is_denied_without_spawning() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("ran");
    let script = write_script(
        &dir,
        "sentinel",
        &format!("touch {}", marker.display()),
    );

    // The only rule denies alice; the requested command has no rule at
    // all. Neither may spawn anything.
    let policy = Policy::new(vec![rule(
        "sentinel",
        &script,
        vec![AclEntry::Principal("bob".to_string())],
    )]);
    let daemon = TestDaemon::start(policy).await;
    let mut client = daemon.connect().await;

    let err = client.call(&args(&["missing", "cmd"]), true).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Remote {
            code: ErrorCode::AccessDenied,
            ..
        }
    ));

    let err = client.call(&args(&["sentinel"]), true).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Remote {
            code: ErrorCode::AccessDenied,
            ..
        }
    ));

    assert!(!marker.exists(), "denied command spawned a process");
}

#[tokio::test]
async fn denial_keeps_v2_connection_usable() {
    let policy = Policy::new(vec![rule("echo", "/bin/echo", allow_alice())]);
    let daemon = TestDaemon::start(policy).await;
    let mut client = daemon.connect().await;

    let err = client.call(&args(&["forbidden"]), true).await.unwrap_err();
    assert!(matches!(err, ClientError::Remote { .. }));

    // The same connection still runs authorized commands.
    let reply = client.call(&args(&["echo", "still-alive"]), false).await.unwrap();
    assert_eq!(reply.status, 0);
    assert_eq!(reply.stdout, b"still-alive\n");
}

#[tokio::test]
async fn sequential_commands_have_independent_cycles() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "task", r#"echo "run:$1"; exit ${2:-0}"#);
    let policy = Policy::new(vec![rule("task", &script, allow_alice())]);
    let daemon = TestDaemon::start(policy).await;

    let mut client = daemon.connect().await;

    let first = client.call(&args(&["task", "one"]), true).await.unwrap();
    assert_eq!(first.status, 0);
    assert_eq!(first.stdout, b"run:one\n");

    let second = client.call(&args(&["task", "two", "3"]), true).await.unwrap();
    assert_eq!(second.status, 3);
    assert_eq!(second.stdout, b"run:two\n");

    client.quit().await.unwrap();
}

#[tokio::test]
async fn stderr_is_multiplexed_separately() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "noisy", "echo out; echo err >&2; exit 5");
    let policy = Policy::new(vec![rule("noisy", &script, allow_alice())]);
    let daemon = TestDaemon::start(policy).await;

    let mut client = daemon.connect().await;
    let reply = client.call(&args(&["noisy"]), false).await.unwrap();

    assert_eq!(reply.status, 5);
    assert_eq!(reply.stdout, b"out\n");
    assert_eq!(reply.stderr, b"err\n");
}

#[tokio::test]
async fn large_output_arrives_untruncated_and_ordered() {
    let dir = TempDir::new().unwrap();
    // 3125 lines of 64 bytes each: 200000 bytes, several chunks.
    let script = write_script(
        &dir,
        "flood",
        "i=0; while [ $i -lt 3125 ]; do printf '%063d\\n' $i; i=$((i+1)); done",
    );
    let policy = Policy::new(vec![rule("flood", &script, allow_alice())]);
    let daemon = TestDaemon::start(policy).await;

    let mut client = daemon.connect().await;
    let mut chunks = 0usize;
    let mut stdout = Vec::new();
    let status = client
        .call_streamed(&args(&["flood"]), false, |stream, data| {
            if stream == StreamId::Stdout {
                chunks += 1;
                stdout.extend_from_slice(data);
            }
        })
        .await
        .unwrap();

    let expected: Vec<u8> = (0..3125)
        .flat_map(|i| format!("{i:063}\n").into_bytes())
        .collect();
    assert_eq!(status, 0);
    assert_eq!(stdout.len(), expected.len());
    assert_eq!(stdout, expected, "stdout bytes reordered or corrupted");
    assert!(chunks > 1, "expected the output split across chunks");
}

#[tokio::test]
async fn command_concludes_despite_lingering_grandchild() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "forker", "echo started; sleep 30 & exit 0");
    let policy = Policy::new(vec![rule("forker", &script, allow_alice())]);
    let daemon = TestDaemon::start(policy).await;

    let mut client = daemon.connect().await;
    let start = Instant::now();
    let reply = client.call(&args(&["forker"]), false).await.unwrap();

    assert_eq!(reply.status, 0);
    assert_eq!(reply.stdout, b"started\n");
    assert!(
        start.elapsed() < Duration::from_secs(10),
        "status was withheld until the grandchild finished"
    );
}

#[tokio::test]
async fn signal_death_is_encoded_in_status() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "doomed", "kill -KILL $$");
    let policy = Policy::new(vec![rule("doomed", &script, allow_alice())]);
    let daemon = TestDaemon::start(policy).await;

    let mut client = daemon.connect().await;
    let reply = client.call(&args(&["doomed"]), false).await.unwrap();
    assert_eq!(reply.status, 128 + 9);
}

#[tokio::test]
async fn stdin_designated_argument_reaches_child_stdin() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "slurp", "cat");
    let mut store_rule = rule("store", &script, allow_alice());
    store_rule.stdin_arg = Some(StdinArg::Index(2));
    let policy = Policy::new(vec![store_rule]);
    let daemon = TestDaemon::start(policy).await;

    let mut client = daemon.connect().await;
    let mut request = args(&["store", "put"]);
    request.push(b"binary\x00payload\nwith lines".to_vec());

    let reply = client.call(&request, false).await.unwrap();
    assert_eq!(reply.status, 0);
    assert_eq!(reply.stdout, b"binary\x00payload\nwith lines");
}

#[tokio::test]
async fn child_without_input_sees_immediate_eof() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "slurp", "cat");
    let policy = Policy::new(vec![rule("slurp", &script, allow_alice())]);
    let daemon = TestDaemon::start(policy).await;

    let mut client = daemon.connect().await;
    let start = Instant::now();
    let reply = client.call(&args(&["slurp"]), false).await.unwrap();

    assert_eq!(reply.status, 0);
    assert!(reply.stdout.is_empty());
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "child blocked reading an empty stdin"
    );
}

#[tokio::test]
async fn nul_in_plain_argument_is_rejected() {
    let policy = Policy::new(vec![rule("echo", "/bin/echo", allow_alice())]);
    let daemon = TestDaemon::start(policy).await;

    let mut client = daemon.connect().await;
    let mut request = args(&["echo", "sub"]);
    request.push(b"has\x00nul".to_vec());

    let err = client.call(&request, false).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Remote {
            code: ErrorCode::BadCommand,
            ..
        }
    ));
}

#[tokio::test]
async fn legacy_v1_single_shot_aggregates_output() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "both", "echo out; echo err >&2; exit 4");
    let policy = Policy::new(vec![rule("both", &script, allow_alice())]);
    let daemon = TestDaemon::start(policy).await;

    let mut client = daemon
        .connect_with(ProtocolVersion::V1, ProtectionLevel::Private)
        .await;
    let reply = client.call(&args(&["both"]), false).await.unwrap();

    assert_eq!(reply.status, 4);
    // Both streams aggregate into one buffer for the legacy reply.
    let text = String::from_utf8(reply.stdout).unwrap();
    assert!(text.contains("out\n"));
    assert!(text.contains("err\n"));
    assert!(reply.stderr.is_empty());

    // Version 1 is single-shot: the server closes after the reply.
    let err = client.call(&args(&["both"]), false).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::ConnectionClosed | ClientError::Io(_) | ClientError::Protocol(_)
    ));
}

#[tokio::test]
async fn legacy_v1_denial_uses_error_reply() {
    let policy = Policy::new(vec![]);
    let daemon = TestDaemon::start(policy).await;

    let mut client = daemon
        .connect_with(ProtocolVersion::V1, ProtectionLevel::Private)
        .await;
    let reply = client.call(&args(&["anything"]), false).await.unwrap();
    assert_eq!(reply.status, -1);
    assert_eq!(reply.stdout, b"Access denied\n");
}

#[tokio::test]
async fn integrity_only_channel_works() {
    let policy = Policy::new(vec![rule("echo", "/bin/echo", allow_alice())]);
    let daemon = TestDaemon::start(policy).await;

    let mut client = daemon
        .connect_with(ProtocolVersion::V2, ProtectionLevel::Integrity)
        .await;
    let reply = client.call(&args(&["echo", "clear"]), false).await.unwrap();
    assert_eq!(reply.status, 0);
    assert_eq!(reply.stdout, b"clear\n");
}

#[tokio::test]
async fn wrong_key_cannot_establish_session() {
    let policy = Policy::new(vec![rule("echo", "/bin/echo", allow_alice())]);
    let daemon = TestDaemon::start(policy).await;

    let wrong_key = SecretKey::generate();
    let result = WardenClient::connect(daemon.addr, PRINCIPAL, wrong_key).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn unknown_principal_cannot_establish_session() {
    let policy = Policy::new(vec![rule("echo", "/bin/echo", allow_alice())]);
    let daemon = TestDaemon::start(policy).await;

    let result =
        WardenClient::connect(daemon.addr, "mallory", SecretKey::generate()).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn spawn_failure_reports_error_not_status() {
    let policy = Policy::new(vec![rule(
        "ghost",
        "/nonexistent/warden-e2e-binary",
        allow_alice(),
    )]);
    let daemon = TestDaemon::start(policy).await;

    let mut client = daemon.connect().await;
    let err = client.call(&args(&["ghost"]), true).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Remote {
            code: ErrorCode::Internal,
            ..
        }
    ));

    // The connection survives the spawn failure.
    let err = client.call(&args(&["ghost"]), false).await.unwrap_err();
    assert!(matches!(err, ClientError::Remote { .. }));
}

#[tokio::test]
async fn idle_connection_is_closed() {
    let policy = Policy::new(vec![rule("echo", "/bin/echo", allow_alice())]);
    let daemon =
        TestDaemon::start_with_idle(policy, Duration::from_millis(300)).await;

    let mut client = daemon.connect().await;
    tokio::time::sleep(Duration::from_millis(900)).await;

    let result = client.call(&args(&["echo", "late"]), false).await;
    assert!(result.is_err(), "idle connection should have been torn down");
}

#[tokio::test]
async fn acl_program_entry_gates_command() {
    let dir = TempDir::new().unwrap();
    let helper = write_script(
        &dir,
        "gate",
        r#"[ "$1" = "alice" ] && exit 0; exit 1"#,
    );
    let policy = Policy::new(vec![rule(
        "echo",
        "/bin/echo",
        vec![AclEntry::Program {
            path: helper,
            args: vec![],
        }],
    )]);
    let daemon = TestDaemon::start(policy).await;

    let mut client = daemon.connect().await;
    let reply = client.call(&args(&["echo", "gated"]), false).await.unwrap();
    assert_eq!(reply.status, 0);
    assert_eq!(reply.stdout, b"gated\n");
}
