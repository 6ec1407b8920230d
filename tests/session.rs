//! End-to-end session tests against scripted `sh` tool servers.

#![cfg(unix)]

use std::path::Path;
use std::time::{Duration, Instant};

use mcp_session::{
    ConnectionConfig, ConnectionState, LogLevel, LogSource, McpError, RawArguments, Session,
};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde_json::json;
use tempfile::TempDir;

// ─── Fake servers ────────────────────────────────────────────────────────────

/// Line-oriented JSON-RPC server: answers `initialize`, `tools/list` and
/// `tools/call`, and writes Python-logging style lines to stderr.
const ECHO_SERVER: &str = r#"#!/bin/sh
echo "2024-01-01 10:00:00 - fake - INFO - server starting" >&2
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9][0-9]*\),.*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"fake","version":"0.0.1"}}}\n' "$id"
      ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[%s]}}\n' "$id" "$TOOLS"
      ;;
    *'"method":"tools/call"'*'"name":"fail"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"quota exceeded"}],"isError":true}}\n' "$id"
      ;;
    *'"method":"tools/call"'*'"name":"reject"'*)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32602,"message":"bad params"}}\n' "$id"
      ;;
    *'"method":"tools/call"'*)
      echo "2024-01-01 10:00:01 - fake - ERROR - disk full" >&2
      printf '{"jsonrpc":"2.0","method":"notifications/message","params":{"level":"warning","data":"slow call"}}\n'
      args=$(printf '%s\n' "$line" | sed -n 's/.*"params":{"arguments":\(.*\),"name":"[^"]*"}}$/\1/p')
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"json","value":%s}],"isError":false}}\n' "$id" "$args"
      ;;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"Method not found"}}\n' "$id"
      ;;
  esac
done
"#;

const DEFAULT_TOOLS: &str = r#"{"name":"echo","description":"Echo arguments","inputSchema":{"type":"object","properties":{"count":{"type":"number"},"verbose":{"type":"boolean"},"label":{"type":"string"}},"required":["count"]}},{"name":"fail"},{"name":"reject"}"#;

/// Exits before answering anything.
const CRASHING_SERVER: &str = "#!/bin/sh\necho 'fatal: cannot start' >&2\nexit 1\n";

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    /// Write an echo server advertising `tools` and return its launch command.
    fn echo_server(&self, file: &str, tools: &str) -> String {
        let body = ECHO_SERVER.replace("\"$TOOLS\"", &format!("'{tools}'"));
        self.command_for(file, &body)
    }

    fn command_for(&self, file: &str, body: &str) -> String {
        let path = self.dir.path().join(file);
        std::fs::write(&path, body).unwrap();
        format!("sh {}", path.display())
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }
}

fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        max_attempts: 3,
        spawn_settle_ms: 0,
        handshake_settle_ms: 0,
        retry_backoff_ms: 50,
        request_timeout_ms: 5_000,
        terminate_grace_ms: 200,
        ..ConnectionConfig::default()
    }
}

fn args(value: serde_json::Value) -> RawArguments {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

fn process_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

// ─── Connect ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_lists_tools_in_server_order() {
    let fx = Fixture::new();
    let session = Session::new(fast_config());

    let catalog = session
        .connect(&fx.echo_server("server.sh", DEFAULT_TOOLS))
        .await
        .unwrap();

    assert_eq!(catalog.tool_names(), vec!["echo", "fail", "reject"]);
    assert_eq!(session.state(), ConnectionState::Connected);
    assert_eq!(session.list_tools().len(), 3);
    assert!(session.is_transport_open().await);
    assert!(session.is_server_running().await);

    session.disconnect().await;
}

#[tokio::test]
async fn test_reconnect_replaces_catalog_and_process() {
    let fx = Fixture::new();
    let session = Session::new(fast_config());

    session
        .connect(&fx.echo_server("first.sh", DEFAULT_TOOLS))
        .await
        .unwrap();
    let first_pid = session.server_pid().await.unwrap();

    let catalog = session
        .connect(&fx.echo_server("second.sh", r#"{"name":"only_tool"}"#))
        .await
        .unwrap();

    assert_eq!(catalog.tool_names(), vec!["only_tool"]);
    assert_eq!(session.list_tools().tool_names(), vec!["only_tool"]);
    assert_ne!(session.server_pid().await, Some(first_pid));
    assert!(!process_alive(first_pid));

    session.disconnect().await;
}

#[tokio::test]
async fn test_server_with_no_tools() {
    let fx = Fixture::new();
    let session = Session::new(fast_config());

    let catalog = session.connect(&fx.echo_server("empty.sh", "")).await.unwrap();

    assert!(catalog.is_empty());
    assert_eq!(session.state(), ConnectionState::Connected);
    session.disconnect().await;
}

#[tokio::test]
async fn test_crashing_server_exhausts_attempts_with_backoff() {
    let fx = Fixture::new();
    let config = ConnectionConfig {
        retry_backoff_ms: 100,
        ..fast_config()
    };
    let session = Session::new(config);
    let command = fx.command_for("crash.sh", CRASHING_SERVER);

    let start = Instant::now();
    let err = session.connect(&command).await.unwrap_err();

    assert!(start.elapsed() >= Duration::from_millis(200));
    match err {
        McpError::ConnectionExhausted { name, attempts, .. } => {
            assert_eq!(name, "crash.sh");
            assert_eq!(attempts, 3);
        }
        other => panic!("expected ConnectionExhausted, got {other:?}"),
    }
    assert_eq!(session.state(), ConnectionState::Failed);
    assert!(session.list_tools().is_empty());
    assert!(!session.is_server_running().await);
}

#[tokio::test]
async fn test_disconnect_cancels_retry_loop() {
    let fx = Fixture::new();
    let config = ConnectionConfig {
        max_attempts: 5,
        retry_backoff_ms: 10_000,
        ..fast_config()
    };
    let session = Session::new(config);
    let command = fx.command_for("crash.sh", CRASHING_SERVER);

    let connecting = {
        let session = session.clone();
        tokio::spawn(async move { session.connect(&command).await })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    let start = Instant::now();
    session.disconnect().await;

    let result = tokio::time::timeout(Duration::from_secs(5), connecting)
        .await
        .expect("connect did not unwind after disconnect")
        .unwrap();
    assert!(matches!(result, Err(McpError::Cancelled)));
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(!session.is_server_running().await);
}

#[tokio::test]
async fn test_concurrent_connect_is_rejected() {
    let fx = Fixture::new();
    let config = ConnectionConfig {
        spawn_settle_ms: 500,
        ..fast_config()
    };
    let session = Session::new(config);
    let command = fx.echo_server("server.sh", DEFAULT_TOOLS);

    let first = {
        let session = session.clone();
        let command = command.clone();
        tokio::spawn(async move { session.connect(&command).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.state(), ConnectionState::Connecting);

    let err = session.connect(&command).await.unwrap_err();
    assert!(matches!(err, McpError::AlreadyConnecting));

    let catalog = first.await.unwrap().unwrap();
    assert_eq!(catalog.len(), 3);
    assert_eq!(session.state(), ConnectionState::Connected);
    session.disconnect().await;
}

#[tokio::test]
async fn test_spawn_options_reach_server() {
    let fx = Fixture::new();
    let script = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9][0-9]*\),.*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *'"method":"initialize"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id" ;;
    *) printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"%s_%s"}]}}\n' "$id" "$FAKE_PREFIX" "$(basename "$(pwd -P)")" ;;
  esac
done
"#;
    let workdir = fx.path().join("work");
    std::fs::create_dir(&workdir).unwrap();
    let mut config = fast_config();
    config.cwd = Some(workdir.display().to_string());
    config.env.insert("FAKE_PREFIX".into(), "env".into());

    let session = Session::new(config);
    let catalog = session.connect(&fx.command_for("env.sh", script)).await.unwrap();

    assert_eq!(catalog.tool_names(), vec!["env_work"]);
    session.disconnect().await;
}

// ─── Invoke ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_invoke_coerces_textual_arguments() {
    let fx = Fixture::new();
    let session = Session::new(fast_config());
    session
        .connect(&fx.echo_server("server.sh", DEFAULT_TOOLS))
        .await
        .unwrap();

    let result = session
        .invoke(
            "echo",
            args(json!({"count": "42", "verbose": "TRUE", "label": ""})),
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.tool_name, "echo");
    assert!(result.error.is_none());
    assert_eq!(result.content[0]["value"], json!({"count": 42, "verbose": true}));

    session.disconnect().await;
}

#[tokio::test]
async fn test_invoke_validation_errors() {
    let fx = Fixture::new();
    let session = Session::new(fast_config());
    session
        .connect(&fx.echo_server("server.sh", DEFAULT_TOOLS))
        .await
        .unwrap();

    let err = session.invoke("nope", RawArguments::new()).await.unwrap_err();
    assert!(matches!(err, McpError::UnknownTool { ref name } if name == "nope"));

    let err = session
        .invoke("echo", args(json!({"verbose": "true"})))
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::MissingArgument { ref argument, .. } if argument == "count"));

    let err = session
        .invoke("echo", args(json!({"count": "many"})))
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::InvalidArgument { .. }));

    // The connection survives rejected invocations.
    let result = session
        .invoke("echo", args(json!({"count": "1.5"})))
        .await
        .unwrap();
    assert_eq!(result.content[0]["value"]["count"], json!(1.5));

    session.disconnect().await;
}

#[tokio::test]
async fn test_tool_errors_are_failed_results() {
    let fx = Fixture::new();
    let session = Session::new(fast_config());
    session
        .connect(&fx.echo_server("server.sh", DEFAULT_TOOLS))
        .await
        .unwrap();

    let failed = session.invoke("fail", RawArguments::new()).await.unwrap();
    assert!(!failed.success);
    assert_eq!(failed.error.as_deref(), Some("quota exceeded"));

    let rejected = session.invoke("reject", RawArguments::new()).await.unwrap();
    assert!(!rejected.success);
    assert_eq!(rejected.error.as_deref(), Some("[-32602] bad params"));

    session.disconnect().await;
}

#[tokio::test]
async fn test_invoke_after_disconnect() {
    let fx = Fixture::new();
    let session = Session::new(fast_config());
    session
        .connect(&fx.echo_server("server.sh", DEFAULT_TOOLS))
        .await
        .unwrap();
    session.disconnect().await;

    let err = session
        .invoke("echo", args(json!({"count": "1"})))
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::NotConnected));
}

// ─── Logs ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_server_diagnostics_are_classified() {
    let fx = Fixture::new();
    let session = Session::new(fast_config());
    let mut logs = session.subscribe_logs();

    session
        .connect(&fx.echo_server("server.sh", DEFAULT_TOOLS))
        .await
        .unwrap();
    session
        .invoke("echo", args(json!({"count": "7"})))
        .await
        .unwrap();

    let mut saw_startup = false;
    let mut saw_error = false;
    let mut saw_notification = false;
    let deadline = Instant::now() + Duration::from_secs(5);
    while !(saw_startup && saw_error && saw_notification) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = tokio::time::timeout(remaining, logs.recv())
            .await
            .expect("timed out waiting for log events")
            .unwrap();
        match (event.source, event.level) {
            (LogSource::Stderr, LogLevel::Info) if event.message.contains("server starting") => {
                saw_startup = true
            }
            (LogSource::Stderr, LogLevel::Error) if event.message.contains("disk full") => {
                saw_error = true
            }
            (LogSource::Protocol, LogLevel::Warning) if event.message == "slow call" => {
                saw_notification = true
            }
            _ => {}
        }
    }

    session.disconnect().await;
}

// ─── Disconnect ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_disconnect_stops_server_process() {
    let fx = Fixture::new();
    let session = Session::new(fast_config());
    session
        .connect(&fx.echo_server("server.sh", DEFAULT_TOOLS))
        .await
        .unwrap();

    let pid = session.server_pid().await.unwrap();
    assert!(process_alive(pid));

    session.disconnect().await;

    assert!(!process_alive(pid));
    assert!(!session.is_transport_open().await);
    assert!(session.server_pid().await.is_none());
    assert!(session.list_tools().is_empty());
    assert_eq!(session.state(), ConnectionState::Disconnected);

    // Idempotent.
    session.cleanup().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_state_transitions_are_observable() {
    let fx = Fixture::new();
    let session = Session::new(fast_config());
    let mut states = session.subscribe_state();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);

    session
        .connect(&fx.echo_server("server.sh", DEFAULT_TOOLS))
        .await
        .unwrap();
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);

    session.disconnect().await;
    assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);
}
