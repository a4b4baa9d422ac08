//! Control API tests driving the router directly

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tower::ServiceExt;
use uros_core::SettingsStore;
use uros_core::config::{AgentProcessConfig, LogConfig};
use uros_supervisor::{AgentControl, LogCapture, LogStream, ProcessSupervisor};

// Stand-in agent: prints its arguments and stays up until signalled
const AGENT_SCRIPT: &str = r#"echo "args: $*"; exec sleep 30"#;

struct TestApp {
    dir: TempDir,
    supervisor: ProcessSupervisor,
    shutdown: watch::Sender<bool>,
    app: Router,
}

impl TestApp {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let process = AgentProcessConfig {
            binary: PathBuf::from("/bin/sh"),
            prefix_args: vec!["-c".into(), AGENT_SCRIPT.into(), "micro-ros-agent".into()],
            startup_grace: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(2),
            kill_timeout: Duration::from_secs(2),
            lock_wait: Duration::from_secs(5),
        };
        let settings = Arc::new(SettingsStore::open(dir.path().join("settings.json")));
        let logs = Arc::new(LogCapture::new(&LogConfig::default()));
        let supervisor = ProcessSupervisor::new(process, settings, logs);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let app = uros_extension::router(Arc::new(supervisor.clone()), shutdown_rx);
        Self {
            dir,
            supervisor,
            shutdown,
            app,
        }
    }

    async fn call(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                request = request.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };

        let response = self
            .app
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.call(Method::GET, uri, None).await
    }

    async fn post(&self, uri: &str) -> (StatusCode, Value) {
        self.call(Method::POST, uri, None).await
    }

    async fn put(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.call(Method::PUT, uri, Some(body)).await
    }

    fn settings_file(&self) -> Option<String> {
        std::fs::read_to_string(self.dir.path().join("settings.json")).ok()
    }
}

#[tokio::test]
async fn test_get_settings_returns_defaults() {
    let app = TestApp::new();
    let (status, body) = app.get("/micro-ros-agent/settings").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["micro_ros_agent"]["transport"], "udp4");
    assert_eq!(body["micro_ros_agent"]["port"], 2019);
    assert_eq!(body["micro_ros_agent"]["verbosity"], 4);
    assert_eq!(body["micro_ros_agent"]["enabled"], false);
}

#[tokio::test]
async fn test_put_settings_persists_valid_config() {
    let app = TestApp::new();
    let (status, body) = app
        .put(
            "/micro-ros-agent/settings",
            json!({ "transport": "tcp4", "port": 8888, "verbosity": 2 }),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["micro_ros_agent"]["transport"], "tcp4");

    let (_, body) = app.get("/micro-ros-agent/settings").await;
    assert_eq!(body["micro_ros_agent"]["port"], 8888);
    assert_eq!(body["micro_ros_agent"]["verbosity"], 2);
    assert!(app.settings_file().unwrap().contains("8888"));
}

#[tokio::test]
async fn test_put_settings_rejects_out_of_range_port() {
    let app = TestApp::new();
    let (status, body) = app
        .put(
            "/micro-ros-agent/settings",
            json!({ "transport": "udp4", "port": 70000, "verbosity": 4 }),
        )
        .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "validation_error");
    assert_eq!(body["field"], "port");

    let (_, body) = app.get("/micro-ros-agent/settings").await;
    assert_eq!(body["micro_ros_agent"]["port"], 2019);
    assert!(app.settings_file().is_none());
}

#[tokio::test]
async fn test_put_settings_rejects_unknown_transport() {
    let app = TestApp::new();
    let (status, body) = app
        .put("/micro-ros-agent/settings", json!({ "transport": "carrier-pigeon" }))
        .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["field"], "transport");
}

#[tokio::test]
async fn test_put_settings_rejects_malformed_body() {
    let app = TestApp::new();
    let (status, body) = app
        .put("/micro-ros-agent/settings", json!({ "port": 2019 }))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");
}

#[tokio::test]
async fn test_stop_when_stopped_conflicts() {
    let app = TestApp::new();
    let (status, body) = app.post("/micro-ros-agent/stop").await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "not_running");
}

#[tokio::test]
async fn test_status_when_never_started() {
    let app = TestApp::new();
    let (status, body) = app.get("/micro-ros-agent/status").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["running"], false);
    assert_eq!(body["state"], "stopped");
    assert_eq!(body["message"], "Stopped");
    assert_eq!(body["health"], "unknown");
    assert_eq!(body["pid"], Value::Null);
}

#[tokio::test]
async fn test_legacy_settings_round_trip() {
    let app = TestApp::new();
    let (status, _) = app
        .post("/micro-ros-agent/save-settings?transport=udp6&port=9999&verbose=3")
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.post("/micro-ros-agent/get-settings").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["micro_ros_agent"],
        json!({ "transport": "udp6", "port": 9999, "verbose": 3 })
    );
}

#[tokio::test]
async fn test_legacy_save_rejects_non_numeric_port() {
    let app = TestApp::new();
    let (status, body) = app
        .post("/micro-ros-agent/save-settings?transport=udp4&port=abc&verbose=4")
        .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["field"], "port");
}

#[tokio::test]
async fn test_enabled_state_is_saved() {
    let app = TestApp::new();
    let (_, body) = app.get("/micro-ros-agent/get-enabled-state").await;
    assert_eq!(body["enabled"], false);

    let (status, _) = app
        .post("/micro-ros-agent/save-enabled-state?enabled=true")
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = app.get("/micro-ros-agent/get-enabled-state").await;
    assert_eq!(body["enabled"], true);
    assert!(app.supervisor.settings().enabled());
}

#[tokio::test]
async fn test_logs_tail_is_bounded() {
    let app = TestApp::new();
    let logs = app.supervisor.logs();
    logs.rotate(1);
    for i in 0..10 {
        logs.push(1, LogStream::Stdout, format!("line {}", i));
    }

    let (status, body) = app.get("/micro-ros-agent/logs?tail=3").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["launch_id"], 1);

    let texts: Vec<&str> = body["lines"]
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l["text"].as_str().unwrap())
        .collect();
    assert_eq!(texts, ["line 7", "line 8", "line 9"]);
}

#[tokio::test]
async fn test_logs_cursor_returns_newer_lines() {
    let app = TestApp::new();
    let logs = app.supervisor.logs();
    logs.rotate(1);
    for i in 0..5 {
        logs.push(1, LogStream::Stderr, format!("line {}", i));
    }

    let (_, first) = app.get("/micro-ros-agent/logs?tail=2").await;
    let cursor = first["next_cursor"].as_u64().unwrap();

    logs.push(1, LogStream::Stderr, "line 5".into());
    let (_, body) = app
        .get(&format!("/micro-ros-agent/logs?cursor={}", cursor))
        .await;

    let lines = body["lines"].as_array().unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["text"], "line 5");
    assert_eq!(lines[0]["stream"], "stderr");
}

#[cfg(unix)]
#[tokio::test]
async fn test_start_status_stop_cycle() {
    let app = TestApp::new();

    let (status, body) = app.post("/micro-ros-agent/start").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["running"], true);
    assert_eq!(body["state"], "running");
    assert!(body["pid"].as_u64().is_some());

    let (status, body) = app.post("/micro-ros-agent/start").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "already_running");

    let (status, body) = app
        .put("/micro-ros-agent/settings", json!({ "transport": "udp4", "port": 7400 }))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "agent_active");

    let (_, body) = app.get("/micro-ros-agent/status").await;
    assert_eq!(body["message"], "Running");
    assert_eq!(body["health"], "healthy");

    let (status, body) = app.post("/micro-ros-agent/stop").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "stopped");
    assert_eq!(body["running"], false);
    assert_eq!(body["last_exit"]["expected"], true);

    let (_, body) = app.get("/micro-ros-agent/logs").await;
    let texts: Vec<&str> = body["lines"]
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l["text"].as_str().unwrap())
        .collect();
    assert_eq!(texts, ["args: udp4 --port 2019 -v4"]);
}

#[cfg(unix)]
#[tokio::test]
async fn test_restart_moves_logs_to_previous() {
    let app = TestApp::new();
    app.post("/micro-ros-agent/start").await;

    let (status, body) = app.post("/micro-ros-agent/restart").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["launch_id"], 2);

    let (_, body) = app.get("/micro-ros-agent/logs/previous").await;
    assert_eq!(body["log"]["launch_id"], 1);

    app.post("/micro-ros-agent/stop").await;
}

#[tokio::test]
async fn test_put_settings_rejects_oversized_and_fractional_ports() {
    let app = TestApp::new();
    for body in [
        r#"{"transport":"udp4","port":100000000000000000000}"#,
        r#"{"transport":"udp4","port":2019.5}"#,
    ] {
        let body: Value = serde_json::from_str(body).unwrap();
        let (status, response) = app.put("/micro-ros-agent/settings", body).await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(response["error"], "validation_error");
        assert_eq!(response["field"], "port");
    }
    assert!(app.settings_file().is_none());
}

#[tokio::test]
async fn test_bad_query_strings_get_json_errors() {
    let app = TestApp::new();
    for (method, uri) in [
        (Method::POST, "/micro-ros-agent/save-enabled-state?enabled=yes"),
        (Method::POST, "/micro-ros-agent/save-enabled-state"),
        (Method::POST, "/micro-ros-agent/save-settings?transport=udp4"),
        (Method::GET, "/micro-ros-agent/logs?tail=abc"),
    ] {
        let (status, body) = app.call(method, uri, None).await;

        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
        assert_eq!(body["success"], false, "{}", uri);
        assert_eq!(body["error"], "bad_request", "{}", uri);
        assert!(body["message"].is_string(), "{}", uri);
    }
    assert!(!app.supervisor.settings().enabled());
}

#[tokio::test]
async fn test_previous_logs_empty_before_any_restart() {
    let app = TestApp::new();
    let (status, body) = app.get("/micro-ros-agent/logs/previous").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["log"], Value::Null);
}

#[tokio::test]
async fn test_logs_cursor_from_previous_launch_restarts() {
    let app = TestApp::new();
    let logs = app.supervisor.logs();
    logs.rotate(1);
    for i in 0..4 {
        logs.push(1, LogStream::Stdout, format!("old {}", i));
    }
    let (_, first) = app.get("/micro-ros-agent/logs").await;
    let cursor = first["next_cursor"].as_u64().unwrap();

    logs.rotate(2);
    logs.push(2, LogStream::Stdout, "new 0".into());

    let (_, body) = app
        .get(&format!("/micro-ros-agent/logs?launch_id=1&cursor={}", cursor))
        .await;
    assert_eq!(body["launch_id"], 2);
    assert_eq!(body["lines"][0]["text"], "new 0");
    assert_eq!(body["next_cursor"], 1);
}

async fn read_until(stream: &mut TcpStream, needle: &str) -> String {
    let mut received = Vec::new();
    let mut chunk = [0u8; 1024];
    while !String::from_utf8_lossy(&received).contains(needle) {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {:?}", needle))
            .unwrap();
        assert!(n > 0, "connection closed before {:?}", needle);
        received.extend_from_slice(&chunk[..n]);
    }
    String::from_utf8_lossy(&received).into_owned()
}

#[tokio::test]
async fn test_log_stream_delivers_lines_and_ends_on_shutdown() {
    let app = TestApp::new();
    app.supervisor.logs().rotate(1);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app.app.clone();
    let (stop_server, server_stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = server_stopped.await;
            })
            .await
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(
            b"GET /micro-ros-agent/logs/stream HTTP/1.1\r\n\
              Host: localhost\r\n\
              Accept: text/event-stream\r\n\r\n",
        )
        .await
        .unwrap();
    let head = read_until(&mut client, "\r\n\r\n").await;
    assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
    assert!(head.contains("text/event-stream"), "{}", head);

    app.supervisor
        .logs()
        .push(1, LogStream::Stderr, "hello stream".into());
    let events = read_until(&mut client, "hello stream").await;
    assert!(events.contains("event: log"), "{}", events);

    app.shutdown.send(true).unwrap();
    stop_server.send(()).unwrap();

    let finished = tokio::time::timeout(Duration::from_secs(5), server).await;
    assert!(finished.is_ok(), "server kept running with a log stream open");
    finished.unwrap().unwrap().unwrap();
}
