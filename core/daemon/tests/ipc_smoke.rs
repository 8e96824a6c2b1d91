use coverage_daemon_protocol::{Method, Request, Response, PROTOCOL_VERSION};
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const LAYOUT: &str = r#"{"methods":[
    {"name":"<init>","desc":"()V","probes":1},
    {"name":"owners","desc":"(Ljava/lang/String;)Ljava/util/List;","probes":[2,2]}
]}"#;

struct DaemonGuard {
    child: Child,
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn spawn_daemon(home: &Path) -> Child {
    Command::new(env!("CARGO_BIN_EXE_coverage-daemon"))
        .env("HOME", home)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to spawn coverage-daemon")
}

fn socket_path(home: &Path) -> PathBuf {
    home.join(".coverage").join("daemon.sock")
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() && UnixStream::connect(path).is_ok() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("Timed out waiting for daemon socket at {}", path.display());
}

fn send_request(socket: &Path, request: Request) -> Response {
    let mut stream = UnixStream::connect(socket).expect("Failed to connect to daemon socket");
    serde_json::to_writer(&mut stream, &request).expect("Failed to serialize request");
    stream.write_all(b"\n").expect("Failed to write request");
    stream.flush().ok();
    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Response {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).expect("Failed to read response");
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if chunk[..n].contains(&b'\n') {
            break;
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    serde_json::from_slice(response_bytes).expect("Failed to parse response JSON")
}

fn request(method: Method, id: &str, params: Option<Value>) -> Request {
    Request {
        protocol_version: PROTOCOL_VERSION,
        method,
        id: Some(id.to_string()),
        params,
    }
}

fn target() -> Value {
    json!({ "id": "petclinic", "name": "Pet Clinic", "build_version": "0.5.0" })
}

fn send_event(socket: &Path, kind: &str, data: Value) -> Response {
    send_request(
        socket,
        request(
            Method::Event,
            kind,
            Some(json!({ "target": target(), "type": kind, "data": data })),
        ),
    )
}

fn event_state(response: &Response) -> Option<&str> {
    response
        .data
        .as_ref()
        .and_then(|data| data.get("state"))
        .and_then(Value::as_str)
}

// Agents send bytes as signed values.
fn signed_bytes(text: &str) -> Value {
    json!(text.bytes().map(|b| b as i8 as i64).collect::<Vec<_>>())
}

#[test]
fn daemon_ipc_health_and_session_smoke() {
    let home = TempDir::new().expect("Failed to create temp HOME");
    let socket = socket_path(home.path());
    let child = spawn_daemon(home.path());
    let _guard = DaemonGuard { child };

    wait_for_socket(&socket, Duration::from_secs(5));

    let health = send_request(&socket, request(Method::GetHealth, "health-check", None));
    assert!(health.ok, "health response was not ok");
    let status = health
        .data
        .as_ref()
        .and_then(|data| data.get("status"))
        .and_then(Value::as_str)
        .unwrap_or("missing");
    assert_eq!(status, "ok");

    let init = send_event(
        &socket,
        "INIT",
        json!({ "classesCount": 1, "message": "Start initialization" }),
    );
    assert!(init.ok, "INIT was not accepted: {:?}", init.error);
    assert_eq!(event_state(&init), Some("initializing"));

    let class_bytes = send_event(
        &socket,
        "CLASS_BYTES",
        json!({ "className": "org/petclinic/OwnerRepository", "bytes": signed_bytes(LAYOUT) }),
    );
    assert!(class_bytes.ok, "CLASS_BYTES was not accepted");

    let initialized = send_event(&socket, "INITIALIZED", json!(""));
    assert!(initialized.ok, "INITIALIZED was not accepted");
    assert_eq!(event_state(&initialized), Some("ready"));

    let started = send_event(&socket, "SESSION_STARTED", json!("run-1"));
    assert!(started.ok, "SESSION_STARTED was not accepted");

    let part = send_event(
        &socket,
        "COVERAGE_DATA_PART",
        json!([{
            "id": -42,
            "className": "org/petclinic/OwnerRepository",
            "probes": [true, true, false],
            "testName": "OwnerTest::findsOwners"
        }]),
    );
    assert!(part.ok, "COVERAGE_DATA_PART was not accepted");
    assert_eq!(
        part.data
            .as_ref()
            .and_then(|data| data.get("rejected_records"))
            .and_then(Value::as_u64),
        Some(0)
    );

    let finished = send_event(&socket, "SESSION_FINISHED", Value::Null);
    assert!(finished.ok, "SESSION_FINISHED was not accepted");
    assert_eq!(
        finished
            .data
            .as_ref()
            .and_then(|data| data.get("finished"))
            .and_then(Value::as_bool),
        Some(true)
    );

    let coverage = send_request(
        &socket,
        request(
            Method::GetTopic,
            "coverage",
            Some(json!({ "target_id": "petclinic", "topic": "/coverage" })),
        ),
    );
    assert!(coverage.ok, "get_topic response was not ok");
    let coverage = coverage.data.expect("coverage payload");
    assert_eq!(coverage["found"], json!(true));
    assert_eq!(coverage["payload"]["arrow"], json!("INCREASE"));
    let percent = coverage["payload"]["coverage"]
        .as_f64()
        .expect("coverage percentage");
    assert!((percent - 60.0).abs() < 1e-6, "unexpected coverage {percent}");

    let collecting = send_request(
        &socket,
        request(
            Method::GetTopic,
            "collection-state",
            Some(json!({ "target_id": "petclinic", "topic": "/collection-state" })),
        ),
    );
    assert_eq!(
        collecting.data.expect("collection payload")["payload"]["active"],
        json!(false)
    );

    let scopes = send_request(
        &socket,
        request(
            Method::GetScopes,
            "scopes",
            Some(json!({ "target_id": "petclinic" })),
        ),
    );
    assert!(scopes.ok, "get_scopes response was not ok");
    let scopes = scopes.data.expect("scopes payload");
    let rows = scopes.as_array().expect("scopes payload is array");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["key"], json!("0.5.0:testScope"));
    assert_eq!(
        rows[0]["scope"]["tests"][0]["name"],
        json!("OwnerTest::findsOwners")
    );

    let snapshot = send_request(
        &socket,
        request(
            Method::GetSessionState,
            "session",
            Some(json!({ "target_id": "petclinic" })),
        ),
    );
    assert!(snapshot.ok, "get_session_state response was not ok");
    let snapshot = snapshot.data.expect("snapshot payload");
    assert_eq!(snapshot["state"], json!("ready"));
    assert_eq!(snapshot["classes"], json!(1));
    assert!(snapshot["collecting"].is_null());

    let health = send_request(&socket, request(Method::GetHealth, "health-after", None));
    assert_eq!(
        health
            .data
            .as_ref()
            .and_then(|data| data.get("targets"))
            .and_then(Value::as_u64),
        Some(1)
    );
}
