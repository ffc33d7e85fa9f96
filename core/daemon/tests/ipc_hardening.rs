use histd_protocol::{HistlistView, Method, Record, Request, Response, PROTOCOL_VERSION};
use std::fs;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

struct DaemonGuard {
    child: Child,
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn spawn_daemon(home: &Path) -> DaemonGuard {
    let child = Command::new(env!("CARGO_BIN_EXE_histd"))
        .env("HOME", home)
        .env_remove("HISTD_CONFIG")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn histd");
    DaemonGuard { child }
}

fn temp_home(prefix: &str) -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in("/tmp")
        .expect("failed to create temp HOME")
}

fn socket_path(home: &Path) -> PathBuf {
    home.join(".histd").join("histd.sock")
}

fn can_bind_socket(home: &Path) -> bool {
    let probe_path = home.join("probe.sock");
    match UnixListener::bind(&probe_path) {
        Ok(listener) => {
            drop(listener);
            let _ = fs::remove_file(&probe_path);
            true
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(_) => true,
    }
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() && UnixStream::connect(path).is_ok() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("timed out waiting for histd socket at {}", path.display());
}

fn send_request(socket: &Path, request: &Request) -> Response {
    let mut payload = serde_json::to_vec(request).expect("failed to serialize request");
    payload.push(b'\n');
    send_raw_request(socket, &payload)
}

fn send_raw_request(socket: &Path, payload: &[u8]) -> Response {
    let mut stream = UnixStream::connect(socket).expect("failed to connect to histd socket");
    stream
        .write_all(payload)
        .expect("failed to write raw payload");
    stream.flush().expect("failed to flush raw payload");
    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Response {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).expect("failed to read response");
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

    serde_json::from_slice(response_bytes).expect("failed to parse response JSON")
}

fn request(method: Method, params: Option<serde_json::Value>) -> Request {
    Request {
        protocol_version: PROTOCOL_VERSION,
        method,
        id: Some("hardening".to_string()),
        params,
    }
}

fn error_code(response: &Response) -> Option<&str> {
    response.error.as_ref().map(|err| err.code.as_str())
}

#[test]
fn histd_handles_malformed_payload_flood_without_losing_health() {
    let home = temp_home("histd-hardening-malformed");
    if !can_bind_socket(home.path()) {
        eprintln!(
            "Skipping malformed flood hardening test: unix socket binding not permitted in this environment."
        );
        return;
    }

    let socket = socket_path(home.path());
    let _guard = spawn_daemon(home.path());
    wait_for_socket(&socket, Duration::from_secs(5));

    for _ in 0..128 {
        let response = send_raw_request(&socket, b"{\"bad_json\": true\n");
        assert!(!response.ok, "malformed payload must be rejected");
        assert_eq!(error_code(&response), Some("invalid_json"));
    }

    let health = send_request(&socket, &request(Method::GetHealth, None));
    assert!(health.ok, "histd should remain healthy after malformed flood");
}

#[test]
fn histd_idle_connection_returns_read_timeout_error() {
    let home = temp_home("histd-hardening-timeout");
    if !can_bind_socket(home.path()) {
        eprintln!(
            "Skipping timeout hardening test: unix socket binding not permitted in this environment."
        );
        return;
    }

    let socket = socket_path(home.path());
    let _guard = spawn_daemon(home.path());
    wait_for_socket(&socket, Duration::from_secs(5));

    let mut idle = UnixStream::connect(&socket).expect("failed to connect idle stream");
    let response = read_response(&mut idle);
    assert!(!response.ok, "idle request should return an error");
    assert_eq!(error_code(&response), Some("read_timeout"));
}

#[test]
fn histd_rejects_bad_envelopes_and_records() {
    let home = temp_home("histd-hardening-invalid");
    if !can_bind_socket(home.path()) {
        eprintln!(
            "Skipping invalid request hardening test: unix socket binding not permitted in this environment."
        );
        return;
    }

    let socket = socket_path(home.path());
    let _guard = spawn_daemon(home.path());
    wait_for_socket(&socket, Duration::from_secs(5));

    let mut stale = request(Method::GetHealth, None);
    stale.protocol_version = PROTOCOL_VERSION + 1;
    assert_eq!(
        error_code(&send_request(&socket, &stale)),
        Some("protocol_mismatch")
    );

    let missing_params = send_request(&socket, &request(Method::Record, None));
    assert_eq!(error_code(&missing_params), Some("invalid_params"));

    let long_session = "s".repeat(512);
    let oversized_session = send_request(
        &socket,
        &request(
            Method::Record,
            Some(serde_json::json!({"sessionId": long_session, "partOne": true, "cmdLine": "ls"})),
        ),
    );
    assert!(!oversized_session.ok);

    let unknown_method =
        send_raw_request(&socket, b"{\"protocol_version\":1,\"method\":\"drop_table\"}\n");
    assert_eq!(error_code(&unknown_method), Some("invalid_json"));
}

#[test]
fn histd_merges_interleaved_sessions_from_concurrent_clients() {
    let home = temp_home("histd-hardening-concurrent");
    if !can_bind_socket(home.path()) {
        eprintln!(
            "Skipping concurrency hardening test: unix socket binding not permitted in this environment."
        );
        return;
    }

    let socket = socket_path(home.path());
    let _guard = spawn_daemon(home.path());
    wait_for_socket(&socket, Duration::from_secs(5));

    let clients: Vec<_> = (0..8)
        .map(|client| {
            let socket = socket.clone();
            std::thread::spawn(move || {
                for step in 0..10 {
                    for (part_one, cmd_line) in
                        [(true, format!("cmd-{}-{}", client, step)), (false, String::new())]
                    {
                        let record = Record {
                            session_id: format!("session-{}", client),
                            shlvl: 1,
                            part_one,
                            cmd_line,
                            ..Record::default()
                        };
                        let response = send_request(
                            &socket,
                            &request(
                                Method::Record,
                                Some(serde_json::to_value(&record).expect("serialize record")),
                            ),
                        );
                        assert!(response.ok, "record rejected: {:?}", response.error);
                    }
                }
            })
        })
        .collect();
    for client in clients {
        client.join().expect("client thread");
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut view = HistlistView::default();
    while Instant::now() < deadline {
        let response = send_request(&socket, &request(Method::GetRecentCmdLines, None));
        view = serde_json::from_value(response.data.expect("history payload"))
            .expect("history view");
        if view.list.len() == 80 {
            break;
        }
        sleep(Duration::from_millis(25));
    }
    assert_eq!(view.list.len(), 80, "every command should be merged once");
    for client in 0..8 {
        let positions: Vec<usize> = (0..10)
            .map(|step| view.last_index[&format!("cmd-{}-{}", client, step)])
            .collect();
        assert!(
            positions.windows(2).all(|pair| pair[0] < pair[1]),
            "per-session order must be preserved"
        );
    }
}
