//! Client helper for talking to histd over its Unix socket.
//!
//! The daemon is the only writer of the history log. Capture failures are
//! surfaced to the caller, which decides whether they matter.

use chrono::Utc;
use histd_protocol::{
    HistlistView, Method, RecentRecordsParams, Record, Request, Response, SuggestionView,
    MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use serde_json::Value;
use std::env;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const ENABLE_ENV: &str = "HISTD_ENABLED";
const SOCKET_ENV: &str = "HISTD_SOCKET";
const SOCKET_NAME: &str = "histd.sock";
const READ_TIMEOUT_MS: u64 = 600;
const WRITE_TIMEOUT_MS: u64 = 600;
const RETRY_DELAY_MS: u64 = 50;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Daemon disabled")]
    Disabled,

    #[error("Home directory not found")]
    NoHome,

    #[error("Failed to connect to daemon socket: {0}")]
    Connect(#[source] io::Error),

    #[error("Failed to write request: {0}")]
    Write(#[source] io::Error),

    #[error("Failed to read response: {0}")]
    Read(#[source] io::Error),

    #[error("Timed out waiting for daemon response")]
    Timeout,

    #[error("Response exceeded maximum size")]
    TooLarge,

    #[error("Daemon response was empty")]
    EmptyResponse,

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{code}: {message}")]
    Daemon { code: String, message: String },
}

impl ClientError {
    /// A daemon that answered with an error will answer the same way again.
    fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ClientError::Disabled | ClientError::NoHome | ClientError::Daemon { .. }
        )
    }
}

pub fn send_record(record: &Record) -> Result<(), ClientError> {
    let params = serde_json::to_value(record)?;
    let id = make_request_id("record");
    call_with_retry(
        || Request {
            protocol_version: PROTOCOL_VERSION,
            method: Method::Record,
            id: Some(id.clone()),
            params: Some(params.clone()),
        },
        "record",
    )
    .map(|_| ())
}

pub fn send_session_end(session_id: &str) -> Result<(), ClientError> {
    let params = serde_json::json!({ "session_id": session_id });
    let id = make_request_id("session-end");
    call_with_retry(
        || Request {
            protocol_version: PROTOCOL_VERSION,
            method: Method::SessionEnd,
            id: Some(id.clone()),
            params: Some(params.clone()),
        },
        "session end",
    )
    .map(|_| ())
}

pub fn recent_cmd_lines() -> Result<HistlistView, ClientError> {
    let data = call_once(Method::GetRecentCmdLines, "recent", None)?;
    Ok(serde_json::from_value(data)?)
}

pub fn suggestions() -> Result<Vec<SuggestionView>, ClientError> {
    let data = call_once(Method::GetSuggestions, "suggest", None)?;
    Ok(serde_json::from_value(data)?)
}

pub fn recent_records(limit: Option<usize>) -> Result<Vec<Record>, ClientError> {
    let params = serde_json::to_value(RecentRecordsParams { limit })?;
    let data = call_once(Method::GetRecentRecords, "records", Some(params))?;
    Ok(serde_json::from_value(data)?)
}

pub fn daemon_health() -> Result<Value, ClientError> {
    call_once(Method::GetHealth, "health-check", None)
}

pub fn daemon_enabled() -> bool {
    match env::var(ENABLE_ENV) {
        Ok(value) => matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"),
        Err(_) => true,
    }
}

fn socket_path() -> Result<PathBuf, ClientError> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or(ClientError::NoHome)?;
    Ok(home.join(".histd").join(SOCKET_NAME))
}

fn call_once(method: Method, id: &str, params: Option<Value>) -> Result<Value, ClientError> {
    if !daemon_enabled() {
        return Err(ClientError::Disabled);
    }
    let response = send_request(Request {
        protocol_version: PROTOCOL_VERSION,
        method,
        id: Some(id.to_string()),
        params,
    })?;
    into_data(response)
}

fn call_with_retry<F>(build: F, label: &str) -> Result<Value, ClientError>
where
    F: Fn() -> Request,
{
    if !daemon_enabled() {
        return Err(ClientError::Disabled);
    }

    match send_request(build()).and_then(into_data) {
        Ok(data) => Ok(data),
        Err(err) if err.is_retryable() => {
            tracing::warn!(error = %err, "Failed to send {} to daemon", label);
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            send_request(build()).and_then(into_data).map_err(|retry_err| {
                tracing::warn!(
                    error = %retry_err,
                    "Retry failed sending {} to daemon",
                    label
                );
                retry_err
            })
        }
        Err(err) => Err(err),
    }
}

fn into_data(response: Response) -> Result<Value, ClientError> {
    if response.ok {
        return Ok(response.data.unwrap_or(Value::Null));
    }
    Err(match response.error {
        Some(error) => ClientError::Daemon {
            code: error.code,
            message: error.message,
        },
        None => ClientError::Daemon {
            code: "unknown".to_string(),
            message: "Unknown daemon error".to_string(),
        },
    })
}

fn send_request(request: Request) -> Result<Response, ClientError> {
    let socket = socket_path()?;
    let mut stream = UnixStream::connect(&socket).map_err(ClientError::Connect)?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

    let mut payload = serde_json::to_vec(&request)?;
    payload.push(b'\n');
    stream.write_all(&payload).map_err(ClientError::Write)?;
    stream.flush().ok();

    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Result<Response, ClientError> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ClientError::TooLarge);
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ClientError::Timeout);
            }
            Err(err) => return Err(ClientError::Read(err)),
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err(ClientError::EmptyResponse);
    }

    Ok(serde_json::from_slice(response_bytes)?)
}

fn make_request_id(kind: &str) -> String {
    format!(
        "{}-{}-{}",
        kind,
        std::process::id(),
        Utc::now().timestamp_millis()
    )
}
