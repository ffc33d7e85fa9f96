//! histd entrypoint.
//!
//! A local daemon that merges the pre-exec and post-exec halves of shell
//! command records, appends merged records to the history log and serves
//! the recency index to lookup tools over a Unix socket.

use chrono::Utc;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use fs_err as fs;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use histd_protocol::{
    parse_recent_records, parse_record, parse_session_end, ErrorInfo, Method, Record, Request, Response,
    MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};

mod config;
mod coordinator;
mod histfile;
mod recency;
mod record_log;
mod strategy;

use config::DaemonConfig;
use histfile::Histfile;
use record_log::LogWriterPool;
use strategy::MarkovChainCmd;

const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;

struct DaemonContext {
    store: Arc<Histfile>,
    input: Sender<Record>,
    sessions_to_drop: Sender<String>,
    started_at: String,
}

fn main() {
    init_logging();

    let config = match config::load_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load histd config; using defaults");
            DaemonConfig::default()
        }
    };

    let home = match config::home_dir() {
        Ok(home) => home,
        Err(err) => {
            error!(error = %err, "Failed to resolve home directory");
            std::process::exit(1);
        }
    };
    let socket_path = config.socket_path(&home);
    let history_path = config.history_path(&home);

    for path in [&socket_path, &history_path] {
        if let Err(err) = prepare_parent_dir(path) {
            error!(error = %err, path = %path.display(), "Failed to prepare state directory");
            std::process::exit(1);
        }
    }

    let writer = LogWriterPool::new(
        history_path.clone(),
        config.writer.workers,
        config.writer.queue_capacity,
    );
    let store = Arc::new(Histfile::new(writer, config.history.recent_records_limit));
    store.register_strategy(Box::new(MarkovChainCmd::new(
        config.strategy.markov_order,
        config.strategy.history_limit,
    )));

    if let Err(err) = store.load_history(config.history.init_size) {
        error!(error = %err, "Cannot serve without a loaded history baseline");
        std::process::exit(1);
    }

    let (input_tx, input_rx) = record_channel(config.input.channel_capacity);
    let (drop_tx, drop_rx) = unbounded::<String>();
    let (signal_tx, signal_rx) = unbounded::<i32>();
    let (done_tx, done_rx) = bounded::<&'static str>(1);
    let (gc_stop_tx, gc_stop_rx) = bounded::<()>(1);

    let signal_handle = match coordinator::spawn_signal_forwarder(signal_tx) {
        Ok(handle) => handle,
        Err(err) => {
            error!(error = %err, "Failed to register shutdown signal handlers");
            std::process::exit(1);
        }
    };
    coordinator::spawn_writer(Arc::clone(&store), input_rx, signal_rx, done_tx);
    let session_gc = coordinator::spawn_session_gc(Arc::clone(&store), drop_rx, gc_stop_rx);

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }
    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind histd socket");
            std::process::exit(1);
        }
    };

    let context = Arc::new(DaemonContext {
        store,
        input: input_tx,
        sessions_to_drop: drop_tx,
        started_at: Utc::now().to_rfc3339(),
    });
    info!(
        socket = %socket_path.display(),
        history = %history_path.display(),
        "histd started"
    );
    spawn_listener(listener, context);

    match done_rx.recv() {
        Ok(component) => info!(component, "Shutdown acknowledged"),
        Err(_) => warn!("Writer loop exited without acknowledging shutdown"),
    }
    drop(gc_stop_tx);
    if session_gc.join().is_err() {
        warn!("Session GC thread panicked");
    }
    signal_handle.close();
    if let Err(err) = remove_existing_socket(&socket_path) {
        warn!(error = %err, "Failed to remove socket on shutdown");
    }
    info!("histd stopped");
}

fn init_logging() {
    let debug_enabled = env::var("HISTD_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn record_channel(capacity: usize) -> (Sender<Record>, Receiver<Record>) {
    if capacity == 0 {
        unbounded()
    } else {
        bounded(capacity)
    }
}

fn prepare_parent_dir(path: &Path) -> Result<(), String> {
    let parent = path
        .parent()
        .ok_or_else(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn spawn_listener(listener: UnixListener, context: Arc<DaemonContext>) {
    thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let context = Arc::clone(&context);
                    thread::spawn(move || handle_connection(stream, &context));
                }
                Err(err) => {
                    warn!(error = %err, "Failed to accept histd connection");
                }
            }
        }
    });
}

fn handle_connection(mut stream: UnixStream, context: &DaemonContext) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "histd request received");
    let response = handle_request(request, context);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, context: &DaemonContext) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    match request.method {
        Method::GetHealth => {
            let mut data = serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
                "started_at": context.started_at,
                "history_path": context.store.history_path().display().to_string(),
            });
            if let Ok(value) = serde_json::to_value(context.store.stats()) {
                data["store"] = value;
            }
            data["pending_merge_ids"] = serde_json::json!(context.store.pending_merge_ids());
            Response::ok(request.id, data)
        }
        Method::Record => {
            let params = match request.params {
                Some(params) => params,
                None => return Response::error(request.id, "invalid_params", "record is required"),
            };
            let record = match parse_record(params) {
                Ok(record) => record,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            info!(
                merge_id = %record.merge_id(),
                part_one = record.part_one,
                "Received record"
            );
            match context.input.send(record) {
                Ok(()) => Response::ok(request.id, serde_json::json!({"accepted": true})),
                Err(_) => Response::error(
                    request.id,
                    "shutting_down",
                    "histd is no longer accepting records",
                ),
            }
        }
        Method::SessionEnd => {
            let params = match request.params {
                Some(params) => params,
                None => {
                    return Response::error(request.id, "invalid_params", "session_id is required")
                }
            };
            let end = match parse_session_end(params) {
                Ok(end) => end,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            match context.sessions_to_drop.send(end.session_id) {
                Ok(()) => Response::ok(request.id, serde_json::json!({"accepted": true})),
                Err(_) => Response::error(
                    request.id,
                    "shutting_down",
                    "histd is no longer tracking sessions",
                ),
            }
        }
        Method::GetRecentCmdLines => {
            let snapshot = context.store.recent_cmd_lines();
            match serde_json::to_value(snapshot) {
                Ok(value) => Response::ok(request.id, value),
                Err(err) => Response::error(
                    request.id,
                    "serialization_error",
                    format!("Failed to serialize history: {}", err),
                ),
            }
        }
        Method::GetSuggestions => match serde_json::to_value(context.store.suggestions()) {
            Ok(value) => Response::ok(request.id, value),
            Err(err) => Response::error(
                request.id,
                "serialization_error",
                format!("Failed to serialize suggestions: {}", err),
            ),
        },
        Method::GetRecentRecords => {
            let params = match parse_recent_records(request.params) {
                Ok(params) => params,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            match serde_json::to_value(context.store.recent_records(params.limit)) {
                Ok(value) => Response::ok(request.id, value),
                Err(err) => Response::error(
                    request.id,
                    "serialization_error",
                    format!("Failed to serialize records: {}", err),
                ),
            }
        }
    }
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
