//! Coverage daemon entrypoint.
//!
//! A small local service in front of the coverage engine: a socket listener
//! with strict request validation, one engine worker per monitored target,
//! an in-memory cache of the latest observer topics, and a SQLite store for
//! exported scopes.

use fs_err as fs;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use coverage_daemon_protocol::{
    parse_event_request, ErrorInfo, Method, Request, Response, ScopeQuery, TargetQuery,
    TopicQuery, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

mod config;
mod db;
mod state;
mod topics;

use db::Db;
use state::SharedState;

const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 64 * 1024;

fn main() {
    init_logging();

    let socket_path = match daemon_socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let config = match config::load_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load daemon config; using defaults");
            config::DaemonConfig::default()
        }
    };

    let db_path = match config.storage.db_path.clone() {
        Some(path) => path,
        None => match daemon_db_path() {
            Ok(path) => path,
            Err(err) => {
                error!(error = %err, "Failed to resolve daemon database path");
                std::process::exit(1);
            }
        },
    };

    let db = match Db::new(db_path) {
        Ok(db) => db,
        Err(err) => {
            error!(error = %err, "Failed to initialize daemon database");
            std::process::exit(1);
        }
    };

    info!(
        scope_name = %config.engine.scope_name,
        test_type = %config.engine.test_type,
        probe_shards = config.engine.probe_shards,
        queue_capacity = config.engine.queue_capacity,
        "Engine config loaded"
    );
    let shared_state = Arc::new(SharedState::new(db, config.engine));

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    info!(path = %socket_path.display(), "Coverage daemon started");

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let state = Arc::clone(&shared_state);
                thread::spawn(move || handle_connection(stream, state));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn init_logging() {
    let debug_enabled = env::var("COVERAGE_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn coverage_home() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".coverage"))
}

pub(crate) fn daemon_dir() -> Result<PathBuf, String> {
    Ok(coverage_home()?.join("daemon"))
}

fn daemon_socket_path() -> Result<PathBuf, String> {
    Ok(coverage_home()?.join(SOCKET_NAME))
}

fn daemon_db_path() -> Result<PathBuf, String> {
    Ok(daemon_dir()?.join("scopes.db"))
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, state: Arc<SharedState>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    let response = handle_request(request, &state);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

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
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
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

    if buffer.is_empty() {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let request_bytes = match newline_index {
        Some(index) => {
            if buffer.len() > index + 1 {
                let trailing = &buffer[index + 1..];
                if trailing.iter().any(|b| !b.is_ascii_whitespace()) {
                    warn!("Extra bytes detected after newline; ignoring trailing data");
                }
            }
            &buffer[..index]
        }
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

fn handle_request(request: Request, state: &SharedState) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    match request.method {
        Method::GetHealth => {
            let data = serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
                "targets": state.target_count(),
            });
            Response::ok(request.id, data)
        }
        Method::Event => handle_event(request, state),
        Method::GetTopic => {
            let query: TopicQuery = match parse_params(request.params) {
                Ok(query) => query,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            match state.topic(&query.target_id, query.topic) {
                Some(payload) => Response::ok(
                    request.id,
                    serde_json::json!({ "found": true, "topic": query.topic, "payload": payload }),
                ),
                None => Response::ok(
                    request.id,
                    serde_json::json!({
                        "found": false,
                        "topic": query.topic,
                        "available": state.published_topics(&query.target_id),
                    }),
                ),
            }
        }
        Method::GetScopes => {
            let query: ScopeQuery = match request.params {
                Some(params) => match parse_params(Some(params)) {
                    Ok(query) => query,
                    Err(err) => return Response::error_with_info(request.id, err),
                },
                None => ScopeQuery::default(),
            };
            match state.scopes(query.target_id.as_deref()) {
                Ok(scopes) => {
                    debug!(scopes = scopes.len(), "Scopes snapshot");
                    to_response(request.id, &scopes, "scopes")
                }
                Err(err) => Response::error(
                    request.id,
                    "scopes_error",
                    format!("Failed to fetch scopes: {}", err),
                ),
            }
        }
        Method::GetSessionState => {
            let query: TargetQuery = match parse_params(request.params) {
                Ok(query) => query,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            match state.session_snapshot(&query.target_id) {
                Some(snapshot) => to_response(request.id, &snapshot, "session state"),
                None => Response::ok(
                    request.id,
                    serde_json::json!({ "found": false, "target_id": query.target_id }),
                ),
            }
        }
    }
}

fn handle_event(request: Request, state: &SharedState) -> Response {
    let params = match request.params {
        Some(params) => params,
        None => return Response::error(request.id, "invalid_params", "event payload is required"),
    };

    let (target, event) = match parse_event_request(params) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Event dropped");
            return Response::error_with_info(request.id, err);
        }
    };

    debug!(
        target_id = %target.id,
        build_version = %target.build_version,
        event_type = event.kind().as_str(),
        "Received event"
    );

    match state.apply_event(&target, event) {
        Ok(outcome) => Response::ok(
            request.id,
            serde_json::json!({
                "accepted": true,
                "state": outcome.state,
                "rejected_records": outcome.rejected_records,
                "finished": outcome.finished,
            }),
        ),
        Err(err) => Response::error(request.id, err.code(), err.to_string()),
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, ErrorInfo> {
    let params = params.ok_or_else(|| ErrorInfo::new("invalid_params", "params are required"))?;
    serde_json::from_value(params)
        .map_err(|err| ErrorInfo::new("invalid_params", format!("invalid params: {}", err)))
}

fn to_response<T: Serialize>(id: Option<String>, value: &T, what: &str) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("Failed to serialize {}: {}", what, err),
        ),
    }
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
