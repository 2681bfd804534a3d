use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;

/// JSON newline-delimited request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub cmd: String,
    /// Identifiers to process (`run`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifiers: Option<Vec<String>>,
    /// Identifier to register (`add`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Identifiers to delete (`remove`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    /// Inclusive `YYYY-MM-DD` bounds (`run`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
}

impl DaemonRequest {
    pub fn command(cmd: &str) -> Self {
        Self {
            cmd: cmd.to_string(),
            ..Self::default()
        }
    }
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Write `request` as one line on the daemon socket and read one line back.
pub fn send_request(
    data_dir: &Path,
    request: &DaemonRequest,
) -> Result<DaemonResponse, DaemonError> {
    let socket = socket_path(data_dir);
    let mut stream = connect(&socket)?;

    let mut line = serde_json::to_vec(request)?;
    line.push(b'\n');
    stream
        .write_all(&line)
        .and_then(|()| stream.flush())
        .map_err(|e| io_err(&socket, e))?;

    let mut reply = String::new();
    let read = BufReader::new(stream)
        .read_line(&mut reply)
        .map_err(|e| io_err(&socket, e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "daemon hung up without answering".to_string(),
        ));
    }
    Ok(serde_json::from_str(reply.trim_end())?)
}

/// A missing socket, or one nobody listens on, means no daemon.
fn connect(socket: &Path) -> Result<UnixStream, DaemonError> {
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning {
            socket: socket.to_path_buf(),
        });
    }
    UnixStream::connect(socket).map_err(|err| match err.kind() {
        ErrorKind::NotFound | ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
            DaemonError::DaemonNotRunning {
                socket: socket.to_path_buf(),
            }
        }
        _ => io_err(socket, err),
    })
}

/// Send `request` and unwrap the response payload.
pub fn request(data_dir: &Path, request: &DaemonRequest) -> Result<Value, DaemonError> {
    response_into_data(send_request(data_dir, request)?)
}

/// Query status, retrying briefly while the socket is coming up.
pub fn request_status(data_dir: &Path) -> Result<Value, DaemonError> {
    const ATTEMPTS: u32 = 5;
    let status = DaemonRequest::command("status");

    let mut attempt = 1;
    loop {
        match send_request(data_dir, &status) {
            Err(DaemonError::DaemonNotRunning { .. }) if attempt < ATTEMPTS => {
                attempt += 1;
                sleep(Duration::from_millis(100));
            }
            other => return response_into_data(other?),
        }
    }
}

pub fn request_stop(data_dir: &Path) -> Result<(), DaemonError> {
    request(data_dir, &DaemonRequest::command("stop")).map(|_| ())
}

pub fn request_stop_schedule(data_dir: &Path) -> Result<Value, DaemonError> {
    request(data_dir, &DaemonRequest::command("stop-schedule"))
}

pub fn request_reset(data_dir: &Path) -> Result<Value, DaemonError> {
    request(data_dir, &DaemonRequest::command("reset"))
}

/// Trigger a run. The daemon answers as soon as the run has started or
/// been refused; it does not wait for completion.
pub fn request_run(
    data_dir: &Path,
    identifiers: Vec<String>,
    start_date: &str,
    end_date: &str,
) -> Result<Value, DaemonError> {
    request(
        data_dir,
        &DaemonRequest {
            cmd: "run".to_string(),
            identifiers: Some(identifiers),
            start_date: Some(start_date.to_string()),
            end_date: Some(end_date.to_string()),
            ..DaemonRequest::default()
        },
    )
}

fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown daemon error".to_string()),
        ))
    }
}
