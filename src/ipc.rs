//! Control channel to a running supervisor (§4.7, ambient).
//!
//! `retry`/`resume`/`stop` are delivered over a Unix domain socket: the CLI
//! process connects, sends one newline-delimited JSON command, reads one
//! JSON response, and exits. The socket lives under the runtime state
//! directory and is removed on clean shutdown.

use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{self, BufRead, BufReader, Write},
    os::unix::net::{UnixListener, UnixStream},
    path::PathBuf,
};
use thiserror::Error;

use crate::runtime;

/// Command sent from a CLI invocation to the resident supervisor.
#[derive(Debug, Serialize, Deserialize)]
pub enum ControlCommand {
    /// Signal "retry-now" to every paused sub-service (or just `service`, if given).
    Resume { service: Option<String> },
    /// Trigger the supervisor's Stop sequence without waiting for it here.
    Stop,
}

/// Response sent by the supervisor.
#[derive(Debug, Serialize, Deserialize)]
pub enum ControlResponse {
    Ok,
    Message(String),
    Error(String),
}

/// Errors raised by the control channel helpers.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control socket I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to serialize control message: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("supervisor reported error: {0}")]
    Server(String),
    #[error("control socket not available; is the supervisor running?")]
    NotAvailable,
}

/// The control socket path, under the active runtime's state directory.
pub fn socket_path() -> PathBuf {
    runtime::control_socket_path()
}

/// Sends `command` to the resident supervisor and waits for one response.
pub fn send_command(command: &ControlCommand) -> Result<ControlResponse, ControlError> {
    let path = socket_path();
    if !path.exists() {
        return Err(ControlError::NotAvailable);
    }

    let mut stream = UnixStream::connect(&path)?;
    let payload = serde_json::to_vec(command)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;
    if response_line.trim().is_empty() {
        return Err(ControlError::NotAvailable);
    }

    let response: ControlResponse = serde_json::from_str(response_line.trim())?;
    if let ControlResponse::Error(message) = &response {
        return Err(ControlError::Server(message.clone()));
    }
    Ok(response)
}

/// Binds the control socket, removing any stale file left by a prior run.
pub fn bind() -> Result<UnixListener, ControlError> {
    let path = socket_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let _ = fs::remove_file(&path);
    Ok(UnixListener::bind(&path)?)
}

/// Removes the control socket file, called on clean shutdown.
pub fn unbind() {
    let _ = fs::remove_file(socket_path());
}

/// Reads one command from an accepted connection.
pub fn read_command(stream: &mut UnixStream) -> Result<ControlCommand, ControlError> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim().is_empty() {
        return Err(ControlError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "empty control command",
        )));
    }
    Ok(serde_json::from_str(line.trim())?)
}

/// Writes one response to the connected CLI client.
pub fn write_response(stream: &mut UnixStream, response: &ControlResponse) -> Result<(), ControlError> {
    let payload = serde_json::to_vec(response)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
