//! Blocking client for the queue socket

use super::protocol::{AckResponse, JobStatusDict, LaunchResponse, Request, ShowResponse};
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;

/// Send one request and decode the reply
pub fn send_request<T: DeserializeOwned>(socket: &Path, request: &Request) -> Result<T> {
    let mut stream = UnixStream::connect(socket)?;
    let mut line = serde_json::to_vec(request)?;
    line.push(b'\n');
    stream.write_all(&line)?;
    stream.shutdown(Shutdown::Write)?;

    let mut reply = String::new();
    stream.read_to_string(&mut reply)?;
    let value: serde_json::Value = serde_json::from_str(reply.trim())
        .map_err(|e| Error::Protocol(format!("malformed reply {:?}: {}", reply, e)))?;
    if let Some(message) = value.get("error").and_then(|e| e.as_str()) {
        return Err(Error::Protocol(message.to_string()));
    }
    Ok(serde_json::from_value(value)?)
}

/// Enqueue a stored manifest; returns the job id
pub fn launch(socket: &Path, specfile: &Path) -> Result<String> {
    let reply: LaunchResponse = send_request(
        socket,
        &Request::Launch {
            specfile_path: specfile.to_path_buf(),
        },
    )?;
    Ok(reply.job_id)
}

pub fn show(socket: &Path) -> Result<ShowResponse> {
    send_request(socket, &Request::Show)
}

pub fn job_status_dict(socket: &Path) -> Result<JobStatusDict> {
    send_request(socket, &Request::GetJobStatusDict)
}

pub fn stop(socket: &Path) -> Result<()> {
    send_request::<AckResponse>(socket, &Request::Stop).map(|_| ())
}

pub fn kill(socket: &Path) -> Result<()> {
    send_request::<AckResponse>(socket, &Request::Kill).map(|_| ())
}
