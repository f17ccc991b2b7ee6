//! Typed messages exchanged between the host and a sandbox worker, plus the
//! length-prefixed framing used when the worker is a child process.
//!
//! Every frame is a 4-byte little-endian length followed by a JSON document.
//! Frames larger than [`MAX_FRAME_SIZE`] are rejected on both sides.
#![allow(missing_docs)]

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::runner::SandboxLimits;

/// Largest frame either side will accept.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Request-scoped values a script sees as constants, plus the names the
/// worker needs to build its capability stubs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScriptContext {
    pub args: Json,
    pub body: Json,
    pub query: Json,
    pub params: Json,
    pub user: Json,
    /// Table `repos.main` resolves to.
    pub main_table: Option<String>,
    /// Tables exposed under `repos`.
    pub tables: Vec<String>,
    /// Host helper names exposed under `helpers::`.
    pub helpers: Vec<String>,
}

/// Host to worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HostMessage {
    Execute {
        execution_id: u64,
        script: String,
        context: ScriptContext,
        limits: SandboxLimits,
    },
    CallResult {
        execution_id: u64,
        call_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Json>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<CallError>,
    },
    Shutdown,
}

/// Worker to host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WorkerMessage {
    Ready {
        pid: u32,
    },
    Call {
        execution_id: u64,
        call_id: u64,
        path: String,
        args: Vec<Json>,
    },
    Done {
        execution_id: u64,
        data: Json,
    },
    Error {
        execution_id: u64,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
    },
}

/// Failure of one host capability call, relayed back into the script.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl CallError {
    /// Error with an HTTP-style status.
    pub fn status(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: Some(status_code),
        }
    }

    /// Error with no status; surfaces as an internal error if uncaught.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: None,
        }
    }
}

/// Repository operation reachable from scripts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepoMethod {
    Find,
    FindOne,
    Create,
    Update,
    Delete,
}

impl RepoMethod {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "find" => RepoMethod::Find,
            "find_one" | "findOne" => RepoMethod::FindOne,
            "create" => RepoMethod::Create,
            "update" => RepoMethod::Update,
            "delete" => RepoMethod::Delete,
            _ => return None,
        })
    }

    /// Script-side name.
    pub fn name(self) -> &'static str {
        match self {
            RepoMethod::Find => "find",
            RepoMethod::FindOne => "find_one",
            RepoMethod::Create => "create",
            RepoMethod::Update => "update",
            RepoMethod::Delete => "delete",
        }
    }
}

/// Parsed `path` of a [`WorkerMessage::Call`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallTarget {
    /// `repos.<table>.<method>`
    Repo { table: String, method: RepoMethod },
    /// `helpers.<name>`
    Helper(String),
    /// `errors.throw<status>`
    Throw(u16),
}

impl CallTarget {
    /// Parses a dotted capability path.
    pub fn parse(path: &str) -> Option<Self> {
        let mut parts = path.split('.');
        let target = match (parts.next()?, parts.next()?, parts.next()) {
            ("repos", table, Some(method)) if !table.is_empty() => CallTarget::Repo {
                table: table.to_string(),
                method: RepoMethod::parse(method)?,
            },
            ("helpers", name, None) if !name.is_empty() => CallTarget::Helper(name.to_string()),
            ("errors", name, None) => match name {
                "throw400" => CallTarget::Throw(400),
                "throw401" => CallTarget::Throw(401),
                "throw403" => CallTarget::Throw(403),
                _ => return None,
            },
            _ => return None,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(target)
    }
}

/// Reads one frame; `None` on a clean end of stream.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    if let Err(err) = reader.read_exact(&mut header) {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(err);
    }
    let size = frame_size(header)?;
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf)?;
    Ok(Some(buf))
}

/// Writes one frame and flushes.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    writer.write_all(&frame_header(payload)?)?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Async [`read_frame`].
pub async fn read_frame_async<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    if let Err(err) = reader.read_exact(&mut header).await {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(err);
    }
    let size = frame_size(header)?;
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Async [`write_frame`].
pub async fn write_frame_async<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    writer.write_all(&frame_header(payload)?).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

fn frame_size(header: [u8; 4]) -> io::Result<usize> {
    let size = u32::from_le_bytes(header) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {size} bytes exceeds the {MAX_FRAME_SIZE} byte limit"),
        ));
    }
    Ok(size)
}

fn frame_header(payload: &[u8]) -> io::Result<[u8; 4]> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("payload of {} bytes exceeds the frame limit", payload.len()),
        ));
    }
    Ok((payload.len() as u32).to_le_bytes())
}
