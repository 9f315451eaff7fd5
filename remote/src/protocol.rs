//! RPC protocol between the archiving daemon and its encode workers.
//!
//! # Protocol Overview
//!
//! Workers connect to the daemon over a single TCP connection and drive a
//! call/response protocol. Every frame is a length-delimited bincode
//! envelope; requests within one connection are answered strictly in order,
//! one at a time. Errors travel on their own reply variant so a failed call
//! never tears down the connection.
//!
//! # Message Flow
//!
//! ```text
//! Worker                                 Daemon
//!   |  ---- Authenticate(token) ------->  |  create or reclaim session
//!   |  <--- Ok(Done) ------------------   |
//!   |  ---- GetNextFile(filter) ------->  |  reserve source, open download
//!   |  <--- Ok(Settings{len, ...}) ----   |  len == 0 -> no job, retry later
//!   |  ---- ReadChunk ----------------->  |
//!   |  <--- Ok(Chunk{more, data}) -----   |  repeated until more == false
//!   |  ---- PostFile(result) ---------->  |  open upload sink on success
//!   |  ---- WriteChunk(data) ---------->  |
//!   |  <--- Ok(MoreExpected(bool)) ----   |  false -> upload complete
//! ```
//!
//! A worker that lost its connection reconnects, calls `Authenticate` with
//! the same token to reclaim the session, then `Reset` to rewind the active
//! transfer.

use serde::{Deserialize, Serialize};

use common::media::{EncodingResultInfo, MediaEncoderSettings, MediaFileRequirements};

/// Calls a worker can issue, with their positional arguments.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum Request {
    GetVersion,
    Authenticate { token: String },
    GetNextFile { filter: MediaFileRequirements },
    ReadChunk,
    PostFile { result: EncodingResultInfo },
    WriteChunk { data: Vec<u8> },
    Reset,
    Abort,
}

impl Request {
    /// Method name for logging.
    pub fn method(&self) -> &'static str {
        match self {
            Request::GetVersion => "getVersion",
            Request::Authenticate { .. } => "authenticate",
            Request::GetNextFile { .. } => "getNextFile",
            Request::ReadChunk => "readChunk",
            Request::PostFile { .. } => "postFile",
            Request::WriteChunk { .. } => "writeChunk",
            Request::Reset => "reset",
            Request::Abort => "abort",
        }
    }
}

/// Successful results, one variant per call shape.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum Response {
    Version(u32),
    Done,
    Settings(MediaEncoderSettings),
    Chunk { has_more: bool, data: Vec<u8> },
    MoreExpected(bool),
}

/// The error-response channel: faults are surfaced to the caller verbatim
/// and the connection stays usable.
#[derive(Clone, Debug, Deserialize, Serialize, thiserror::Error)]
pub enum RpcFault {
    #[error("client not authenticated")]
    NotAuthenticated,
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("catalog error: {0}")]
    Catalog(String),
}

/// Envelope sent back for every request.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum Reply {
    Ok(Response),
    Err(RpcFault),
}
