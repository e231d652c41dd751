//! What travels inside a frame.
//!
//! The orchestrator only ever sends a [`Request`] and a worker only ever
//! sends a [`Response`]. Every response answers the request carrying the
//! same sequence number, so neither side inspects payloads to pair them.

use serde::{Deserialize, Serialize};

use nodefleet_core::{ExecutionReply, Task};

use crate::frame::{Direction, WireMessage};

/// Orchestrator to worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// First request on a connection
    Hello { orchestrator: String, version: u8 },
    /// Liveness check
    Ping,
    /// Execute a task and answer with [`Response::Done`]
    Run(Task),
    /// The orchestrator is closing the connection; not answered
    Bye { reason: String },
}

impl Request {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Hello { .. } => "hello",
            Request::Ping => "ping",
            Request::Run(_) => "run",
            Request::Bye { .. } => "bye",
        }
    }
}

impl WireMessage for Request {
    const DIRECTION: Direction = Direction::Request;
}

/// Worker to orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// `Hello` accepted
    Welcome { worker: String },
    /// `Hello` refused; the worker closes the connection next
    Refused { reason: String },
    Pong { running_tasks: u32 },
    /// Outcome of a `Run`, including task-level failures
    Done(ExecutionReply),
    /// The request could not be served at all
    Error { code: ErrorCode, message: String },
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Welcome { .. } => "welcome",
            Response::Refused { .. } => "refused",
            Response::Pong { .. } => "pong",
            Response::Done(_) => "done",
            Response::Error { .. } => "error",
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
        }
    }
}

impl WireMessage for Response {
    const DIRECTION: Direction = Direction::Response;
}

/// Why a worker could not serve a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The incoming frame was malformed
    Protocol,
    /// A request other than `Hello` arrived first
    HelloRequired,
    /// The request is not valid at this point of the conversation
    InvalidRequest,
}
