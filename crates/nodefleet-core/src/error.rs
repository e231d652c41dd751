//! Errors raised while driving the fleet.
//!
//! A node that fails or times out on a task is not an error here: that
//! outcome is recorded in its [`TaskResult`](crate::TaskResult). A
//! `FleetError` means the operation itself could not be carried out.

use thiserror::Error;

use crate::node::{NodeEvent, NodeId, NodeState};

pub type Result<T> = std::result::Result<T, FleetError>;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("node {node_id} could not start: {reason}")]
    Startup { node_id: NodeId, reason: String },

    #[error("node {node_id} is {state}, not Ready")]
    NotReady { node_id: NodeId, state: NodeState },

    #[error("node {0} is not registered")]
    UnknownNode(NodeId),

    #[error("node {0} is already registered")]
    DuplicateNode(NodeId),

    #[error("node {node_id} cannot take {event:?} while {from}")]
    InvalidTransition {
        node_id: NodeId,
        from: NodeState,
        event: NodeEvent,
    },

    /// Nothing was Ready when a task was coordinated
    #[error("no Ready node to run the task")]
    NoEligibleNodes,

    #[error("cannot reach node: {0}")]
    ConnectionFailed(String),

    #[error("connection to node lost")]
    ConnectionClosed,

    #[error("gave up after {0} ms")]
    Timeout(u64),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The peer sent something that is not a usable frame
    #[error("wire: {0}")]
    Wire(#[from] WireError),

    /// A message could not be turned into a frame; nothing was sent
    #[error("cannot encode message: {0}")]
    Serialization(String),

    #[error("bad configuration: {0}")]
    Config(String),

    #[error("internal: {0}")]
    Internal(String),
}

/// Ways an incoming frame can be unusable
#[derive(Error, Debug)]
pub enum WireError {
    #[error("bad magic {0:02x?}")]
    InvalidMagic([u8; 4]),

    #[error("protocol version {0} is not spoken here")]
    UnsupportedVersion(u8),

    #[error("frame kind {0:#04x} is unknown")]
    UnknownFrameKind(u8),

    #[error("frame checksum {actual:#010x}, computed {expected:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("{size}-byte payload over the {max}-byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// Checksum matched but the payload is not a message
    #[error("undecodable payload: {0}")]
    Deserialization(String),
}

impl FleetError {
    /// Whether the same operation may succeed if tried again later
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FleetError::Timeout(_)
                | FleetError::ConnectionFailed(_)
                | FleetError::ConnectionClosed
                | FleetError::NoEligibleNodes
        )
    }

    pub fn is_protocol_error(&self) -> bool {
        matches!(self, FleetError::Wire(_))
    }

    /// Whether the connection to a node can no longer be trusted.
    ///
    /// Such a node is moved to Failed. Encoding failures are local and
    /// leave the connection intact.
    pub fn is_transport_fault(&self) -> bool {
        matches!(
            self,
            FleetError::ConnectionFailed(_)
                | FleetError::ConnectionClosed
                | FleetError::Io(_)
                | FleetError::Timeout(_)
                | FleetError::Wire(_)
        )
    }
}
