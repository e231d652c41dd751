//! Node identity and lifecycle definitions.
//!
//! Nodes in the fleet are identified by unique UUIDs. Their lifecycle is a
//! small state machine driven by [`NodeEvent`]s; every legal move is listed
//! in [`NodeState::apply`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a node in the fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generate a new random node ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a node ID from a UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse from a string
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // first 8 chars of the UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Lifecycle state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    /// Node is registered but not yet connected
    Starting,
    /// Node is connected and can accept a task
    Ready,
    /// Node is executing a task
    Busy,
    /// Node is shutting down
    Stopping,
    /// Node has shut down
    Stopped,
    /// Node hit an unrecoverable error; needs an explicit restart
    Failed,
}

impl NodeState {
    /// All states, in lifecycle order
    pub const ALL: [NodeState; 6] = [
        NodeState::Starting,
        NodeState::Ready,
        NodeState::Busy,
        NodeState::Stopping,
        NodeState::Stopped,
        NodeState::Failed,
    ];

    /// Compute the state reached by applying `event`, or `None` if the
    /// event is not legal from this state.
    pub fn apply(self, event: NodeEvent) -> Option<NodeState> {
        use NodeEvent as E;
        use NodeState as S;

        match (self, event) {
            (_, E::Fault) => Some(S::Failed),
            (S::Starting, E::Started) => Some(S::Ready),
            (S::Ready, E::TaskBegan) => Some(S::Busy),
            (S::Busy, E::TaskFinished) => Some(S::Ready),
            (S::Starting | S::Ready | S::Busy | S::Failed, E::StopRequested) => Some(S::Stopping),
            (S::Stopping, E::Stopped) => Some(S::Stopped),
            (S::Failed | S::Stopped, E::Restart) => Some(S::Starting),
            _ => None,
        }
    }

    /// Check if a node in this state can accept a task
    pub fn is_eligible(&self) -> bool {
        *self == NodeState::Ready
    }

    /// Check if the node has left service (stopped or failed)
    pub fn is_down(&self) -> bool {
        matches!(self, NodeState::Stopped | NodeState::Failed)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Starting => write!(f, "Starting"),
            NodeState::Ready => write!(f, "Ready"),
            NodeState::Busy => write!(f, "Busy"),
            NodeState::Stopping => write!(f, "Stopping"),
            NodeState::Stopped => write!(f, "Stopped"),
            NodeState::Failed => write!(f, "Failed"),
        }
    }
}

/// Lifecycle events that drive [`NodeState`] transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeEvent {
    /// Connection established (Starting -> Ready)
    Started,
    /// Task execution began (Ready -> Busy)
    TaskBegan,
    /// Task execution finished (Busy -> Ready)
    TaskFinished,
    /// Unrecoverable error (any -> Failed)
    Fault,
    /// Shutdown requested (-> Stopping)
    StopRequested,
    /// Shutdown finished (Stopping -> Stopped)
    Stopped,
    /// Explicit restart of a failed or stopped node (-> Starting)
    Restart,
}

/// Point-in-time view of a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique node identifier
    pub id: NodeId,

    /// Human-readable node name
    pub name: String,

    /// Current lifecycle state
    pub state: NodeState,

    /// Last time the node proved it was alive
    pub last_heartbeat: DateTime<Utc>,

    /// Number of tasks this node has completed (success or failure)
    pub tasks_completed: u64,
}

impl NodeInfo {
    /// Check if heartbeat is stale (older than given age)
    pub fn is_heartbeat_stale(&self, max_age: std::time::Duration) -> bool {
        (Utc::now() - self.last_heartbeat)
            .to_std()
            .map(|age| age > max_age)
            .unwrap_or(false)
    }
}
