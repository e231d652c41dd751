//! Node registry for tracking the managed fleet.
//!
//! The registry owns every [`NodeHandle`] and remembers the order in which
//! they were added; every listing it hands out follows that order.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use nodefleet_core::{FleetError, NodeEvent, NodeId, NodeInfo, NodeState, Result};

use crate::handle::NodeHandle;

/// Events that can occur in the registry
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// Node joined the fleet
    NodeAdded(NodeId),
    /// Node left the fleet
    NodeRemoved(NodeId),
    /// Node state changed
    StateChanged {
        node_id: NodeId,
        old_state: NodeState,
        new_state: NodeState,
    },
}

/// Node count per lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FleetSummary {
    pub total: usize,
    pub starting: usize,
    pub ready: usize,
    pub busy: usize,
    pub stopping: usize,
    pub stopped: usize,
    pub failed: usize,
}

impl FleetSummary {
    fn count(&mut self, state: NodeState) {
        self.total += 1;
        match state {
            NodeState::Starting => self.starting += 1,
            NodeState::Ready => self.ready += 1,
            NodeState::Busy => self.busy += 1,
            NodeState::Stopping => self.stopping += 1,
            NodeState::Stopped => self.stopped += 1,
            NodeState::Failed => self.failed += 1,
        }
    }
}

impl std::fmt::Display for FleetSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} nodes: {} ready, {} busy, {} starting, {} stopping, {} stopped, {} failed",
            self.total, self.ready, self.busy, self.starting, self.stopping, self.stopped, self.failed
        )
    }
}

/// Node registry
pub struct NodeRegistry {
    /// Map of node ID to handle
    nodes: DashMap<NodeId, Arc<NodeHandle>>,
    /// Insertion order
    order: RwLock<Vec<NodeId>>,
    /// Event broadcaster
    event_tx: broadcast::Sender<RegistryEvent>,
}

impl NodeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            nodes: DashMap::new(),
            order: RwLock::new(Vec::new()),
            event_tx,
        }
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    /// Take ownership of a handle
    pub fn add_node(&self, handle: NodeHandle) -> Result<NodeId> {
        let node_id = handle.id();
        let mut order = self.order.write().unwrap_or_else(PoisonError::into_inner);

        match self.nodes.entry(node_id) {
            Entry::Occupied(_) => return Err(FleetError::DuplicateNode(node_id)),
            Entry::Vacant(slot) => {
                handle.attach_events(self.event_tx.clone());
                info!(node_id = %node_id, name = %handle.name(), "Node registered");
                slot.insert(Arc::new(handle));
            }
        }
        order.push(node_id);
        drop(order);

        let _ = self.event_tx.send(RegistryEvent::NodeAdded(node_id));
        Ok(node_id)
    }

    /// Remove a handle, handing it back to the caller
    pub fn remove_node(&self, node_id: &NodeId) -> Result<Arc<NodeHandle>> {
        let mut order = self.order.write().unwrap_or_else(PoisonError::into_inner);
        let (_, handle) = self
            .nodes
            .remove(node_id)
            .ok_or(FleetError::UnknownNode(*node_id))?;
        order.retain(|id| id != node_id);
        drop(order);

        handle.detach_events();
        info!(node_id = %node_id, "Node unregistered");
        let _ = self.event_tx.send(RegistryEvent::NodeRemoved(*node_id));
        Ok(handle)
    }

    /// Apply a lifecycle event to one node
    pub fn transition(&self, node_id: &NodeId, event: NodeEvent) -> Result<NodeState> {
        self.get(node_id)
            .ok_or(FleetError::UnknownNode(*node_id))?
            .apply(event)
    }

    /// Get a node handle
    pub fn get(&self, node_id: &NodeId) -> Option<Arc<NodeHandle>> {
        self.nodes.get(node_id).map(|entry| Arc::clone(entry.value()))
    }

    /// All handles in insertion order
    pub fn handles(&self) -> Vec<Arc<NodeHandle>> {
        let order = self.order.read().unwrap_or_else(PoisonError::into_inner);
        order.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Handles that are ready to accept a task, in insertion order.
    ///
    /// The listing is a snapshot; a node may leave Ready before it is used.
    pub fn list_ready(&self) -> Vec<Arc<NodeHandle>> {
        let ready: Vec<_> = self
            .handles()
            .into_iter()
            .filter(|handle| handle.is_ready())
            .collect();
        debug!(ready = ready.len(), total = self.len(), "Listed ready nodes");
        ready
    }

    /// Get info for all nodes
    pub fn snapshot(&self) -> Vec<NodeInfo> {
        self.handles().iter().map(|handle| handle.info()).collect()
    }

    /// Count nodes per state
    pub fn summary(&self) -> FleetSummary {
        let mut summary = FleetSummary::default();
        for handle in self.handles() {
            summary.count(handle.state());
        }
        summary
    }

    /// Live nodes whose last heartbeat is older than `max_age`
    pub fn stale_nodes(&self, max_age: Duration) -> Vec<NodeId> {
        self.snapshot()
            .into_iter()
            .filter(|info| !info.state.is_down() && info.is_heartbeat_stale(max_age))
            .map(|info| info.id)
            .collect()
    }

    /// Get number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
