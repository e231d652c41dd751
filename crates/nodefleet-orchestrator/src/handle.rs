//! A single managed node.
//!
//! A [`NodeHandle`] pairs a node's identity with its transport and its
//! lifecycle state. State changes go through [`NodeHandle::apply`], which
//! holds the handle's lock only for the synchronous check-and-update and
//! never across an `.await`.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use nodefleet_core::{FleetError, NodeEvent, NodeId, NodeInfo, NodeState, Result, Task, TaskResult};

use crate::registry::RegistryEvent;
use crate::transport::NodeTransport;

/// Mutable part of a handle
struct Status {
    state: NodeState,
    last_heartbeat: DateTime<Utc>,
    tasks_completed: u64,
    /// A `start` call owns the transport's connect
    connecting: bool,
    /// Set while the handle belongs to a registry
    events: Option<broadcast::Sender<RegistryEvent>>,
}

/// One worker node under orchestration
pub struct NodeHandle {
    id: NodeId,
    name: String,
    transport: Arc<dyn NodeTransport>,
    status: Mutex<Status>,
}

impl NodeHandle {
    /// Create a handle in the Starting state
    pub fn new(name: impl Into<String>, transport: Arc<dyn NodeTransport>) -> Self {
        Self::with_id(NodeId::new(), name, transport)
    }

    /// Create a handle with a caller-chosen id
    pub fn with_id(id: NodeId, name: impl Into<String>, transport: Arc<dyn NodeTransport>) -> Self {
        Self {
            id,
            name: name.into(),
            transport,
            status: Mutex::new(Status {
                state: NodeState::Starting,
                last_heartbeat: Utc::now(),
                tasks_completed: 0,
                connecting: false,
                events: None,
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport(&self) -> &Arc<dyn NodeTransport> {
        &self.transport
    }

    /// Current lifecycle state
    pub fn state(&self) -> NodeState {
        self.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_eligible()
    }

    /// Snapshot of the handle
    pub fn info(&self) -> NodeInfo {
        let status = self.lock();
        NodeInfo {
            id: self.id,
            name: self.name.clone(),
            state: status.state,
            last_heartbeat: status.last_heartbeat,
            tasks_completed: status.tasks_completed,
        }
    }

    /// Apply a lifecycle event atomically, returning the new state
    pub fn apply(&self, event: NodeEvent) -> Result<NodeState> {
        let mut status = self.lock();
        self.transition(&mut status, event)
    }

    /// Connect the node, moving it from Starting to Ready.
    ///
    /// On a connection error or when `timeout` elapses the node becomes
    /// Failed and [`FleetError::Startup`] is returned. Only one `start` may
    /// connect at a time. If the node is stopped while connecting, the new
    /// connection is closed again and the node stays Stopped.
    pub async fn start(&self, timeout: Duration) -> Result<()> {
        let _connecting = self.begin_connect()?;

        info!(node_id = %self.id, name = %self.name, peer = %self.transport.peer(), "Starting node");

        let reason = match tokio::time::timeout(timeout, self.transport.connect()).await {
            Ok(Ok(())) => return self.finish_connect().await,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no connection within {} ms", timeout.as_millis()),
        };

        {
            let mut status = self.lock();
            if status.state == NodeState::Starting {
                warn!(node_id = %self.id, name = %self.name, reason = %reason, "Node failed to start");
                let _ = self.transition(&mut status, NodeEvent::Fault);
            }
        }
        Err(FleetError::Startup {
            node_id: self.id,
            reason,
        })
    }

    /// Claim the connect for this `start` call
    fn begin_connect(&self) -> Result<ConnectingGuard<'_>> {
        let mut status = self.lock();
        if status.state != NodeState::Starting || status.connecting {
            return Err(FleetError::InvalidTransition {
                node_id: self.id,
                from: status.state,
                event: NodeEvent::Started,
            });
        }
        status.connecting = true;
        Ok(ConnectingGuard(self))
    }

    /// Settle a successful connect against whatever happened meanwhile
    async fn finish_connect(&self) -> Result<()> {
        let outcome = {
            let mut status = self.lock();
            let outcome = self.transition(&mut status, NodeEvent::Started);
            if outcome.is_ok() {
                status.last_heartbeat = Utc::now();
            }
            outcome
        };

        match outcome {
            Ok(_) => {
                info!(node_id = %self.id, name = %self.name, "Node ready");
                Ok(())
            }
            Err(_) => {
                let state = self.state();
                warn!(node_id = %self.id, state = %state, "Node left Starting while connecting");
                if let Err(e) = self.transport.disconnect().await {
                    warn!(node_id = %self.id, error = %e, "Closing late connection failed");
                }
                Err(FleetError::Startup {
                    node_id: self.id,
                    reason: format!("node became {} while connecting", state),
                })
            }
        }
    }

    /// Disconnect the node. Stopping an already stopped node is a no-op.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut status = self.lock();
            if matches!(status.state, NodeState::Stopped | NodeState::Stopping) {
                debug!(node_id = %self.id, state = %status.state, "Node already stopped");
                return Ok(());
            }
            self.transition(&mut status, NodeEvent::StopRequested)?;
        }

        info!(node_id = %self.id, name = %self.name, "Stopping node");

        match self.transport.disconnect().await {
            Ok(()) => {
                self.apply(NodeEvent::Stopped)?;
                info!(node_id = %self.id, "Node stopped");
                Ok(())
            }
            Err(e) => {
                self.mark_failed(&format!("disconnect failed: {}", e));
                Err(e)
            }
        }
    }

    /// Run a task on this node.
    ///
    /// Fails with [`FleetError::NotReady`] when the node is not Ready. A
    /// broken transport moves the node to Failed and yields a `Failure`.
    pub async fn execute_task(&self, task: &Task) -> Result<TaskResult> {
        {
            let mut status = self.lock();
            if status.state != NodeState::Ready {
                return Err(FleetError::NotReady {
                    node_id: self.id,
                    state: status.state,
                });
            }
            self.transition(&mut status, NodeEvent::TaskBegan)?;
        }

        debug!(node_id = %self.id, task_id = %task.id, "Executing task");
        let started = Instant::now();

        match self.transport.send(task).await {
            Ok(reply) => {
                let result = reply.into_result();
                self.finish_task();
                debug!(
                    node_id = %self.id,
                    task_id = %task.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    result = %result,
                    "Task finished"
                );
                Ok(result)
            }
            Err(e) if e.is_transport_fault() => {
                self.mark_failed(&e.to_string());
                Ok(TaskResult::Failure(e.to_string()))
            }
            Err(e) => {
                self.finish_task();
                warn!(node_id = %self.id, task_id = %task.id, error = %e, "Task send failed");
                Ok(TaskResult::Failure(e.to_string()))
            }
        }
    }

    /// Ping the node, refreshing its heartbeat on success.
    ///
    /// A failed or late ping moves the node to Failed.
    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        let outcome = match tokio::time::timeout(timeout, self.transport.ping()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(FleetError::Timeout(timeout.as_millis() as u64)),
        };

        match outcome {
            Ok(()) => {
                self.touch();
                Ok(())
            }
            Err(e) => {
                self.mark_failed(&format!("heartbeat failed: {}", e));
                Err(e)
            }
        }
    }

    /// Move the node to Failed
    pub fn mark_failed(&self, reason: &str) {
        let mut status = self.lock();
        if status.state == NodeState::Failed {
            return;
        }
        warn!(node_id = %self.id, name = %self.name, reason, "Node failed");
        // Fault is legal from every state
        let _ = self.transition(&mut status, NodeEvent::Fault);
    }

    /// Put a Failed or Stopped node back into Starting
    pub fn restart(&self) -> Result<()> {
        self.apply(NodeEvent::Restart)?;
        info!(node_id = %self.id, name = %self.name, "Node restarting");
        Ok(())
    }

    /// Refresh the heartbeat timestamp
    pub fn touch(&self) {
        self.lock().last_heartbeat = Utc::now();
    }

    pub(crate) fn attach_events(&self, events: broadcast::Sender<RegistryEvent>) {
        self.lock().events = Some(events);
    }

    pub(crate) fn detach_events(&self) {
        self.lock().events = None;
    }

    /// Leave Busy after a task; a node stopped or failed meanwhile keeps its state
    fn finish_task(&self) {
        let mut status = self.lock();
        status.tasks_completed += 1;
        status.last_heartbeat = Utc::now();
        if status.state == NodeState::Busy {
            let _ = self.transition(&mut status, NodeEvent::TaskFinished);
        }
    }

    fn transition(&self, status: &mut Status, event: NodeEvent) -> Result<NodeState> {
        let from = status.state;
        let to = from.apply(event).ok_or(FleetError::InvalidTransition {
            node_id: self.id,
            from,
            event,
        })?;

        status.state = to;
        if from != to {
            debug!(node_id = %self.id, ?event, old_state = %from, new_state = %to, "Node state changed");
            if let Some(events) = &status.events {
                let _ = events.send(RegistryEvent::StateChanged {
                    node_id: self.id,
                    old_state: from,
                    new_state: to,
                });
            }
        }
        Ok(to)
    }

    fn lock(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the connect claim however `start` ends, including cancellation
struct ConnectingGuard<'a>(&'a NodeHandle);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().connecting = false;
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Behavior, ScriptedTransport};

    fn handle(transport: ScriptedTransport) -> (NodeHandle, Arc<ScriptedTransport>) {
        let transport = Arc::new(transport);
        (NodeHandle::new("node-0", transport.clone()), transport)
    }

    #[tokio::test]
    async fn test_start_moves_to_ready() {
        let (node, transport) = handle(ScriptedTransport::new());
        assert_eq!(node.state(), NodeState::Starting);

        node.start(Duration::from_secs(1)).await.unwrap();
        assert_eq!(node.state(), NodeState::Ready);
        assert_eq!(transport.connects(), 1);
    }

    #[tokio::test]
    async fn test_start_failure_marks_failed() {
        let (node, _) = handle(ScriptedTransport::new().failing_connect());

        let err = node.start(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, FleetError::Startup { .. }));
        assert_eq!(node.state(), NodeState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_timeout_marks_failed() {
        let (node, _) = handle(ScriptedTransport::new().connect_delay(Duration::from_secs(10)));

        let err = node.start(Duration::from_secs(1)).await.unwrap_err();
        assert!(err.to_string().contains("no connection within 1000 ms"));
        assert_eq!(node.state(), NodeState::Failed);
    }

    #[tokio::test]
    async fn test_start_requires_starting_state() {
        let (node, transport) = handle(ScriptedTransport::new());
        node.start(Duration::from_secs(1)).await.unwrap();

        let err = node.start(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, FleetError::InvalidTransition { from: NodeState::Ready, .. }));
        assert_eq!(transport.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_connecting_closes_connection() {
        let transport = Arc::new(ScriptedTransport::new().connect_delay(Duration::from_millis(100)));
        let node = Arc::new(NodeHandle::new("node-0", transport.clone()));

        let starting = tokio::spawn({
            let node = Arc::clone(&node);
            async move { node.start(Duration::from_secs(1)).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        node.stop().await.unwrap();
        assert_eq!(node.state(), NodeState::Stopped);

        let err = starting.await.unwrap().unwrap_err();
        assert!(matches!(err, FleetError::Startup { .. }));
        assert_eq!(node.state(), NodeState::Stopped);
        assert_eq!(transport.connects(), 1);
        assert_eq!(transport.disconnects(), 2);
        assert!(!transport.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_start_connects_once() {
        let transport = Arc::new(ScriptedTransport::new().connect_delay(Duration::from_millis(100)));
        let node = Arc::new(NodeHandle::new("node-0", transport.clone()));

        let first = tokio::spawn({
            let node = Arc::clone(&node);
            async move { node.start(Duration::from_secs(1)).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = node.start(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, FleetError::InvalidTransition { from: NodeState::Starting, .. }));

        first.await.unwrap().unwrap();
        assert_eq!(node.state(), NodeState::Ready);
        assert_eq!(transport.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_start_can_be_retried() {
        let (node, transport) = handle(ScriptedTransport::new().connect_delay(Duration::from_millis(100)));

        let cancelled = tokio::time::timeout(Duration::from_millis(10), node.start(Duration::from_secs(1))).await;
        assert!(cancelled.is_err());
        assert_eq!(node.state(), NodeState::Starting);

        node.start(Duration::from_secs(1)).await.unwrap();
        assert_eq!(node.state(), NodeState::Ready);
        assert_eq!(transport.connects(), 2);
    }

    #[tokio::test]
    async fn test_stop_twice_is_noop() {
        let (node, transport) = handle(ScriptedTransport::new());
        node.start(Duration::from_secs(1)).await.unwrap();

        node.stop().await.unwrap();
        assert_eq!(node.state(), NodeState::Stopped);

        node.stop().await.unwrap();
        assert_eq!(node.state(), NodeState::Stopped);
        assert_eq!(transport.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_stop_failure_marks_failed() {
        let (node, _) = handle(ScriptedTransport::new().failing_disconnect());
        node.start(Duration::from_secs(1)).await.unwrap();

        assert!(node.stop().await.is_err());
        assert_eq!(node.state(), NodeState::Failed);
    }

    #[tokio::test]
    async fn test_execute_requires_ready() {
        let (node, transport) = handle(ScriptedTransport::new());
        let task = Task::new_compute("sum", "1+1");

        let err = node.execute_task(&task).await.unwrap_err();
        assert!(matches!(err, FleetError::NotReady { state: NodeState::Starting, .. }));
        assert_eq!(transport.sends(), 0);
    }

    #[tokio::test]
    async fn test_execute_success_and_failure_return_to_ready() {
        let (node, _) = handle(
            ScriptedTransport::new()
                .then(Behavior::Succeed(b"2".to_vec()))
                .then(Behavior::Fail("bad input".to_string())),
        );
        node.start(Duration::from_secs(1)).await.unwrap();
        let task = Task::new_compute("sum", "1+1");

        let result = node.execute_task(&task).await.unwrap();
        assert_eq!(result, TaskResult::Success(b"2".to_vec()));
        assert_eq!(node.state(), NodeState::Ready);

        let result = node.execute_task(&task).await.unwrap();
        assert_eq!(result, TaskResult::Failure("bad input".to_string()));
        assert_eq!(node.state(), NodeState::Ready);
        assert_eq!(node.info().tasks_completed, 2);
    }

    #[tokio::test]
    async fn test_lost_connection_marks_failed() {
        let (node, _) = handle(ScriptedTransport::new().then(Behavior::Disconnect));
        node.start(Duration::from_secs(1)).await.unwrap();

        let result = node.execute_task(&Task::new_compute("sum", "1+1")).await.unwrap();
        assert!(matches!(result, TaskResult::Failure(_)));
        assert_eq!(node.state(), NodeState::Failed);
    }

    #[tokio::test]
    async fn test_restart_after_failure() {
        let (node, transport) = handle(ScriptedTransport::new());
        node.mark_failed("test");
        assert_eq!(node.state(), NodeState::Failed);

        node.restart().unwrap();
        node.start(Duration::from_secs(1)).await.unwrap();
        assert_eq!(node.state(), NodeState::Ready);
        assert_eq!(transport.connects(), 1);

        assert!(node.restart().is_err());
    }

    #[tokio::test]
    async fn test_state_changes_are_broadcast() {
        let (node, _) = handle(ScriptedTransport::new());
        let (tx, mut rx) = broadcast::channel(16);
        node.attach_events(tx);

        node.start(Duration::from_secs(1)).await.unwrap();

        match rx.recv().await.unwrap() {
            RegistryEvent::StateChanged { node_id, old_state, new_state } => {
                assert_eq!(node_id, node.id());
                assert_eq!(old_state, NodeState::Starting);
                assert_eq!(new_state, NodeState::Ready);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
