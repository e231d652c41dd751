//! Concurrent fan-out of one task to a set of nodes.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use nodefleet_core::{FleetError, NodeId, Result, Task, TaskResult};

use crate::handle::NodeHandle;

/// Sends a task to many nodes at once and collects one result per node
#[derive(Debug, Clone)]
pub struct TaskDispatcher {
    /// Per-node timeout for tasks that do not set their own
    default_timeout: Duration,
}

impl TaskDispatcher {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    /// Run `task` on every node in `nodes` concurrently.
    ///
    /// Results come back in the order of `nodes`, whatever order the nodes
    /// finish in. A node that misses the deadline yields `Timeout` and is
    /// marked Failed; a node that is no longer Ready yields `Failure` and
    /// keeps its state.
    pub async fn dispatch(
        &self,
        task: &Task,
        nodes: &[Arc<NodeHandle>],
    ) -> Result<Vec<(NodeId, TaskResult)>> {
        if nodes.is_empty() {
            return Err(FleetError::NoEligibleNodes);
        }

        let timeout = task.effective_timeout(self.default_timeout);
        let shared = Arc::new(task.clone());

        debug!(
            task_id = %task.id,
            nodes = nodes.len(),
            timeout_ms = timeout.as_millis() as u64,
            "Dispatching task"
        );

        let running = nodes.iter().map(|node| {
            let node = Arc::clone(node);
            let task = Arc::clone(&shared);
            tokio::spawn(async move { run_on_node(&node, &task, timeout).await })
        });
        let joined = join_all(running).await;

        let results = nodes
            .iter()
            .zip(joined)
            .map(|(node, outcome)| {
                let result = outcome.unwrap_or_else(|e| {
                    node.mark_failed(&format!("node task aborted: {}", e));
                    TaskResult::Failure(format!("node task aborted: {}", e))
                });
                (node.id(), result)
            })
            .collect();

        Ok(results)
    }
}

async fn run_on_node(node: &NodeHandle, task: &Task, timeout: Duration) -> TaskResult {
    match tokio::time::timeout(timeout, node.execute_task(task)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            debug!(node_id = %node.id(), task_id = %task.id, error = %e, "Node skipped");
            TaskResult::Failure(e.to_string())
        }
        Err(_) => {
            warn!(
                node_id = %node.id(),
                task_id = %task.id,
                timeout_ms = timeout.as_millis() as u64,
                "Node timed out"
            );
            node.mark_failed(&format!("no reply within {} ms", timeout.as_millis()));
            TaskResult::Timeout
        }
    }
}
