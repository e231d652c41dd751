//! Fleet-wide coordination.
//!
//! The [`Orchestrator`] owns a [`NodeRegistry`] and a [`TaskDispatcher`].
//! It starts and stops the fleet, and runs a task across every Ready node
//! with retries for the nodes that failed.

use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use nodefleet_core::{
    AggregateReport, FleetError, NodeId, NodeState, OrchestratorConfig, Result, Task,
};

use crate::dispatcher::TaskDispatcher;
use crate::handle::NodeHandle;
use crate::registry::NodeRegistry;
use crate::transport::NodeTransport;

/// Outcome of [`Orchestrator::start_all_nodes`]
#[derive(Debug, Clone, Default)]
pub struct StartReport {
    /// Nodes that are up, in insertion order
    pub started: Vec<NodeId>,
    /// Nodes that could not be started, with the reason
    pub failed: Vec<(NodeId, String)>,
}

impl StartReport {
    pub fn all_started(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of [`Orchestrator::stop_all_nodes`]
#[derive(Debug, Clone, Default)]
pub struct StopReport {
    pub stopped: Vec<NodeId>,
    pub failed: Vec<(NodeId, String)>,
}

impl StopReport {
    pub fn all_stopped(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of [`Orchestrator::heartbeat_all_nodes`]
#[derive(Debug, Clone, Default)]
pub struct HeartbeatReport {
    pub alive: Vec<NodeId>,
    /// Nodes that missed the ping and are now Failed
    pub lost: Vec<(NodeId, String)>,
}

/// Steps of one `coordinate_task` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Selecting,
    Dispatching { round: u32 },
    Aggregating { round: u32 },
    Retrying { round: u32 },
    Done,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Selecting => write!(f, "selecting"),
            Phase::Dispatching { round } => write!(f, "dispatching (round {})", round),
            Phase::Aggregating { round } => write!(f, "aggregating (round {})", round),
            Phase::Retrying { round } => write!(f, "retrying (round {})", round),
            Phase::Done => write!(f, "done"),
        }
    }
}

/// Public coordinator for a fleet of nodes
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<NodeRegistry>,
    dispatcher: TaskDispatcher,
}

impl Orchestrator {
    /// Build a fleet of `node_count` nodes, taking each transport from
    /// `factory(index)`.
    pub fn new<F>(node_count: usize, config: OrchestratorConfig, factory: F) -> Result<Self>
    where
        F: FnMut(usize) -> Arc<dyn NodeTransport>,
    {
        Self::with_transports(config, (0..node_count).map(factory))
    }

    /// Build a fleet with one node per transport
    pub fn with_transports<I>(config: OrchestratorConfig, transports: I) -> Result<Self>
    where
        I: IntoIterator<Item = Arc<dyn NodeTransport>>,
    {
        let orchestrator = Self::empty(config)?;
        for (index, transport) in transports.into_iter().enumerate() {
            orchestrator.add_node(format!("node-{}", index), transport)?;
        }
        Ok(orchestrator)
    }

    /// Build an orchestrator with no nodes
    pub fn empty(config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            dispatcher: TaskDispatcher::new(config.task_timeout()),
            registry: Arc::new(NodeRegistry::new()),
            config,
        })
    }

    /// Register a new node in the Starting state
    pub fn add_node(&self, name: impl Into<String>, transport: Arc<dyn NodeTransport>) -> Result<NodeId> {
        self.registry.add_node(NodeHandle::new(name, transport))
    }

    /// Remove a node from the fleet without stopping it
    pub fn remove_node(&self, node_id: &NodeId) -> Result<Arc<NodeHandle>> {
        self.registry.remove_node(node_id)
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Start every node that is still Starting.
    ///
    /// Nodes already Ready or Busy are reported as started. Failures are
    /// collected in the report rather than returned.
    pub async fn start_all_nodes(&self) -> StartReport {
        let mut report = StartReport::default();
        let mut pending = Vec::new();

        for handle in self.registry.handles() {
            match handle.state() {
                NodeState::Starting => pending.push(handle),
                NodeState::Ready | NodeState::Busy => report.started.push(handle.id()),
                state => report
                    .failed
                    .push((handle.id(), format!("node is {}; restart it first", state))),
            }
        }

        info!(nodes = pending.len(), "Starting fleet");

        let timeout = self.config.startup_timeout();
        let outcomes = fan_out(pending, move |handle| async move { handle.start(timeout).await }).await;

        for (node_id, outcome) in outcomes {
            match outcome {
                Ok(()) => report.started.push(node_id),
                Err(e) => {
                    warn!(node_id = %node_id, error = %e, "Node failed to start");
                    report.failed.push((node_id, e.to_string()));
                }
            }
        }

        report.started = self.in_registry_order(&report.started);
        info!(
            started = report.started.len(),
            failed = report.failed.len(),
            "Fleet start complete"
        );
        report
    }

    /// Stop every node, best effort. Individual failures are logged and
    /// collected; the call itself never fails.
    pub async fn stop_all_nodes(&self) -> StopReport {
        let handles = self.registry.handles();
        info!(nodes = handles.len(), "Stopping fleet");

        let timeout = self.config.startup_timeout();
        let outcomes = fan_out(handles, move |handle| async move {
            match tokio::time::timeout(timeout, handle.stop()).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    handle.mark_failed("stop timed out");
                    Err(FleetError::Timeout(timeout.as_millis() as u64))
                }
            }
        })
        .await;

        let mut report = StopReport::default();
        for (node_id, outcome) in outcomes {
            match outcome {
                Ok(()) => report.stopped.push(node_id),
                Err(e) => {
                    warn!(node_id = %node_id, error = %e, "Node failed to stop");
                    report.failed.push((node_id, e.to_string()));
                }
            }
        }

        info!(
            stopped = report.stopped.len(),
            failed = report.failed.len(),
            "Fleet stop complete"
        );
        report
    }

    /// Restart a Failed or Stopped node and connect it again
    pub async fn restart_node(&self, node_id: &NodeId) -> Result<()> {
        let handle = self
            .registry
            .get(node_id)
            .ok_or(FleetError::UnknownNode(*node_id))?;
        handle.restart()?;
        handle.start(self.config.startup_timeout()).await
    }

    /// Ping every Ready node. Nodes that miss the ping become Failed.
    pub async fn heartbeat_all_nodes(&self) -> HeartbeatReport {
        let timeout = self.config.heartbeat_timeout();
        let outcomes = fan_out(self.registry.list_ready(), move |handle| async move {
            handle.ping(timeout).await
        })
        .await;

        let mut report = HeartbeatReport::default();
        for (node_id, outcome) in outcomes {
            match outcome {
                Ok(()) => report.alive.push(node_id),
                Err(e) => report.lost.push((node_id, e.to_string())),
            }
        }

        debug!(alive = report.alive.len(), lost = report.lost.len(), "Heartbeat round complete");
        report
    }

    /// Run `task` on every Ready node and judge the outcome.
    ///
    /// Nodes whose result is a failure or timeout are retried, up to the
    /// task's retry count, as long as they are still Ready. Nodes that
    /// already succeeded are never re-run. Only [`FleetError::NoEligibleNodes`]
    /// surfaces as an error; per-node problems land in the report.
    pub async fn coordinate_task(&self, task: &Task) -> Result<AggregateReport> {
        enter(task, Phase::Selecting);
        let nodes = self.registry.list_ready();
        if nodes.is_empty() {
            warn!(task_id = %task.id, "No eligible nodes for task");
            return Err(FleetError::NoEligibleNodes);
        }

        let max_retries = task.effective_retries(self.config.max_retries);
        info!(
            task_id = %task.id,
            task_name = %task.name,
            nodes = nodes.len(),
            policy = %task.policy,
            max_retries,
            "Coordinating task"
        );

        enter(task, Phase::Dispatching { round: 0 });
        let mut results = self.dispatcher.dispatch(task, &nodes).await?;
        let mut attempts = 1;

        for round in 1..=max_retries {
            enter(task, Phase::Aggregating { round: round - 1 });

            // Indices into `nodes`; `results` is aligned with it
            let retry: Vec<usize> = results
                .iter()
                .enumerate()
                .filter(|(index, (_, result))| !result.is_success() && nodes[*index].is_ready())
                .map(|(index, _)| index)
                .collect();

            if retry.is_empty() {
                debug!(task_id = %task.id, "Nothing left to retry");
                break;
            }

            enter(task, Phase::Retrying { round });
            let delay = self.config.retry_delay(round);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let targets: Vec<Arc<NodeHandle>> = retry.iter().map(|&index| Arc::clone(&nodes[index])).collect();
            info!(task_id = %task.id, round, nodes = targets.len(), "Retrying failed nodes");

            enter(task, Phase::Dispatching { round });
            let retried = self.dispatcher.dispatch(task, &targets).await?;
            for (index, (_, result)) in retry.into_iter().zip(retried) {
                results[index].1 = result;
            }
            attempts += 1;
        }

        enter(task, Phase::Done);
        let report = AggregateReport::new(task.id, results, task.policy, attempts);
        info!(
            task_id = %task.id,
            verdict = %report.verdict,
            succeeded = report.success_count(),
            failed = report.failed_nodes().len(),
            attempts = report.attempts,
            "Task coordinated"
        );
        Ok(report)
    }

    fn in_registry_order(&self, ids: &[NodeId]) -> Vec<NodeId> {
        self.registry
            .handles()
            .iter()
            .map(|handle| handle.id())
            .filter(|id| ids.contains(id))
            .collect()
    }
}

fn enter(task: &Task, phase: Phase) {
    debug!(task_id = %task.id, phase = %phase, "Coordination phase");
}

/// Run `op` on every handle concurrently, returning outcomes in handle order
async fn fan_out<F, Fut>(handles: Vec<Arc<NodeHandle>>, op: F) -> Vec<(NodeId, Result<()>)>
where
    F: Fn(Arc<NodeHandle>) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let ids: Vec<NodeId> = handles.iter().map(|handle| handle.id()).collect();
    let running = handles.into_iter().map(|handle| tokio::spawn(op(handle)));
    let joined = join_all(running).await;

    ids.into_iter()
        .zip(joined)
        .map(|(id, outcome)| {
            let outcome = outcome
                .unwrap_or_else(|e| Err(FleetError::Internal(format!("node task aborted: {}", e))));
            (id, outcome)
        })
        .collect()
}
