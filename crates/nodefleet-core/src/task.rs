//! Task definitions, per-node outcomes and aggregate reports.
//!
//! A [`Task`] is sent to every eligible node. Each node yields a
//! [`TaskResult`]; the results of one coordination call are collected into
//! an [`AggregateReport`] whose verdict comes from the task's
//! [`SuccessPolicy`].

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::node::NodeId;

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a new random task ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from a UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Task payload - the work a node is asked to do.
///
/// The orchestrator never looks inside; only workers interpret it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskPayload {
    /// Shell command to execute
    Command { command: String, args: Vec<String> },

    /// Arithmetic expression to evaluate
    Compute { expression: String },

    /// Raw data to process with a named function
    Data { function: String, data: Vec<u8> },
}

/// How many nodes must succeed for the task as a whole to succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SuccessPolicy {
    /// Every dispatched node must succeed
    #[default]
    All,
    /// Strictly more than half of the dispatched nodes must succeed
    Majority,
    /// At least this many nodes must succeed
    AtLeast(usize),
}

impl SuccessPolicy {
    /// Derive a verdict from the number of successes out of `total` nodes
    pub fn evaluate(&self, successes: usize, total: usize) -> Verdict {
        if total == 0 {
            return Verdict::Failure;
        }

        let ok = match self {
            SuccessPolicy::All => successes == total,
            SuccessPolicy::Majority => successes * 2 > total,
            SuccessPolicy::AtLeast(n) => successes >= *n,
        };

        if ok {
            Verdict::Success
        } else {
            Verdict::Failure
        }
    }
}

impl std::fmt::Display for SuccessPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SuccessPolicy::All => write!(f, "all"),
            SuccessPolicy::Majority => write!(f, "majority"),
            SuccessPolicy::AtLeast(n) => write!(f, "at-least:{}", n),
        }
    }
}

impl std::str::FromStr for SuccessPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(SuccessPolicy::All),
            "majority" => Ok(SuccessPolicy::Majority),
            other => {
                let n = other
                    .strip_prefix("at-least:")
                    .ok_or_else(|| format!("unknown success policy: {}", s))?;
                n.parse::<usize>()
                    .map(SuccessPolicy::AtLeast)
                    .map_err(|e| format!("invalid at-least count '{}': {}", n, e))
            }
        }
    }
}

/// Aggregate judgment over all per-node results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Success,
    Failure,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Success => write!(f, "Success"),
            Verdict::Failure => write!(f, "Failure"),
        }
    }
}

/// A unit of work coordinated across the fleet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier
    pub id: TaskId,

    /// Human-readable task name
    pub name: String,

    /// Task payload
    pub payload: TaskPayload,

    /// Success policy for the verdict
    pub policy: SuccessPolicy,

    /// Per-node timeout in milliseconds (None or 0 = orchestrator default)
    pub timeout_ms: Option<u64>,

    /// Retry rounds for the failure subset (None = orchestrator default)
    pub max_retries: Option<u32>,

    /// When task was created (Unix timestamp)
    pub created_at: i64,
}

impl Task {
    /// Create a task with an arbitrary payload
    pub fn new(name: impl Into<String>, payload: TaskPayload) -> Self {
        Self {
            id: TaskId::new(),
            name: name.into(),
            payload,
            policy: SuccessPolicy::default(),
            timeout_ms: None,
            max_retries: None,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Create a new task with a command payload
    pub fn new_command(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(
            name,
            TaskPayload::Command {
                command: command.into(),
                args: Vec::new(),
            },
        )
    }

    /// Create a new compute task
    pub fn new_compute(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self::new(
            name,
            TaskPayload::Compute {
                expression: expression.into(),
            },
        )
    }

    /// Create a new data processing task
    pub fn new_data(name: impl Into<String>, function: impl Into<String>, data: Vec<u8>) -> Self {
        Self::new(
            name,
            TaskPayload::Data {
                function: function.into(),
                data,
            },
        )
    }

    /// Set the success policy
    pub fn with_policy(mut self, policy: SuccessPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set per-node timeout, saturating at `u64::MAX` milliseconds
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Set max retries
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Per-node timeout, falling back to `default`. Zero counts as unset.
    pub fn effective_timeout(&self, default: Duration) -> Duration {
        self.timeout_ms
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(default)
    }

    /// Retry rounds, falling back to `default`
    pub fn effective_retries(&self, default: u32) -> u32 {
        self.max_retries.unwrap_or(default)
    }
}

/// Raw reply from a node for one task execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReply {
    /// Task that produced this reply
    pub task_id: TaskId,

    /// Whether execution was successful
    pub success: bool,

    /// Output data
    pub data: Vec<u8>,

    /// Error message (if failed)
    pub error: Option<String>,

    /// Execution duration in milliseconds
    pub duration_ms: u64,
}

impl ExecutionReply {
    /// Create a successful reply
    pub fn success(task_id: TaskId, data: Vec<u8>, duration_ms: u64) -> Self {
        Self {
            task_id,
            success: true,
            data,
            error: None,
            duration_ms,
        }
    }

    /// Create a failure reply
    pub fn failure(task_id: TaskId, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            task_id,
            success: false,
            data: Vec::new(),
            error: Some(error.into()),
            duration_ms,
        }
    }

    /// Convert into a per-node outcome
    pub fn into_result(self) -> TaskResult {
        if self.success {
            TaskResult::Success(self.data)
        } else {
            TaskResult::Failure(self.error.unwrap_or_else(|| "task failed".to_string()))
        }
    }
}

/// Per-node outcome of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskResult {
    /// Node completed the task
    Success(Vec<u8>),
    /// Node reported an error or could not run the task
    Failure(String),
    /// Node did not respond within the task timeout
    Timeout,
}

impl TaskResult {
    /// Check if this outcome counts as a success
    pub fn is_success(&self) -> bool {
        matches!(self, TaskResult::Success(_))
    }

    /// Check if this outcome is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskResult::Timeout)
    }
}

impl std::fmt::Display for TaskResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskResult::Success(data) => write!(f, "Success ({} bytes)", data.len()),
            TaskResult::Failure(err) => write!(f, "Failure: {}", err),
            TaskResult::Timeout => write!(f, "Timeout"),
        }
    }
}

/// Outcome of one coordination call across the fleet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateReport {
    /// Task that was coordinated
    pub task_id: TaskId,

    /// Final per-node results, in registry insertion order
    pub results: Vec<(NodeId, TaskResult)>,

    /// Verdict under the task's success policy
    pub verdict: Verdict,

    /// Dispatch rounds performed (1 + retry rounds)
    pub attempts: u32,
}

impl AggregateReport {
    /// Build a report, computing the verdict from `policy`
    pub fn new(
        task_id: TaskId,
        results: Vec<(NodeId, TaskResult)>,
        policy: SuccessPolicy,
        attempts: u32,
    ) -> Self {
        let successes = results.iter().filter(|(_, r)| r.is_success()).count();
        let verdict = policy.evaluate(successes, results.len());
        Self {
            task_id,
            results,
            verdict,
            attempts,
        }
    }

    /// Result for a given node
    pub fn get(&self, node_id: &NodeId) -> Option<&TaskResult> {
        self.results
            .iter()
            .find(|(id, _)| id == node_id)
            .map(|(_, r)| r)
    }

    /// Node ids in report order
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.results.iter().map(|(id, _)| *id).collect()
    }

    /// Nodes whose result is Failure or Timeout
    pub fn failed_nodes(&self) -> Vec<NodeId> {
        self.results
            .iter()
            .filter(|(_, r)| !r.is_success())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_success()).count()
    }

    pub fn timeout_count(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_timeout()).count()
    }

    /// Check if the verdict is Success
    pub fn is_success(&self) -> bool {
        self.verdict == Verdict::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_creation() {
        let task = Task::new_command("test", "echo")
            .with_policy(SuccessPolicy::Majority)
            .with_timeout(Duration::from_millis(250))
            .with_max_retries(2);

        assert_eq!(task.name, "test");
        assert_eq!(task.policy, SuccessPolicy::Majority);
        assert_eq!(task.timeout_ms, Some(250));
        assert_eq!(task.max_retries, Some(2));
    }

    #[test]
    fn test_effective_defaults() {
        let task = Task::new_compute("sum", "1+2");
        assert_eq!(task.effective_timeout(Duration::from_secs(3)), Duration::from_secs(3));
        assert_eq!(task.effective_retries(4), 4);

        let task = task.with_timeout(Duration::from_millis(10)).with_max_retries(0);
        assert_eq!(task.effective_timeout(Duration::from_secs(3)), Duration::from_millis(10));
        assert_eq!(task.effective_retries(4), 0);
    }

    #[test]
    fn test_zero_timeout_uses_default() {
        let task = Task::new_compute("sum", "1+2").with_timeout(Duration::ZERO);
        assert_eq!(task.timeout_ms, Some(0));
        assert_eq!(task.effective_timeout(Duration::from_secs(3)), Duration::from_secs(3));
    }

    #[test]
    fn test_huge_timeout_saturates() {
        let task = Task::new_compute("sum", "1+2").with_timeout(Duration::MAX);
        assert_eq!(task.timeout_ms, Some(u64::MAX));
    }

    #[test]
    fn test_policy_all() {
        assert_eq!(SuccessPolicy::All.evaluate(3, 3), Verdict::Success);
        assert_eq!(SuccessPolicy::All.evaluate(2, 3), Verdict::Failure);
        assert_eq!(SuccessPolicy::All.evaluate(0, 0), Verdict::Failure);
    }

    #[test]
    fn test_policy_majority() {
        assert_eq!(SuccessPolicy::Majority.evaluate(2, 3), Verdict::Success);
        assert_eq!(SuccessPolicy::Majority.evaluate(2, 4), Verdict::Failure);
        assert_eq!(SuccessPolicy::Majority.evaluate(1, 1), Verdict::Success);
    }

    #[test]
    fn test_policy_at_least() {
        assert_eq!(SuccessPolicy::AtLeast(1).evaluate(1, 5), Verdict::Success);
        assert_eq!(SuccessPolicy::AtLeast(3).evaluate(2, 5), Verdict::Failure);
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("all".parse::<SuccessPolicy>(), Ok(SuccessPolicy::All));
        assert_eq!("Majority".parse::<SuccessPolicy>(), Ok(SuccessPolicy::Majority));
        assert_eq!("at-least:2".parse::<SuccessPolicy>(), Ok(SuccessPolicy::AtLeast(2)));
        assert!("some".parse::<SuccessPolicy>().is_err());
        assert!("at-least:x".parse::<SuccessPolicy>().is_err());
    }

    #[test]
    fn test_reply_into_result() {
        let id = TaskId::new();
        assert_eq!(
            ExecutionReply::success(id, b"ok".to_vec(), 3).into_result(),
            TaskResult::Success(b"ok".to_vec())
        );
        assert_eq!(
            ExecutionReply::failure(id, "boom", 3).into_result(),
            TaskResult::Failure("boom".to_string())
        );
    }

    #[test]
    fn test_aggregate_report() {
        let a = NodeId::new();
        let b = NodeId::new();
        let c = NodeId::new();
        let report = AggregateReport::new(
            TaskId::new(),
            vec![
                (a, TaskResult::Success(vec![])),
                (b, TaskResult::Timeout),
                (c, TaskResult::Failure("x".into())),
            ],
            SuccessPolicy::All,
            1,
        );

        assert_eq!(report.verdict, Verdict::Failure);
        assert_eq!(report.node_ids(), vec![a, b, c]);
        assert_eq!(report.failed_nodes(), vec![b, c]);
        assert_eq!(report.success_count(), 1);
        assert_eq!(report.timeout_count(), 1);
        assert_eq!(report.get(&b), Some(&TaskResult::Timeout));
        assert!(report.get(&NodeId::new()).is_none());
    }
}
