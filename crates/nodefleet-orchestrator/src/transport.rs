//! Transport capability implemented by every node variant.

use async_trait::async_trait;

use nodefleet_core::{ExecutionReply, Result, Task};

/// How the orchestrator talks to one worker.
///
/// A transport is owned by exactly one [`NodeHandle`](crate::NodeHandle).
/// The handle serializes lifecycle calls, but `send` and `ping` may be
/// called concurrently with each other.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Establish the connection to the worker
    async fn connect(&self) -> Result<()>;

    /// Run one task on the worker and wait for its reply.
    ///
    /// A task-level failure is returned as `Ok` with an unsuccessful
    /// [`ExecutionReply`]; `Err` means the transport itself is broken.
    async fn send(&self, task: &Task) -> Result<ExecutionReply>;

    /// Close the connection
    async fn disconnect(&self) -> Result<()>;

    /// Liveness check
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Peer description for logs
    fn peer(&self) -> String {
        "in-process".to_string()
    }
}
