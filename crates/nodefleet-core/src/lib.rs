//! # NodeFleet Core
//!
//! Core types for the NodeFleet task-coordination engine.
//!
//! This crate provides shared types used across all NodeFleet components:
//! - Node identity and lifecycle states
//! - Tasks, per-node results and aggregate reports
//! - Orchestrator configuration
//! - Common error types

pub mod config;
pub mod error;
pub mod node;
pub mod task;

pub use config::OrchestratorConfig;
pub use error::{FleetError, Result, WireError};
pub use node::{NodeEvent, NodeId, NodeInfo, NodeState};
pub use task::{
    AggregateReport, ExecutionReply, SuccessPolicy, Task, TaskId, TaskPayload, TaskResult,
    Verdict,
};
