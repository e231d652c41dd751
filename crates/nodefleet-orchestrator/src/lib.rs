//! # NodeFleet Orchestrator
//!
//! Manages a fleet of worker nodes and runs tasks across them.
//!
//! This crate provides:
//! - [`NodeTransport`], the capability every node variant implements
//! - [`TcpTransport`] for workers reached over the NodeFleet wire protocol
//! - [`NodeRegistry`] owning the fleet's [`NodeHandle`]s
//! - [`TaskDispatcher`] for concurrent fan-out with per-node timeouts
//! - [`Orchestrator`], the public entry point tying them together

pub mod dispatcher;
pub mod handle;
pub mod orchestrator;
pub mod registry;
pub mod tcp;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use dispatcher::TaskDispatcher;
pub use handle::NodeHandle;
pub use orchestrator::{HeartbeatReport, Orchestrator, StartReport, StopReport};
pub use registry::{FleetSummary, NodeRegistry, RegistryEvent};
pub use tcp::TcpTransport;
pub use transport::NodeTransport;
