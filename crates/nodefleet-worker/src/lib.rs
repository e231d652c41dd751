//! # NodeFleet Worker
//!
//! A worker node: listens for an orchestrator, answers its handshake and
//! heartbeats, and executes the tasks it is assigned.

pub mod executor;
pub mod server;

pub use executor::TaskExecutor;
pub use server::WorkerServer;
