//! # NodeFleet Protocol
//!
//! Request/response protocol between the orchestrator and its workers.
//! The orchestrator numbers each [`Request`]; the worker answers with a
//! [`Response`] under the same number. See [`frame`] for the byte layout.

pub mod codec;
pub mod frame;
pub mod messages;

pub use codec::{FleetCodec, OrchestratorCodec, WorkerCodec};
pub use frame::{Envelope, MAX_PAYLOAD, PROTOCOL_VERSION};
pub use messages::{ErrorCode, Request, Response};
