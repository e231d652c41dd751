//! `tokio_util` codec over the frame layer.
//!
//! The codec is typed by direction: the orchestrator end reads responses
//! and writes requests, a worker end does the opposite.

use bytes::BytesMut;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use nodefleet_core::{FleetError, Result};

use crate::frame::{self, Envelope, WireMessage};
use crate::messages::{Request, Response};

/// Reads `In` envelopes and writes `Out` envelopes
pub struct FleetCodec<In, Out> {
    _direction: PhantomData<fn(Out) -> In>,
}

/// Codec for the orchestrator end of a connection
pub type OrchestratorCodec = FleetCodec<Response, Request>;

/// Codec for the worker end of a connection
pub type WorkerCodec = FleetCodec<Request, Response>;

impl<In, Out> FleetCodec<In, Out> {
    pub fn new() -> Self {
        Self {
            _direction: PhantomData,
        }
    }
}

impl<In, Out> Default for FleetCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In: WireMessage, Out> Decoder for FleetCodec<In, Out> {
    type Item = Envelope<In>;
    type Error = FleetError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope<In>>> {
        let decoded = frame::decode::<In>(src);
        match &decoded {
            Ok(Some(envelope)) => trace!(seq = envelope.seq, buffered = src.len(), "Decoded frame"),
            Err(e) => warn!(error = %e, "Frame decode error"),
            Ok(None) => {}
        }
        decoded
    }
}

impl<In, Out: WireMessage> Encoder<Envelope<Out>> for FleetCodec<In, Out> {
    type Error = FleetError;

    fn encode(&mut self, item: Envelope<Out>, dst: &mut BytesMut) -> Result<()> {
        trace!(seq = item.seq, "Encoding frame");
        frame::encode(&item, dst)
    }
}
