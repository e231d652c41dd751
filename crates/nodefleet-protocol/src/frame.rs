//! Frame layout.
//!
//! ```text
//! magic | version | direction | sequence | length | payload | crc32
//! "NFLT"   u8        u8          u64 BE     u32 BE   bincode   u32 BE
//! ```
//!
//! The checksum covers everything after the magic up to the checksum
//! itself. A decoder only accepts frames travelling in the direction it
//! reads, so a worker can never mistake a response for a request.

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use nodefleet_core::{FleetError, Result, WireError};

pub const MAGIC: [u8; 4] = *b"NFLT";

pub const PROTOCOL_VERSION: u8 = 1;

/// Largest payload a frame may carry (16 MiB)
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = MAGIC.len() + 1 + 1 + 8 + 4;
const CHECKSUM_LEN: usize = 4;

/// Which way a frame travels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    /// Orchestrator to worker
    Request = b'>',
    /// Worker to orchestrator
    Response = b'<',
}

impl Direction {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'>' => Some(Direction::Request),
            b'<' => Some(Direction::Response),
            _ => None,
        }
    }
}

/// A message type that owns one direction of the wire
pub trait WireMessage: Serialize + DeserializeOwned {
    const DIRECTION: Direction;
}

/// A message plus the sequence number pairing a response with its request
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub seq: u64,
    pub body: T,
}

impl<T> Envelope<T> {
    pub fn new(seq: u64, body: T) -> Self {
        Self { seq, body }
    }
}

/// Append one frame carrying `envelope` to `dst`.
///
/// On error `dst` is left as it was.
pub fn encode<T: WireMessage>(envelope: &Envelope<T>, dst: &mut BytesMut) -> Result<()> {
    let size = bincode::serialized_size(&envelope.body)
        .map_err(|e| FleetError::Serialization(e.to_string()))? as usize;
    if size > MAX_PAYLOAD {
        return Err(FleetError::Serialization(format!(
            "{size}-byte payload over the {MAX_PAYLOAD}-byte limit"
        )));
    }

    dst.reserve(HEADER_LEN + size + CHECKSUM_LEN);
    let start = dst.len();

    dst.put_slice(&MAGIC);
    dst.put_u8(PROTOCOL_VERSION);
    dst.put_u8(T::DIRECTION as u8);
    dst.put_u64(envelope.seq);
    dst.put_u32(size as u32);
    if let Err(e) = bincode::serialize_into((&mut *dst).writer(), &envelope.body) {
        dst.truncate(start);
        return Err(FleetError::Serialization(e.to_string()));
    }

    let checksum = crc32fast::hash(&dst[start + MAGIC.len()..]);
    dst.put_u32(checksum);
    Ok(())
}

/// Take one frame off the front of `src`.
///
/// Returns `Ok(None)` until the whole frame is buffered. The header is
/// validated as soon as it arrives, so garbage is rejected without waiting
/// for a payload that may never come.
pub fn decode<T: WireMessage>(src: &mut BytesMut) -> Result<Option<Envelope<T>>> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }

    if src[..MAGIC.len()] != MAGIC {
        return Err(WireError::InvalidMagic([src[0], src[1], src[2], src[3]]).into());
    }
    if src[4] != PROTOCOL_VERSION {
        return Err(WireError::UnsupportedVersion(src[4]).into());
    }
    match Direction::from_byte(src[5]) {
        None => return Err(WireError::UnknownFrameKind(src[5]).into()),
        Some(direction) if direction != T::DIRECTION => {
            return Err(WireError::UnexpectedMessage(format!(
                "{:?} frame where a {:?} was expected",
                direction,
                T::DIRECTION
            ))
            .into());
        }
        Some(_) => {}
    }

    let mut fields = &src[6..HEADER_LEN];
    let seq = fields.get_u64();
    let length = fields.get_u32() as usize;
    if length > MAX_PAYLOAD {
        return Err(WireError::FrameTooLarge {
            size: length,
            max: MAX_PAYLOAD,
        }
        .into());
    }

    let total = HEADER_LEN + length + CHECKSUM_LEN;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    let frame = src.split_to(total);
    let (covered, mut trailer) = frame.split_at(HEADER_LEN + length);
    let actual = trailer.get_u32();
    let expected = crc32fast::hash(&covered[MAGIC.len()..]);
    if actual != expected {
        return Err(WireError::ChecksumMismatch { expected, actual }.into());
    }

    let body = bincode::deserialize(&covered[HEADER_LEN..])
        .map_err(|e| WireError::Deserialization(e.to_string()))?;
    Ok(Some(Envelope { seq, body }))
}
