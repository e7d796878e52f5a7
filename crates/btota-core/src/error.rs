//! Error taxonomy for the OTA protocol engine.

use thiserror::Error;

use crate::protocol::Opcode;
use crate::transport::TransportError;

/// Malformed or unexpected traffic on the command stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("Invalid service id: 0x{0:02X}")]
    InvalidServiceId(u8),

    #[error("Invalid parameter kind: 0x{0:02X}")]
    InvalidParamKind(u8),

    #[error("Unknown opcode: 0x{0:02X}")]
    UnknownOpcode(u8),

    #[error("Reserved opcode without handler: {0}")]
    ReservedOpcode(Opcode),

    #[error("Opcode not accepted from host: {0}")]
    UnexpectedOpcode(Opcode),

    #[error("Unexpected TLV type: expected 0x{expected:02X}, got 0x{actual:02X}")]
    UnexpectedTlv { expected: u8, actual: u8 },

    #[error("TLV overruns parameter block: declared {declared}, remaining {remaining}")]
    TlvOverrun { declared: usize, remaining: usize },

    #[error("Unconsumed parameter bytes after payload: {remaining}")]
    TrailingPayload { remaining: usize },

    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    TruncatedFrame { expected: usize, actual: usize },

    #[error("Frame of {size} bytes exceeds send buffer of {capacity}")]
    FrameTooLarge { size: usize, capacity: usize },
}

/// Errors surfaced by the session and its components.
#[derive(Error, Debug)]
pub enum OtaError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("Sequence error: expected psn {expected}, got {actual}")]
    Sequence { expected: u8, actual: u8 },

    #[error("Integrity error on psn {psn}: expected crc 0x{expected:08X}, computed 0x{actual:08X}")]
    Integrity { psn: u8, expected: u32, actual: u32 },

    #[error("Negotiation not complete")]
    NotNegotiated,

    #[error("Command framer busy")]
    Busy,

    #[error("No transfer in progress")]
    NoActiveTransfer,

    #[error("Read offset 0x{requested:X} does not match prepared offset 0x{prepared:X}")]
    OffsetMismatch { prepared: u32, requested: u32 },

    #[error("Buffer too small: need {needed}, got {actual}")]
    BufferTooSmall { needed: usize, actual: usize },

    #[error("Read of {len} bytes exceeds the 32-bit pull length")]
    RequestTooLarge { len: usize },

    #[error("Transfer failed at offset 0x{offset:X} with {remaining} bytes remaining: {source}")]
    TransferFailed {
        offset: u32,
        remaining: u32,
        #[source]
        source: Box<OtaError>,
    },
}

impl OtaError {
    /// Whether a drain-and-resume can bring the stream back in sync.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            OtaError::Sequence { .. } | OtaError::Integrity { .. } | OtaError::Protocol(_)
        )
    }
}

pub type Result<T, E = OtaError> = std::result::Result<T, E>;
