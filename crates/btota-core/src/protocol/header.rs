//! Command header: the fixed 5-byte prefix of every command.

use byteorder::{ByteOrder, LittleEndian};

use super::constants::{SERVICE_ID_OTA, TLV_TYPE_MAIN};
use super::opcode::Opcode;
use crate::error::ProtocolViolation;
use crate::transport::{ByteSource, TransportError};

/// Command header (5 bytes, packed, little-endian length).
///
/// ```text
/// +--------+--------+------------+---------------+
/// | svc_id | opcode | param_kind | param_len LE  |
/// +--------+--------+------------+---------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub service_id: u8,
    /// Raw opcode; see [`CommandHeader::validate`].
    pub opcode: u8,
    pub param_kind: u8,
    pub param_len: u16,
}

impl CommandHeader {
    pub const SIZE: usize = 5;

    /// Header for an OTA-service command.
    pub fn new(opcode: Opcode, param_len: u16) -> Self {
        Self {
            service_id: SERVICE_ID_OTA,
            opcode: opcode.as_u8(),
            param_kind: TLV_TYPE_MAIN,
            param_len,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.service_id;
        buf[1] = self.opcode;
        buf[2] = self.param_kind;
        LittleEndian::write_u16(&mut buf[3..5], self.param_len);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolViolation> {
        if data.len() < Self::SIZE {
            return Err(ProtocolViolation::TruncatedFrame {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        Ok(Self {
            service_id: data[0],
            opcode: data[1],
            param_kind: data[2],
            param_len: LittleEndian::read_u16(&data[3..5]),
        })
    }

    /// Read a header off the stream.
    pub fn decode<S: ByteSource + ?Sized>(source: &mut S) -> Result<Self, TransportError> {
        let mut buf = [0u8; Self::SIZE];
        source.read_exact(&mut buf)?;
        Ok(Self {
            service_id: buf[0],
            opcode: buf[1],
            param_kind: buf[2],
            param_len: LittleEndian::read_u16(&buf[3..5]),
        })
    }

    /// Check the service id and parameter kind, and resolve the opcode.
    pub fn validate(&self) -> Result<Opcode, ProtocolViolation> {
        if self.service_id != SERVICE_ID_OTA {
            return Err(ProtocolViolation::InvalidServiceId(self.service_id));
        }
        if self.param_kind != TLV_TYPE_MAIN {
            return Err(ProtocolViolation::InvalidParamKind(self.param_kind));
        }
        Opcode::from_u8(self.opcode).ok_or(ProtocolViolation::UnknownOpcode(self.opcode))
    }
}
