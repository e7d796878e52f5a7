//! Protocol module - OTA service wire definitions.

pub mod checksum;
pub mod constants;
pub mod header;
pub mod message;
pub mod opcode;
pub mod tlv;

pub use checksum::{Crc32Accumulator, crc32};
pub use constants::*;
pub use header::CommandHeader;
pub use message::{DeviceMessage, HostCommand};
pub use opcode::Opcode;
pub use tlv::{ParamReader, TlvHeader, TlvValue};
