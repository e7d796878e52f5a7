//! Typed command frames.
//!
//! The same opcode can carry a host request or the device's reply to it.
//! `HostCommand` and `DeviceMessage` give each side its own shape while
//! reusing the wire opcode.

use super::constants::*;
use super::header::CommandHeader;
use super::opcode::Opcode;
use super::tlv::{self, ParamReader, TlvValue};
use crate::error::{OtaError, ProtocolViolation};

/// Assembles a command frame: header first, parameters after.
struct FrameBuilder {
    opcode: Opcode,
    params: Vec<u8>,
}

impl FrameBuilder {
    fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            params: Vec::new(),
        }
    }

    fn tlv(mut self, kind: u8, value: TlvValue<'_>) -> Result<Self, ProtocolViolation> {
        tlv::encode(kind, value, &mut self.params)?;
        Ok(self)
    }

    fn raw(mut self, bytes: &[u8]) -> Self {
        self.params.extend_from_slice(bytes);
        self
    }

    fn finish(self) -> Result<Vec<u8>, ProtocolViolation> {
        let param_len =
            u16::try_from(self.params.len()).map_err(|_| ProtocolViolation::FrameTooLarge {
                size: CommandHeader::SIZE + self.params.len(),
                capacity: CommandHeader::SIZE + u16::MAX as usize,
            })?;
        let header = CommandHeader::new(self.opcode, param_len);
        let mut frame = Vec::with_capacity(CommandHeader::SIZE + self.params.len());
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(&self.params);
        Ok(frame)
    }
}

/// Frames the device sends to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMessage {
    /// Reply to a host upgrade request.
    UpgradeReply {
        error_code: u32,
        battery_threshold: u8,
        /// Present only when the host advertised features.
        device_features: Option<u8>,
    },
    /// Reply to a host connect negotiation.
    NegotiationReply {
        app_wait_timeout: u16,
        device_restart_timeout: u16,
        unit_size: u16,
        interval: u16,
        ack_enable: u8,
    },
    /// Device-initiated pull of an image range.
    RequireImageData { offset: u32, len: u32, read_mask: u8 },
    /// Outcome of the image validity check.
    ValidateImage { valid: bool },
}

impl DeviceMessage {
    pub fn opcode(&self) -> Opcode {
        match self {
            DeviceMessage::UpgradeReply { .. } => Opcode::RequestUpgrade,
            DeviceMessage::NegotiationReply { .. } => Opcode::ConnectNegotiation,
            DeviceMessage::RequireImageData { .. } => Opcode::RequireImageData,
            DeviceMessage::ValidateImage { .. } => Opcode::ValidateImage,
        }
    }

    /// Encode into a frame no larger than `capacity`.
    pub fn encode(&self, capacity: usize) -> Result<Vec<u8>, ProtocolViolation> {
        let frame = match *self {
            DeviceMessage::UpgradeReply {
                error_code,
                battery_threshold,
                device_features,
            } => {
                let mut b = FrameBuilder::new(self.opcode())
                    .tlv(TLV_TYPE_ERROR_CODE, TlvValue::U32(error_code))?
                    .tlv(TLV_UPGRADE_BATTERY_THRESHOLD, TlvValue::U8(battery_threshold))?;
                if let Some(features) = device_features {
                    b = b.tlv(TLV_TYPE_SUPPORT_FEATURES, TlvValue::U8(features))?;
                }
                b.finish()?
            }
            DeviceMessage::NegotiationReply {
                app_wait_timeout,
                device_restart_timeout,
                unit_size,
                interval,
                ack_enable,
            } => FrameBuilder::new(self.opcode())
                .tlv(TLV_NEGO_APP_WAIT_TIMEOUT, TlvValue::U16(app_wait_timeout))?
                .tlv(
                    TLV_NEGO_DEVICE_RESTART_TIMEOUT,
                    TlvValue::U16(device_restart_timeout),
                )?
                .tlv(TLV_NEGO_UNIT_SIZE, TlvValue::U16(unit_size))?
                .tlv(TLV_NEGO_INTERVAL, TlvValue::U16(interval))?
                .tlv(TLV_NEGO_ACK_ENABLE, TlvValue::U8(ack_enable))?
                .finish()?,
            DeviceMessage::RequireImageData {
                offset,
                len,
                read_mask,
            } => FrameBuilder::new(self.opcode())
                .tlv(TLV_REQUIRE_OFFSET, TlvValue::U32(offset))?
                .tlv(TLV_REQUIRE_LENGTH, TlvValue::U32(len))?
                .tlv(TLV_REQUIRE_READ_MASK, TlvValue::U8(read_mask))?
                .finish()?,
            DeviceMessage::ValidateImage { valid } => FrameBuilder::new(self.opcode())
                .tlv(TLV_VALIDATE_FLAG, TlvValue::U8(valid as u8))?
                .finish()?,
        };

        if frame.len() > capacity {
            return Err(ProtocolViolation::FrameTooLarge {
                size: frame.len(),
                capacity,
            });
        }
        Ok(frame)
    }

    /// Decode a complete device frame (host side).
    pub fn decode(frame: &[u8]) -> Result<Self, OtaError> {
        let header = CommandHeader::from_bytes(frame)?;
        let opcode = header.validate()?;
        let mut body = &frame[CommandHeader::SIZE..];
        if body.len() < header.param_len as usize {
            return Err(ProtocolViolation::TruncatedFrame {
                expected: CommandHeader::SIZE + header.param_len as usize,
                actual: frame.len(),
            }
            .into());
        }
        let mut params = ParamReader::new(&mut body, header.param_len);
        let mut fields: Vec<(u8, u32)> = Vec::new();
        while let Some(h) = params.next_header()? {
            let value = params.read_uint(&h, 4)?;
            fields.push((h.kind, value));
        }
        let field = |kind: u8| fields.iter().find(|(k, _)| *k == kind).map(|(_, v)| *v);

        let msg = match opcode {
            Opcode::RequestUpgrade => DeviceMessage::UpgradeReply {
                error_code: field(TLV_TYPE_ERROR_CODE).unwrap_or_default(),
                battery_threshold: field(TLV_UPGRADE_BATTERY_THRESHOLD).unwrap_or_default() as u8,
                device_features: field(TLV_TYPE_SUPPORT_FEATURES).map(|v| v as u8),
            },
            Opcode::ConnectNegotiation => DeviceMessage::NegotiationReply {
                app_wait_timeout: field(TLV_NEGO_APP_WAIT_TIMEOUT).unwrap_or_default() as u16,
                device_restart_timeout: field(TLV_NEGO_DEVICE_RESTART_TIMEOUT)
                    .unwrap_or_default() as u16,
                unit_size: field(TLV_NEGO_UNIT_SIZE).unwrap_or_default() as u16,
                interval: field(TLV_NEGO_INTERVAL).unwrap_or_default() as u16,
                ack_enable: field(TLV_NEGO_ACK_ENABLE).unwrap_or_default() as u8,
            },
            Opcode::RequireImageData => DeviceMessage::RequireImageData {
                offset: field(TLV_REQUIRE_OFFSET).unwrap_or_default(),
                len: field(TLV_REQUIRE_LENGTH).unwrap_or_default(),
                read_mask: field(TLV_REQUIRE_READ_MASK).unwrap_or_default() as u8,
            },
            Opcode::ValidateImage => DeviceMessage::ValidateImage {
                valid: field(TLV_VALIDATE_FLAG).unwrap_or_default() != 0,
            },
            other => return Err(ProtocolViolation::UnexpectedOpcode(other).into()),
        };
        Ok(msg)
    }
}

/// Frames the host sends to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    /// Start an upgrade, optionally advertising host features.
    RequestUpgrade { features: Option<u8> },
    /// Ask for link parameters.
    ConnectNegotiation,
    /// Close the handshake.
    NegotiationResult { result: u8 },
    /// One unit of image data. `crc` selects the checked variant.
    SendImageData {
        psn: u8,
        crc: Option<u32>,
        payload: Vec<u8>,
    },
}

impl HostCommand {
    pub fn opcode(&self) -> Opcode {
        match self {
            HostCommand::RequestUpgrade { .. } => Opcode::RequestUpgrade,
            HostCommand::ConnectNegotiation => Opcode::ConnectNegotiation,
            HostCommand::NegotiationResult { .. } => Opcode::NegotiationResult,
            HostCommand::SendImageData { crc: None, .. } => Opcode::SendImageData,
            HostCommand::SendImageData { crc: Some(_), .. } => Opcode::SendImageDataWithCrc,
        }
    }

    /// Unit of image data with its CRC32 filled in.
    pub fn checked_data(psn: u8, payload: Vec<u8>) -> Self {
        let crc = super::checksum::crc32(&payload);
        HostCommand::SendImageData {
            psn,
            crc: Some(crc),
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolViolation> {
        let b = FrameBuilder::new(self.opcode());
        match self {
            HostCommand::RequestUpgrade { features } => match features {
                Some(f) => b.tlv(TLV_TYPE_SUPPORT_FEATURES, TlvValue::U8(*f))?.finish(),
                None => b.finish(),
            },
            HostCommand::ConnectNegotiation => b.finish(),
            HostCommand::NegotiationResult { result } => {
                b.tlv(TLV_NEGO_RESULT, TlvValue::U8(*result))?.finish()
            }
            HostCommand::SendImageData { psn, crc, payload } => {
                let mut b = b.raw(&[*psn]);
                if let Some(crc) = crc {
                    b = b.raw(&crc.to_le_bytes());
                }
                b.raw(payload).finish()
            }
        }
    }
}
