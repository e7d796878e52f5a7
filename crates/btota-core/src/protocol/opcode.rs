//! Command opcodes.
//!
//! Request-upgrade and connect-negotiation are shared by the host request
//! and the device reply: the device answers on the opcode it was asked on.

use std::fmt;

/// OTA command opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    RequestUpgrade = 0x01,
    ConnectNegotiation = 0x02,
    RequireImageData = 0x03,
    SendImageData = 0x04,
    ReportReceivedCount = 0x05,
    ValidateImage = 0x06,
    ReportStatus = 0x07,
    CancelUpgrade = 0x08,
    NegotiationResult = 0x09,
    RequestUpgradeAlt = 0x0A,
    SendImageDataWithCrc = 0x0B,
}

impl Opcode {
    pub const ALL: [Opcode; 11] = [
        Opcode::RequestUpgrade,
        Opcode::ConnectNegotiation,
        Opcode::RequireImageData,
        Opcode::SendImageData,
        Opcode::ReportReceivedCount,
        Opcode::ValidateImage,
        Opcode::ReportStatus,
        Opcode::CancelUpgrade,
        Opcode::NegotiationResult,
        Opcode::RequestUpgradeAlt,
        Opcode::SendImageDataWithCrc,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| *op as u8 == value)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Opcodes in the vocabulary that no handler is registered for.
    pub fn is_reserved(self) -> bool {
        matches!(
            self,
            Opcode::ReportReceivedCount
                | Opcode::ReportStatus
                | Opcode::CancelUpgrade
                | Opcode::RequestUpgradeAlt
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::RequestUpgrade => "REQUEST_UPGRADE",
            Opcode::ConnectNegotiation => "CONNECT_NEGOTIATION",
            Opcode::RequireImageData => "REQUIRE_IMAGE_DATA",
            Opcode::SendImageData => "SEND_IMAGE_DATA",
            Opcode::ReportReceivedCount => "REPORT_RECEIVED_COUNT",
            Opcode::ValidateImage => "VALIDATE_IMAGE",
            Opcode::ReportStatus => "REPORT_STATUS",
            Opcode::CancelUpgrade => "CANCEL_UPGRADE",
            Opcode::NegotiationResult => "NEGOTIATION_RESULT",
            Opcode::RequestUpgradeAlt => "REQUEST_UPGRADE_ALT",
            Opcode::SendImageDataWithCrc => "SEND_IMAGE_DATA_WITH_CRC",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:02X})", self.name(), self.as_u8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_values() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::from_u8(op.as_u8()), Some(op));
        }
        assert_eq!(Opcode::from_u8(0x00), None);
        assert_eq!(Opcode::from_u8(0x0C), None);
        assert_eq!(Opcode::SendImageDataWithCrc.as_u8(), 0x0B);
    }

    #[test]
    fn test_reserved_opcodes() {
        let reserved: Vec<u8> = Opcode::ALL
            .iter()
            .filter(|op| op.is_reserved())
            .map(|op| op.as_u8())
            .collect();
        assert_eq!(reserved, vec![0x05, 0x07, 0x08, 0x0A]);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Opcode::NegotiationResult.to_string(),
            "NEGOTIATION_RESULT(0x09)"
        );
    }
}
