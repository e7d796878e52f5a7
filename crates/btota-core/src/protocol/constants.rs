//! Protocol constants for the OTA service.
//!
//! All multi-byte values on the wire are little-endian.

// ============================================================================
// Service framing
// ============================================================================

/// Service id carried in every command header.
pub const SERVICE_ID_OTA: u8 = 0x09;

/// Parameter kind carried in every command header ("main" TLV block).
pub const TLV_TYPE_MAIN: u8 = 0x80;

/// Largest value a single TLV may carry.
pub const TLV_MAX_DATA_LENGTH: u16 = 0x3FFF;

/// Size of a TLV header (type + length).
pub const TLV_HEAD_SIZE: usize = 3;

// ============================================================================
// Common TLV types
// ============================================================================

/// Error code TLV, sent in the upgrade reply.
pub const TLV_TYPE_ERROR_CODE: u8 = 0x7F;

/// Feature bitmap TLV, exchanged in the upgrade request/reply.
pub const TLV_TYPE_SUPPORT_FEATURES: u8 = 0x09;

/// Success value of the error code TLV.
pub const OTA_ERROR_CODE_SUCCESS: u32 = 100_000;

/// Feature bit: each data unit carries a CRC32 of its payload.
pub const FEATURE_UNIT_DATA_CRC: u8 = 1 << 0;

// Upgrade reply
pub const TLV_UPGRADE_BATTERY_THRESHOLD: u8 = 0x04;

// Connect negotiation reply
pub const TLV_NEGO_APP_WAIT_TIMEOUT: u8 = 0x01;
pub const TLV_NEGO_DEVICE_RESTART_TIMEOUT: u8 = 0x02;
pub const TLV_NEGO_UNIT_SIZE: u8 = 0x03;
pub const TLV_NEGO_INTERVAL: u8 = 0x04;
pub const TLV_NEGO_ACK_ENABLE: u8 = 0x05;

// Negotiation result
pub const TLV_NEGO_RESULT: u8 = 0x01;

// Require image data
pub const TLV_REQUIRE_OFFSET: u8 = 0x01;
pub const TLV_REQUIRE_LENGTH: u8 = 0x02;
pub const TLV_REQUIRE_READ_MASK: u8 = 0x03;

// Validate image
pub const TLV_VALIDATE_FLAG: u8 = 0x01;

// ============================================================================
// Image data
// ============================================================================

/// PSN value meaning "no chunk accepted yet"; the first chunk carries 0.
pub const PSN_NONE: u8 = 0xFF;

/// Bytes preceding the payload of a send-image-data command.
pub const DATA_PSN_SIZE: usize = 1;

/// Extra bytes preceding the payload of the CRC variant.
pub const DATA_CRC_SIZE: usize = 4;

// ============================================================================
// Unit sizes
// ============================================================================

/// Unit size used when the connection kind is unknown.
pub const OTA_UNIT_SIZE: u16 = 0x100;

/// Unit size over SPP (RFCOMM).
pub const OTA_UNIT_RFCOMM_SIZE: u16 = 650;

/// Unit size over GATT carried on the classic radio.
pub const OTA_UNIT_GATT_SIZE: u16 = 502;

/// Upper unit size over BLE, also the fallback for out-of-range MTUs.
pub const OTA_UNIT_BLE_SIZE: u16 = 230;

/// Smallest BLE MTU that is used as-is.
pub const BLE_MIN_USABLE_MTU: u16 = 100;

/// ATT and service overhead subtracted from a BLE MTU.
pub const BLE_MTU_OVERHEAD: u16 = 15;

/// Units a BLE peer may have in flight per request.
pub const BLE_MAX_UNITS_PER_REQUEST: u32 = 60;

// ============================================================================
// Session defaults
// ============================================================================

/// Default capacity of the transmit scratch buffer.
pub const SEND_BUFFER_SIZE: usize = 0x80;

pub const DEFAULT_BATTERY_THRESHOLD: u8 = 30;
pub const DEFAULT_APP_WAIT_TIMEOUT: u16 = 3;
pub const DEFAULT_DEVICE_RESTART_TIMEOUT: u16 = 5;

/// Base of the drain window in milliseconds.
pub const DRAIN_BASE_MS: u64 = 500;

/// Remaining bytes per additional millisecond of drain window.
pub const DRAIN_BYTES_PER_MS: u64 = 50;

/// Poll interval of the drain loop.
pub const DRAIN_POLL_MS: u64 = 20;
