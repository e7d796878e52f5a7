//! Link kinds and unit-size selection.

use std::fmt;
use std::str::FromStr;

use crate::protocol::constants::{
    BLE_MIN_USABLE_MTU, BLE_MTU_OVERHEAD, OTA_UNIT_BLE_SIZE, OTA_UNIT_GATT_SIZE,
    OTA_UNIT_RFCOMM_SIZE, OTA_UNIT_SIZE,
};

/// Kind of link carrying the OTA stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionKind {
    /// No link.
    #[default]
    None,
    /// Serial port profile over RFCOMM.
    Spp,
    /// GATT carried on the classic (BR/EDR) radio.
    GattOverBr,
    /// Bluetooth Low Energy GATT.
    Ble,
    /// Any other stream.
    Other,
}

impl ConnectionKind {
    pub fn is_connected(&self) -> bool {
        !matches!(self, ConnectionKind::None)
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKind::None => write!(f, "none"),
            ConnectionKind::Spp => write!(f, "spp"),
            ConnectionKind::GattOverBr => write!(f, "gatt-over-br"),
            ConnectionKind::Ble => write!(f, "ble"),
            ConnectionKind::Other => write!(f, "other"),
        }
    }
}

impl FromStr for ConnectionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(ConnectionKind::None),
            "spp" => Ok(ConnectionKind::Spp),
            "gatt-over-br" | "gatt" => Ok(ConnectionKind::GattOverBr),
            "ble" => Ok(ConnectionKind::Ble),
            "other" => Ok(ConnectionKind::Other),
            other => Err(format!("unknown connection type: {other}")),
        }
    }
}

/// Notification from the link layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Link came up. `mtu` is only meaningful for BLE.
    Connected { kind: ConnectionKind, mtu: u16 },
    /// Link went down.
    Disconnected,
}

/// Unit size to negotiate for a link.
///
/// BLE uses `mtu - 15` while the MTU is within `[100, 230]` and falls back
/// to 230 otherwise.
pub fn unit_size_for(kind: ConnectionKind, mtu: u16) -> u16 {
    match kind {
        ConnectionKind::Spp => OTA_UNIT_RFCOMM_SIZE,
        ConnectionKind::GattOverBr => OTA_UNIT_GATT_SIZE,
        ConnectionKind::Ble => {
            if !(BLE_MIN_USABLE_MTU..=OTA_UNIT_BLE_SIZE).contains(&mtu) {
                OTA_UNIT_BLE_SIZE
            } else {
                mtu - BLE_MTU_OVERHEAD
            }
        }
        ConnectionKind::Other | ConnectionKind::None => OTA_UNIT_SIZE,
    }
}
