//! BTOTA-Core: device side of the Bluetooth OTA command/data protocol.
//!
//! This crate implements the firmware-update protocol spoken between a host
//! updater and an embedded device over an SPP, BLE or GATT-over-BR/EDR byte
//! stream: the handshake that fixes the unit size, device-initiated pulls of
//! image ranges, PSN/CRC checked data units and one-shot drain-and-resume
//! recovery.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Constants, opcodes, command header, TLV codec, CRC32
//! - **Transport**: Byte-stream abstraction, unit-size mapping (mock, simulated host)
//! - **State**: Command framer, handlers, recovery controller
//! - **Events**: Observer pattern replacing progress callbacks
//! - **Session**: Public open/read/ioctl surface
//!
//! # Example
//!
//! ```no_run
//! use btota_core::session::{OtaSession, SessionConfig};
//! use btota_core::transport::{ConnectionKind, HostSimulator, LinkEvent};
//!
//! let host = HostSimulator::new(std::fs::read("app.bin").unwrap());
//! let mut session = OtaSession::new(host, SessionConfig::default());
//! session.handle_link_event(LinkEvent::Connected {
//!     kind: ConnectionKind::Ble,
//!     mtu: 247,
//! });
//! session.open().expect("negotiation failed");
//!
//! let mut block = vec![0u8; 4096];
//! session.read(0, &mut block).expect("pull failed");
//! ```

pub mod error;
pub mod events;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use error::{OtaError, ProtocolViolation, Result};
pub use events::{ChannelObserver, NullObserver, OtaEvent, OtaObserver, TracingObserver};
pub use protocol::{CommandHeader, DeviceMessage, HostCommand, Opcode};
pub use session::{IoctlCommand, IoctlReply, OtaSession, SessionConfig};
pub use transport::{
    ConnectionKind, Fault, HostSimulator, LinkEvent, MockTransport, OtaTransport, TransportError,
};
