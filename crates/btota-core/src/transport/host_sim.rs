//! Simulated update host.
//!
//! Plays the host side of the protocol over an in-memory stream: it drives
//! the handshake, answers every pull with image data, and can inject one-shot
//! faults to exercise recovery.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use super::traits::{OtaTransport, TransportError};
use crate::protocol::constants::{FEATURE_UNIT_DATA_CRC, OTA_UNIT_SIZE};
use crate::protocol::{DeviceMessage, HostCommand};

/// One-shot fault applied to the unit carrying a given PSN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Drop the unit, so the next one arrives out of sequence.
    SkipPsn(u8),
    /// Send the unit with a wrong CRC (only with CRC enabled).
    CorruptCrc(u8),
    /// Re-run negotiation before the unit and abandon the rest of the pull.
    Renegotiate(u8),
}

impl Fault {
    fn psn(&self) -> u8 {
        match *self {
            Fault::SkipPsn(p) | Fault::CorruptCrc(p) | Fault::Renegotiate(p) => p,
        }
    }
}

/// A pull the device issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullRecord {
    pub offset: u32,
    pub len: u32,
}

#[derive(Debug, Default)]
struct HostState {
    image: Vec<u8>,
    host_features: Option<u8>,
    device_features: Option<u8>,
    unit_size: u16,
    faults: Vec<Fault>,
    rx: VecDeque<u8>,
    pulls: Vec<PullRecord>,
    validated: Option<bool>,
    negotiations: usize,
    opened: bool,
    disconnected: bool,
}

impl HostState {
    fn push(&mut self, cmd: &HostCommand) -> Result<(), TransportError> {
        let frame = cmd
            .encode()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        self.rx.extend(frame);
        Ok(())
    }

    fn unit_crc(&self) -> bool {
        let host = self.host_features.unwrap_or(0);
        let device = self.device_features.unwrap_or(0);
        host & device & FEATURE_UNIT_DATA_CRC != 0
    }

    fn take_fault(&mut self, psn: u8) -> Option<Fault> {
        let idx = self.faults.iter().position(|f| f.psn() == psn)?;
        Some(self.faults.remove(idx))
    }

    fn serve_pull(&mut self, offset: u32, len: u32) -> Result<(), TransportError> {
        self.pulls.push(PullRecord { offset, len });

        let start = (offset as usize).min(self.image.len());
        let end = start.saturating_add(len as usize).min(self.image.len());
        let unit = usize::from(if self.unit_size == 0 {
            OTA_UNIT_SIZE
        } else {
            self.unit_size
        });
        let with_crc = self.unit_crc();

        let range = self.image[start..end].to_vec();
        debug!(offset, len, unit, with_crc, "Host serving pull");

        for (idx, chunk) in range.chunks(unit).enumerate() {
            let psn = idx as u8;
            let payload = chunk.to_vec();
            match self.take_fault(psn) {
                Some(Fault::SkipPsn(_)) => {
                    warn!(psn, "Host dropping unit");
                }
                Some(Fault::CorruptCrc(_)) if with_crc => {
                    warn!(psn, "Host corrupting unit CRC");
                    let crc = crate::protocol::crc32(&payload) ^ 0xFFFF_FFFF;
                    self.push(&HostCommand::SendImageData {
                        psn,
                        crc: Some(crc),
                        payload,
                    })?;
                }
                Some(Fault::Renegotiate(_)) => {
                    info!(psn, "Host re-negotiating mid-pull");
                    self.push(&HostCommand::NegotiationResult { result: 1 })?;
                    return Ok(());
                }
                _ => {
                    let cmd = if with_crc {
                        HostCommand::checked_data(psn, payload)
                    } else {
                        HostCommand::SendImageData {
                            psn,
                            crc: None,
                            payload,
                        }
                    };
                    self.push(&cmd)?;
                }
            }
        }
        Ok(())
    }

    fn on_device_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let msg = DeviceMessage::decode(frame)
            .map_err(|e| TransportError::WriteFailed(format!("host rejected frame: {e}")))?;
        match msg {
            DeviceMessage::UpgradeReply {
                device_features, ..
            } => {
                self.device_features = device_features;
                self.push(&HostCommand::ConnectNegotiation)
            }
            DeviceMessage::NegotiationReply { unit_size, .. } => {
                self.unit_size = unit_size;
                self.negotiations += 1;
                self.push(&HostCommand::NegotiationResult { result: 1 })
            }
            DeviceMessage::RequireImageData { offset, len, .. } => self.serve_pull(offset, len),
            DeviceMessage::ValidateImage { valid } => {
                self.validated = Some(valid);
                Ok(())
            }
        }
    }
}

/// In-memory host that serves `image` to the device under test.
#[derive(Debug, Clone)]
pub struct HostSimulator {
    state: Arc<Mutex<HostState>>,
}

impl HostSimulator {
    /// Host advertising per-unit CRC support.
    pub fn new(image: Vec<u8>) -> Self {
        Self {
            state: Arc::new(Mutex::new(HostState {
                image,
                host_features: Some(FEATURE_UNIT_DATA_CRC),
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Features sent in the upgrade request; `None` omits the TLV.
    pub fn with_features(self, features: Option<u8>) -> Self {
        self.lock().host_features = features;
        self
    }

    pub fn with_fault(self, fault: Fault) -> Self {
        self.lock().faults.push(fault);
        self
    }

    /// Every pull the device issued, in order.
    pub fn pulls(&self) -> Vec<PullRecord> {
        self.lock().pulls.clone()
    }

    /// Validity flag reported by the device, if any.
    pub fn validated(&self) -> Option<bool> {
        self.lock().validated
    }

    /// Unit size from the last negotiation reply.
    pub fn unit_size(&self) -> u16 {
        self.lock().unit_size
    }

    /// Feature TLV from the last upgrade reply.
    pub fn device_features(&self) -> Option<u8> {
        self.lock().device_features
    }

    /// Completed connect negotiations.
    pub fn negotiations(&self) -> usize {
        self.lock().negotiations
    }

    /// Faults that have not fired yet.
    pub fn pending_faults(&self) -> Vec<Fault> {
        self.lock().faults.clone()
    }

    pub fn disconnect(&self) {
        self.lock().disconnected = true;
    }
}

impl OtaTransport for HostSimulator {
    fn open(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.disconnected {
            return Err(TransportError::Disconnected);
        }
        state.opened = true;
        state.rx.clear();
        let features = state.host_features;
        info!(?features, "Host requesting upgrade");
        state.push(&HostCommand::RequestUpgrade { features })
    }

    fn close(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.opened = false;
        state.rx.clear();
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut state = self.lock();
        if state.disconnected {
            return Err(TransportError::Disconnected);
        }
        if !state.opened {
            return Err(TransportError::NotOpen);
        }
        let n = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.lock();
        if state.disconnected {
            return Err(TransportError::Disconnected);
        }
        if !state.opened {
            return Err(TransportError::NotOpen);
        }
        state.on_device_frame(data)?;
        Ok(data.len())
    }

    fn available(&self) -> usize {
        self.lock().rx.len()
    }

    fn is_connected(&self) -> bool {
        !self.lock().disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CommandHeader, Opcode, SEND_BUFFER_SIZE};

    fn read_all(host: &HostSimulator) -> Vec<u8> {
        let mut buf = vec![0u8; host.available()];
        let n = host.read(&mut buf).unwrap();
        buf.truncate(n);
        buf
    }

    fn reply(msg: DeviceMessage) -> Vec<u8> {
        msg.encode(SEND_BUFFER_SIZE).unwrap()
    }

    #[test]
    fn test_handshake_sequence() {
        let host = HostSimulator::new(vec![0u8; 16]);
        host.open().unwrap();

        let first = read_all(&host);
        let header = CommandHeader::from_bytes(&first).unwrap();
        assert_eq!(header.validate().unwrap(), Opcode::RequestUpgrade);

        host.write(&reply(DeviceMessage::UpgradeReply {
            error_code: 100_000,
            battery_threshold: 30,
            device_features: Some(FEATURE_UNIT_DATA_CRC),
        }))
        .unwrap();
        let second = read_all(&host);
        assert_eq!(second[1], Opcode::ConnectNegotiation.as_u8());

        host.write(&reply(DeviceMessage::NegotiationReply {
            app_wait_timeout: 3,
            device_restart_timeout: 5,
            unit_size: 8,
            interval: 0,
            ack_enable: 0,
        }))
        .unwrap();
        let third = read_all(&host);
        assert_eq!(third[1], Opcode::NegotiationResult.as_u8());
        assert_eq!(host.unit_size(), 8);
        assert_eq!(host.negotiations(), 1);
    }

    #[test]
    fn test_pull_is_chunked_by_unit_size() {
        let image: Vec<u8> = (0..20u8).collect();
        let host = HostSimulator::new(image).with_features(None);
        host.open().unwrap();
        read_all(&host);
        host.lock().unit_size = 8;

        host.write(&reply(DeviceMessage::RequireImageData {
            offset: 2,
            len: 18,
            read_mask: 0,
        }))
        .unwrap();

        // Three plain units: 8 + 8 + 2 bytes of payload.
        let wire = read_all(&host);
        assert_eq!(wire.len(), 3 * (CommandHeader::SIZE + 1) + 18);
        assert_eq!(wire[1], Opcode::SendImageData.as_u8());
        assert_eq!(wire[5], 0);
        assert_eq!(wire[6], 2);
        assert_eq!(host.pulls(), vec![PullRecord { offset: 2, len: 18 }]);
    }

    #[test]
    fn test_skip_fault_fires_once() {
        let host = HostSimulator::new(vec![0u8; 4])
            .with_features(None)
            .with_fault(Fault::SkipPsn(0));
        host.open().unwrap();
        read_all(&host);

        let pull = reply(DeviceMessage::RequireImageData {
            offset: 0,
            len: 4,
            read_mask: 0,
        });
        host.write(&pull).unwrap();
        assert_eq!(host.available(), 0);
        assert!(host.pending_faults().is_empty());

        host.write(&pull).unwrap();
        assert!(host.available() > 0);
    }
}
