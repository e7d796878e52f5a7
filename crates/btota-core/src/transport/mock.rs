//! Mock transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use super::traits::{OtaTransport, TransportError};
use crate::protocol::{DeviceMessage, HostCommand};

#[derive(Debug, Default)]
struct MockState {
    /// Bytes waiting to be read by the device.
    rx: VecDeque<u8>,
    /// Captured writes, one entry per frame.
    write_log: Vec<Vec<u8>>,
    opened: bool,
    disconnected: bool,
}

/// Mock transport for unit testing protocol logic.
///
/// Clones share the same queues, so a test can keep a handle after moving
/// the transport into a session.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A poisoned lock only means another test thread panicked.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue raw bytes to be returned on later reads.
    pub fn queue_bytes(&self, bytes: &[u8]) {
        self.lock().rx.extend(bytes.iter().copied());
    }

    /// Queue an encoded host command.
    pub fn queue_command(&self, cmd: &HostCommand) {
        if let Ok(frame) = cmd.encode() {
            self.queue_bytes(&frame);
        }
    }

    /// Bytes not yet read by the device.
    pub fn pending(&self) -> usize {
        self.lock().rx.len()
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.lock().write_log.clone()
    }

    /// Captured writes decoded as device frames.
    pub fn sent_messages(&self) -> Vec<DeviceMessage> {
        self.get_writes()
            .iter()
            .filter_map(|frame| DeviceMessage::decode(frame).ok())
            .collect()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.lock().write_log.clear();
    }

    pub fn is_open(&self) -> bool {
        self.lock().opened
    }

    /// Simulate link loss.
    pub fn disconnect(&self) {
        self.lock().disconnected = true;
    }

    /// Simulate link recovery.
    pub fn reconnect(&self) {
        self.lock().disconnected = false;
    }
}

impl OtaTransport for MockTransport {
    fn open(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.disconnected {
            return Err(TransportError::Disconnected);
        }
        state.opened = true;
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        self.lock().opened = false;
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
        if state.rx.is_empty() {
            return Err(TransportError::Timeout { timeout_ms: 5000 });
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
        state.write_log.push(data.to_vec());
        Ok(data.len())
    }

    fn available(&self) -> usize {
        self.lock().rx.len()
    }

    fn is_connected(&self) -> bool {
        !self.lock().disconnected
    }
}
