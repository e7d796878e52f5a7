//! Runtime state of the OTA protocol engine.

use std::fmt;

use crate::protocol::constants::{FEATURE_UNIT_DATA_CRC, OTA_UNIT_SIZE, PSN_NONE};
use crate::transport::ConnectionKind;

/// Phase of the command framer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Ready to receive a new header.
    #[default]
    Idle,
    /// A handler is running; a new command may not start.
    AwaitingResponse,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "IDLE"),
            Phase::AwaitingResponse => write!(f, "AWAITING_RESPONSE"),
        }
    }
}

/// Handshake progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NegotiationState {
    /// Negotiation-result received.
    pub done: bool,
    /// Feature bitmap from the last upgrade request.
    pub host_features: u8,
    /// Feature bitmap the device answered with (0 if it sent none).
    pub device_features: u8,
}

impl NegotiationState {
    /// Both sides agreed on per-unit CRC.
    pub fn unit_crc(&self) -> bool {
        self.host_features & self.device_features & FEATURE_UNIT_DATA_CRC != 0
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// In-flight pull state for one logical read.
///
/// `written` counts bytes placed in the destination since the read began and
/// survives resumes; `acked` and `last_psn` belong to the current pull only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Image offset of the logical read.
    pub base_offset: u32,
    /// Length of the logical read.
    pub total_len: u32,
    /// Bytes written into the destination so far.
    pub written: u32,
    /// Image offset of the current pull.
    pub pull_offset: u32,
    /// Length requested by the current pull.
    pub pull_len: u32,
    /// Bytes acknowledged within the current pull.
    pub acked: u32,
    /// Last accepted PSN of the current pull.
    pub last_psn: u8,
}

impl TransferRequest {
    pub fn new(offset: u32, len: u32) -> Self {
        Self {
            base_offset: offset,
            total_len: len,
            written: 0,
            pull_offset: offset,
            pull_len: len,
            acked: 0,
            last_psn: PSN_NONE,
        }
    }

    /// Start a (re)pull of the not-yet-written range. Returns `(offset, len)`.
    pub fn begin_pull(&mut self) -> (u32, u32) {
        self.pull_offset = self.resume_offset();
        self.pull_len = self.remaining();
        self.acked = 0;
        self.last_psn = PSN_NONE;
        (self.pull_offset, self.pull_len)
    }

    /// PSN the next unit must carry.
    pub fn expected_psn(&self) -> u8 {
        self.last_psn.wrapping_add(1)
    }

    /// Bytes of the logical read not yet written.
    pub fn remaining(&self) -> u32 {
        self.total_len - self.written
    }

    /// Bytes still expected by the current pull.
    pub fn pull_remaining(&self) -> u32 {
        self.pull_len - self.acked
    }

    /// Image offset a resume starts from.
    pub fn resume_offset(&self) -> u32 {
        self.base_offset + self.written
    }

    /// Record an accepted unit.
    pub fn accept(&mut self, psn: u8, len: u32) {
        self.written += len;
        self.acked += len;
        self.last_psn = psn;
    }

    pub fn is_complete(&self) -> bool {
        self.written >= self.total_len
    }
}

/// All mutable state of one session.
#[derive(Debug)]
pub struct SessionState {
    pub phase: Phase,
    pub connection: ConnectionKind,
    /// Bytes per unit, fixed once negotiated.
    pub unit_size: u16,
    pub negotiation: NegotiationState,
    pub transfer: Option<TransferRequest>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            connection: ConnectionKind::None,
            unit_size: OTA_UNIT_SIZE,
            negotiation: NegotiationState::default(),
            transfer: None,
        }
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transition the framer.
    pub fn goto_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            tracing::trace!(from = %self.phase, to = %phase, "Framer transition");
        }
        self.phase = phase;
    }
}
