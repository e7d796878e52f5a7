//! Event system for the driving application.
//!
//! The session reports link changes, negotiation and progress as explicit
//! `OtaEvent` messages instead of raw callbacks.

use std::sync::Mutex;
use std::sync::mpsc::Sender;

use crate::transport::ConnectionKind;

/// Events emitted by the OTA session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaEvent {
    /// Link came up or went down.
    LinkChanged {
        connected: bool,
        kind: ConnectionKind,
        unit_size: u16,
    },
    /// Handshake finished.
    Negotiated { unit_size: u16, unit_crc: bool },
    /// A pull was issued to the host.
    PullStarted { offset: u32, len: u32 },
    /// Progress reported by the orchestrator.
    Progress { percent: u8 },
    /// Stale data drained, pull resumed from `offset`.
    Recovery { offset: u32, remaining: u32 },
    /// Image validity sent to the host.
    ImageValidated { valid: bool },
}

/// Observer trait for receiving OTA events.
pub trait OtaObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &OtaEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl OtaObserver for NullObserver {
    fn on_event(&self, _event: &OtaEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl OtaObserver for TracingObserver {
    fn on_event(&self, event: &OtaEvent) {
        match event {
            OtaEvent::LinkChanged {
                connected,
                kind,
                unit_size,
            } => {
                if *connected {
                    tracing::info!(kind = %kind, unit_size, "Link connected");
                } else {
                    tracing::warn!("Link disconnected");
                }
            }
            OtaEvent::Negotiated {
                unit_size,
                unit_crc,
            } => {
                tracing::info!(unit_size, unit_crc, "Negotiation complete");
            }
            OtaEvent::PullStarted { offset, len } => {
                tracing::debug!(offset = %format!("0x{:X}", offset), len, "Pull started");
            }
            OtaEvent::Progress { percent } => {
                tracing::info!(progress = %format!("{}%", percent), "Progress");
            }
            OtaEvent::Recovery { offset, remaining } => {
                tracing::warn!(offset = %format!("0x{:X}", offset), remaining, "Resuming pull");
            }
            OtaEvent::ImageValidated { valid } => {
                tracing::info!(valid, "Image validity reported");
            }
        }
    }
}

/// Observer that forwards events over a channel.
pub struct ChannelObserver {
    sender: Mutex<Sender<OtaEvent>>,
}

impl ChannelObserver {
    pub fn new(sender: Sender<OtaEvent>) -> Self {
        Self {
            sender: Mutex::new(sender),
        }
    }
}

impl OtaObserver for ChannelObserver {
    fn on_event(&self, event: &OtaEvent) {
        if let Ok(sender) = self.sender.lock() {
            // Receiver gone means nobody is listening any more.
            let _ = sender.send(event.clone());
        }
    }
}
