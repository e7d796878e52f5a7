//! OTA Session - public surface driven by the update orchestrator.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{OtaError, Result};
use crate::events::{OtaEvent, OtaObserver, TracingObserver};
use crate::protocol::constants::{
    BLE_MAX_UNITS_PER_REQUEST, DEFAULT_APP_WAIT_TIMEOUT, DEFAULT_BATTERY_THRESHOLD,
    DEFAULT_DEVICE_RESTART_TIMEOUT, DRAIN_BASE_MS, DRAIN_POLL_MS, OTA_UNIT_BLE_SIZE,
    SEND_BUFFER_SIZE,
};
use crate::protocol::{DeviceMessage, Opcode};
use crate::state::handlers::{self, HandlerContext};
use crate::state::machine::{Phase, SessionState, TransferRequest};
use crate::state::recovery::{drain_stale_input, drain_window};
use crate::transport::{ConnectionKind, LinkEvent, OtaTransport, unit_size_for};

/// Configuration for an OTA session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Capacity of the transmit scratch buffer.
    pub send_buffer_size: usize,
    /// Advertise per-unit CRC when the host advertises features.
    pub unit_crc: bool,
    /// Battery threshold reported in the upgrade reply.
    pub battery_threshold: u8,
    /// App wait timeout reported in the negotiation reply.
    pub app_wait_timeout: u16,
    /// Device restart timeout reported in the negotiation reply.
    pub device_restart_timeout: u16,
    /// Base of the drain window in milliseconds. This is also the shortest
    /// window; values below the 500 ms default shorten it.
    pub drain_base_ms: u64,
    /// Drain loop poll interval in milliseconds.
    pub drain_poll_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_buffer_size: SEND_BUFFER_SIZE,
            unit_crc: true,
            battery_threshold: DEFAULT_BATTERY_THRESHOLD,
            app_wait_timeout: DEFAULT_APP_WAIT_TIMEOUT,
            device_restart_timeout: DEFAULT_DEVICE_RESTART_TIMEOUT,
            drain_base_ms: DRAIN_BASE_MS,
            drain_poll_ms: DRAIN_POLL_MS,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Control requests from the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlCommand {
    /// Send the outcome of the image check to the host.
    ReportImageValid(bool),
    /// Forward update progress to the observer.
    ReportProgress(u8),
    GetUnitSize,
    GetMaxSize,
    GetConnectType,
}

/// Answers to [`IoctlCommand`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlReply {
    Done,
    UnitSize(u16),
    /// Largest request the host accepts; `None` outside the BLE tier.
    MaxSize(Option<u32>),
    ConnectType(ConnectionKind),
}

/// How a pull stopped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PullOutcome {
    Complete,
    /// Host re-ran negotiation; the rest of the pull was abandoned.
    Renegotiated,
}

/// Length of a pull covering `len` bytes of caller buffer.
fn pull_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| OtaError::RequestTooLarge { len })
}

/// OTA Session - owns the transport and all protocol state of one
/// connection.
pub struct OtaSession<T: OtaTransport, O: OtaObserver> {
    transport: T,
    observer: Arc<O>,
    config: SessionConfig,
    state: SessionState,
    opened: bool,
}

impl<T: OtaTransport> OtaSession<T, TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self::with_observer(transport, config, Arc::new(TracingObserver))
    }
}

impl<T: OtaTransport, O: OtaObserver> OtaSession<T, O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(transport: T, config: SessionConfig, observer: Arc<O>) -> Self {
        Self {
            transport,
            observer,
            config,
            state: SessionState::new(),
            opened: false,
        }
    }

    fn context<'a>(&'a mut self, dest: &'a mut [u8]) -> HandlerContext<'a, T, O> {
        HandlerContext {
            transport: &self.transport,
            observer: self.observer.as_ref(),
            state: &mut self.state,
            config: &self.config,
            dest,
        }
    }

    /// Feed a connection change from the link layer.
    ///
    /// The unit size announced at negotiation is derived here.
    pub fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected { kind, mtu } => {
                self.state.connection = kind;
                self.state.unit_size = unit_size_for(kind, mtu);
                debug!(kind = %kind, mtu, unit_size = self.state.unit_size, "Link up");
            }
            LinkEvent::Disconnected => {
                self.state.connection = ConnectionKind::None;
                self.state.negotiation.reset();
            }
        }
        self.observer.on_event(&OtaEvent::LinkChanged {
            connected: self.state.connection.is_connected(),
            kind: self.state.connection,
            unit_size: self.state.unit_size,
        });
    }

    /// Open the transport and block until the host finishes negotiation.
    #[instrument(skip(self))]
    pub fn open(&mut self) -> Result<()> {
        if self.opened {
            warn!("Session already open");
            return Ok(());
        }
        self.transport.open()?;
        self.opened = true;
        info!(unit_size = self.state.unit_size, "Waiting for negotiation");

        while !self.state.negotiation.done {
            self.process_next_command(&mut [])?;
        }
        Ok(())
    }

    /// Close the transport and forget the negotiation.
    #[instrument(skip(self))]
    pub fn close(&mut self) -> Result<()> {
        self.state.negotiation.reset();
        self.state.transfer = None;
        self.state.goto_phase(Phase::Idle);
        if !self.opened {
            return Ok(());
        }
        self.opened = false;
        self.transport.close()?;
        info!("Session closed");
        Ok(())
    }

    /// Read and handle a single command from the host.
    ///
    /// Image data is written into `dest`, indexed from the start of the
    /// active transfer.
    pub fn process_next_command(&mut self, dest: &mut [u8]) -> Result<Opcode> {
        handlers::process_next_command(&mut self.context(dest))
    }

    /// Pull `buf.len()` bytes of the image at `offset`.
    #[instrument(skip(self, buf), fields(len = buf.len()))]
    pub fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize> {
        let len = pull_len(buf.len())?;
        self.read_prepare(offset, len)?;
        self.read_complete(offset, buf)
    }

    /// Issue the pull for `[offset, offset + len)` without waiting for data.
    #[instrument(skip(self))]
    pub fn read_prepare(&mut self, offset: u32, len: u32) -> Result<()> {
        if !self.state.negotiation.done {
            return Err(OtaError::NotNegotiated);
        }
        if self.state.transfer.is_some() {
            warn!("Pull already prepared");
            return Err(OtaError::Busy);
        }

        self.state.transfer = Some(TransferRequest::new(offset, len));
        let result = handlers::begin_pull(&mut self.context(&mut []));
        if result.is_err() {
            self.state.transfer = None;
        }
        result
    }

    /// Receive the pull issued by [`read_prepare`](Self::read_prepare) into
    /// `buf`, retrying once after a recoverable error.
    #[instrument(skip(self, buf), fields(len = buf.len()))]
    pub fn read_complete(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize> {
        let (prepared, total) = match &self.state.transfer {
            Some(t) => (t.base_offset, t.total_len),
            None => return Err(OtaError::NoActiveTransfer),
        };

        let result = if prepared != offset {
            Err(OtaError::OffsetMismatch {
                prepared,
                requested: offset,
            })
        } else if buf.len() < total as usize {
            Err(OtaError::BufferTooSmall {
                needed: total as usize,
                actual: buf.len(),
            })
        } else {
            self.complete_transfer(buf).map(|_| total as usize)
        };

        self.state.transfer = None;
        result
    }

    fn complete_transfer(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut retried = false;
        loop {
            match self.pump_transfer(buf) {
                Ok(PullOutcome::Complete) => return Ok(()),
                Ok(PullOutcome::Renegotiated) => {
                    info!("Host re-negotiated during pull");
                    self.resume()?;
                }
                Err(e) if retried => {
                    let (offset, remaining) = self.progress();
                    warn!(offset, remaining, error = %e, "Pull failed after retry");
                    return Err(OtaError::TransferFailed {
                        offset,
                        remaining,
                        source: Box::new(e),
                    });
                }
                Err(e) if e.is_recoverable() => {
                    if !self.link_up() {
                        warn!(error = %e, "Link down, not retrying");
                        return Err(e);
                    }
                    warn!(error = %e, "Pull desynchronized, recovering");
                    retried = true;
                    self.recover()?;
                    self.resume()?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run the framer until the current pull is fully written.
    fn pump_transfer(&mut self, buf: &mut [u8]) -> Result<PullOutcome> {
        loop {
            let complete = self
                .state
                .transfer
                .as_ref()
                .map(TransferRequest::is_complete)
                .ok_or(OtaError::NoActiveTransfer)?;
            if complete {
                return Ok(PullOutcome::Complete);
            }
            if self.process_next_command(buf)? == Opcode::NegotiationResult {
                return Ok(PullOutcome::Renegotiated);
            }
        }
    }

    /// Drop whatever the host is still sending for the abandoned pull.
    fn recover(&mut self) -> Result<()> {
        let (_, remaining) = self.progress();
        let window = drain_window(remaining, &self.config);
        let poll = Duration::from_millis(self.config.drain_poll_ms);
        drain_stale_input(&self.transport, window, poll)?;
        self.state.goto_phase(Phase::Idle);
        Ok(())
    }

    /// Re-issue the pull for the bytes not yet written.
    fn resume(&mut self) -> Result<()> {
        let (offset, remaining) = self.progress();
        self.observer.on_event(&OtaEvent::Recovery { offset, remaining });
        handlers::begin_pull(&mut self.context(&mut []))
    }

    fn progress(&self) -> (u32, u32) {
        self.state
            .transfer
            .as_ref()
            .map(|t| (t.resume_offset(), t.remaining()))
            .unwrap_or_default()
    }

    /// Orchestrator control surface.
    pub fn ioctl(&mut self, cmd: IoctlCommand) -> Result<IoctlReply> {
        match cmd {
            IoctlCommand::ReportImageValid(valid) => {
                if !self.state.negotiation.done {
                    return Err(OtaError::NotNegotiated);
                }
                info!(valid, "Reporting image validity");
                let ctx = self.context(&mut []);
                ctx.send(&DeviceMessage::ValidateImage { valid })?;
                ctx.emit(OtaEvent::ImageValidated { valid });
                Ok(IoctlReply::Done)
            }
            IoctlCommand::ReportProgress(percent) => {
                self.observer.on_event(&OtaEvent::Progress {
                    percent: percent.min(100),
                });
                Ok(IoctlReply::Done)
            }
            IoctlCommand::GetUnitSize => Ok(IoctlReply::UnitSize(self.state.unit_size)),
            IoctlCommand::GetMaxSize => {
                let unit = self.state.unit_size;
                Ok(IoctlReply::MaxSize(
                    (unit <= OTA_UNIT_BLE_SIZE).then(|| u32::from(unit) * BLE_MAX_UNITS_PER_REQUEST),
                ))
            }
            IoctlCommand::GetConnectType => Ok(IoctlReply::ConnectType(self.state.connection)),
        }
    }

    pub fn is_open(&self) -> bool {
        self.opened
    }

    pub fn is_negotiated(&self) -> bool {
        self.state.negotiation.done
    }

    pub fn unit_size(&self) -> u16 {
        self.state.unit_size
    }

    pub fn connection(&self) -> ConnectionKind {
        self.state.connection
    }

    /// Link layer reports a connection and the transport is still up.
    pub fn link_up(&self) -> bool {
        self.state.connection.is_connected() && self.transport.is_connected()
    }

    /// Whether both sides agreed on per-unit CRC.
    pub fn unit_crc(&self) -> bool {
        self.state.negotiation.unit_crc()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}
