//! Command handlers - dispatch logic for each opcode.
//!
//! This module is split into submodules by functionality:
//! - `negotiation`: upgrade request, connect negotiation, negotiation result
//! - `transfer`: require/send image data

mod negotiation;
mod transfer;

use tracing::{debug, error, warn};

use crate::error::{OtaError, ProtocolViolation, Result};
use crate::events::{OtaEvent, OtaObserver};
use crate::protocol::{CommandHeader, DeviceMessage, Opcode, ParamReader};
use crate::session::SessionConfig;
use crate::state::machine::{Phase, SessionState};
use crate::transport::{ByteSource, OtaTransport, TransportReader};

pub use negotiation::{
    handle_connect_negotiation, handle_negotiation_result, handle_request_upgrade,
};
pub use transfer::{begin_pull, handle_send_image_data};

/// Handler context containing all resources.
pub struct HandlerContext<'a, T: OtaTransport, O: OtaObserver> {
    pub transport: &'a T,
    pub observer: &'a O,
    pub state: &'a mut SessionState,
    pub config: &'a SessionConfig,
    /// Destination of image data for the pull in flight.
    pub dest: &'a mut [u8],
}

impl<'a, T: OtaTransport, O: OtaObserver> HandlerContext<'a, T, O> {
    pub(crate) fn emit(&self, event: OtaEvent) {
        self.observer.on_event(&event);
    }

    /// Encode and write a device frame.
    pub(crate) fn send(&self, msg: &DeviceMessage) -> Result<()> {
        let frame = msg.encode(self.config.send_buffer_size)?;
        debug!(opcode = %msg.opcode(), len = frame.len(), "Sending command");
        self.transport.write(&frame).map_err(|e| {
            error!(opcode = %msg.opcode(), error = %e, "Failed to send command");
            e
        })?;
        Ok(())
    }
}

/// Read one command off the stream and run its handler.
///
/// The framer is `AwaitingResponse` while the handler runs and returns to
/// `Idle` afterwards whether or not the handler succeeded. When a command is
/// rejected, whatever is left of its declared parameters is discarded so the
/// next read starts on a header. A sequence error is the exception: the
/// rest of that unit is left for the recovery drain.
pub fn process_next_command<T: OtaTransport, O: OtaObserver>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<Opcode> {
    if ctx.state.phase != Phase::Idle {
        error!(phase = %ctx.state.phase, "Command processing re-entered");
        return Err(OtaError::Busy);
    }

    let mut source = TransportReader::new(ctx.transport);
    let header = CommandHeader::decode(&mut source)?;
    debug!(
        svc_id = header.service_id,
        opcode = header.opcode,
        param_kind = header.param_kind,
        param_len = header.param_len,
        "Command header"
    );

    let mut params = ParamReader::new(&mut source, header.param_len);
    let opcode = match header.validate() {
        Ok(opcode) => opcode,
        Err(e @ ProtocolViolation::UnknownOpcode(_)) => {
            error!(error = %e, "Rejected command header");
            params.skip_rest()?;
            return Err(e.into());
        }
        // Length of a foreign frame cannot be trusted.
        Err(e) => {
            error!(error = %e, "Rejected command header");
            return Err(e.into());
        }
    };

    ctx.state.goto_phase(Phase::AwaitingResponse);
    let result = dispatch(opcode, &mut params, ctx);
    ctx.state.goto_phase(Phase::Idle);

    if let Err(e) = &result {
        error!(opcode = %opcode, error = %e, "Command handler failed");
        if !matches!(e, OtaError::Sequence { .. } | OtaError::Transport(_)) {
            let skipped = params.skip_rest()?;
            if skipped != 0 {
                debug!(skipped, "Discarded rest of rejected command");
            }
        }
    }
    result.map(|_| opcode)
}

fn dispatch<T: OtaTransport, O: OtaObserver, S: ByteSource + ?Sized>(
    opcode: Opcode,
    params: &mut ParamReader<'_, S>,
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<()> {
    match opcode {
        Opcode::RequestUpgrade => handle_request_upgrade(ctx, params),
        Opcode::ConnectNegotiation => handle_connect_negotiation(ctx, params),
        Opcode::NegotiationResult => handle_negotiation_result(ctx, params),
        Opcode::SendImageData => handle_send_image_data(ctx, params, false),
        Opcode::SendImageDataWithCrc => handle_send_image_data(ctx, params, true),
        other => {
            warn!(opcode = %other, "No handler for opcode");
            let violation = if other.is_reserved() {
                ProtocolViolation::ReservedOpcode(other)
            } else {
                ProtocolViolation::UnexpectedOpcode(other)
            };
            Err(violation.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::protocol::HostCommand;
    use crate::transport::MockTransport;

    fn open_mock() -> MockTransport {
        let mock = MockTransport::new();
        mock.open().unwrap();
        mock
    }

    #[test]
    fn test_rejects_foreign_service() {
        let mock = open_mock();
        mock.queue_bytes(&[0x05, 0x01, 0x80, 0x00, 0x00]);
        let mut state = SessionState::new();
        let config = SessionConfig::default();
        let mut ctx = HandlerContext {
            transport: &mock,
            observer: &NullObserver,
            state: &mut state,
            config: &config,
            dest: &mut [],
        };

        let err = process_next_command(&mut ctx).unwrap_err();
        assert!(matches!(
            err,
            OtaError::Protocol(ProtocolViolation::InvalidServiceId(0x05))
        ));
        assert_eq!(state.phase, Phase::Idle);
    }

    #[test]
    fn test_rejects_bad_param_kind() {
        let mock = open_mock();
        mock.queue_bytes(&[0x09, 0x01, 0x00, 0x00, 0x00]);
        let mut state = SessionState::new();
        let config = SessionConfig::default();
        let mut ctx = HandlerContext {
            transport: &mock,
            observer: &NullObserver,
            state: &mut state,
            config: &config,
            dest: &mut [],
        };

        assert!(matches!(
            process_next_command(&mut ctx),
            Err(OtaError::Protocol(ProtocolViolation::InvalidParamKind(0x00)))
        ));
    }

    #[test]
    fn test_reserved_opcode_skips_params() {
        let mock = open_mock();
        // Report-status with 3 parameter bytes, then a valid command.
        mock.queue_bytes(&[0x09, 0x07, 0x80, 0x03, 0x00, 0xAA, 0xBB, 0xCC]);
        mock.queue_command(&HostCommand::ConnectNegotiation);
        let mut state = SessionState::new();
        let config = SessionConfig::default();
        let mut ctx = HandlerContext {
            transport: &mock,
            observer: &NullObserver,
            state: &mut state,
            config: &config,
            dest: &mut [],
        };

        assert!(matches!(
            process_next_command(&mut ctx),
            Err(OtaError::Protocol(ProtocolViolation::ReservedOpcode(
                Opcode::ReportStatus
            )))
        ));
        assert_eq!(ctx.state.phase, Phase::Idle);

        // Stream is still aligned.
        assert_eq!(
            process_next_command(&mut ctx).unwrap(),
            Opcode::ConnectNegotiation
        );
        assert_eq!(mock.pending(), 0);
    }

    fn context<'a>(
        mock: &'a MockTransport,
        state: &'a mut SessionState,
        config: &'a SessionConfig,
    ) -> HandlerContext<'a, MockTransport, NullObserver> {
        HandlerContext {
            transport: mock,
            observer: &NullObserver,
            state,
            config,
            dest: &mut [],
        }
    }

    #[test]
    fn test_unknown_opcode_skips_params() {
        let mock = open_mock();
        mock.queue_bytes(&[0x09, 0x42, 0x80, 0x02, 0x00, 0xAA, 0xBB]);
        mock.queue_command(&HostCommand::ConnectNegotiation);
        let mut state = SessionState::new();
        let config = SessionConfig::default();
        let mut ctx = context(&mock, &mut state, &config);

        assert!(matches!(
            process_next_command(&mut ctx),
            Err(OtaError::Protocol(ProtocolViolation::UnknownOpcode(0x42)))
        ));
        assert_eq!(
            process_next_command(&mut ctx).unwrap(),
            Opcode::ConnectNegotiation
        );
        assert_eq!(mock.pending(), 0);
    }

    #[test]
    fn test_short_tlv_header_skips_params() {
        let mock = open_mock();
        // Two parameter bytes cannot hold a TLV header.
        mock.queue_bytes(&[0x09, 0x01, 0x80, 0x02, 0x00, 0xAA, 0xBB]);
        mock.queue_command(&HostCommand::ConnectNegotiation);
        let mut state = SessionState::new();
        let config = SessionConfig::default();
        let mut ctx = context(&mock, &mut state, &config);

        assert!(matches!(
            process_next_command(&mut ctx),
            Err(OtaError::Protocol(ProtocolViolation::TlvOverrun {
                declared: 3,
                remaining: 2
            }))
        ));
        assert_eq!(ctx.state.phase, Phase::Idle);
        assert_eq!(
            process_next_command(&mut ctx).unwrap(),
            Opcode::ConnectNegotiation
        );
        assert_eq!(mock.get_writes().len(), 1);
    }

    #[test]
    fn test_oversized_tlv_value_skips_params() {
        let mock = open_mock();
        // Feature TLV claims 16 bytes inside a 5-byte parameter block.
        mock.queue_bytes(&[0x09, 0x01, 0x80, 0x05, 0x00, 0x09, 0x10, 0x00, 0x01, 0x02]);
        mock.queue_command(&HostCommand::NegotiationResult { result: 1 });
        let mut state = SessionState::new();
        let config = SessionConfig::default();
        let mut ctx = context(&mock, &mut state, &config);

        assert!(matches!(
            process_next_command(&mut ctx),
            Err(OtaError::Protocol(ProtocolViolation::TlvOverrun {
                declared: 16,
                remaining: 2
            }))
        ));
        assert_eq!(
            process_next_command(&mut ctx).unwrap(),
            Opcode::NegotiationResult
        );
        assert!(state.negotiation.done);
        assert!(mock.get_writes().is_empty());
    }

    #[test]
    fn test_device_only_opcode_rejected() {
        let mock = open_mock();
        mock.queue_bytes(&[0x09, 0x03, 0x80, 0x00, 0x00]);
        let mut state = SessionState::new();
        let config = SessionConfig::default();
        let mut ctx = HandlerContext {
            transport: &mock,
            observer: &NullObserver,
            state: &mut state,
            config: &config,
            dest: &mut [],
        };

        assert!(matches!(
            process_next_command(&mut ctx),
            Err(OtaError::Protocol(ProtocolViolation::UnexpectedOpcode(
                Opcode::RequireImageData
            )))
        ));
    }

    #[test]
    fn test_reentry_is_busy() {
        let mock = open_mock();
        mock.queue_command(&HostCommand::ConnectNegotiation);
        let mut state = SessionState::new();
        state.phase = Phase::AwaitingResponse;
        let config = SessionConfig::default();
        let mut ctx = HandlerContext {
            transport: &mock,
            observer: &NullObserver,
            state: &mut state,
            config: &config,
            dest: &mut [],
        };

        assert!(matches!(process_next_command(&mut ctx), Err(OtaError::Busy)));
        // Nothing was consumed.
        assert!(mock.pending() > 0);
    }

    #[test]
    fn test_transport_failure_propagates() {
        let mock = open_mock();
        mock.queue_bytes(&[0x09, 0x01]);
        let mut state = SessionState::new();
        let config = SessionConfig::default();
        let mut ctx = HandlerContext {
            transport: &mock,
            observer: &NullObserver,
            state: &mut state,
            config: &config,
            dest: &mut [],
        };

        assert!(matches!(
            process_next_command(&mut ctx),
            Err(OtaError::Transport(_))
        ));
    }
}
