//! Image data handlers (REQUIRE_IMAGE_DATA out, SEND_IMAGE_DATA in).

use tracing::{debug, error, trace};

use crate::error::{OtaError, ProtocolViolation, Result};
use crate::events::{OtaEvent, OtaObserver};
use crate::protocol::constants::{DATA_CRC_SIZE, DATA_PSN_SIZE};
use crate::protocol::{Crc32Accumulator, DeviceMessage, ParamReader};
use crate::transport::{ByteSource, OtaTransport};

use super::HandlerContext;

/// Ask the host for the not-yet-written part of the active transfer.
pub fn begin_pull<T: OtaTransport, O: OtaObserver>(ctx: &mut HandlerContext<'_, T, O>) -> Result<()> {
    if !ctx.state.negotiation.done {
        return Err(OtaError::NotNegotiated);
    }
    let (offset, len) = ctx
        .state
        .transfer
        .as_mut()
        .ok_or(OtaError::NoActiveTransfer)?
        .begin_pull();

    ctx.send(&DeviceMessage::RequireImageData {
        offset,
        len,
        read_mask: 0,
    })?;
    ctx.emit(OtaEvent::PullStarted { offset, len });
    Ok(())
}

/// SEND_IMAGE_DATA / SEND_IMAGE_DATA_WITH_CRC - one unit of the current pull.
///
/// Raw layout is `psn`, then a little-endian CRC-32 when `with_crc`, then the
/// payload. A unit is only accounted for once its PSN and CRC both check out;
/// on any error the transfer counters are left untouched.
pub fn handle_send_image_data<T: OtaTransport, O: OtaObserver, S: ByteSource + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
    params: &mut ParamReader<'_, S>,
    with_crc: bool,
) -> Result<()> {
    let Some(transfer) = ctx.state.transfer.as_mut() else {
        return Err(OtaError::NoActiveTransfer);
    };

    let head_len = DATA_PSN_SIZE + if with_crc { DATA_CRC_SIZE } else { 0 };
    if params.remaining() < head_len {
        return Err(ProtocolViolation::TruncatedFrame {
            expected: head_len,
            actual: params.remaining(),
        }
        .into());
    }

    let psn = params.read_raw_u8()?;
    let expected = transfer.expected_psn();
    if psn != expected {
        error!(expected, actual = psn, "PSN out of sequence");
        return Err(OtaError::Sequence {
            expected,
            actual: psn,
        });
    }

    let unit_crc = if with_crc {
        Some(params.read_raw_u32()?)
    } else {
        None
    };

    let seg = (transfer.pull_remaining() as usize).min(params.remaining());
    let start = transfer.written as usize;
    let end = start + seg;
    if end > ctx.dest.len() {
        return Err(OtaError::BufferTooSmall {
            needed: end,
            actual: ctx.dest.len(),
        });
    }
    let chunk = &mut ctx.dest[start..end];
    params.read_raw(chunk)?;

    if let Some(expected_crc) = unit_crc {
        let mut crc = Crc32Accumulator::new();
        crc.update(chunk);
        let computed = crc.finalize();
        if computed != expected_crc {
            error!(
                psn,
                expected = %format!("0x{:08X}", expected_crc),
                computed = %format!("0x{:08X}", computed),
                "Unit CRC mismatch"
            );
            return Err(OtaError::Integrity {
                psn,
                expected: expected_crc,
                actual: computed,
            });
        }
    }

    if params.remaining() != 0 {
        return Err(ProtocolViolation::TrailingPayload {
            remaining: params.remaining(),
        }
        .into());
    }

    transfer.accept(psn, seg as u32);
    trace!(psn, seg, "Unit accepted");
    debug!(
        written = transfer.written,
        total = transfer.total_len,
        "Transfer progress"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::protocol::{HostCommand, Opcode};
    use crate::session::SessionConfig;
    use crate::state::handlers::process_next_command;
    use crate::state::machine::{SessionState, TransferRequest};
    use crate::transport::MockTransport;

    fn negotiated_state(offset: u32, len: u32) -> SessionState {
        let mut state = SessionState::new();
        state.negotiation.done = true;
        state.transfer = Some(TransferRequest::new(offset, len));
        state
    }

    fn open_mock() -> MockTransport {
        let mock = MockTransport::new();
        mock.open().unwrap();
        mock
    }

    fn plain(psn: u8, payload: &[u8]) -> HostCommand {
        HostCommand::SendImageData {
            psn,
            crc: None,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_begin_pull_requires_negotiation() {
        let mock = open_mock();
        let mut state = SessionState::new();
        state.transfer = Some(TransferRequest::new(0, 16));
        let config = SessionConfig::default();
        let mut ctx = HandlerContext {
            transport: &mock,
            observer: &NullObserver,
            state: &mut state,
            config: &config,
            dest: &mut [],
        };

        assert!(matches!(begin_pull(&mut ctx), Err(OtaError::NotNegotiated)));
        assert!(mock.get_writes().is_empty());
    }

    #[test]
    fn test_begin_pull_sends_require() {
        let mock = open_mock();
        let mut state = negotiated_state(0x2000, 512);
        let config = SessionConfig::default();
        let mut ctx = HandlerContext {
            transport: &mock,
            observer: &NullObserver,
            state: &mut state,
            config: &config,
            dest: &mut [],
        };

        begin_pull(&mut ctx).unwrap();
        assert_eq!(
            mock.sent_messages(),
            vec![DeviceMessage::RequireImageData {
                offset: 0x2000,
                len: 512,
                read_mask: 0,
            }]
        );
    }

    #[test]
    fn test_units_assemble_in_order() {
        let mock = open_mock();
        let first: Vec<u8> = (0..128).map(|i| i as u8).collect();
        let second: Vec<u8> = (128..256).map(|i| i as u8).collect();
        mock.queue_command(&plain(0, &first));
        mock.queue_command(&plain(1, &second));

        let mut state = negotiated_state(0, 256);
        let config = SessionConfig::default();
        let mut dest = vec![0u8; 256];
        let mut ctx = HandlerContext {
            transport: &mock,
            observer: &NullObserver,
            state: &mut state,
            config: &config,
            dest: &mut dest,
        };

        assert_eq!(process_next_command(&mut ctx).unwrap(), Opcode::SendImageData);
        process_next_command(&mut ctx).unwrap();

        let transfer = state.transfer.as_ref().unwrap();
        assert_eq!(transfer.written, 256);
        assert_eq!(transfer.last_psn, 1);
        assert!(transfer.is_complete());
        assert_eq!(dest, (0..256).map(|i| i as u8).collect::<Vec<_>>());
    }

    #[test]
    fn test_out_of_sequence_psn_not_accepted() {
        let mock = open_mock();
        mock.queue_command(&plain(0, &[1, 2, 3, 4]));
        mock.queue_command(&plain(2, &[5, 6, 7, 8]));

        let mut state = negotiated_state(0, 8);
        let config = SessionConfig::default();
        let mut dest = vec![0u8; 8];
        let mut ctx = HandlerContext {
            transport: &mock,
            observer: &NullObserver,
            state: &mut state,
            config: &config,
            dest: &mut dest,
        };

        process_next_command(&mut ctx).unwrap();
        assert!(matches!(
            process_next_command(&mut ctx),
            Err(OtaError::Sequence {
                expected: 1,
                actual: 2
            })
        ));
        assert_eq!(ctx.state.transfer.as_ref().unwrap().written, 4);
        // Payload of the rejected unit stays queued for the recovery drain.
        assert_eq!(mock.pending(), 4);
        assert_eq!(&dest[4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_crc_verified_unit_accepted() {
        let mock = open_mock();
        mock.queue_command(&HostCommand::checked_data(0, vec![0xAA; 32]));

        let mut state = negotiated_state(0, 32);
        let config = SessionConfig::default();
        let mut dest = vec![0u8; 32];
        let mut ctx = HandlerContext {
            transport: &mock,
            observer: &NullObserver,
            state: &mut state,
            config: &config,
            dest: &mut dest,
        };

        assert_eq!(
            process_next_command(&mut ctx).unwrap(),
            Opcode::SendImageDataWithCrc
        );
        assert_eq!(state.transfer.unwrap().written, 32);
    }

    #[test]
    fn test_bad_crc_not_accepted() {
        let mock = open_mock();
        let payload = vec![0x55; 16];
        let good = crate::protocol::crc32(&payload);
        mock.queue_command(&HostCommand::SendImageData {
            psn: 0,
            crc: Some(good ^ 1),
            payload,
        });

        let mut state = negotiated_state(0, 16);
        let config = SessionConfig::default();
        let mut dest = vec![0u8; 16];
        let mut ctx = HandlerContext {
            transport: &mock,
            observer: &NullObserver,
            state: &mut state,
            config: &config,
            dest: &mut dest,
        };

        let err = process_next_command(&mut ctx).unwrap_err();
        assert!(matches!(err, OtaError::Integrity { psn: 0, .. }));
        let transfer = state.transfer.unwrap();
        assert_eq!(transfer.written, 0);
        assert_eq!(transfer.expected_psn(), 0);
    }

    #[test]
    fn test_data_without_transfer_is_skipped() {
        let mock = open_mock();
        mock.queue_command(&plain(0, &[1, 2, 3]));
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
            Err(OtaError::NoActiveTransfer)
        ));
        assert_eq!(
            process_next_command(&mut ctx).unwrap(),
            Opcode::ConnectNegotiation
        );
    }

    #[test]
    fn test_unit_past_pull_end_is_trailing() {
        let mock = open_mock();
        mock.queue_command(&plain(0, &[9; 6]));

        let mut state = negotiated_state(0, 4);
        let config = SessionConfig::default();
        let mut dest = vec![0u8; 4];
        let mut ctx = HandlerContext {
            transport: &mock,
            observer: &NullObserver,
            state: &mut state,
            config: &config,
            dest: &mut dest,
        };

        assert!(matches!(
            process_next_command(&mut ctx),
            Err(OtaError::Protocol(ProtocolViolation::TrailingPayload {
                remaining: 2
            }))
        ));
        assert_eq!(mock.pending(), 0);
        assert_eq!(state.transfer.unwrap().written, 0);
    }

    #[test]
    fn test_truncated_crc_unit() {
        let mock = open_mock();
        // With-CRC opcode but only psn + 2 bytes.
        mock.queue_bytes(&[0x09, 0x0B, 0x80, 0x03, 0x00, 0x00, 0x11, 0x22]);

        let mut state = negotiated_state(0, 4);
        let config = SessionConfig::default();
        let mut dest = vec![0u8; 4];
        let mut ctx = HandlerContext {
            transport: &mock,
            observer: &NullObserver,
            state: &mut state,
            config: &config,
            dest: &mut dest,
        };

        assert!(matches!(
            process_next_command(&mut ctx),
            Err(OtaError::Protocol(ProtocolViolation::TruncatedFrame {
                expected: 5,
                actual: 3
            }))
        ));
        assert_eq!(mock.pending(), 0);
    }

    #[test]
    fn test_small_destination_rejected() {
        let mock = open_mock();
        mock.queue_command(&plain(0, &[1; 8]));

        let mut state = negotiated_state(0, 8);
        let config = SessionConfig::default();
        let mut dest = vec![0u8; 4];
        let mut ctx = HandlerContext {
            transport: &mock,
            observer: &NullObserver,
            state: &mut state,
            config: &config,
            dest: &mut dest,
        };

        assert!(matches!(
            process_next_command(&mut ctx),
            Err(OtaError::BufferTooSmall {
                needed: 8,
                actual: 4
            })
        ));
    }
}
