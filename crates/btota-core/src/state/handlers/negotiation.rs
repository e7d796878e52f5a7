//! Handshake handlers (REQUEST_UPGRADE, CONNECT_NEGOTIATION, NEGOTIATION_RESULT).

use tracing::{info, warn};

use crate::error::Result;
use crate::events::{OtaEvent, OtaObserver};
use crate::protocol::constants::{
    FEATURE_UNIT_DATA_CRC, OTA_ERROR_CODE_SUCCESS, TLV_NEGO_RESULT, TLV_TYPE_SUPPORT_FEATURES,
};
use crate::protocol::{DeviceMessage, ParamReader};
use crate::transport::{ByteSource, OtaTransport};

use super::HandlerContext;

/// REQUEST_UPGRADE - host asks to start, optionally advertising features.
///
/// The reply goes out on the same opcode and carries the device feature TLV
/// only when the host sent a non-zero feature bitmap.
pub fn handle_request_upgrade<T: OtaTransport, O: OtaObserver, S: ByteSource + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
    params: &mut ParamReader<'_, S>,
) -> Result<()> {
    info!(param_len = params.remaining(), "Upgrade request");

    let mut host_features = 0u8;
    while let Some(field) = params.next_header()? {
        match field.kind {
            TLV_TYPE_SUPPORT_FEATURES => {
                host_features = params.read_uint(&field, 1)? as u8;
                info!(host_features = %format!("0x{:02X}", host_features), "Host features");
            }
            other => {
                // Skip other parameters by now
                warn!(kind = %format!("0x{:02X}", other), len = field.len, "Skipping TLV");
                params.skip_value(&field)?;
            }
        }
    }

    let device_features = if host_features != 0 {
        let features = if ctx.config.unit_crc {
            FEATURE_UNIT_DATA_CRC
        } else {
            0
        };
        info!(device_features = %format!("0x{:02X}", features), "Device features");
        Some(features)
    } else {
        None
    };

    ctx.state.negotiation.host_features = host_features;
    ctx.state.negotiation.device_features = device_features.unwrap_or(0);

    ctx.send(&DeviceMessage::UpgradeReply {
        error_code: OTA_ERROR_CODE_SUCCESS,
        battery_threshold: ctx.config.battery_threshold,
        device_features,
    })
}

/// CONNECT_NEGOTIATION - host asks for link parameters.
pub fn handle_connect_negotiation<T: OtaTransport, O: OtaObserver, S: ByteSource + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
    params: &mut ParamReader<'_, S>,
) -> Result<()> {
    if params.remaining() != 0 {
        warn!(param_len = params.remaining(), "Connect negotiation carries unexpected parameters");
        while let Some(field) = params.next_header()? {
            params.skip_value(&field)?;
        }
    }

    let reply = DeviceMessage::NegotiationReply {
        app_wait_timeout: ctx.config.app_wait_timeout,
        device_restart_timeout: ctx.config.device_restart_timeout,
        unit_size: ctx.state.unit_size,
        interval: 0,
        ack_enable: 0,
    };
    info!(
        app_wait_timeout = ctx.config.app_wait_timeout,
        device_restart_timeout = ctx.config.device_restart_timeout,
        unit_size = ctx.state.unit_size,
        "Connect negotiation"
    );
    ctx.send(&reply)
}

/// NEGOTIATION_RESULT - host closes the handshake.
///
/// Any result value completes negotiation; no rejection path exists.
pub fn handle_negotiation_result<T: OtaTransport, O: OtaObserver, S: ByteSource + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
    params: &mut ParamReader<'_, S>,
) -> Result<()> {
    let result = params.expect_uint(TLV_NEGO_RESULT, 1)? as u8;
    let surplus = params.skip_rest()?;
    if surplus != 0 {
        warn!(surplus, "Negotiation result carries extra parameters");
    }

    info!(result, "Negotiation result");
    ctx.state.negotiation.done = true;
    ctx.emit(OtaEvent::Negotiated {
        unit_size: ctx.state.unit_size,
        unit_crc: ctx.state.negotiation.unit_crc(),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::protocol::{HostCommand, Opcode, SEND_BUFFER_SIZE};
    use crate::session::SessionConfig;
    use crate::state::handlers::process_next_command;
    use crate::state::machine::SessionState;
    use crate::transport::MockTransport;

    fn run(mock: &MockTransport, state: &mut SessionState, config: &SessionConfig) -> Result<Opcode> {
        let mut ctx = HandlerContext {
            transport: mock,
            observer: &NullObserver,
            state,
            config,
            dest: &mut [],
        };
        process_next_command(&mut ctx)
    }

    fn setup() -> (MockTransport, SessionState, SessionConfig) {
        let mock = MockTransport::new();
        mock.open().unwrap();
        (mock, SessionState::new(), SessionConfig::default())
    }

    #[test]
    fn test_upgrade_with_features_gets_device_features() {
        let (mock, mut state, config) = setup();
        mock.queue_command(&HostCommand::RequestUpgrade {
            features: Some(0x01),
        });

        assert_eq!(
            run(&mock, &mut state, &config).unwrap(),
            Opcode::RequestUpgrade
        );
        let sent = mock.sent_messages();
        assert_eq!(
            sent,
            vec![DeviceMessage::UpgradeReply {
                error_code: OTA_ERROR_CODE_SUCCESS,
                battery_threshold: 30,
                device_features: Some(FEATURE_UNIT_DATA_CRC),
            }]
        );
        // Reply reuses the request opcode.
        assert_eq!(mock.get_writes()[0][1], Opcode::RequestUpgrade.as_u8());
        assert!(state.negotiation.unit_crc());
    }

    #[test]
    fn test_upgrade_without_features_omits_device_features() {
        let (mock, mut state, config) = setup();
        mock.queue_command(&HostCommand::RequestUpgrade { features: None });

        run(&mock, &mut state, &config).unwrap();
        let writes = mock.get_writes();
        // error code (7) + battery threshold (4), nothing else.
        assert_eq!(writes[0].len(), 5 + 7 + 4);
        assert_eq!(
            mock.sent_messages(),
            vec![DeviceMessage::UpgradeReply {
                error_code: OTA_ERROR_CODE_SUCCESS,
                battery_threshold: 30,
                device_features: None,
            }]
        );
        assert!(!state.negotiation.unit_crc());
    }

    #[test]
    fn test_upgrade_crc_disabled_in_config() {
        let (mock, mut state, mut config) = setup();
        config.unit_crc = false;
        mock.queue_command(&HostCommand::RequestUpgrade {
            features: Some(0x01),
        });

        run(&mock, &mut state, &config).unwrap();
        assert_eq!(
            mock.sent_messages(),
            vec![DeviceMessage::UpgradeReply {
                error_code: OTA_ERROR_CODE_SUCCESS,
                battery_threshold: 30,
                device_features: Some(0),
            }]
        );
    }

    #[test]
    fn test_upgrade_skips_unknown_tlvs() {
        let (mock, mut state, config) = setup();
        // Unknown TLV 0x30 (2 bytes), then features.
        let params = [0x30, 0x02, 0x00, 0xDE, 0xAD, 0x09, 0x01, 0x00, 0x01];
        mock.queue_bytes(&[0x09, 0x01, 0x80, params.len() as u8, 0x00]);
        mock.queue_bytes(&params);

        run(&mock, &mut state, &config).unwrap();
        assert_eq!(state.negotiation.host_features, 0x01);
        assert_eq!(mock.pending(), 0);
    }

    #[test]
    fn test_connect_negotiation_reports_unit_size() {
        let (mock, mut state, config) = setup();
        state.unit_size = 135;
        mock.queue_command(&HostCommand::ConnectNegotiation);

        assert_eq!(
            run(&mock, &mut state, &config).unwrap(),
            Opcode::ConnectNegotiation
        );
        assert_eq!(
            mock.sent_messages(),
            vec![DeviceMessage::NegotiationReply {
                app_wait_timeout: 3,
                device_restart_timeout: 5,
                unit_size: 135,
                interval: 0,
                ack_enable: 0,
            }]
        );
        assert!(mock.get_writes()[0].len() <= SEND_BUFFER_SIZE);
    }

    #[test]
    fn test_any_negotiation_result_completes() {
        for result in [0u8, 1, 0xFF] {
            let (mock, mut state, config) = setup();
            mock.queue_command(&HostCommand::NegotiationResult { result });
            assert!(!state.negotiation.done);
            run(&mock, &mut state, &config).unwrap();
            assert!(state.negotiation.done);
            assert!(mock.get_writes().is_empty());
        }
    }

    #[test]
    fn test_negotiation_result_wrong_tlv() {
        let (mock, mut state, config) = setup();
        mock.queue_bytes(&[0x09, 0x09, 0x80, 0x07, 0x00, 0x02, 0x01, 0x00, 0x01]);
        mock.queue_bytes(&[0x01, 0x00, 0x00]);
        mock.queue_command(&HostCommand::ConnectNegotiation);
        assert!(run(&mock, &mut state, &config).is_err());
        assert!(!state.negotiation.done);

        // Surplus TLV of the rejected command was discarded.
        assert_eq!(
            run(&mock, &mut state, &config).unwrap(),
            Opcode::ConnectNegotiation
        );
    }
}
