//! SVC protocol driver.
//!
//! The bridge is the SVC from the host's point of view. It opens the
//! session with a version/hello handshake and then answers the host's
//! control-plane requests, delegating connection management to the
//! routing fabric.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;

use greybus::protocol::{payload_as, svc};
use greybus::{Error, Result, AP_INTF_ID, SVC_CPORT};

use crate::bridge::{self, Core};
use crate::driver::{
    request, request_empty, request_unsupported, response, response_empty, Driver,
};
use crate::engine::{alloc_operation, send_request, Operation};

/// Endo id reported in the hello request.
pub const ENDO_ID: u16 = 0x4755;

/// Progress of the SVC bootstrap handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapState {
    Init,
    WaitVersionResp,
    WaitHelloResp,
    Ready,
}

static SVC_DRIVER: Driver = Driver {
    name: "svc",
    operations: &[
        request_empty(svc::INTF_DEVICE_ID),
        request_unsupported(svc::INTF_RESET),
        request(svc::CONN_CREATE, connection_create_request),
        request(svc::CONN_DESTROY, connection_destroy_request),
        request(svc::DME_PEER_GET, dme_peer_get_request),
        request(svc::DME_PEER_SET, dme_peer_set_request),
        request_empty(svc::ROUTE_CREATE),
        request_empty(svc::ROUTE_DESTROY),
        request_unsupported(svc::TIMESYNC_ENABLE),
        request_unsupported(svc::TIMESYNC_DISABLE),
        request_unsupported(svc::TIMESYNC_AUTHORITATIVE),
        request(svc::INTF_SET_PWRM, intf_set_pwrm_request),
        request_unsupported(svc::INTF_EJECT),
        request_empty(svc::PING),
        request(svc::PWRMON_RAIL_COUNT_GET, pwrmon_rail_count_get_request),
        request_unsupported(svc::PWRMON_RAIL_NAMES_GET),
        request_unsupported(svc::PWRMON_SAMPLE_GET),
        request_unsupported(svc::PWRMON_INTF_SAMPLE_GET),
        request_unsupported(svc::TIMESYNC_WAKE_PINS_ACQUIRE),
        request_unsupported(svc::TIMESYNC_WAKE_PINS_RELEASE),
        request_unsupported(svc::TIMESYNC_PING),
        request_unsupported(svc::MODULE_INSERTED),
        request_unsupported(svc::MODULE_REMOVED),
        request(svc::INTF_VSYS_ENABLE, intf_vsys_request),
        request(svc::INTF_VSYS_DISABLE, intf_vsys_request),
        request(svc::INTF_REFCLK_ENABLE, intf_refclk_request),
        request(svc::INTF_REFCLK_DISABLE, intf_refclk_request),
        request(svc::INTF_UNIPRO_ENABLE, intf_unipro_request),
        request(svc::INTF_UNIPRO_DISABLE, intf_unipro_request),
        request(svc::INTF_ACTIVATE, intf_activate_request),
        request(svc::INTF_RESUME, intf_resume_request),
        request_unsupported(svc::INTF_MAILBOX_EVENT),
        request_unsupported(svc::INTF_OOPS),
        response_empty(svc::MODULE_INSERTED),
        response(svc::PROTOCOL_VERSION, protocol_version_response),
        response(svc::SVC_HELLO, svc_hello_response),
    ],
};

/// Put the SVC driver on (AP, CPort 0).
pub fn register_driver(core: &Arc<Core>) -> Result<()> {
    core.register_driver(AP_INTF_ID, SVC_CPORT, &SVC_DRIVER)
}

/// Kick off the bootstrap handshake.
pub fn init(core: &Arc<Core>) -> Result<()> {
    send_protocol_version_request(core)
}

fn send_protocol_version_request(core: &Arc<Core>) -> Result<()> {
    // Advance the state before sending: the response is handled on the
    // host-transport thread and may beat the store otherwise.
    *core.svc_state() = BootstrapState::WaitVersionResp;
    let op = alloc_operation(core, svc::PROTOCOL_VERSION, &[])?;
    send_request(core, AP_INTF_ID, SVC_CPORT, op).map_err(|e| {
        *core.svc_state() = BootstrapState::Init;
        e
    })
}

fn send_hello_request(core: &Arc<Core>) -> Result<()> {
    *core.svc_state() = BootstrapState::WaitHelloResp;
    let req = svc::HelloRequest {
        endo_id: ENDO_ID.to_le(),
        interface_id: AP_INTF_ID,
    };
    let op = alloc_operation(core, svc::SVC_HELLO, unsafe { plain::as_bytes(&req) })?;
    send_request(core, AP_INTF_ID, SVC_CPORT, op).map_err(|e| {
        *core.svc_state() = BootstrapState::Init;
        e
    })
}

/// Announce a hotplugged interface to the host.
pub fn send_module_inserted(core: &Arc<Core>, intf_id: u8) -> Result<()> {
    let req = svc::ModuleInsertedRequest {
        primary_intf_id: intf_id,
        intf_count: 1,
        flags: 0,
    };
    let op = alloc_operation(core, svc::MODULE_INSERTED, unsafe { plain::as_bytes(&req) })?;
    send_request(core, AP_INTF_ID, SVC_CPORT, op)
}

fn protocol_version_response(core: &Arc<Core>, op: &mut Operation) -> Result<()> {
    {
        let state = core.svc_state();
        if *state != BootstrapState::WaitVersionResp {
            log::warn!("unexpected svc version response in state {:?}", *state);
            return Err(Error::Invalid);
        }
    }

    let resp: &svc::VersionResponse = payload_as(op.response_payload().unwrap_or(&[]))?;
    log::info!(
        "host svc protocol version {}.{}",
        resp.major,
        resp.minor
    );
    send_hello_request(core)
}

fn svc_hello_response(core: &Arc<Core>, _op: &mut Operation) -> Result<()> {
    let mut state = core.svc_state();
    if *state != BootstrapState::WaitHelloResp {
        log::warn!("unexpected svc hello response in state {:?}", *state);
        return Err(Error::Invalid);
    }
    *state = BootstrapState::Ready;
    log::info!("svc handshake complete");
    Ok(())
}

fn connection_create_request(core: &Arc<Core>, op: &mut Operation) -> Result<()> {
    let req: &svc::ConnCreateRequest = payload_as(op.request_payload())?;
    bridge::connection_create(
        core,
        req.intf1_id,
        u16::from_le(req.cport1_id),
        req.intf2_id,
        u16::from_le(req.cport2_id),
    )
}

fn connection_destroy_request(core: &Arc<Core>, op: &mut Operation) -> Result<()> {
    let req: &svc::ConnDestroyRequest = payload_as(op.request_payload())?;
    bridge::connection_destroy(
        core,
        req.intf1_id,
        u16::from_le(req.cport1_id),
        req.intf2_id,
        u16::from_le(req.cport2_id),
    )
}

fn dme_peer_get_request(_core: &Arc<Core>, op: &mut Operation) -> Result<()> {
    op.respond(&svc::DmePeerGetResponse {
        result_code: 0u16.to_le(),
        attr_value: 0x0126u32.to_le(),
    })
}

fn dme_peer_set_request(_core: &Arc<Core>, op: &mut Operation) -> Result<()> {
    op.respond(&svc::DmePeerSetResponse {
        result_code: 0u16.to_le(),
    })
}

fn intf_vsys_request(_core: &Arc<Core>, op: &mut Operation) -> Result<()> {
    op.respond(&svc::IntfVsysResponse {
        result_code: svc::VSYS_OK,
    })
}

fn intf_refclk_request(_core: &Arc<Core>, op: &mut Operation) -> Result<()> {
    op.respond(&svc::IntfRefclkResponse {
        result_code: svc::REFCLK_OK,
    })
}

fn intf_unipro_request(_core: &Arc<Core>, op: &mut Operation) -> Result<()> {
    op.respond(&svc::IntfUniproResponse {
        result_code: svc::UNIPRO_OK,
    })
}

fn intf_activate_request(_core: &Arc<Core>, op: &mut Operation) -> Result<()> {
    op.respond(&svc::IntfActivateResponse {
        status: svc::OP_SUCCESS,
        intf_type: svc::INTF_TYPE_GREYBUS,
    })
}

fn intf_resume_request(_core: &Arc<Core>, op: &mut Operation) -> Result<()> {
    op.respond(&svc::IntfResumeResponse {
        status: svc::OP_SUCCESS,
    })
}

fn intf_set_pwrm_request(_core: &Arc<Core>, op: &mut Operation) -> Result<()> {
    let req: &svc::IntfSetPwrmRequest = payload_as(op.request_payload())?;
    let result_code = if req.tx_mode == svc::UNIPRO_HIBERNATE_MODE
        && req.rx_mode == svc::UNIPRO_HIBERNATE_MODE
    {
        svc::SETPWRM_PWR_OK
    } else {
        svc::SETPWRM_PWR_LOCAL
    };
    op.respond(&svc::IntfSetPwrmResponse { result_code })
}

fn pwrmon_rail_count_get_request(_core: &Arc<Core>, op: &mut Operation) -> Result<()> {
    op.respond(&svc::PwrmonRailCountGetResponse { rail_count: 0 })
}

/// Stop the host kernel's SVC watchdog so it does not eject the bridge
/// while a debugger holds things up.
pub fn watchdog_disable() {
    const WATCHDOG: &str = "/sys/bus/greybus/devices/1-svc/watchdog";

    let result = OpenOptions::new()
        .write(true)
        .open(WATCHDOG)
        .and_then(|mut f| f.write_all(b"0"));
    if let Err(e) = result {
        log::warn!("failed to disable svc watchdog: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::tests::recording_core;
    use crate::engine::handle_message;
    use greybus::message::{MsgHeader, MSG_HEADER_SIZE};

    fn response_bytes(op_id: u16, op_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut msg = vec![0u8; MSG_HEADER_SIZE + payload.len()];
        MsgHeader {
            size: msg.len() as u16,
            operation_id: op_id,
            op_type: op_type | 0x80,
            result: 0,
            pad: [0, 0],
        }
        .encode(&mut msg);
        msg[MSG_HEADER_SIZE..].copy_from_slice(payload);
        msg
    }

    #[test]
    fn bootstrap_handshake_bytes() {
        let (core, host) = recording_core();
        register_driver(&core).unwrap();

        init(&core).unwrap();
        assert_eq!(core.svc_bootstrap_state(), BootstrapState::WaitVersionResp);

        // Version request: bare header, type 0x7d, first operation id.
        let sent = host.sent();
        let (cport, msg) = &sent[0];
        assert_eq!(*cport, SVC_CPORT);
        assert_eq!(msg, &[0x08, 0x00, 0x01, 0x00, 0x7d, 0x00, 0x00, 0x00]);

        // The host answers with its version; the bridge must say hello.
        let resp = response_bytes(1, svc::PROTOCOL_VERSION, &[0x02, 0x01]);
        handle_message(&core, AP_INTF_ID, SVC_CPORT, &resp).unwrap();
        assert_eq!(core.svc_bootstrap_state(), BootstrapState::WaitHelloResp);

        let sent = host.sent();
        let (_, hello) = &sent[1];
        assert_eq!(
            hello,
            &[0x0b, 0x00, 0x02, 0x00, 0x7f, 0x00, 0x00, 0x00, 0x55, 0x47, 0x00]
        );

        let resp = response_bytes(2, svc::SVC_HELLO, &[]);
        handle_message(&core, AP_INTF_ID, SVC_CPORT, &resp).unwrap();
        assert_eq!(core.svc_bootstrap_state(), BootstrapState::Ready);
        assert!(core.ops.is_empty());
    }

    #[test]
    fn ready_state_request_handlers() {
        let (core, host) = recording_core();
        register_driver(&core).unwrap();

        // Ping: empty request, empty success response.
        let mut ping = vec![0u8; MSG_HEADER_SIZE];
        MsgHeader {
            size: 8,
            operation_id: 9,
            op_type: svc::PING,
            result: 0,
            pad: [0, 0],
        }
        .encode(&mut ping);
        handle_message(&core, AP_INTF_ID, SVC_CPORT, &ping).unwrap();
        let sent = host.sent();
        let (_, resp) = sent.last().unwrap();
        assert_eq!(resp.len(), MSG_HEADER_SIZE);
        assert_eq!(resp[4], svc::PING | 0x80);
        assert_eq!(resp[5], 0);

        // DME peer get returns the fixed attribute.
        let mut dme = vec![0u8; MSG_HEADER_SIZE];
        MsgHeader {
            size: 8,
            operation_id: 10,
            op_type: svc::DME_PEER_GET,
            result: 0,
            pad: [0, 0],
        }
        .encode(&mut dme);
        handle_message(&core, AP_INTF_ID, SVC_CPORT, &dme).unwrap();
        let sent = host.sent();
        let (_, resp) = sent.last().unwrap();
        assert_eq!(
            &resp[MSG_HEADER_SIZE..],
            &[0x00, 0x00, 0x26, 0x01, 0x00, 0x00]
        );
    }

    #[test]
    fn set_pwrm_hibernate_goes_ok() {
        let (core, host) = recording_core();
        register_driver(&core).unwrap();

        let mut payload = [0u8; 10];
        payload[2] = svc::UNIPRO_HIBERNATE_MODE; // tx_mode
        payload[7] = svc::UNIPRO_HIBERNATE_MODE; // rx_mode
        let mut msg = vec![0u8; MSG_HEADER_SIZE + payload.len()];
        MsgHeader {
            size: msg.len() as u16,
            operation_id: 11,
            op_type: svc::INTF_SET_PWRM,
            result: 0,
            pad: [0, 0],
        }
        .encode(&mut msg);
        msg[MSG_HEADER_SIZE..].copy_from_slice(&payload);
        handle_message(&core, AP_INTF_ID, SVC_CPORT, &msg).unwrap();
        let sent = host.sent();
        let (_, resp) = sent.last().unwrap();
        assert_eq!(resp[MSG_HEADER_SIZE], svc::SETPWRM_PWR_OK);

        // Any other mode pair keeps local power.
        msg[MSG_HEADER_SIZE + 2] = 0x01;
        msg[3] = 0; // keep id unique
        msg[2] = 12;
        handle_message(&core, AP_INTF_ID, SVC_CPORT, &msg).unwrap();
        let sent = host.sent();
        let (_, resp) = sent.last().unwrap();
        assert_eq!(resp[MSG_HEADER_SIZE], svc::SETPWRM_PWR_LOCAL);
    }

    #[test]
    fn unsupported_svc_request_is_protocol_bad() {
        let (core, host) = recording_core();
        register_driver(&core).unwrap();

        let mut msg = vec![0u8; MSG_HEADER_SIZE];
        MsgHeader {
            size: 8,
            operation_id: 3,
            op_type: svc::INTF_EJECT,
            result: 0,
            pad: [0, 0],
        }
        .encode(&mut msg);
        assert!(handle_message(&core, AP_INTF_ID, SVC_CPORT, &msg).is_err());

        let sent = host.sent();
        let (_, resp) = sent.last().unwrap();
        assert_eq!(resp[5], greybus::protocol::GB_OP_PROTOCOL_BAD);
    }
}
