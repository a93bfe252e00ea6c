//! End-to-end scenarios: a simulated module behind the full engine and
//! routing fabric, with an in-memory host transport standing in for the
//! netlink socket.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::{Arc, Mutex};

use greybus::manifest::{DESC_BUNDLE, DESC_CPORT, DESC_INTERFACE, PROTOCOL_LOOPBACK};
use greybus::message::{MsgHeader, MSG_HEADER_SIZE};
use greybus::protocol::{control, loopback, svc, GB_OP_SUCCESS};
use greybus::{Error, AP_INTF_ID, SVC_CPORT};

use gbridged::bridge::{self, Core, HostTransport};
use gbridged::controllers::gbsim::GbsimController;
use gbridged::engine;
use gbridged::svc as svc_driver;

struct TestHost {
    sent: Mutex<Vec<(u16, Vec<u8>)>>,
}

impl TestHost {
    fn new() -> Arc<TestHost> {
        Arc::new(TestHost {
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<(u16, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    fn last(&self) -> (u16, Vec<u8>) {
        self.sent().last().cloned().expect("nothing was sent")
    }
}

impl HostTransport for TestHost {
    fn send(&self, cport_id: u16, msg: &[u8]) -> greybus::Result<()> {
        self.sent.lock().unwrap().push((cport_id, msg.to_vec()));
        Ok(())
    }
}

fn push_desc(blob: &mut Vec<u8>, desc_type: u8, body: &[u8]) {
    let size = (4 + body.len()) as u16;
    blob.extend_from_slice(&size.to_le_bytes());
    blob.push(desc_type);
    blob.push(0);
    blob.extend_from_slice(body);
}

/// A manifest with bundle 2 holding loopback CPorts 4 and 5. The leading
/// size field doubles as the simulator file's size prefix.
fn manifest_blob() -> Vec<u8> {
    let mut blob = vec![0u8, 0, 0, 1];
    push_desc(&mut blob, DESC_INTERFACE, &[1, 2, 0, 0]);
    push_desc(&mut blob, DESC_BUNDLE, &[2, 0x0a, 0, 0]);
    push_desc(&mut blob, DESC_CPORT, &[4, 0, 2, PROTOCOL_LOOPBACK]);
    push_desc(&mut blob, DESC_CPORT, &[5, 0, 2, PROTOCOL_LOOPBACK]);
    let size = blob.len() as u16;
    blob[..2].copy_from_slice(&size.to_le_bytes());
    blob
}

fn write_manifest_file(tag: &str) -> PathBuf {
    let path = env::temp_dir().join(format!("gbridged-{}-{}.mnfb", tag, process::id()));
    fs::write(&path, manifest_blob()).expect("failed to write manifest file");
    path
}

fn request_bytes(op_id: u16, op_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut msg = vec![0u8; MSG_HEADER_SIZE + payload.len()];
    MsgHeader {
        size: msg.len() as u16,
        operation_id: op_id,
        op_type,
        result: 0,
        pad: [0, 0],
    }
    .encode(&mut msg);
    msg[MSG_HEADER_SIZE..].copy_from_slice(payload);
    msg
}

/// Bring up a core with the SVC driver and one simulated module, and
/// acknowledge the hotplug event like the host kernel would.
fn bridge_with_module(tag: &str) -> (Arc<Core>, Arc<TestHost>, u8) {
    let core = Core::new();
    let host = TestHost::new();
    core.set_host(host.clone());
    svc_driver::register_driver(&core).unwrap();

    let path = write_manifest_file(tag);
    let ctrl = bridge::register_controller(&core, Box::new(GbsimController::new(&path))).unwrap();
    ctrl.imp().event_loop(&core, &ctrl).unwrap();
    fs::remove_file(&path).ok();

    let intf_id = ctrl.interfaces()[0].id;

    // The hotplug event went to the SVC CPort; answer it.
    let (cport, inserted) = host.last();
    assert_eq!(cport, SVC_CPORT);
    let hdr = MsgHeader::decode(&inserted).unwrap();
    assert_eq!(hdr.op_type, svc::MODULE_INSERTED);
    assert_eq!(&inserted[MSG_HEADER_SIZE..], &[intf_id, 1, 0, 0]);

    let mut ack = request_bytes(hdr.operation_id, svc::MODULE_INSERTED | 0x80, &[]);
    ack[5] = GB_OP_SUCCESS;
    engine::handle_message(&core, AP_INTF_ID, SVC_CPORT, &ack).unwrap();
    assert!(core.ops.is_empty());

    (core, host, intf_id)
}

/// Route host CPort `cport1` to the module's `cport2` with a CONN_CREATE
/// request, checking the SVC response.
fn connect(core: &Arc<Core>, host: &TestHost, intf_id: u8, cport1: u16, cport2: u16, op_id: u16) {
    let mut payload = Vec::new();
    payload.push(AP_INTF_ID);
    payload.extend_from_slice(&cport1.to_le_bytes());
    payload.push(intf_id);
    payload.extend_from_slice(&cport2.to_le_bytes());
    payload.push(0x07); // traffic class
    payload.push(0x00); // flags
    let msg = request_bytes(op_id, svc::CONN_CREATE, &payload);
    engine::handle_message(core, AP_INTF_ID, SVC_CPORT, &msg).unwrap();

    let (cport, resp) = host.last();
    assert_eq!(cport, SVC_CPORT);
    let hdr = MsgHeader::decode(&resp).unwrap();
    assert_eq!(hdr.op_type, svc::CONN_CREATE | 0x80);
    assert_eq!(hdr.result, GB_OP_SUCCESS);
}

#[test]
fn manifest_fetch_round_trip() {
    let (core, host, intf_id) = bridge_with_module("manifest");
    connect(&core, &host, intf_id, 7, 0, 1);

    // GET_MANIFEST_SIZE over the control CPort.
    let mut msg = request_bytes(2, control::GET_MANIFEST_SIZE, &[]);
    bridge::forward_to_module(&core, 7, &mut msg).unwrap();
    let (cport, resp) = host.last();
    assert_eq!(cport, 7);
    let hdr = MsgHeader::decode(&resp).unwrap();
    assert_eq!(hdr.op_type, control::GET_MANIFEST_SIZE | 0x80);
    assert_eq!(hdr.result, GB_OP_SUCCESS);
    let blob = manifest_blob();
    assert_eq!(
        &resp[MSG_HEADER_SIZE..],
        &(blob.len() as u16).to_le_bytes()
    );

    // GET_MANIFEST returns the blob byte for byte.
    let mut msg = request_bytes(3, control::GET_MANIFEST, &[]);
    bridge::forward_to_module(&core, 7, &mut msg).unwrap();
    let (_, resp) = host.last();
    assert_eq!(&resp[MSG_HEADER_SIZE..], &blob[..]);
}

#[test]
fn control_version_and_pm_acks() {
    let (core, host, intf_id) = bridge_with_module("control");
    connect(&core, &host, intf_id, 7, 0, 1);

    let mut msg = request_bytes(2, control::VERSION, &[0, 1]);
    bridge::forward_to_module(&core, 7, &mut msg).unwrap();
    let (_, resp) = host.last();
    assert_eq!(&resp[MSG_HEADER_SIZE..], &[0, 1]);

    for (id, op_type) in [
        (3u16, control::INTF_SUSPEND_PREPARE),
        (4, control::INTF_DEACTIVATE_PREPARE),
        (5, control::INTF_HIBERNATE_ABORT),
    ] {
        let mut msg = request_bytes(id, op_type, &[]);
        bridge::forward_to_module(&core, 7, &mut msg).unwrap();
        let (_, resp) = host.last();
        assert_eq!(MsgHeader::decode(&resp).unwrap().result, GB_OP_SUCCESS);
        assert_eq!(&resp[MSG_HEADER_SIZE..], &[control::INTF_PM_OK]);
    }

    for (id, op_type) in [
        (6u16, control::BUNDLE_SUSPEND),
        (7, control::BUNDLE_RESUME),
    ] {
        let mut msg = request_bytes(id, op_type, &[2]);
        bridge::forward_to_module(&core, 7, &mut msg).unwrap();
        let (_, resp) = host.last();
        assert_eq!(&resp[MSG_HEADER_SIZE..], &[control::BUNDLE_PM_OK]);
    }
}

#[test]
fn bundle_activation_binds_loopback() {
    let (core, host, intf_id) = bridge_with_module("loopback");
    connect(&core, &host, intf_id, 7, 0, 1);

    // Activating bundle 2 binds the loopback driver on CPorts 4 and 5.
    let mut msg = request_bytes(2, control::BUNDLE_ACTIVATE, &[2]);
    bridge::forward_to_module(&core, 7, &mut msg).unwrap();
    let (_, resp) = host.last();
    assert_eq!(&resp[MSG_HEADER_SIZE..], &[control::BUNDLE_PM_OK]);

    connect(&core, &host, intf_id, 9, 4, 3);

    // Loopback ping.
    let mut msg = request_bytes(4, loopback::PING, &[]);
    bridge::forward_to_module(&core, 9, &mut msg).unwrap();
    let (cport, resp) = host.last();
    assert_eq!(cport, 9);
    assert_eq!(resp.len(), MSG_HEADER_SIZE);
    assert_eq!(MsgHeader::decode(&resp).unwrap().result, GB_OP_SUCCESS);

    // Loopback transfer echoes len, reserved fields and data.
    let mut payload = Vec::new();
    payload.extend_from_slice(&4u32.to_le_bytes());
    payload.extend_from_slice(&0u32.to_le_bytes());
    payload.extend_from_slice(&0u32.to_le_bytes());
    payload.extend_from_slice(&0xdeadbeefu32.to_le_bytes());
    let mut msg = request_bytes(5, loopback::TRANSFER, &payload);
    bridge::forward_to_module(&core, 9, &mut msg).unwrap();
    let (_, resp) = host.last();
    assert_eq!(MsgHeader::decode(&resp).unwrap().result, GB_OP_SUCCESS);
    assert_eq!(&resp[MSG_HEADER_SIZE..], &payload[..]);

    // Deactivation unbinds: the next ping has no driver to land in.
    let mut msg = request_bytes(6, control::BUNDLE_DEACTIVATE, &[2]);
    bridge::forward_to_module(&core, 7, &mut msg).unwrap();
    let (_, resp) = host.last();
    assert_eq!(&resp[MSG_HEADER_SIZE..], &[control::BUNDLE_PM_OK]);

    let before = host.sent().len();
    let mut msg = request_bytes(7, loopback::PING, &[]);
    assert!(matches!(
        bridge::forward_to_module(&core, 9, &mut msg),
        Err(Error::Invalid)
    ));
    assert_eq!(host.sent().len(), before);
}

#[test]
fn activating_an_unknown_bundle_is_refused() {
    let (core, host, intf_id) = bridge_with_module("badbundle");
    connect(&core, &host, intf_id, 7, 0, 1);

    let mut msg = request_bytes(2, control::BUNDLE_ACTIVATE, &[9]);
    bridge::forward_to_module(&core, 7, &mut msg).unwrap();
    let (_, resp) = host.last();
    // The control handler itself succeeded; the failure is in the status.
    assert_eq!(MsgHeader::decode(&resp).unwrap().result, GB_OP_SUCCESS);
    assert_eq!(&resp[MSG_HEADER_SIZE..], &[control::BUNDLE_PM_INVAL]);
}

#[test]
fn oversize_frame_does_not_stall_the_bridge() {
    let (core, host, intf_id) = bridge_with_module("oversize");
    connect(&core, &host, intf_id, 7, 0, 1);

    // A header announcing more than the MTU is rejected outright.
    let mut bad = request_bytes(2, control::VERSION, &[]);
    bad[0] = 0xff;
    bad[1] = 0xff;
    assert!(matches!(
        engine::handle_message(&core, AP_INTF_ID, SVC_CPORT, &bad),
        Err(Error::Overflow)
    ));

    // The next well-formed exchange still works.
    let mut msg = request_bytes(3, control::VERSION, &[]);
    bridge::forward_to_module(&core, 7, &mut msg).unwrap();
    let (_, resp) = host.last();
    assert_eq!(MsgHeader::decode(&resp).unwrap().result, GB_OP_SUCCESS);
}

#[test]
fn connection_destroy_tears_the_route_down() {
    let (core, host, intf_id) = bridge_with_module("destroy");
    connect(&core, &host, intf_id, 7, 0, 1);

    let mut payload = Vec::new();
    payload.push(AP_INTF_ID);
    payload.extend_from_slice(&7u16.to_le_bytes());
    payload.push(intf_id);
    payload.extend_from_slice(&0u16.to_le_bytes());
    let msg = request_bytes(2, svc::CONN_DESTROY, &payload);
    engine::handle_message(&core, AP_INTF_ID, SVC_CPORT, &msg).unwrap();
    let (_, resp) = host.last();
    assert_eq!(MsgHeader::decode(&resp).unwrap().result, GB_OP_SUCCESS);

    let mut msg = request_bytes(3, control::VERSION, &[]);
    assert!(matches!(
        bridge::forward_to_module(&core, 7, &mut msg),
        Err(Error::Invalid)
    ));
}
