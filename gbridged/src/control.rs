//! Control protocol driver, registered on the control CPort of simulated
//! module interfaces. Physical modules answer their own control CPort;
//! the bridge only forwards to them.

use std::sync::Arc;

use greybus::manifest::{Cport, PROTOCOL_LOOPBACK};
use greybus::protocol::{control, payload_as, CPORT_SHUTDOWN};
use greybus::{Error, Result};

use crate::bridge::Core;
use crate::driver::{request, request_empty, request_unsupported, Driver};
use crate::engine::Operation;
use crate::loopback;

const VERSION_MAJOR: u8 = 0;
const VERSION_MINOR: u8 = 1;

/// CPort every module answers control traffic on.
pub const CONTROL_CPORT: u16 = 0;

static CONTROL_DRIVER: Driver = Driver {
    name: "control",
    operations: &[
        request_empty(CPORT_SHUTDOWN),
        request(control::VERSION, version_request),
        request_unsupported(control::PROBE_AP),
        request(control::GET_MANIFEST_SIZE, get_manifest_size_request),
        request(control::GET_MANIFEST, get_manifest_request),
        request_empty(control::CONNECTED),
        request_empty(control::DISCONNECTED),
        request_unsupported(control::TIMESYNC_ENABLE),
        request_unsupported(control::TIMESYNC_DISABLE),
        request_unsupported(control::TIMESYNC_AUTHORITATIVE),
        request_unsupported(control::BUNDLE_VERSION),
        request_empty(control::DISCONNECTING),
        request_unsupported(control::TIMESYNC_GET_LAST_EVENT),
        request_unsupported(control::MODE_SWITCH),
        request(control::BUNDLE_SUSPEND, bundle_suspend_request),
        request(control::BUNDLE_RESUME, bundle_resume_request),
        request(control::BUNDLE_DEACTIVATE, bundle_deactivate_request),
        request(control::BUNDLE_ACTIVATE, bundle_activate_request),
        request(control::INTF_SUSPEND_PREPARE, intf_pm_request),
        request(control::INTF_DEACTIVATE_PREPARE, intf_pm_request),
        request(control::INTF_HIBERNATE_ABORT, intf_pm_request),
    ],
};

/// Put the Control driver on an interface's control CPort.
pub fn register_driver(core: &Arc<Core>, intf_id: u8) -> Result<()> {
    core.register_driver(intf_id, CONTROL_CPORT, &CONTROL_DRIVER)
}

pub fn unregister_driver(core: &Arc<Core>, intf_id: u8) {
    core.unregister_driver(intf_id, CONTROL_CPORT);
}

fn version_request(_core: &Arc<Core>, op: &mut Operation) -> Result<()> {
    op.respond(&control::VersionResponse {
        major: VERSION_MAJOR,
        minor: VERSION_MINOR,
    })
}

fn get_manifest_size_request(core: &Arc<Core>, op: &mut Operation) -> Result<()> {
    let size = core.manifest_size(op.intf_id);
    op.respond(&control::GetManifestSizeResponse {
        size: size.to_le(),
    })
}

fn get_manifest_request(core: &Arc<Core>, op: &mut Operation) -> Result<()> {
    let blob = core.manifest_blob(op.intf_id).ok_or_else(|| {
        log::error!("no manifest for interface {}", op.intf_id);
        Error::Invalid
    })?;
    op.alloc_response(blob.len())?.copy_from_slice(&blob);
    Ok(())
}

fn bundle_suspend_request(_core: &Arc<Core>, op: &mut Operation) -> Result<()> {
    let req: &control::BundlePmRequest = payload_as(op.request_payload())?;
    log::debug!("suspend bundle {} on interface {}", req.bundle_id, op.intf_id);
    op.respond(&control::BundlePmResponse {
        status: control::BUNDLE_PM_OK,
    })
}

fn bundle_resume_request(_core: &Arc<Core>, op: &mut Operation) -> Result<()> {
    let req: &control::BundlePmRequest = payload_as(op.request_payload())?;
    log::debug!("resume bundle {} on interface {}", req.bundle_id, op.intf_id);
    op.respond(&control::BundlePmResponse {
        status: control::BUNDLE_PM_OK,
    })
}

fn bundle_activate_request(core: &Arc<Core>, op: &mut Operation) -> Result<()> {
    let req: &control::BundlePmRequest = payload_as(op.request_payload())?;
    let status = set_bundle_active(core, op.intf_id, req.bundle_id, true);
    op.respond(&control::BundlePmResponse { status })
}

fn bundle_deactivate_request(core: &Arc<Core>, op: &mut Operation) -> Result<()> {
    let req: &control::BundlePmRequest = payload_as(op.request_payload())?;
    let status = set_bundle_active(core, op.intf_id, req.bundle_id, false);
    op.respond(&control::BundlePmResponse { status })
}

fn intf_pm_request(_core: &Arc<Core>, op: &mut Operation) -> Result<()> {
    op.respond(&control::IntfPmResponse {
        status: control::INTF_PM_OK,
    })
}

/// Walk a bundle's CPorts and bind or unbind their protocol drivers.
fn set_bundle_active(core: &Arc<Core>, intf_id: u8, bundle_id: u8, activate: bool) -> u8 {
    let bundle = match core.manifest_bundle(intf_id, bundle_id) {
        Some(bundle) => bundle,
        None => {
            log::error!(
                "no bundle {} in the manifest of interface {}",
                bundle_id,
                intf_id
            );
            return control::BUNDLE_PM_INVAL;
        }
    };

    for cport in &bundle.cports {
        let ret = if activate {
            cport_enable(core, intf_id, cport)
        } else {
            cport_disable(core, intf_id, cport)
        };
        if ret.is_err() {
            log::error!(
                "failed to {} cport {} on interface {}",
                if activate { "activate" } else { "deactivate" },
                cport.id,
                intf_id
            );
            return control::BUNDLE_PM_INVAL;
        }
    }

    control::BUNDLE_PM_OK
}

fn cport_enable(core: &Arc<Core>, intf_id: u8, cport: &Cport) -> Result<()> {
    match cport.protocol_id {
        PROTOCOL_LOOPBACK => loopback::register_driver(core, intf_id, cport.id),
        other => {
            log::error!("unsupported protocol {:#04x}", other);
            Err(Error::Invalid)
        }
    }
}

fn cport_disable(core: &Arc<Core>, intf_id: u8, cport: &Cport) -> Result<()> {
    match cport.protocol_id {
        PROTOCOL_LOOPBACK => {
            loopback::unregister_driver(core, intf_id, cport.id);
            Ok(())
        }
        other => {
            log::error!("unsupported protocol {:#04x}", other);
            Err(Error::Invalid)
        }
    }
}
