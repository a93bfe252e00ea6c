//! Operation type numbers, result codes and payload layouts.
//!
//! The numbering is the header-level enumeration derived from the Greybus
//! specification. Payload structures are `#[repr(C, packed)]` mirrors of
//! the wire layout; multi-byte fields hold little-endian values, so go
//! through `u16::from_le`/`to_le` (and friends) when touching them.

use crate::{Error, Result};

/// Operation result codes carried in the header's `result` byte.
pub const GB_OP_SUCCESS: u8 = 0x00;
pub const GB_OP_INTERRUPTED: u8 = 0x01;
pub const GB_OP_TIMEOUT: u8 = 0x02;
pub const GB_OP_NO_MEMORY: u8 = 0x03;
pub const GB_OP_PROTOCOL_BAD: u8 = 0x04;
pub const GB_OP_OVERFLOW: u8 = 0x05;
pub const GB_OP_INVALID: u8 = 0x06;
pub const GB_OP_RETRY: u8 = 0x07;
pub const GB_OP_NONEXISTENT: u8 = 0x08;
pub const GB_OP_UNKNOWN_ERROR: u8 = 0xfe;

/// Shutdown request understood by every CPort, whatever its protocol.
pub const CPORT_SHUTDOWN: u8 = 0x00;

/// Borrow a message payload as a packed wire structure.
///
/// Fails with `Protocol` when the payload is shorter than the structure;
/// trailing bytes are allowed (several layouts end in data the caller
/// slices off separately).
pub fn payload_as<T: plain::Plain>(payload: &[u8]) -> Result<&T> {
    plain::from_bytes(payload).map_err(|_| Error::Protocol)
}

/// SVC protocol (CPort 0 of the AP interface).
pub mod svc {
    /// Operation types.
    pub const INTF_DEVICE_ID: u8 = 0x03;
    pub const INTF_RESET: u8 = 0x06;
    pub const CONN_CREATE: u8 = 0x07;
    pub const CONN_DESTROY: u8 = 0x08;
    pub const DME_PEER_GET: u8 = 0x09;
    pub const DME_PEER_SET: u8 = 0x0a;
    pub const ROUTE_CREATE: u8 = 0x0b;
    pub const ROUTE_DESTROY: u8 = 0x0c;
    pub const TIMESYNC_ENABLE: u8 = 0x0d;
    pub const TIMESYNC_DISABLE: u8 = 0x0e;
    pub const TIMESYNC_AUTHORITATIVE: u8 = 0x0f;
    pub const INTF_SET_PWRM: u8 = 0x10;
    pub const INTF_EJECT: u8 = 0x11;
    pub const PING: u8 = 0x13;
    pub const PWRMON_RAIL_COUNT_GET: u8 = 0x14;
    pub const PWRMON_RAIL_NAMES_GET: u8 = 0x15;
    pub const PWRMON_SAMPLE_GET: u8 = 0x16;
    pub const PWRMON_INTF_SAMPLE_GET: u8 = 0x17;
    pub const TIMESYNC_WAKE_PINS_ACQUIRE: u8 = 0x18;
    pub const TIMESYNC_WAKE_PINS_RELEASE: u8 = 0x19;
    pub const TIMESYNC_PING: u8 = 0x1a;
    pub const MODULE_INSERTED: u8 = 0x1f;
    pub const MODULE_REMOVED: u8 = 0x20;
    pub const INTF_VSYS_ENABLE: u8 = 0x21;
    pub const INTF_VSYS_DISABLE: u8 = 0x22;
    pub const INTF_REFCLK_ENABLE: u8 = 0x23;
    pub const INTF_REFCLK_DISABLE: u8 = 0x24;
    pub const INTF_UNIPRO_ENABLE: u8 = 0x25;
    pub const INTF_UNIPRO_DISABLE: u8 = 0x26;
    pub const INTF_ACTIVATE: u8 = 0x27;
    pub const INTF_RESUME: u8 = 0x28;
    pub const INTF_MAILBOX_EVENT: u8 = 0x29;
    pub const INTF_OOPS: u8 = 0x2a;
    pub const PROTOCOL_VERSION: u8 = 0x7d;
    pub const SVC_HELLO: u8 = 0x7f;

    /// Status byte reported in SVC responses that carry one.
    pub const OP_SUCCESS: u8 = 0x00;

    pub const INTF_TYPE_UNKNOWN: u8 = 0x00;
    pub const INTF_TYPE_DUMMY: u8 = 0x01;
    pub const INTF_TYPE_UNIPRO: u8 = 0x02;
    pub const INTF_TYPE_GREYBUS: u8 = 0x03;

    pub const VSYS_OK: u8 = 0x00;
    pub const REFCLK_OK: u8 = 0x00;
    pub const UNIPRO_OK: u8 = 0x00;

    pub const SETPWRM_PWR_OK: u8 = 0x00;
    pub const SETPWRM_PWR_LOCAL: u8 = 0x01;

    /// UniPro power mode requesting hibernation.
    pub const UNIPRO_HIBERNATE_MODE: u8 = 0x11;

    #[repr(C, packed)]
    #[derive(Clone, Copy, Debug, Default)]
    pub struct VersionResponse {
        pub major: u8,
        pub minor: u8,
    }
    unsafe impl plain::Plain for VersionResponse {}

    #[repr(C, packed)]
    #[derive(Clone, Copy, Debug, Default)]
    pub struct HelloRequest {
        pub endo_id: u16,
        pub interface_id: u8,
    }
    unsafe impl plain::Plain for HelloRequest {}

    #[repr(C, packed)]
    #[derive(Clone, Copy, Debug, Default)]
    pub struct ConnCreateRequest {
        pub intf1_id: u8,
        pub cport1_id: u16,
        pub intf2_id: u8,
        pub cport2_id: u16,
        pub tc: u8,
        pub flags: u8,
    }
    unsafe impl plain::Plain for ConnCreateRequest {}

    #[repr(C, packed)]
    #[derive(Clone, Copy, Debug, Default)]
    pub struct ConnDestroyRequest {
        pub intf1_id: u8,
        pub cport1_id: u16,
        pub intf2_id: u8,
        pub cport2_id: u16,
    }
    unsafe impl plain::Plain for ConnDestroyRequest {}

    #[repr(C, packed)]
    #[derive(Clone, Copy, Debug, Default)]
    pub struct DmePeerGetResponse {
        pub result_code: u16,
        pub attr_value: u32,
    }
    unsafe impl plain::Plain for DmePeerGetResponse {}

    #[repr(C, packed)]
    #[derive(Clone, Copy, Debug, Default)]
    pub struct DmePeerSetResponse {
        pub result_code: u16,
    }
    unsafe impl plain::Plain for DmePeerSetResponse {}

    #[repr(C, packed)]
    #[derive(Clone, Copy, Debug, Default)]
    pub struct IntfVsysResponse {
        pub result_code: u8,
    }
    unsafe impl plain::Plain for IntfVsysResponse {}

    #[repr(C, packed)]
    #[derive(Clone, Copy, Debug, Default)]
    pub struct IntfRefclkResponse {
        pub result_code: u8,
    }
    unsafe impl plain::Plain for IntfRefclkResponse {}

    #[repr(C, packed)]
    #[derive(Clone, Copy, Debug, Default)]
    pub struct IntfUniproResponse {
        pub result_code: u8,
    }
    unsafe impl plain::Plain for IntfUniproResponse {}

    #[repr(C, packed)]
    #[derive(Clone, Copy, Debug, Default)]
    pub struct IntfActivateResponse {
        pub status: u8,
        pub intf_type: u8,
    }
    unsafe impl plain::Plain for IntfActivateResponse {}

    #[repr(C, packed)]
    #[derive(Clone, Copy, Debug, Default)]
    pub struct IntfResumeResponse {
        pub status: u8,
    }
    unsafe impl plain::Plain for IntfResumeResponse {}

    /// Leading fields of the set-power-mode request. The full request
    /// continues with gear/lane tuning and L2 timer configuration the
    /// bridge has no use for, so only the prefix is mapped.
    #[repr(C, packed)]
    #[derive(Clone, Copy, Debug, Default)]
    pub struct IntfSetPwrmRequest {
        pub intf_id: u8,
        pub hs_series: u8,
        pub tx_mode: u8,
        pub tx_gear: u8,
        pub tx_nlanes: u8,
        pub tx_amplitude: u8,
        pub tx_hs_equalizer: u8,
        pub rx_mode: u8,
    }
    unsafe impl plain::Plain for IntfSetPwrmRequest {}

    #[repr(C, packed)]
    #[derive(Clone, Copy, Debug, Default)]
    pub struct IntfSetPwrmResponse {
        pub result_code: u8,
    }
    unsafe impl plain::Plain for IntfSetPwrmResponse {}

    #[repr(C, packed)]
    #[derive(Clone, Copy, Debug, Default)]
    pub struct PwrmonRailCountGetResponse {
        pub rail_count: u8,
    }
    unsafe impl plain::Plain for PwrmonRailCountGetResponse {}

    #[repr(C, packed)]
    #[derive(Clone, Copy, Debug, Default)]
    pub struct ModuleInsertedRequest {
        pub primary_intf_id: u8,
        pub intf_count: u8,
        pub flags: u16,
    }
    unsafe impl plain::Plain for ModuleInsertedRequest {}
}

/// Control protocol (CPort 0 of every module interface).
pub mod control {
    pub const VERSION: u8 = 0x01;
    pub const PROBE_AP: u8 = 0x02;
    pub const GET_MANIFEST_SIZE: u8 = 0x03;
    pub const GET_MANIFEST: u8 = 0x04;
    pub const CONNECTED: u8 = 0x05;
    pub const DISCONNECTED: u8 = 0x06;
    pub const TIMESYNC_ENABLE: u8 = 0x07;
    pub const TIMESYNC_DISABLE: u8 = 0x08;
    pub const TIMESYNC_AUTHORITATIVE: u8 = 0x09;
    pub const BUNDLE_VERSION: u8 = 0x0a;
    pub const DISCONNECTING: u8 = 0x0b;
    pub const TIMESYNC_GET_LAST_EVENT: u8 = 0x0c;
    pub const MODE_SWITCH: u8 = 0x0e;
    pub const BUNDLE_SUSPEND: u8 = 0x0f;
    pub const BUNDLE_RESUME: u8 = 0x10;
    pub const BUNDLE_DEACTIVATE: u8 = 0x11;
    pub const BUNDLE_ACTIVATE: u8 = 0x12;
    pub const INTF_SUSPEND_PREPARE: u8 = 0x13;
    pub const INTF_DEACTIVATE_PREPARE: u8 = 0x14;
    pub const INTF_HIBERNATE_ABORT: u8 = 0x15;

    pub const BUNDLE_PM_OK: u8 = 0x00;
    pub const BUNDLE_PM_INVAL: u8 = 0x01;
    pub const BUNDLE_PM_BUSY: u8 = 0x02;
    pub const BUNDLE_PM_FAIL: u8 = 0x03;
    pub const BUNDLE_PM_NA: u8 = 0x04;

    pub const INTF_PM_OK: u8 = 0x00;
    pub const INTF_PM_BUSY: u8 = 0x01;
    pub const INTF_PM_FAIL: u8 = 0x02;

    #[repr(C, packed)]
    #[derive(Clone, Copy, Debug, Default)]
    pub struct VersionResponse {
        pub major: u8,
        pub minor: u8,
    }
    unsafe impl plain::Plain for VersionResponse {}

    #[repr(C, packed)]
    #[derive(Clone, Copy, Debug, Default)]
    pub struct GetManifestSizeResponse {
        pub size: u16,
    }
    unsafe impl plain::Plain for GetManifestSizeResponse {}

    #[repr(C, packed)]
    #[derive(Clone, Copy, Debug, Default)]
    pub struct BundlePmRequest {
        pub bundle_id: u8,
    }
    unsafe impl plain::Plain for BundlePmRequest {}

    #[repr(C, packed)]
    #[derive(Clone, Copy, Debug, Default)]
    pub struct BundlePmResponse {
        pub status: u8,
    }
    unsafe impl plain::Plain for BundlePmResponse {}

    #[repr(C, packed)]
    #[derive(Clone, Copy, Debug, Default)]
    pub struct IntfPmResponse {
        pub status: u8,
    }
    unsafe impl plain::Plain for IntfPmResponse {}
}

/// Loopback test protocol.
pub mod loopback {
    pub const PING: u8 = 0x02;
    pub const TRANSFER: u8 = 0x03;
    pub const SINK: u8 = 0x04;

    /// Fixed part of both the transfer request and response; the echoed
    /// data follows on the wire.
    #[repr(C, packed)]
    #[derive(Clone, Copy, Debug, Default)]
    pub struct TransferHeader {
        pub len: u32,
        pub reserved0: u32,
        pub reserved1: u32,
    }
    unsafe impl plain::Plain for TransferHeader {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn payload_layouts_match_the_wire() {
        assert_eq!(size_of::<svc::HelloRequest>(), 3);
        assert_eq!(size_of::<svc::ConnCreateRequest>(), 8);
        assert_eq!(size_of::<svc::ConnDestroyRequest>(), 6);
        assert_eq!(size_of::<svc::DmePeerGetResponse>(), 6);
        assert_eq!(size_of::<svc::IntfActivateResponse>(), 2);
        assert_eq!(size_of::<svc::ModuleInsertedRequest>(), 4);
        assert_eq!(size_of::<control::GetManifestSizeResponse>(), 2);
        assert_eq!(size_of::<loopback::TransferHeader>(), 12);
    }

    #[test]
    fn payload_as_checks_length() {
        let bytes = [0x55u8, 0x47, 0x00];
        let hello: &svc::HelloRequest = payload_as(&bytes).unwrap();
        assert_eq!(u16::from_le(hello.endo_id), 0x4755);
        assert_eq!(hello.interface_id, 0);

        let short = [0x55u8, 0x47];
        assert!(payload_as::<svc::HelloRequest>(&short).is_err());
    }
}
