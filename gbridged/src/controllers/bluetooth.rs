//! Bluetooth controller: periodic HCI inquiry for devices advertising a
//! `GREYBUS` name, reached over an RFCOMM stream on channel 1. Like the
//! serial transport, all CPorts of a module share the one stream with the
//! CPort id in the header pad.

use std::collections::HashMap;
use std::ffi::CStr;
use std::fs::File;
use std::io::{self, Write};
use std::mem;
use std::os::raw::{c_char, c_int, c_long};
use std::os::unix::io::FromRawFd;
use std::ptr;
use std::sync::{Arc, Mutex};

use libbluetooth::{
    bdaddr_t, hci_close_dev, hci_get_route, hci_inquiry, hci_open_dev, hci_read_remote_name,
    inquiry_info, sockaddr_rc, BTPROTO_RFCOMM, IREQ_CACHE_FLUSH,
};

use greybus::message::{cport_pack, cport_unpack, read_msg};
use greybus::{Error, Result};

use crate::bridge::Core;
use crate::controller::{
    interface_create, interface_destroy, interface_hotplug, Connection, Controller,
    ControllerHandle, Interface,
};

const RFCOMM_CHANNEL: u8 = 1;
const INQUIRY_LEN: c_int = 8;
const MAX_RSP: usize = 255;
const NAME_SIZE: usize = 248;
const MAX_SCAN_FAILURES: u32 = 5;

struct HciSession {
    dev_id: c_int,
    sock: c_int,
}

struct BtDevice {
    addr: String,
    stream: File,
}

struct Inner {
    hci: Mutex<Option<HciSession>>,
    devices: Mutex<HashMap<u8, Arc<BtDevice>>>,
}

pub struct BluetoothController {
    inner: Arc<Inner>,
}

impl BluetoothController {
    pub fn new() -> BluetoothController {
        BluetoothController {
            inner: Arc::new(Inner {
                hci: Mutex::new(None),
                devices: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn is_connected(&self, addr: &str) -> bool {
        self.inner
            .devices
            .lock()
            .unwrap()
            .values()
            .any(|dev| dev.addr == addr)
    }

    fn device(&self, intf_id: u8) -> Result<Arc<BtDevice>> {
        self.inner
            .devices
            .lock()
            .unwrap()
            .get(&intf_id)
            .cloned()
            .ok_or(Error::Absent)
    }

    fn connect(
        &self,
        core: &Arc<Core>,
        ctrl: &Arc<ControllerHandle>,
        bdaddr: &bdaddr_t,
        addr: String,
    ) {
        log::info!("connecting a new greybus device at {}", addr);
        let stream = match rfcomm_connect(bdaddr) {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("rfcomm connect to {} failed: {}", addr, e);
                return;
            }
        };

        let intf = match interface_create(core, ctrl, 1, 1, 0x1234) {
            Ok(intf) => intf,
            Err(e) => {
                log::error!("failed to create bluetooth interface: {}", e);
                return;
            }
        };
        self.inner
            .devices
            .lock()
            .unwrap()
            .insert(intf.id, Arc::new(BtDevice { addr, stream }));

        if let Err(e) = interface_hotplug(core, &intf) {
            log::error!("failed to hotplug bluetooth module: {}", e);
            interface_destroy(core, &intf);
        } else {
            log::info!("greybus device connected as interface {}", intf.id);
        }
    }
}

fn ba2str(bdaddr: &bdaddr_t) -> String {
    let b = bdaddr.b;
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        b[5], b[4], b[3], b[2], b[1], b[0]
    )
}

fn remote_name(hci_sock: c_int, bdaddr: &bdaddr_t) -> String {
    let mut name = [0 as c_char; NAME_SIZE];
    let mut bdaddr = *bdaddr;
    let rc = unsafe {
        hci_read_remote_name(
            hci_sock,
            &mut bdaddr,
            NAME_SIZE as c_int,
            name.as_mut_ptr(),
            0,
        )
    };
    if rc < 0 {
        return "[unknown]".to_string();
    }
    unsafe { CStr::from_ptr(name.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

fn rfcomm_connect(bdaddr: &bdaddr_t) -> io::Result<File> {
    let fd = unsafe { libc::socket(libc::AF_BLUETOOTH, libc::SOCK_STREAM, BTPROTO_RFCOMM as c_int) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut addr: sockaddr_rc = unsafe { mem::zeroed() };
    addr.rc_family = libc::AF_BLUETOOTH as libc::sa_family_t;
    addr.rc_bdaddr = *bdaddr;
    addr.rc_channel = RFCOMM_CHANNEL;

    let rc = unsafe {
        libc::connect(
            fd,
            &addr as *const sockaddr_rc as *const libc::sockaddr,
            mem::size_of::<sockaddr_rc>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let e = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(e);
    }

    // Bounded reads so the reader thread can poll its shutdown flag.
    let tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 500_000,
    };
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &tv as *const libc::timeval as *const libc::c_void,
            mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let e = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(e);
    }

    Ok(unsafe { File::from_raw_fd(fd) })
}

impl Controller for BluetoothController {
    fn name(&self) -> &'static str {
        "bluetooth"
    }

    fn init(&self, _core: &Arc<Core>) -> Result<()> {
        let dev_id = unsafe { hci_get_route(ptr::null_mut()) };
        if dev_id < 0 {
            log::error!("no bluetooth adapter available");
            return Err(Error::Absent);
        }
        let sock = unsafe { hci_open_dev(dev_id) };
        if sock < 0 {
            log::error!(
                "failed to open hci device {}: {}",
                dev_id,
                io::Error::last_os_error()
            );
            return Err(Error::Absent);
        }
        *self.inner.hci.lock().unwrap() = Some(HciSession { dev_id, sock });
        Ok(())
    }

    fn exit(&self) {
        self.inner.devices.lock().unwrap().clear();
        if let Some(session) = self.inner.hci.lock().unwrap().take() {
            unsafe { hci_close_dev(session.sock) };
        }
    }

    fn event_loop(&self, core: &Arc<Core>, ctrl: &Arc<ControllerHandle>) -> Result<()> {
        let (dev_id, hci_sock) = {
            let guard = self.inner.hci.lock().unwrap();
            let session = guard.as_ref().ok_or(Error::Absent)?;
            (session.dev_id, session.sock)
        };

        let mut infos: Vec<inquiry_info> = vec![unsafe { mem::zeroed() }; MAX_RSP];
        let mut failures = 0u32;

        while !core.shutdown_requested() {
            let mut ii = infos.as_mut_ptr();
            let num_rsp = unsafe {
                hci_inquiry(
                    dev_id,
                    INQUIRY_LEN,
                    MAX_RSP as c_int,
                    ptr::null(),
                    &mut ii,
                    IREQ_CACHE_FLUSH as c_long,
                )
            };
            if num_rsp < 0 {
                failures += 1;
                log::warn!(
                    "hci inquiry failed ({} in a row): {}",
                    failures,
                    io::Error::last_os_error()
                );
                if failures >= MAX_SCAN_FAILURES {
                    log::error!("bluetooth scanning is persistently failing, giving up");
                    return Err(Error::Io(io::Error::last_os_error()));
                }
                continue;
            }
            failures = 0;

            for info in &infos[..num_rsp as usize] {
                let addr = ba2str(&info.bdaddr);
                let name = remote_name(hci_sock, &info.bdaddr);
                if name.contains("GREYBUS") && !self.is_connected(&addr) {
                    self.connect(core, ctrl, &info.bdaddr, addr);
                }
            }
        }
        Ok(())
    }

    fn interface_destroy(&self, intf: &Interface) {
        self.inner.devices.lock().unwrap().remove(&intf.id);
    }

    fn write(&self, _core: &Arc<Core>, conn: &Connection, msg: &mut [u8]) -> Result<()> {
        cport_pack(msg, conn.cport2_id);
        let device = self.device(conn.intf.id)?;
        let mut stream = &device.stream;
        stream.write_all(msg)?;
        Ok(())
    }

    fn intf_read(&self, intf: &Interface, buf: &mut [u8]) -> Result<(u16, usize)> {
        let device = self.device(intf.id)?;
        let mut stream = &device.stream;
        let len = read_msg(&mut stream, buf)?;
        Ok((cport_unpack(&buf[..len]), len))
    }

    fn is_stream(&self) -> bool {
        true
    }
}

impl Default for BluetoothController {
    fn default() -> Self {
        Self::new()
    }
}
