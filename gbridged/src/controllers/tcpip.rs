//! TCP/IP controller: modules advertise `_greybus._tcp` over mDNS and
//! expose one TCP socket per CPort at `advertised_port + cport_id`, so no
//! header multiplexing is needed.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};

use greybus::message::{read_msg, MTU};
use greybus::{Error, Result};

use crate::bridge::Core;
use crate::controller::{
    interface_create, interface_destroy, interface_hotplug, Connection, Controller,
    ControllerHandle, Interface,
};

const SERVICE_TYPE: &str = "_greybus._tcp.local.";
const EVENT_POLL: Duration = Duration::from_millis(500);
const READ_TIMEOUT: Duration = Duration::from_millis(500);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const CONNECT_RETRIES: u32 = 10;

struct TcpIpDevice {
    addr: IpAddr,
    port: u16,
}

struct Inner {
    mdns: Mutex<Option<ServiceDaemon>>,
    devices: Mutex<HashMap<u8, TcpIpDevice>>,
    conns: Mutex<HashMap<u16, TcpStream>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    seen: Mutex<HashSet<String>>,
}

pub struct TcpIpController {
    inner: Arc<Inner>,
}

impl TcpIpController {
    pub fn new() -> TcpIpController {
        TcpIpController {
            inner: Arc::new(Inner {
                mdns: Mutex::new(None),
                devices: Mutex::new(HashMap::new()),
                conns: Mutex::new(HashMap::new()),
                readers: Mutex::new(Vec::new()),
                seen: Mutex::new(HashSet::new()),
            }),
        }
    }

    fn hotplug(&self, core: &Arc<Core>, ctrl: &Arc<ControllerHandle>, info: &ServiceInfo) {
        let fullname = info.get_fullname().to_string();
        if !self.inner.seen.lock().unwrap().insert(fullname.clone()) {
            return;
        }

        let addresses = info.get_addresses();
        let addr = match addresses
            .iter()
            .copied()
            .find(|a| a.is_ipv4())
            .or_else(|| addresses.iter().copied().next())
        {
            Some(addr) => addr,
            None => {
                log::error!("{} resolved without an address", fullname);
                self.inner.seen.lock().unwrap().remove(&fullname);
                return;
            }
        };
        let port = info.get_port();
        log::info!("found module {} at {}:{}", fullname, addr, port);

        let intf = match interface_create(core, ctrl, 1, 1, 0x1234) {
            Ok(intf) => intf,
            Err(e) => {
                log::error!("failed to create TCP/IP interface: {}", e);
                self.inner.seen.lock().unwrap().remove(&fullname);
                return;
            }
        };
        self.inner
            .devices
            .lock()
            .unwrap()
            .insert(intf.id, TcpIpDevice { addr, port });

        if let Err(e) = interface_hotplug(core, &intf) {
            log::error!("failed to hotplug TCP/IP module: {}", e);
            interface_destroy(core, &intf);
            self.inner.seen.lock().unwrap().remove(&fullname);
        }
    }
}

/// Per-connection reader pumping module frames up to the host. The CPort
/// is implied by the socket, so the pad trick is not used here.
fn connection_recv(core: Arc<Core>, intf: Arc<Interface>, cport2_id: u16, mut stream: TcpStream) {
    let mut buf = vec![0u8; MTU];
    while !core.shutdown_requested() && !intf.removed() {
        let len = match read_msg(&mut stream, &mut buf) {
            Ok(len) => len,
            Err(Error::Timeout) => continue,
            Err(Error::Overflow) => {
                log::error!("tcpip: dropping oversize message on cport {}", cport2_id);
                continue;
            }
            Err(e) => {
                log::debug!("tcpip: reader for cport {} finished: {}", cport2_id, e);
                break;
            }
        };
        if let Err(e) = core.forward_to_host(intf.id, cport2_id, &buf[..len]) {
            log::error!(
                "tcpip: failed to forward cport {} data to host: {}",
                cport2_id,
                e
            );
        }
    }
}

impl Controller for TcpIpController {
    fn name(&self) -> &'static str {
        "tcpip"
    }

    fn init(&self, _core: &Arc<Core>) -> Result<()> {
        let mdns = ServiceDaemon::new().map_err(|e| {
            log::error!("failed to start mDNS browsing: {}", e);
            Error::Absent
        })?;
        *self.inner.mdns.lock().unwrap() = Some(mdns);
        Ok(())
    }

    fn event_loop(&self, core: &Arc<Core>, ctrl: &Arc<ControllerHandle>) -> Result<()> {
        let receiver = {
            let guard = self.inner.mdns.lock().unwrap();
            let mdns = guard.as_ref().ok_or(Error::Absent)?;
            mdns.browse(SERVICE_TYPE).map_err(|e| {
                log::error!("failed to browse {}: {}", SERVICE_TYPE, e);
                Error::Absent
            })?
        };

        while !core.shutdown_requested() {
            match receiver.recv_timeout(EVENT_POLL) {
                Ok(ServiceEvent::ServiceResolved(info)) => self.hotplug(core, ctrl, &info),
                Ok(_) => {}
                Err(_) => {
                    // Either a poll timeout or the daemon went away under
                    // event_loop_stop; only the latter ends the loop.
                    if self.inner.mdns.lock().unwrap().is_none() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn event_loop_stop(&self) {
        if let Some(mdns) = self.inner.mdns.lock().unwrap().take() {
            let _ = mdns.shutdown();
        }
    }

    fn exit(&self) {
        for handle in self.inner.readers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }

    fn interface_destroy(&self, intf: &Interface) {
        self.inner.devices.lock().unwrap().remove(&intf.id);
    }

    fn connection_create(&self, core: &Arc<Core>, conn: &Connection) -> Result<()> {
        let target = {
            let devices = self.inner.devices.lock().unwrap();
            let device = devices.get(&conn.intf.id).ok_or(Error::Invalid)?;
            let port = device.port.checked_add(conn.cport2_id).ok_or(Error::Invalid)?;
            SocketAddr::new(device.addr, port)
        };

        log::info!("trying to connect to module at {}", target);
        let mut stream = None;
        for _ in 0..CONNECT_RETRIES {
            if core.shutdown_requested() {
                return Err(Error::Interrupted);
            }
            match TcpStream::connect_timeout(&target, CONNECT_TIMEOUT) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    log::warn!("connect to {} failed: {}", target, e);
                    thread::sleep(Duration::from_secs(1));
                }
            }
        }
        let stream = stream.ok_or_else(|| {
            log::error!("giving up connecting to {}", target);
            Error::Retry
        })?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        stream.set_nodelay(true)?;
        log::info!("connected to module at {}", target);

        let reader = stream.try_clone()?;
        let handle = {
            let core = core.clone();
            let intf = conn.intf.clone();
            let cport2_id = conn.cport2_id;
            thread::Builder::new()
                .name(format!("gb-tcp-cport{}", conn.cport1_id))
                .spawn(move || connection_recv(core, intf, cport2_id, reader))
                .map_err(Error::Io)?
        };

        self.inner.readers.lock().unwrap().push(handle);
        self.inner
            .conns
            .lock()
            .unwrap()
            .insert(conn.cport1_id, stream);
        Ok(())
    }

    fn connection_destroy(&self, conn: &Connection) {
        if let Some(stream) = self.inner.conns.lock().unwrap().remove(&conn.cport1_id) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn write(&self, _core: &Arc<Core>, conn: &Connection, msg: &mut [u8]) -> Result<()> {
        let conns = self.inner.conns.lock().unwrap();
        let mut stream = conns.get(&conn.cport1_id).ok_or(Error::Invalid)?;
        stream.write_all(msg)?;
        Ok(())
    }
}

impl Default for TcpIpController {
    fn default() -> Self {
        Self::new()
    }
}
