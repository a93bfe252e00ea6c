//! Transport controllers and the interface records they own.
//!
//! A controller is one way of reaching modules (serial line, TCP/IP,
//! Bluetooth, simulator). It discovers modules, turns them into
//! interfaces, and moves bytes for the connections routed over it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use greybus::message::MTU;
use greybus::{Error, Result};

use crate::bridge::Core;
use crate::svc;

/// One transport provider. Hooks a transport does not need keep their
/// defaults; only `write` is mandatory.
pub trait Controller: Send + Sync {
    fn name(&self) -> &'static str;

    fn init(&self, _core: &Arc<Core>) -> Result<()> {
        Ok(())
    }

    fn exit(&self) {}

    /// Discovery loop, run on the controller's own thread until shutdown.
    fn event_loop(&self, _core: &Arc<Core>, _ctrl: &Arc<ControllerHandle>) -> Result<()> {
        Ok(())
    }

    /// Ask a blocking `event_loop` to wind down.
    fn event_loop_stop(&self) {}

    fn interface_create(&self, _intf: &Interface) -> Result<()> {
        Ok(())
    }

    fn interface_destroy(&self, _intf: &Interface) {}

    fn connection_create(&self, _core: &Arc<Core>, _conn: &Connection) -> Result<()> {
        Ok(())
    }

    fn connection_destroy(&self, _conn: &Connection) {}

    /// Ship one message to the module side of `conn`. Multiplexed stream
    /// transports stuff the module CPort id into the header pad first,
    /// which is why the buffer is mutable.
    fn write(&self, core: &Arc<Core>, conn: &Connection, msg: &mut [u8]) -> Result<()>;

    /// Stream transports: read one framed message into `buf`, returning
    /// the module CPort id and the message length.
    fn intf_read(&self, _intf: &Interface, _buf: &mut [u8]) -> Result<(u16, usize)> {
        Err(Error::Absent)
    }

    /// True when each interface is a single multiplexed byte stream that
    /// needs a reader thread pumping `intf_read`.
    fn is_stream(&self) -> bool {
        false
    }
}

/// A module attached through some controller.
pub struct Interface {
    pub id: u8,
    pub vendor_id: u32,
    pub product_id: u32,
    pub serial_id: u64,
    ctrl: Weak<ControllerHandle>,
    removed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Interface {
    pub fn controller(&self) -> Option<Arc<ControllerHandle>> {
        self.ctrl.upgrade()
    }

    pub fn removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }
}

/// A host CPort routed to a CPort on a module interface.
pub struct Connection {
    pub cport1_id: u16,
    pub cport2_id: u16,
    pub intf: Arc<Interface>,
}

/// A registered controller: the transport implementation plus the
/// interfaces and event-loop thread it owns.
pub struct ControllerHandle {
    imp: Box<dyn Controller>,
    interfaces: Mutex<Vec<Arc<Interface>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ControllerHandle {
    pub(crate) fn new(imp: Box<dyn Controller>) -> ControllerHandle {
        ControllerHandle {
            imp,
            interfaces: Mutex::new(Vec::new()),
            thread: Mutex::new(None),
        }
    }

    pub fn imp(&self) -> &dyn Controller {
        &*self.imp
    }

    pub fn name(&self) -> &'static str {
        self.imp.name()
    }

    pub fn interfaces(&self) -> Vec<Arc<Interface>> {
        self.interfaces.lock().unwrap().clone()
    }

    pub fn find_interface(&self, id: u8) -> Option<Arc<Interface>> {
        self.interfaces
            .lock()
            .unwrap()
            .iter()
            .find(|intf| intf.id == id)
            .cloned()
    }

    pub(crate) fn set_thread(&self, handle: JoinHandle<()>) {
        *self.thread.lock().unwrap() = Some(handle);
    }

    pub(crate) fn join_thread(&self) {
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// Create an interface on `ctrl` and start its reader when the transport
/// is stream-oriented. The interface is not announced to the host yet;
/// that is [`interface_hotplug`].
pub fn interface_create(
    core: &Arc<Core>,
    ctrl: &Arc<ControllerHandle>,
    vendor_id: u32,
    product_id: u32,
    serial_id: u64,
) -> Result<Arc<Interface>> {
    let id = core.alloc_intf_id()?;
    let intf = Arc::new(Interface {
        id,
        vendor_id,
        product_id,
        serial_id,
        ctrl: Arc::downgrade(ctrl),
        removed: AtomicBool::new(false),
        reader: Mutex::new(None),
    });

    ctrl.imp().interface_create(&intf)?;

    if ctrl.imp().is_stream() {
        let thread = {
            let core = core.clone();
            let intf = intf.clone();
            thread::Builder::new()
                .name(format!("gb-intf{}", id))
                .spawn(move || interface_recv(core, intf))
        };
        match thread {
            Ok(handle) => *intf.reader.lock().unwrap() = Some(handle),
            Err(e) => {
                ctrl.imp().interface_destroy(&intf);
                return Err(Error::Io(e));
            }
        }
    }

    ctrl.interfaces.lock().unwrap().push(intf.clone());
    log::info!("{}: created interface {}", ctrl.name(), id);
    Ok(intf)
}

/// Announce a freshly created interface to the host.
pub fn interface_hotplug(core: &Arc<Core>, intf: &Interface) -> Result<()> {
    svc::send_module_inserted(core, intf.id)
}

/// Tear an interface down: stop its reader, drop its routes, run the
/// controller hook and forget it.
pub fn interface_destroy(core: &Arc<Core>, intf: &Arc<Interface>) {
    intf.removed.store(true, Ordering::SeqCst);
    if let Some(handle) = intf.reader.lock().unwrap().take() {
        let _ = handle.join();
    }

    core.drop_interface_connections(intf.id);
    core.unregister_interface_drivers(intf.id);
    core.remove_manifest(intf.id);

    if let Some(ctrl) = intf.controller() {
        ctrl.interfaces.lock().unwrap().retain(|i| i.id != intf.id);
        ctrl.imp().interface_destroy(intf);
        log::info!("{}: destroyed interface {}", ctrl.name(), intf.id);
    }
}

/// Reader loop for stream-oriented transports: one framed message at a
/// time, forwarded to the host CPort its connection names.
fn interface_recv(core: Arc<Core>, intf: Arc<Interface>) {
    let ctrl = match intf.controller() {
        Some(ctrl) => ctrl,
        None => return,
    };
    let mut buf = vec![0u8; MTU];

    while !core.shutdown_requested() && !intf.removed() {
        let (cport_id, len) = match ctrl.imp().intf_read(&intf, &mut buf) {
            Ok(v) => v,
            Err(Error::Timeout) => continue,
            Err(Error::Overflow) => {
                log::error!("{}: dropping oversize message", ctrl.name());
                continue;
            }
            Err(e) => {
                log::error!(
                    "{}: failed to read from interface {}: {}",
                    ctrl.name(),
                    intf.id,
                    e
                );
                break;
            }
        };

        if let Err(e) = core.forward_to_host(intf.id, cport_id, &buf[..len]) {
            log::error!(
                "{}: failed to forward cport {} data to host: {}",
                ctrl.name(),
                cport_id,
                e
            );
        }
    }
}
