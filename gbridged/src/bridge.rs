//! The bridge core: every registry the daemon needs, passed explicitly
//! into handlers instead of living in globals, plus the routing between
//! host CPorts and module CPorts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use once_cell::sync::OnceCell;

use greybus::manifest::{Bundle, Manifest};
use greybus::{Error, Result, AP_INTF_ID};

use crate::controller::{Connection, Controller, ControllerHandle, Interface};
use crate::driver::Driver;
use crate::engine::OperationTable;
use crate::logging::hexdump;
use crate::svc::BootstrapState;

/// Byte pipe to the host kernel. The production implementation is the
/// generic netlink adapter; tests plug in an in-memory one.
pub trait HostTransport: Send + Sync {
    /// Ship one Greybus message to the host on `cport_id`.
    fn send(&self, cport_id: u16, msg: &[u8]) -> Result<()>;
}

/// Shared state of one bridge instance.
pub struct Core {
    pub ops: OperationTable,
    drivers: Mutex<HashMap<(u8, u16), &'static Driver>>,
    connections: Mutex<Vec<Arc<Connection>>>,
    controllers: Mutex<Vec<Arc<ControllerHandle>>>,
    manifests: Mutex<HashMap<u8, Manifest>>,
    svc_state: Mutex<BootstrapState>,
    next_intf_id: Mutex<u8>,
    host: OnceCell<Arc<dyn HostTransport>>,
    shutdown: AtomicBool,
}

impl Core {
    pub fn new() -> Arc<Core> {
        Arc::new(Core {
            ops: OperationTable::new(),
            drivers: Mutex::new(HashMap::new()),
            connections: Mutex::new(Vec::new()),
            controllers: Mutex::new(Vec::new()),
            manifests: Mutex::new(HashMap::new()),
            svc_state: Mutex::new(BootstrapState::Init),
            next_intf_id: Mutex::new(0),
            host: OnceCell::new(),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn set_host(&self, host: Arc<dyn HostTransport>) {
        if self.host.set(host).is_err() {
            log::warn!("host transport is already set");
        }
    }

    fn host(&self) -> Result<&Arc<dyn HostTransport>> {
        self.host.get().ok_or(Error::Absent)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn svc_state(&self) -> MutexGuard<'_, BootstrapState> {
        self.svc_state.lock().unwrap()
    }

    /// Current SVC bootstrap state, for observers.
    pub fn svc_bootstrap_state(&self) -> BootstrapState {
        *self.svc_state.lock().unwrap()
    }

    /// Allocate the next interface id. Ids are handed out contiguously
    /// from 1; id 0 belongs to the AP.
    pub(crate) fn alloc_intf_id(&self) -> Result<u8> {
        let mut next = self.next_intf_id.lock().unwrap();
        if *next == u8::MAX {
            log::error!("out of interface ids");
            return Err(Error::NoMemory);
        }
        *next += 1;
        Ok(*next)
    }

    /// Register `driver` on (interface, CPort). Fails with `Invalid` when
    /// the slot is taken or the driver's operation table is not strictly
    /// increasing by type.
    pub fn register_driver(
        &self,
        intf_id: u8,
        cport_id: u16,
        driver: &'static Driver,
    ) -> Result<()> {
        driver.validate()?;

        let mut drivers = self.drivers.lock().unwrap();
        if drivers.contains_key(&(intf_id, cport_id)) {
            log::error!(
                "a driver is already registered for interface {} cport {}",
                intf_id,
                cport_id
            );
            return Err(Error::Invalid);
        }
        drivers.insert((intf_id, cport_id), driver);
        Ok(())
    }

    pub fn unregister_driver(&self, intf_id: u8, cport_id: u16) {
        self.drivers.lock().unwrap().remove(&(intf_id, cport_id));
    }

    pub(crate) fn unregister_interface_drivers(&self, intf_id: u8) {
        self.drivers
            .lock()
            .unwrap()
            .retain(|(intf, _), _| *intf != intf_id);
    }

    pub fn driver(&self, intf_id: u8, cport_id: u16) -> Option<&'static Driver> {
        self.drivers.lock().unwrap().get(&(intf_id, cport_id)).copied()
    }

    pub fn add_manifest(&self, manifest: Manifest) {
        self.manifests.lock().unwrap().insert(manifest.intf_id, manifest);
    }

    pub fn remove_manifest(&self, intf_id: u8) {
        self.manifests.lock().unwrap().remove(&intf_id);
    }

    /// Manifest size for an interface; 0 when none is known.
    pub fn manifest_size(&self, intf_id: u8) -> u16 {
        self.manifests
            .lock()
            .unwrap()
            .get(&intf_id)
            .map(|m| m.size())
            .unwrap_or(0)
    }

    pub fn manifest_blob(&self, intf_id: u8) -> Option<Vec<u8>> {
        self.manifests
            .lock()
            .unwrap()
            .get(&intf_id)
            .map(|m| m.blob().to_vec())
    }

    pub fn manifest_bundle(&self, intf_id: u8, bundle_id: u8) -> Option<Bundle> {
        self.manifests
            .lock()
            .unwrap()
            .get(&intf_id)
            .and_then(|m| m.bundle(bundle_id).cloned())
    }

    pub fn find_interface(&self, intf_id: u8) -> Option<Arc<Interface>> {
        let controllers = self.controllers.lock().unwrap();
        controllers
            .iter()
            .find_map(|ctrl| ctrl.find_interface(intf_id))
    }

    pub fn connection_by_host_cport(&self, cport1_id: u16) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .find(|conn| conn.cport1_id == cport1_id)
            .cloned()
    }

    fn connection_by_module_cport(&self, intf_id: u8, cport2_id: u16) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .find(|conn| conn.intf.id == intf_id && conn.cport2_id == cport2_id)
            .cloned()
    }

    /// Host CPort carrying traffic for (interface, module CPort).
    pub fn host_cport(&self, intf_id: u8, cport2_id: u16) -> Result<u16> {
        self.connection_by_module_cport(intf_id, cport2_id)
            .map(|conn| conn.cport1_id)
            .ok_or(Error::Invalid)
    }

    /// Route a message from the bridge out to the host. Messages for a
    /// module interface travel on the host CPort its connection names;
    /// AP-interface messages already carry their host CPort.
    pub fn send_to_host(&self, intf_id: u8, cport_id: u16, msg: &[u8]) -> Result<()> {
        let host_cport = if intf_id == AP_INTF_ID {
            cport_id
        } else {
            self.host_cport(intf_id, cport_id)?
        };
        self.host()?.send(host_cport, msg)
    }

    /// Forward a frame read from a module up to the host.
    pub fn forward_to_host(&self, intf_id: u8, cport2_id: u16, msg: &[u8]) -> Result<()> {
        self.send_to_host(intf_id, cport2_id, msg)
    }

    pub(crate) fn drop_interface_connections(&self, intf_id: u8) {
        let dropped: Vec<Arc<Connection>> = {
            let mut connections = self.connections.lock().unwrap();
            let (dead, live) = connections
                .drain(..)
                .partition(|conn| conn.intf.id == intf_id);
            *connections = live;
            dead
        };
        for conn in dropped {
            if let Some(ctrl) = conn.intf.controller() {
                ctrl.imp().connection_destroy(&conn);
            }
            log::debug!(
                "dropped connection {} -> {}:{}",
                conn.cport1_id,
                intf_id,
                conn.cport2_id
            );
        }
    }
}

/// Create the route (intf1, cport1) -> (intf2, cport2) requested by the
/// host. `cport1` must be new to the process; `intf2` must exist.
pub fn connection_create(
    core: &Arc<Core>,
    _intf1_id: u8,
    cport1_id: u16,
    intf2_id: u8,
    cport2_id: u16,
) -> Result<()> {
    // intf1 is always the AP in this bridge.
    let intf = core.find_interface(intf2_id).ok_or_else(|| {
        log::error!("connection create for unknown interface {}", intf2_id);
        Error::Invalid
    })?;
    if core.connection_by_host_cport(cport1_id).is_some() {
        log::error!("host cport {} is already connected", cport1_id);
        return Err(Error::Invalid);
    }

    let conn = Arc::new(Connection {
        cport1_id,
        cport2_id,
        intf: intf.clone(),
    });

    let ctrl = intf.controller().ok_or(Error::Absent)?;
    ctrl.imp().connection_create(core, &conn)?;

    core.connections.lock().unwrap().push(conn);
    log::info!(
        "connected host cport {} to interface {} cport {}",
        cport1_id,
        intf2_id,
        cport2_id
    );
    Ok(())
}

/// Drop the route created for `cport1`.
pub fn connection_destroy(
    core: &Arc<Core>,
    _intf1_id: u8,
    cport1_id: u16,
    intf2_id: u8,
    _cport2_id: u16,
) -> Result<()> {
    core.find_interface(intf2_id).ok_or(Error::Invalid)?;
    let conn = core
        .connection_by_host_cport(cport1_id)
        .ok_or(Error::Invalid)?;

    if let Some(ctrl) = conn.intf.controller() {
        ctrl.imp().connection_destroy(&conn);
    }
    core.connections
        .lock()
        .unwrap()
        .retain(|c| c.cport1_id != cport1_id);
    log::info!("disconnected host cport {}", cport1_id);
    Ok(())
}

/// Hand a host frame to the module transport routed for `cport1`.
pub fn forward_to_module(core: &Arc<Core>, cport1_id: u16, msg: &mut [u8]) -> Result<()> {
    let conn = core.connection_by_host_cport(cport1_id).ok_or_else(|| {
        log::error!("no connection for host cport {}", cport1_id);
        Error::Invalid
    })?;

    hexdump("forward to module", msg);
    let ctrl = conn.intf.controller().ok_or(Error::Absent)?;
    ctrl.imp().write(core, &conn, msg)
}

/// Initialize and remember a controller. An init failure drops the
/// controller without touching the rest of the bridge.
pub fn register_controller(
    core: &Arc<Core>,
    imp: Box<dyn Controller>,
) -> Result<Arc<ControllerHandle>> {
    if let Err(e) = imp.init(core) {
        log::error!("failed to init {}: {}", imp.name(), e);
        return Err(e);
    }
    let handle = Arc::new(ControllerHandle::new(imp));
    core.controllers.lock().unwrap().push(handle.clone());
    log::info!("registered {} controller", handle.name());
    Ok(handle)
}

/// Spawn the controller's discovery loop on its own thread.
pub fn start_controller(core: &Arc<Core>, ctrl: &Arc<ControllerHandle>) -> Result<()> {
    let thread = {
        let core = core.clone();
        let ctrl2 = ctrl.clone();
        thread::Builder::new()
            .name(format!("gb-{}", ctrl.name()))
            .spawn(move || {
                if let Err(e) = ctrl2.imp().event_loop(&core, &ctrl2) {
                    log::error!("{}: event loop failed: {}", ctrl2.name(), e);
                }
            })
            .map_err(Error::Io)?
    };
    ctrl.set_thread(thread);
    Ok(())
}

/// Stop every controller: wind down its event loop, destroy its
/// interfaces, run its exit hook.
pub fn controllers_exit(core: &Arc<Core>) {
    let controllers: Vec<Arc<ControllerHandle>> = {
        let mut list = core.controllers.lock().unwrap();
        list.drain(..).collect()
    };

    for ctrl in controllers {
        ctrl.imp().event_loop_stop();
        ctrl.join_thread();
        for intf in ctrl.interfaces() {
            crate::controller::interface_destroy(core, &intf);
        }
        ctrl.imp().exit();
        log::info!("stopped {} controller", ctrl.name());
    }
}
