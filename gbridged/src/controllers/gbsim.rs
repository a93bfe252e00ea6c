//! Simulator controller: one in-process module described by a manifest
//! file. Frames written towards the module are dispatched straight back
//! into the protocol engine, so the whole Greybus path can be exercised
//! without hardware.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use greybus::manifest::Manifest;
use greybus::{Error, Result};

use crate::bridge::Core;
use crate::control;
use crate::controller::{
    interface_create, interface_destroy, interface_hotplug, Connection, Controller,
    ControllerHandle,
};
use crate::engine;

pub struct GbsimController {
    manifest_file: PathBuf,
}

impl GbsimController {
    pub fn new<P: Into<PathBuf>>(manifest_file: P) -> GbsimController {
        GbsimController {
            manifest_file: manifest_file.into(),
        }
    }
}

/// Load a manifest file: a 2-byte little-endian size (doubling as the
/// manifest header's own size field) followed by the rest of the blob.
fn load_manifest_blob(path: &Path) -> Result<Vec<u8>> {
    let contents = fs::read(path)?;
    if contents.len() < 2 {
        log::error!("manifest file {} is too short", path.display());
        return Err(Error::Invalid);
    }
    let size = u16::from_le_bytes([contents[0], contents[1]]) as usize;
    if size > contents.len() {
        log::error!(
            "manifest file {} truncated: header says {} bytes, file has {}",
            path.display(),
            size,
            contents.len()
        );
        return Err(Error::Invalid);
    }
    Ok(contents[..size].to_vec())
}

impl Controller for GbsimController {
    fn name(&self) -> &'static str {
        "gbsim"
    }

    fn init(&self, _core: &Arc<Core>) -> Result<()> {
        // Reject a broken manifest before anything is hotplugged.
        let blob = load_manifest_blob(&self.manifest_file)?;
        Manifest::parse(&blob, 0)?;
        Ok(())
    }

    fn event_loop(&self, core: &Arc<Core>, ctrl: &Arc<ControllerHandle>) -> Result<()> {
        let intf = interface_create(core, ctrl, 1, 1, 0x1234)?;

        let setup = (|| -> Result<()> {
            let blob = load_manifest_blob(&self.manifest_file)?;
            core.add_manifest(Manifest::parse(&blob, intf.id)?);
            control::register_driver(core, intf.id)?;
            interface_hotplug(core, &intf)
        })();

        if let Err(e) = setup {
            log::error!("failed to hotplug the simulated module: {}", e);
            interface_destroy(core, &intf);
            return Err(e);
        }
        Ok(())
    }

    fn write(&self, core: &Arc<Core>, conn: &Connection, msg: &mut [u8]) -> Result<()> {
        engine::handle_message(core, conn.intf.id, conn.cport2_id, msg)
    }
}
