//! Module manifest parsing.
//!
//! A manifest is a little-endian blob: a 4-byte header followed by
//! variable-size descriptors. The parser builds the bundle/CPort view the
//! Control protocol needs and keeps the raw blob around so GET_MANIFEST
//! can return it byte-for-byte.

use crate::{protocol::payload_as, Error, Result};

/// Descriptor type numbers.
pub const DESC_INTERFACE: u8 = 0x01;
pub const DESC_STRING: u8 = 0x02;
pub const DESC_BUNDLE: u8 = 0x03;
pub const DESC_CPORT: u8 = 0x04;

/// CPort protocol ids the bridge knows about.
pub const PROTOCOL_CONTROL: u8 = 0x00;
pub const PROTOCOL_LOOPBACK: u8 = 0x11;

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ManifestHeader {
    pub size: u16,
    pub version_major: u8,
    pub version_minor: u8,
}
unsafe impl plain::Plain for ManifestHeader {}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DescriptorHeader {
    pub size: u16,
    pub desc_type: u8,
    pub pad: u8,
}
unsafe impl plain::Plain for DescriptorHeader {}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct BundleDescriptor {
    pub id: u8,
    pub class: u8,
    pub pad: [u8; 2],
}
unsafe impl plain::Plain for BundleDescriptor {}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct CportDescriptor {
    pub id: u16,
    pub bundle: u8,
    pub protocol_id: u8,
}
unsafe impl plain::Plain for CportDescriptor {}

const MANIFEST_HEADER_SIZE: usize = 4;
const DESC_HEADER_SIZE: usize = 4;

#[derive(Clone, Debug)]
pub struct Cport {
    pub id: u16,
    pub protocol_id: u8,
}

#[derive(Clone, Debug)]
pub struct Bundle {
    pub id: u8,
    pub class: u8,
    pub cports: Vec<Cport>,
}

/// Parsed manifest of one module interface.
#[derive(Clone, Debug)]
pub struct Manifest {
    pub intf_id: u8,
    pub bundles: Vec<Bundle>,
    blob: Vec<u8>,
}

impl Manifest {
    /// Parse the manifest at the front of `blob` for interface `intf_id`.
    ///
    /// The descriptors must add up to the header's `size` exactly; any
    /// over- or under-run is `Invalid`.
    pub fn parse(blob: &[u8], intf_id: u8) -> Result<Manifest> {
        let header: &ManifestHeader = payload_as(blob).map_err(|_| Error::Invalid)?;
        let size = u16::from_le(header.size) as usize;
        if size < MANIFEST_HEADER_SIZE || size > blob.len() {
            return Err(Error::Invalid);
        }
        log::debug!(
            "parsing manifest for interface {}: {} bytes, version {}.{}",
            intf_id,
            size,
            header.version_major,
            header.version_minor
        );

        let mut manifest = Manifest {
            intf_id,
            bundles: Vec::new(),
            blob: blob[..size].to_vec(),
        };

        let mut offset = MANIFEST_HEADER_SIZE;
        while offset < size {
            offset += manifest.parse_descriptor(&blob[offset..size])?;
        }
        if offset != size {
            return Err(Error::Invalid);
        }

        Ok(manifest)
    }

    fn parse_descriptor(&mut self, desc: &[u8]) -> Result<usize> {
        let header: &DescriptorHeader = payload_as(desc).map_err(|_| Error::Invalid)?;
        let size = u16::from_le(header.size) as usize;
        if size < DESC_HEADER_SIZE || size > desc.len() {
            return Err(Error::Invalid);
        }

        let body = &desc[DESC_HEADER_SIZE..size];
        match header.desc_type {
            DESC_INTERFACE => log::debug!("interface descriptor"),
            DESC_STRING => log::debug!("string descriptor"),
            DESC_BUNDLE => {
                let bundle: &BundleDescriptor = payload_as(body).map_err(|_| Error::Invalid)?;
                let (id, class) = (bundle.id, bundle.class);
                self.bundle_mut(id).class = class;
                log::debug!("bundle descriptor: id {id}, class {class}");
            }
            DESC_CPORT => {
                let cport: &CportDescriptor = payload_as(body).map_err(|_| Error::Invalid)?;
                let (id, protocol_id) = (u16::from_le(cport.id), cport.protocol_id);
                self.bundle_mut(cport.bundle).cports.push(Cport { id, protocol_id });
                log::debug!("cport descriptor: id {id}, protocol {protocol_id}");
            }
            other => log::warn!("skipping unknown descriptor type {other:#04x}"),
        }

        Ok(size)
    }

    fn bundle_mut(&mut self, id: u8) -> &mut Bundle {
        if let Some(pos) = self.bundles.iter().position(|b| b.id == id) {
            return &mut self.bundles[pos];
        }
        self.bundles.push(Bundle {
            id,
            class: 0,
            cports: Vec::new(),
        });
        self.bundles.last_mut().unwrap()
    }

    /// The raw blob, exactly as it will be served to GET_MANIFEST.
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    pub fn size(&self) -> u16 {
        self.blob.len() as u16
    }

    pub fn bundle(&self, id: u8) -> Option<&Bundle> {
        self.bundles.iter().find(|b| b.id == id)
    }
}
