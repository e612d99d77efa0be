//! PCI presence queries.
//!
//! Walks the sysfs PCI device directory and reads the start of each
//! device's configuration space to count devices matching a
//! [`PciMatch`]. Only the count is reported; individual devices are never
//! handed back to callers.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, trace};

/// Bytes of configuration space needed for identification.
pub const CONFIG_PREFIX_LEN: usize = 48;

/// PCI address format: 0000:01:00.0
static PCI_ADDRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{4}:[0-9a-fA-F]{2}:[0-9a-fA-F]{2}\.[0-7]$")
        .expect("Invalid PCI address regex")
});

/// Known vendor IDs.
pub mod vendor {
    pub const NVIDIA: u16 = 0x10de;
}

/// Class codes (base class in the high byte, sub class in the low byte).
pub mod class {
    /// Display controller base class (VGA, 3D, other display).
    pub const DISPLAY: u16 = 0x0300;
    /// Compare base class only.
    pub const BASE_CLASS_MASK: u16 = 0xff00;
    /// Compare base and sub class.
    pub const FULL_CLASS_MASK: u16 = 0xffff;
}

/// PCI enumeration failures.
#[derive(Error, Debug)]
pub enum PciScanError {
    /// No PCI sysfs on this host (container, non-Linux, odd sandbox).
    #[error("PCI sysfs not available at {path:?}")]
    Unsupported { path: PathBuf },

    /// Enumeration started but a device could not be read.
    #[error("Failed to read PCI device {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Match criteria. `None` in an ID field matches anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciMatch {
    pub vendor_id: Option<u16>,
    pub device_id: Option<u16>,
    pub subvendor_id: Option<u16>,
    pub subdevice_id: Option<u16>,
    pub device_class: u16,
    pub device_class_mask: u16,
}

impl PciMatch {
    /// Any display-class device from NVIDIA.
    pub fn nvidia_display() -> Self {
        Self {
            vendor_id: Some(vendor::NVIDIA),
            device_id: None,
            subvendor_id: None,
            subdevice_id: None,
            device_class: class::DISPLAY,
            device_class_mask: class::BASE_CLASS_MASK,
        }
    }

    /// Check the identification fields of one device.
    pub fn matches(&self, ids: &PciIds) -> bool {
        fn field(want: Option<u16>, have: u16) -> bool {
            want.map_or(true, |w| w == have)
        }

        field(self.vendor_id, ids.vendor_id)
            && field(self.device_id, ids.device_id)
            && field(self.subvendor_id, ids.subvendor_id)
            && field(self.subdevice_id, ids.subdevice_id)
            && (ids.device_class & self.device_class_mask) == self.device_class
    }
}

/// Identification fields decoded from configuration space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciIds {
    pub vendor_id: u16,
    pub device_id: u16,
    pub subvendor_id: u16,
    pub subdevice_id: u16,
    /// Base class (high byte) and sub class (low byte).
    pub device_class: u16,
}

impl PciIds {
    /// Decode from the first [`CONFIG_PREFIX_LEN`] bytes of config space.
    pub fn from_config(config: &[u8; CONFIG_PREFIX_LEN]) -> Self {
        let word = |off: usize| u16::from_le_bytes([config[off], config[off + 1]]);

        Self {
            vendor_id: word(0x00),
            device_id: word(0x02),
            device_class: word(0x0a),
            subvendor_id: word(0x2c),
            subdevice_id: word(0x2e),
        }
    }
}

/// Validate PCI address format.
pub fn is_valid_pci_address(address: &str) -> bool {
    PCI_ADDRESS_REGEX.is_match(address)
}

/// Count devices under `pci_devices` matching `criteria`.
///
/// A missing directory is [`PciScanError::Unsupported`]. Any read error on a
/// device aborts the walk; a short config read skips that device.
pub fn count_matching_devices(
    pci_devices: &Path,
    criteria: &PciMatch,
) -> Result<u32, PciScanError> {
    if !pci_devices.is_dir() {
        return Err(PciScanError::Unsupported { path: pci_devices.to_path_buf() });
    }

    let entries = fs::read_dir(pci_devices)
        .map_err(|e| PciScanError::Io { path: pci_devices.to_path_buf(), source: e })?;

    let mut matches = 0u32;

    for entry in entries {
        let entry =
            entry.map_err(|e| PciScanError::Io { path: pci_devices.to_path_buf(), source: e })?;
        let address = entry.file_name().to_string_lossy().to_string();

        if !is_valid_pci_address(&address) {
            trace!(entry = %address, "Skipping non-device entry");
            continue;
        }

        let config_path = entry.path().join("config");
        let Some(config) = read_config_prefix(&config_path)? else {
            debug!(address = %address, "Short PCI config read, skipping device");
            continue;
        };

        let ids = PciIds::from_config(&config);
        if criteria.matches(&ids) {
            debug!(
                address = %address,
                vendor = %format!("{:04x}", ids.vendor_id),
                device = %format!("{:04x}", ids.device_id),
                class = %format!("{:04x}", ids.device_class),
                "Matching PCI device"
            );
            matches += 1;
        }
    }

    Ok(matches)
}

/// Read the identification prefix of a config file.
///
/// `Ok(None)` when the file holds fewer than [`CONFIG_PREFIX_LEN`] bytes.
fn read_config_prefix(path: &Path) -> Result<Option<[u8; CONFIG_PREFIX_LEN]>, PciScanError> {
    let io_err = |e| PciScanError::Io { path: path.to_path_buf(), source: e };

    let file = File::open(path).map_err(io_err)?;
    let mut buf = Vec::with_capacity(CONFIG_PREFIX_LEN);
    file.take(CONFIG_PREFIX_LEN as u64).read_to_end(&mut buf).map_err(io_err)?;

    Ok(buf.try_into().ok())
}
