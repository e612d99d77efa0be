//! Centralized host path configuration.
//!
//! Every proc, sys and dev location the engine touches goes through
//! [`HostPaths`]. The defaults are the fixed kernel-exposed locations and are
//! never taken from the environment: the binary runs privileged on behalf of
//! unprivileged callers.

use std::path::{Path, PathBuf};

/// Loaded module list.
pub const PROC_MODULES: &str = "/proc/modules";
/// Registered block/character device majors.
pub const PROC_DEVICES: &str = "/proc/devices";
/// Path to the kernel's module loader helper.
pub const PROC_MODPROBE: &str = "/proc/sys/kernel/modprobe";
/// Loader used when the kernel does not say otherwise.
pub const DEFAULT_MODPROBE: &str = "/sbin/modprobe";
/// NVIDIA driver proc tree (params, capabilities).
pub const PROC_DRIVER_NVIDIA: &str = "/proc/driver/nvidia";
/// PCI devices in sysfs.
pub const SYS_PCI_DEVICES: &str = "/sys/bus/pci/devices";
/// SoC family identification.
pub const SYS_SOC_FAMILY: &str = "/sys/devices/soc0/family";
/// Memory block auto-onlining policy.
pub const SYS_AUTO_ONLINE_BLOCKS: &str = "/sys/devices/system/memory/auto_online_blocks";
/// Device node directory.
pub const DEV_DIR: &str = "/dev";
/// udev-style `major:minor` alias directory.
pub const DEV_CHAR_DIR: &str = "/dev/char";

/// Host locations used by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    pub proc_modules: PathBuf,
    pub proc_devices: PathBuf,
    pub proc_modprobe: PathBuf,
    pub default_modprobe: PathBuf,
    pub proc_driver: PathBuf,
    pub pci_devices: PathBuf,
    pub soc_family: PathBuf,
    pub auto_online_blocks: PathBuf,
    pub dev_dir: PathBuf,
    pub dev_char_dir: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            proc_modules: PathBuf::from(PROC_MODULES),
            proc_devices: PathBuf::from(PROC_DEVICES),
            proc_modprobe: PathBuf::from(PROC_MODPROBE),
            default_modprobe: PathBuf::from(DEFAULT_MODPROBE),
            proc_driver: PathBuf::from(PROC_DRIVER_NVIDIA),
            pci_devices: PathBuf::from(SYS_PCI_DEVICES),
            soc_family: PathBuf::from(SYS_SOC_FAMILY),
            auto_online_blocks: PathBuf::from(SYS_AUTO_ONLINE_BLOCKS),
            dev_dir: PathBuf::from(DEV_DIR),
            dev_char_dir: PathBuf::from(DEV_CHAR_DIR),
        }
    }
}

impl HostPaths {
    /// Re-root every location under `root`.
    ///
    /// `/proc/modules` becomes `<root>/proc/modules` and so on. Used for
    /// sandboxed runs and tests.
    pub fn rooted_at(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let reroot = |p: &str| root.join(p.trim_start_matches('/'));

        Self {
            proc_modules: reroot(PROC_MODULES),
            proc_devices: reroot(PROC_DEVICES),
            proc_modprobe: reroot(PROC_MODPROBE),
            default_modprobe: reroot(DEFAULT_MODPROBE),
            proc_driver: reroot(PROC_DRIVER_NVIDIA),
            pci_devices: reroot(SYS_PCI_DEVICES),
            soc_family: reroot(SYS_SOC_FAMILY),
            auto_online_blocks: reroot(SYS_AUTO_ONLINE_BLOCKS),
            dev_dir: reroot(DEV_DIR),
            dev_char_dir: reroot(DEV_CHAR_DIR),
        }
    }

    /// Driver parameter file for the given module instance.
    ///
    /// `None` is the single-module layout (`/proc/driver/nvidia/params`).
    pub fn driver_params(&self, instance: Option<u32>) -> PathBuf {
        match instance {
            Some(n) => self.proc_driver.join(n.to_string()).join("params"),
            None => self.proc_driver.join("params"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths() {
        let paths = HostPaths::default();
        assert_eq!(paths.proc_modules, PathBuf::from("/proc/modules"));
        assert_eq!(paths.dev_char_dir, PathBuf::from("/dev/char"));
        assert_eq!(paths.driver_params(None), PathBuf::from("/proc/driver/nvidia/params"));
        assert_eq!(paths.driver_params(Some(2)), PathBuf::from("/proc/driver/nvidia/2/params"));
    }

    #[test]
    fn test_rooted_paths_consistency() {
        let paths = HostPaths::rooted_at("/tmp/sandbox");
        assert_eq!(paths.proc_devices, PathBuf::from("/tmp/sandbox/proc/devices"));
        assert_eq!(paths.pci_devices, PathBuf::from("/tmp/sandbox/sys/bus/pci/devices"));
        assert!(paths.dev_char_dir.starts_with(&paths.dev_dir));
    }
}
