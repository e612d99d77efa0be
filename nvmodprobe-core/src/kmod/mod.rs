//! Kernel module registry.
//!
//! Reads the live module list (`/proc/modules`) and the character-device
//! major table (`/proc/devices`). Both are re-read on every call.

pub mod loader;

use std::fmt;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, trace};

pub use loader::{LoadOptions, ModuleLoader};

/// Width of the name column the module table is scanned with.
///
/// Longer names compare on their first 15 characters only.
pub const MODULE_NAME_WIDTH: usize = 15;

/// Instances supported for multi-module `nvidia<N>` setups.
pub const MAX_MODULE_INSTANCES: u32 = 16;

/// Well-known module names.
pub mod names {
    pub const NVIDIA: &str = "nvidia";
    pub const UVM: &str = "nvidia-uvm";
    pub const MODESET: &str = "nvidia-modeset";
    pub const NVLINK: &str = "nvidia-nvlink";
    pub const NVSWITCH: &str = "nvidia-nvswitch";
    pub const VGPU_VFIO: &str = "nvidia-vgpu-vfio";
    pub const CAPS: &str = "nvidia-caps";
    pub const CAPS_IMEX_CHANNELS: &str = "nvidia-caps-imex-channels";
    pub const MSR: &str = "msr";
}

/// A kernel module name.
///
/// Equality ignores the `-`/`_` distinction, as the kernel does.
#[derive(Debug, Clone, Eq)]
pub struct ModuleName(String);

impl ModuleName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The base driver, or `nvidia<N>` for a module instance.
    pub fn nvidia(instance: Option<u32>) -> Self {
        match instance {
            Some(n) => Self(format!("{}{}", names::NVIDIA, n)),
            None => Self::new(names::NVIDIA),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether loading this module only makes sense with NVIDIA hardware.
    pub fn requires_nvidia_hardware(&self) -> bool {
        *self != Self::new(names::MSR)
    }

    /// Compare against a name token read from the module table.
    ///
    /// Both sides are cut to [`MODULE_NAME_WIDTH`] first.
    pub fn matches_table_entry(&self, token: &str) -> bool {
        normalized(truncate(token)).eq(normalized(truncate(&self.0)))
    }
}

impl PartialEq for ModuleName {
    fn eq(&self, other: &Self) -> bool {
        normalized(&self.0).eq(normalized(&other.0))
    }
}

impl Hash for ModuleName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for c in normalized(&self.0) {
            c.hash(state);
        }
    }
}

impl fmt::Display for ModuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

fn normalized(name: &str) -> impl Iterator<Item = char> + '_ {
    name.chars().map(|c| if c == '-' { '_' } else { c })
}

fn truncate(name: &str) -> &str {
    match name.char_indices().nth(MODULE_NAME_WIDTH) {
        Some((idx, _)) => &name[..idx],
        None => name,
    }
}

/// Check whether `name` appears in the module table at `proc_modules`.
///
/// An unreadable table reads as "not loaded".
pub fn is_module_loaded(proc_modules: &Path, name: &ModuleName) -> bool {
    let file = match File::open(proc_modules) {
        Ok(f) => f,
        Err(e) => {
            debug!(path = %proc_modules.display(), error = %e, "Module table unreadable");
            return false;
        }
    };

    let loaded = BufReader::new(file)
        .lines()
        .map_while(|line| line.ok())
        .filter_map(|line| line.split_whitespace().next().map(str::to_owned))
        .any(|token| name.matches_table_entry(&token));

    trace!(module = %name, loaded, "Checked module table");
    loaded
}

/// Look up the character-device major registered under `name`.
///
/// Only the `Character devices:` section is searched, up to the first blank
/// line. The name must be the whole second column, so `nvidia` never matches
/// a `nvidia-uvm` line.
pub fn char_major(proc_devices: &Path, name: &str) -> Option<u32> {
    let file = match File::open(proc_devices) {
        Ok(f) => f,
        Err(e) => {
            debug!(path = %proc_devices.display(), error = %e, "Device table unreadable");
            return None;
        }
    };

    let mut lines = BufReader::new(file).lines().map_while(|line| line.ok());

    lines.by_ref().find(|line| line.trim_end() == "Character devices:")?;

    for line in lines {
        if line.trim().is_empty() {
            break;
        }

        let mut fields = line.split_whitespace();
        let (Some(major), Some(entry), None) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };

        if entry == name {
            let major = major.parse().ok();
            debug!(name, major = ?major, "Found character device major");
            return major;
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const MODULES: &str = "\
nvidia_uvm 1437696 0 - Live 0x0000000000000000 (POE)
nvidia_modeset 1302528 0 - Live 0x0000000000000000 (POE)
nvidia_vgpu_vfio 57344 0 - Live 0x0000000000000000
nvidia 56573952 2 nvidia_uvm,nvidia_modeset, Live 0x0000000000000000 (POE)
";

    const DEVICES: &str = "\
Character devices:
  1 mem
195 nvidia-frontend
195 nvidia
235 nvidia-uvm
236 nvidia-nvswitch
237 nvidia-caps

Block devices:
  8 sd
240 nvidia-nvlink
";

    fn write(tmp: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = tmp.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_name_equivalence() {
        let tmp = TempDir::new().unwrap();
        let modules = write(&tmp, "modules", MODULES);

        assert_eq!(
            is_module_loaded(&modules, &ModuleName::new("nvidia_uvm")),
            is_module_loaded(&modules, &ModuleName::new("nvidia-uvm"))
        );
        assert!(is_module_loaded(&modules, &ModuleName::new("nvidia-uvm")));
        assert!(is_module_loaded(&modules, &ModuleName::new("nvidia-modeset")));
        assert!(!is_module_loaded(&modules, &ModuleName::new("nvidia-drm")));
    }

    #[test]
    fn test_module_name_eq_and_hash() {
        use std::collections::HashSet;

        assert_eq!(ModuleName::new("nvidia-uvm"), ModuleName::new("nvidia_uvm"));
        assert_ne!(ModuleName::new("nvidia"), ModuleName::new("nvidia-uvm"));

        let set: HashSet<_> = [ModuleName::new("nvidia-uvm"), ModuleName::new("nvidia_uvm")].into();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_historical_name_width() {
        // The table is scanned 15 characters wide; longer names match on the
        // shared prefix. Kept for compatibility.
        let tmp = TempDir::new().unwrap();
        let modules = write(&tmp, "modules", "nvidia_vgpu_vfi 57344 0 - Live\n");

        assert!(is_module_loaded(&modules, &ModuleName::new("nvidia-vgpu-vfio")));
        assert!(ModuleName::new("nvidia-vgpu-vfio").matches_table_entry("nvidia_vgpu_vfio"));
        assert!(!ModuleName::new("nvidia").matches_table_entry("nvidia_vgpu_vfio"));
    }

    #[test]
    fn test_module_table_missing() {
        let tmp = TempDir::new().unwrap();
        assert!(!is_module_loaded(&tmp.path().join("absent"), &ModuleName::nvidia(None)));
    }

    #[test]
    fn test_instance_names() {
        assert_eq!(ModuleName::nvidia(None).as_str(), "nvidia");
        assert_eq!(ModuleName::nvidia(Some(3)).as_str(), "nvidia3");
        assert!(ModuleName::nvidia(None).requires_nvidia_hardware());
        assert!(!ModuleName::new("msr").requires_nvidia_hardware());
    }

    #[test]
    fn test_char_major_lookup() {
        let tmp = TempDir::new().unwrap();
        let devices = write(&tmp, "devices", DEVICES);

        assert_eq!(char_major(&devices, "nvidia"), Some(195));
        assert_eq!(char_major(&devices, "nvidia-uvm"), Some(235));
        assert_eq!(char_major(&devices, "nvidia-caps"), Some(237));
        // Listed under block devices only
        assert_eq!(char_major(&devices, "nvidia-nvlink"), None);
    }

    #[test]
    fn test_char_major_substring_boundary() {
        let tmp = TempDir::new().unwrap();
        let devices = write(&tmp, "devices", "Character devices:\n195 nvidia-uvm\n\n");

        assert_eq!(char_major(&devices, "nvidia"), None);
        assert_eq!(char_major(&devices, "uvm"), None);
        assert_eq!(char_major(&devices, "nvidia-uvm"), Some(195));
    }

    #[test]
    fn test_char_major_without_section() {
        let tmp = TempDir::new().unwrap();
        let devices = write(&tmp, "devices", "195 nvidia\n");
        assert_eq!(char_major(&devices, "nvidia"), None);
        assert_eq!(char_major(&tmp.path().join("absent"), "nvidia"), None);
    }
}
