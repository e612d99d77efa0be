//! Kernel module loading via the system module loader.
//!
//! The loader's exit status is not trusted. After the child finishes the
//! module table is checked again and that decides the outcome.

use super::{is_module_loaded, ModuleName};
use crate::error::{ModprobeError, Result};
use crate::paths::HostPaths;
use crate::pci::{self, PciMatch};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

/// Search path handed to the loader child. Nothing else is inherited.
const LOADER_PATH_ENV: &str = "/sbin";

/// `argv[0]` of the loader child.
const LOADER_ARGV0: &str = "modprobe";

/// SoC family that exposes the GPU without a PCI function.
const EMBEDDED_SOC_FAMILY: &str = "Tegra";

/// Owner execute bit.
const OWNER_EXEC: u32 = 0o100;

/// Log a loader diagnostic at `warn` when verbose, `debug` otherwise.
macro_rules! diag {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            warn!($($arg)+);
        } else {
            debug!($($arg)+);
        }
    };
}

/// Per-call loader options.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Report failures as warnings instead of debug output.
    pub verbose: bool,
    /// Load even when no PCI device matched, if the host is an embedded SoC.
    pub allow_embedded_without_pci: bool,
}

/// Loads kernel modules with the host's module loader.
#[derive(Debug, Clone)]
pub struct ModuleLoader {
    paths: HostPaths,
    effective_uid: u32,
}

impl ModuleLoader {
    pub fn new(paths: HostPaths) -> Self {
        Self { paths, effective_uid: unsafe { libc::geteuid() } }
    }

    /// Override the identity checked before spawning the loader.
    pub fn with_effective_uid(mut self, uid: u32) -> Self {
        self.effective_uid = uid;
        self
    }

    pub fn paths(&self) -> &HostPaths {
        &self.paths
    }

    /// Ensure `module` is loaded.
    ///
    /// Returns immediately if it already is. Otherwise checks for hardware,
    /// privilege and a usable loader executable, runs the loader and waits
    /// for it, then re-reads the module table.
    pub fn load(&self, module: &ModuleName, opts: &LoadOptions) -> Result<()> {
        if is_module_loaded(&self.paths.proc_modules, module) {
            debug!(module = %module, "Module already loaded");
            return Ok(());
        }

        if module.requires_nvidia_hardware() {
            self.check_hardware(module, opts)?;
        }

        if self.effective_uid != 0 {
            diag!(
                opts.verbose,
                module = %module,
                uid = self.effective_uid,
                "Not root, cannot load module"
            );
            return Err(ModprobeError::PermissionDenied {
                module: module.to_string(),
                reason: "loading kernel modules requires root".to_string(),
            });
        }

        let loader = self.loader_path();
        if let Err(reason) = check_executable(&loader) {
            diag!(
                opts.verbose,
                loader = %loader.display(),
                reason = %reason,
                "Module loader unusable"
            );
            return Err(ModprobeError::ResourceUnavailable { path: loader, reason });
        }

        info!(module = %module, loader = %loader.display(), "Loading kernel module");

        let mut child = Command::new(&loader)
            .arg0(LOADER_ARGV0)
            .arg(module.as_str())
            .env_clear()
            .env("PATH", LOADER_PATH_ENV)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                diag!(
                    opts.verbose,
                    loader = %loader.display(),
                    error = %e,
                    "Failed to execute module loader"
                );
                ModprobeError::SpawnFailed { loader: loader.clone(), source: e }
            })?;

        // Wait errors are ignored: with SIGCHLD set to SIG_IGN the child is
        // reaped automatically and wait reports ECHILD even on success.
        match child.wait() {
            Ok(status) => debug!(module = %module, status = %status, "Module loader finished"),
            Err(e) => debug!(module = %module, error = %e, "Waiting for module loader failed"),
        }

        if is_module_loaded(&self.paths.proc_modules, module) {
            info!(module = %module, "Kernel module loaded");
            Ok(())
        } else {
            diag!(opts.verbose, module = %module, "Module not loaded after running loader");
            Err(ModprobeError::ModuleLoadFailed { module: module.to_string(), loader })
        }
    }

    /// Fail fast when there is definitely no NVIDIA display device.
    ///
    /// An enumeration error or a missing PCI tree is not proof of absence,
    /// so the load goes ahead.
    fn check_hardware(&self, module: &ModuleName, opts: &LoadOptions) -> Result<()> {
        match pci::count_matching_devices(&self.paths.pci_devices, &PciMatch::nvidia_display()) {
            Ok(0) => {
                if opts.allow_embedded_without_pci && is_embedded_platform(&self.paths) {
                    debug!(module = %module, "No PCI match, continuing on embedded platform");
                    return Ok(());
                }
                diag!(opts.verbose, module = %module, "No NVIDIA PCI devices found");
                Err(ModprobeError::HardwareAbsent { module: module.to_string() })
            }
            Ok(count) => {
                debug!(module = %module, count, "NVIDIA PCI devices present");
                Ok(())
            }
            Err(e) => {
                debug!(
                    module = %module,
                    error = %e,
                    "PCI enumeration unavailable, attempting load"
                );
                Ok(())
            }
        }
    }

    /// Loader executable: the kernel's configured helper, or the default.
    fn loader_path(&self) -> PathBuf {
        let configured = fs::read_to_string(&self.paths.proc_modprobe).unwrap_or_default();
        let first_line = configured.lines().next().unwrap_or_default();

        if first_line.is_empty() {
            self.paths.default_modprobe.clone()
        } else {
            PathBuf::from(first_line)
        }
    }
}

/// Whether the host is an embedded SoC whose GPU is not a PCI function.
pub fn is_embedded_platform(paths: &HostPaths) -> bool {
    fs::read_to_string(&paths.soc_family)
        .map(|family| family.trim() == EMBEDDED_SOC_FAMILY)
        .unwrap_or(false)
}

/// A regular file with the owner execute bit set.
fn check_executable(path: &Path) -> std::result::Result<(), String> {
    let meta = fs::metadata(path).map_err(|e| e.to_string())?;

    if !meta.is_file() {
        return Err("not a regular file".to_string());
    }
    if meta.permissions().mode() & OWNER_EXEC == 0 {
        return Err("not executable by owner".to_string());
    }

    Ok(())
}
