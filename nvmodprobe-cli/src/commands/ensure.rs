//! Default command: load the module and reconcile every requested node.

use super::{capability_node, Plan};
use anyhow::{Context, Result};
use nvmodprobe_core::memory;
use nvmodprobe_core::{DeviceNode, DeviceReconciler, HostPaths, LoadOptions, ModuleLoader};
use tracing::info;

/// Carry out `plan`, stopping at the first failing step.
pub fn ensure(plan: &Plan, paths: &HostPaths, verbose: bool) -> Result<()> {
    let opts = LoadOptions { verbose, allow_embedded_without_pci: true };

    ModuleLoader::new(paths.clone())
        .load(&plan.module, &opts)
        .with_context(|| format!("Failed to load kernel module {}", plan.module))?;

    let reconciler = DeviceReconciler::new(paths.clone());
    for node in &plan.nodes {
        ensure_node(&reconciler, node, paths)?;
    }

    // Capability files are only readable now that the driver is loaded.
    for file in &plan.capability_files {
        let node = capability_node(file)?;
        ensure_node(&reconciler, &node, paths)?;
    }

    if plan.auto_online_movable {
        memory::enable_auto_online_movable(paths)
            .context("Failed to enable online_movable memory onlining")?;
    }

    info!(
        module = %plan.module,
        nodes = plan.nodes.len() + plan.capability_files.len(),
        "Device files ready"
    );
    Ok(())
}

fn ensure_node(reconciler: &DeviceReconciler, node: &DeviceNode, paths: &HostPaths) -> Result<()> {
    reconciler
        .ensure(node)
        .with_context(|| format!("Failed to set up {}", node.path(paths).display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{Feature, Request};
    use nvmodprobe_core::{ErrorKind, ModprobeError};
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn capability_plan(file: PathBuf) -> Plan {
        Request {
            feature: Feature::Capabilities(vec![file]),
            minors: Vec::new(),
            module_instance: None,
            auto_online_movable: false,
        }
        .plan()
        .unwrap()
    }

    fn sandbox(modules: &str) -> (TempDir, HostPaths) {
        let tmp = TempDir::new().unwrap();
        let paths = HostPaths::rooted_at(tmp.path());
        fs::create_dir_all(paths.proc_modules.parent().unwrap()).unwrap();
        fs::write(&paths.proc_modules, modules).unwrap();
        fs::create_dir_all(&paths.pci_devices).unwrap();
        (tmp, paths)
    }

    #[test]
    fn test_capability_load_comes_before_minor_lookup() {
        let (_tmp, paths) = sandbox("");
        let plan = capability_plan(paths.proc_driver.join("capabilities/mig/config"));

        // No hardware: the load attempt is what fails, not the missing file.
        let err = ensure(&plan, &paths, false).unwrap_err();
        assert!(err.to_string().contains("Failed to load kernel module nvidia"));
        let cause = err.downcast_ref::<ModprobeError>().unwrap();
        assert_eq!(cause.kind(), ErrorKind::HardwareAbsent);
    }

    #[test]
    fn test_capability_minor_read_after_load() {
        let (_tmp, paths) = sandbox("nvidia 1 0 - Live 0x0\n");
        let plan = capability_plan(paths.proc_driver.join("capabilities/mig/config"));

        let err = ensure(&plan, &paths, false).unwrap_err();
        assert!(err.to_string().contains("No capability minor published"));
    }
}
