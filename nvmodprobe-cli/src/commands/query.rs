//! `--query`: report module and device-file state without changing it.

use super::{capability_node, Plan};
use anyhow::Result;
use nvmodprobe_core::kmod::is_module_loaded;
use nvmodprobe_core::{DeviceReconciler, HostPaths, NodeReport};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Serialize)]
pub struct ModuleReport {
    pub name: String,
    pub loaded: bool,
}

#[derive(Debug, Serialize)]
pub struct QueryReport {
    pub module: ModuleReport,
    pub nodes: Vec<NodeReport>,
    /// Capability files that publish no minor yet.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unresolved_capabilities: Vec<PathBuf>,
}

/// Observe everything `plan` would touch.
pub fn collect(plan: &Plan, paths: &HostPaths) -> QueryReport {
    let reconciler = DeviceReconciler::new(paths.clone());

    let mut nodes: Vec<NodeReport> =
        plan.nodes.iter().map(|node| reconciler.inspect(node)).collect();
    let mut unresolved_capabilities = Vec::new();

    for file in &plan.capability_files {
        match capability_node(file) {
            Ok(node) => nodes.push(reconciler.inspect(&node)),
            Err(_) => unresolved_capabilities.push(file.clone()),
        }
    }

    QueryReport {
        module: ModuleReport {
            name: plan.module.to_string(),
            loaded: is_module_loaded(&paths.proc_modules, &plan.module),
        },
        nodes,
        unresolved_capabilities,
    }
}

/// Print the report for `plan` as JSON on stdout.
pub fn query(plan: &Plan, paths: &HostPaths) -> Result<()> {
    let report = collect(plan, paths);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
