//! CLI command implementations

pub mod ensure;
pub mod query;

pub use ensure::ensure;
pub use query::query;

use anyhow::{bail, Context, Result};
use nvmodprobe_core::devices::read_capability_minor;
use nvmodprobe_core::kmod::{names, ModuleName};
use nvmodprobe_core::DeviceNode;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Range of IMEX channel minors, given as `START:COUNT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImexRange {
    pub start: i64,
    pub count: i64,
}

impl FromStr for ImexRange {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (start, count) =
            s.split_once(':').ok_or_else(|| format!("expected START:COUNT, got {:?}", s))?;
        let start = start.trim().parse().map_err(|_| format!("invalid start {:?}", start))?;
        let count = count.trim().parse().map_err(|_| format!("invalid count {:?}", count))?;
        Ok(Self { start, count })
    }
}

/// What one invocation is asked to maintain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feature {
    /// GPU and control nodes of the base driver.
    Gpu,
    Uvm,
    Modeset,
    NvSwitch,
    NvLink,
    VgpuVfio,
    Capabilities(Vec<PathBuf>),
    ImexChannels(ImexRange),
}

/// A parsed invocation.
#[derive(Debug, Clone)]
pub struct Request {
    pub feature: Feature,
    /// Minors given with `-c`.
    pub minors: Vec<i64>,
    pub module_instance: Option<i64>,
    pub auto_online_movable: bool,
}

/// Module to load and nodes to maintain, in order.
#[derive(Debug, Clone)]
pub struct Plan {
    pub module: ModuleName,
    pub nodes: Vec<DeviceNode>,
    /// Capability files whose nodes follow `nodes`. Their minors are only
    /// published once the module is loaded.
    pub capability_files: Vec<PathBuf>,
    pub auto_online_movable: bool,
}

/// Node described by a capability file of a loaded driver.
pub fn capability_node(file: &Path) -> Result<DeviceNode> {
    let minor = read_capability_minor(file)
        .with_context(|| format!("No capability minor published in {}", file.display()))?;
    let minor = i64::from(minor);
    checked(DeviceNode::capability(minor, file), "capability", minor)
}

impl Request {
    /// Resolve the request into concrete modules and nodes.
    ///
    /// Fails on the first out-of-range number, before anything is touched.
    pub fn plan(&self) -> Result<Plan> {
        let instance = self.instance()?;
        let mut nodes = Vec::new();
        let mut capability_files = Vec::new();

        let module = match &self.feature {
            Feature::Gpu => {
                for &minor in &self.minors {
                    let node = DeviceNode::gpu(minor, self.module_instance);
                    nodes.push(checked(node, "GPU", minor)?);
                }
                ModuleName::nvidia(instance)
            }
            Feature::Uvm => {
                for &minor in &self.minors {
                    let (uvm, tools) = checked(DeviceNode::uvm_pair(minor), "UVM", minor)?;
                    nodes.push(uvm);
                    nodes.push(tools);
                }
                ModuleName::new(names::UVM)
            }
            Feature::Modeset => {
                nodes.push(DeviceNode::Modeset);
                ModuleName::new(names::MODESET)
            }
            Feature::NvSwitch => {
                for &minor in &self.minors {
                    nodes.push(checked(DeviceNode::nvswitch(minor), "NVSwitch", minor)?);
                }
                ModuleName::nvidia(None)
            }
            Feature::NvLink => {
                nodes.push(DeviceNode::NvLink);
                ModuleName::nvidia(None)
            }
            Feature::VgpuVfio => {
                for &minor in &self.minors {
                    nodes.push(checked(DeviceNode::vgpu_vfio(minor), "vGPU", minor)?);
                }
                ModuleName::new(names::VGPU_VFIO)
            }
            Feature::Capabilities(files) => {
                capability_files.extend(files.iter().cloned());
                ModuleName::nvidia(None)
            }
            Feature::ImexChannels(range) => {
                if range.count < 0 {
                    bail!("Invalid IMEX channel count {}", range.count);
                }
                for minor in range.start..range.start.saturating_add(range.count) {
                    nodes.push(checked(DeviceNode::imex_channel(minor), "IMEX channel", minor)?);
                }
                ModuleName::nvidia(None)
            }
        };

        tracing::debug!(
            module = %module,
            nodes = nodes.len(),
            capability_files = capability_files.len(),
            "Planned invocation"
        );

        Ok(Plan {
            module,
            nodes,
            capability_files,
            auto_online_movable: self.auto_online_movable,
        })
    }

    fn instance(&self) -> Result<Option<u32>> {
        match self.module_instance {
            None => Ok(None),
            Some(n) => match u32::try_from(n) {
                Ok(n) if n < nvmodprobe_core::kmod::MAX_MODULE_INSTANCES => Ok(Some(n)),
                _ => bail!("Invalid module instance {}", n),
            },
        }
    }
}

fn checked<T>(node: Option<T>, what: &str, minor: i64) -> Result<T> {
    node.ok_or_else(|| {
        let reason = format!("invalid {} minor number {}", what, minor);
        nvmodprobe_core::ModprobeError::malformed(reason).into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(feature: Feature, minors: &[i64]) -> Request {
        Request {
            feature,
            minors: minors.to_vec(),
            module_instance: None,
            auto_online_movable: false,
        }
    }

    #[test]
    fn test_imex_range_parsing() {
        assert_eq!("0:4".parse::<ImexRange>().unwrap(), ImexRange { start: 0, count: 4 });
        assert!("4".parse::<ImexRange>().is_err());
        assert!("a:1".parse::<ImexRange>().is_err());
    }

    #[test]
    fn test_gpu_plan() {
        let plan = request(Feature::Gpu, &[0, 255]).plan().unwrap();
        assert_eq!(plan.module.as_str(), "nvidia");
        assert_eq!(
            plan.nodes,
            vec![
                DeviceNode::Gpu { minor: 0, instance: None },
                DeviceNode::Control { instance: None },
            ]
        );
    }

    #[test]
    fn test_module_instance() {
        let mut req = request(Feature::Gpu, &[1]);
        req.module_instance = Some(3);
        let plan = req.plan().unwrap();
        assert_eq!(plan.module.as_str(), "nvidia3");
        assert_eq!(plan.nodes, vec![DeviceNode::Gpu { minor: 1, instance: Some(3) }]);

        req.module_instance = Some(16);
        assert!(req.plan().is_err());
    }

    #[test]
    fn test_uvm_plan_creates_pairs() {
        let plan = request(Feature::Uvm, &[0]).plan().unwrap();
        assert_eq!(plan.module.as_str(), "nvidia-uvm");
        assert_eq!(
            plan.nodes,
            vec![DeviceNode::Uvm { minor: 0 }, DeviceNode::UvmTools { minor: 1 }]
        );
    }

    #[test]
    fn test_negative_minor_rejected() {
        let err = request(Feature::Gpu, &[-1]).plan().unwrap_err();
        assert!(err.to_string().contains("invalid GPU minor number -1"));
    }

    #[test]
    fn test_imex_plan() {
        let plan = request(Feature::ImexChannels(ImexRange { start: 2, count: 3 }), &[])
            .plan()
            .unwrap();
        assert_eq!(
            plan.nodes,
            vec![
                DeviceNode::ImexChannel { minor: 2 },
                DeviceNode::ImexChannel { minor: 3 },
                DeviceNode::ImexChannel { minor: 4 },
            ]
        );

        let bad = request(Feature::ImexChannels(ImexRange { start: 0, count: -1 }), &[]);
        assert!(bad.plan().is_err());
    }

    #[test]
    fn test_capability_plan_defers_minor() {
        let tmp = TempDir::new().unwrap();
        let absent = tmp.path().join("absent");

        // The file does not exist until the driver is loaded.
        let plan = request(Feature::Capabilities(vec![absent.clone()]), &[])
            .plan()
            .unwrap();
        assert_eq!(plan.module.as_str(), "nvidia");
        assert!(plan.nodes.is_empty());
        assert_eq!(plan.capability_files, vec![absent]);
    }

    #[test]
    fn test_capability_node_reads_minor() {
        let tmp = TempDir::new().unwrap();
        let cap = tmp.path().join("monitor");
        std::fs::write(&cap, "DeviceFileMinor: 2\nDeviceFileMode: 292\nDeviceFileModify: 1\n")
            .unwrap();

        let node = capability_node(&cap).unwrap();
        assert_eq!(node, DeviceNode::Capability { minor: 2, source: cap });

        let err = capability_node(&tmp.path().join("absent")).unwrap_err();
        assert!(err.to_string().contains("No capability minor published"));
    }
}
