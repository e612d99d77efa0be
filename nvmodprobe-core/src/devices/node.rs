//! Device kinds and their naming rules.
//!
//! Each NVIDIA device file is described by a [`DeviceNode`]: where it lives
//! under `/dev`, how its major number is found, its minor number, which
//! module provides it and where its permission policy comes from.
//! Constructors validate their numeric input and return `None` instead of
//! producing a malformed path.

use crate::devices::number::MAX_MINOR;
use crate::kmod::{self, names, ModuleName};
use crate::paths::HostPaths;
use std::path::PathBuf;

/// Major number of the primary driver.
pub const NV_MAJOR_DEVICE_NUMBER: u32 = 195;
/// Minor of `/dev/nvidiactl`.
pub const NV_CTL_DEVICE_MINOR: u32 = 255;
/// Minor of `/dev/nvidia-modeset`.
pub const NV_MODESET_MINOR: u32 = 254;
/// Minor of `/dev/nvidia-nvswitchctl`.
pub const NV_NVSWITCH_CTL_MINOR: u32 = 255;
/// Minor of `/dev/nvidia-nvlink`.
pub const NV_NVLINK_MINOR: u32 = 0;

/// Subdirectory holding capability nodes.
pub const CAPS_DIR: &str = "nvidia-caps";
/// Subdirectory holding IMEX channel nodes.
pub const IMEX_CHANNELS_DIR: &str = "nvidia-caps-imex-channels";

/// How the major number of a device is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MajorSource {
    Fixed(u32),
    /// Registered by name in `/proc/devices`.
    Registered(&'static str),
}

/// A device file the engine knows how to maintain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceNode {
    /// `/dev/nvidia<minor>`
    Gpu { minor: u32, instance: Option<u32> },
    /// `/dev/nvidiactl`
    Control { instance: Option<u32> },
    /// `/dev/nvidia-modeset`
    Modeset,
    /// `/dev/nvidia-uvm`
    Uvm { minor: u32 },
    /// `/dev/nvidia-uvm-tools`
    UvmTools { minor: u32 },
    /// `/dev/nvidia-nvlink`
    NvLink,
    /// `/dev/nvidia-nvswitch<minor>`
    NvSwitch { minor: u32 },
    /// `/dev/nvidia-nvswitchctl`
    NvSwitchControl,
    /// `/dev/nvidia-vgpu<minor>`
    VgpuVfio { minor: u32 },
    /// `/dev/nvidia-caps/nvidia-cap<minor>`, policy from `source`
    Capability { minor: u32, source: PathBuf },
    /// `/dev/nvidia-caps-imex-channels/channel<minor>`
    ImexChannel { minor: u32 },
}

fn checked_minor(minor: i64) -> Option<u32> {
    u32::try_from(minor).ok().filter(|m| *m <= MAX_MINOR)
}

fn checked_instance(instance: Option<i64>) -> Option<Option<u32>> {
    match instance {
        None => Some(None),
        Some(n) => u32::try_from(n).ok().filter(|n| *n < kmod::MAX_MODULE_INSTANCES).map(Some),
    }
}

impl DeviceNode {
    /// GPU node for `minor` in 0..=255; 255 is the control node.
    pub fn gpu(minor: i64, instance: Option<i64>) -> Option<Self> {
        let instance = checked_instance(instance)?;
        match u32::try_from(minor).ok()? {
            NV_CTL_DEVICE_MINOR => Some(Self::Control { instance }),
            m if m < NV_CTL_DEVICE_MINOR => Some(Self::Gpu { minor: m, instance }),
            _ => None,
        }
    }

    /// The UVM node and its tools node at `base + 1`.
    pub fn uvm_pair(base: i64) -> Option<(Self, Self)> {
        let minor = checked_minor(base)?;
        let tools = checked_minor(i64::from(minor) + 1)?;
        Some((Self::Uvm { minor }, Self::UvmTools { minor: tools }))
    }

    /// NVSwitch node; 255 is the control node.
    pub fn nvswitch(minor: i64) -> Option<Self> {
        match checked_minor(minor)? {
            NV_NVSWITCH_CTL_MINOR => Some(Self::NvSwitchControl),
            m => Some(Self::NvSwitch { minor: m }),
        }
    }

    pub fn vgpu_vfio(minor: i64) -> Option<Self> {
        checked_minor(minor).map(|minor| Self::VgpuVfio { minor })
    }

    pub fn imex_channel(minor: i64) -> Option<Self> {
        checked_minor(minor).map(|minor| Self::ImexChannel { minor })
    }

    pub fn capability(minor: i64, source: impl Into<PathBuf>) -> Option<Self> {
        checked_minor(minor).map(|minor| Self::Capability { minor, source: source.into() })
    }

    /// File name relative to the device directory.
    pub fn relative_path(&self) -> PathBuf {
        match self {
            Self::Gpu { minor, .. } => PathBuf::from(format!("nvidia{}", minor)),
            Self::Control { .. } => PathBuf::from("nvidiactl"),
            Self::Modeset => PathBuf::from("nvidia-modeset"),
            Self::Uvm { .. } => PathBuf::from("nvidia-uvm"),
            Self::UvmTools { .. } => PathBuf::from("nvidia-uvm-tools"),
            Self::NvLink => PathBuf::from("nvidia-nvlink"),
            Self::NvSwitch { minor } => PathBuf::from(format!("nvidia-nvswitch{}", minor)),
            Self::NvSwitchControl => PathBuf::from("nvidia-nvswitchctl"),
            Self::VgpuVfio { minor } => PathBuf::from(format!("nvidia-vgpu{}", minor)),
            Self::Capability { minor, .. } => {
                PathBuf::from(CAPS_DIR).join(format!("nvidia-cap{}", minor))
            }
            Self::ImexChannel { minor } => {
                PathBuf::from(IMEX_CHANNELS_DIR).join(format!("channel{}", minor))
            }
        }
    }

    /// Absolute path of the node.
    pub fn path(&self, paths: &HostPaths) -> PathBuf {
        paths.dev_dir.join(self.relative_path())
    }

    /// Directory that must exist before the node can be created, if it is
    /// not the device directory itself.
    pub fn parent_dir(&self, paths: &HostPaths) -> Option<PathBuf> {
        match self {
            Self::Capability { .. } => Some(paths.dev_dir.join(CAPS_DIR)),
            Self::ImexChannel { .. } => Some(paths.dev_dir.join(IMEX_CHANNELS_DIR)),
            _ => None,
        }
    }

    pub fn minor(&self) -> u32 {
        match self {
            Self::Gpu { minor, .. }
            | Self::Uvm { minor }
            | Self::UvmTools { minor }
            | Self::NvSwitch { minor }
            | Self::VgpuVfio { minor }
            | Self::Capability { minor, .. }
            | Self::ImexChannel { minor } => *minor,
            Self::Control { .. } => NV_CTL_DEVICE_MINOR,
            Self::Modeset => NV_MODESET_MINOR,
            Self::NvLink => NV_NVLINK_MINOR,
            Self::NvSwitchControl => NV_NVSWITCH_CTL_MINOR,
        }
    }

    pub fn major_source(&self) -> MajorSource {
        match self {
            Self::Gpu { .. } | Self::Control { .. } | Self::Modeset => {
                MajorSource::Fixed(NV_MAJOR_DEVICE_NUMBER)
            }
            Self::Uvm { .. } | Self::UvmTools { .. } => MajorSource::Registered(names::UVM),
            Self::NvLink => MajorSource::Registered(names::NVLINK),
            Self::NvSwitch { .. } | Self::NvSwitchControl => {
                MajorSource::Registered(names::NVSWITCH)
            }
            Self::VgpuVfio { .. } => MajorSource::Registered(names::VGPU_VFIO),
            Self::Capability { .. } => MajorSource::Registered(names::CAPS),
            Self::ImexChannel { .. } => MajorSource::Registered(names::CAPS_IMEX_CHANNELS),
        }
    }

    /// Kernel module that provides this node.
    pub fn module(&self) -> ModuleName {
        match self {
            Self::Gpu { instance, .. } | Self::Control { instance } => {
                ModuleName::nvidia(*instance)
            }
            Self::Modeset => ModuleName::new(names::MODESET),
            Self::Uvm { .. } | Self::UvmTools { .. } => ModuleName::new(names::UVM),
            Self::VgpuVfio { .. } => ModuleName::new(names::VGPU_VFIO),
            Self::NvLink
            | Self::NvSwitch { .. }
            | Self::NvSwitchControl
            | Self::Capability { .. }
            | Self::ImexChannel { .. } => ModuleName::nvidia(None),
        }
    }

    /// Where the permission policy for this node is read from.
    pub fn policy_source(&self, paths: &HostPaths) -> PathBuf {
        match self {
            Self::Capability { source, .. } => source.clone(),
            Self::Gpu { instance, .. } | Self::Control { instance } => {
                paths.driver_params(*instance)
            }
            _ => paths.driver_params(None),
        }
    }
}
