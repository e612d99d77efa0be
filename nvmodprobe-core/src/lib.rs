//! NVIDIA device-file engine
//!
//! Loads the NVIDIA kernel modules on demand and keeps their device files
//! present with the type, device number, ownership and mode the driver asks
//! for.

pub mod devices;
pub mod error;
pub mod kmod;
pub mod memory;
pub mod observability;
pub mod paths;
pub mod pci;

// Re-export commonly used items
pub use devices::{DeviceFilePolicy, DeviceId, DeviceNode, DeviceReconciler, FileState, NodeReport};
pub use error::{ErrorKind, ModprobeError, Result};
pub use kmod::{LoadOptions, ModuleLoader, ModuleName};
pub use observability::init as init_observability;
pub use paths::HostPaths;
