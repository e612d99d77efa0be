//! Device files: naming, numbering, policy and reconciliation.

pub mod fs;
pub mod node;
pub mod number;
pub mod policy;
pub mod reconcile;

pub use fs::{DeviceFs, NodeStat, NodeType, SystemFs};
pub use node::{DeviceNode, MajorSource};
pub use number::{DeviceEncoding, DeviceId};
pub use policy::{read_capability_minor, read_policy, DeviceFilePolicy};
pub use reconcile::{DeviceReconciler, FileState, NodeReport};
