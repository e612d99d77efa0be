//! Error types for the device-file engine.
//!
//! All errors use `thiserror` so the CLI can print a readable chain. Every
//! variant is recovered at the operation boundary; nothing here is fatal to
//! the process.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, ModprobeError>;

/// Broad failure classes, independent of which operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PermissionDenied,
    HardwareAbsent,
    ResourceUnavailable,
    StateConflict,
    CreationFailed,
    MalformedInput,
    Unexpected,
}

/// Main error type for the engine.
#[derive(Error, Debug)]
pub enum ModprobeError {
    // Module loading errors
    #[error("Cannot load kernel module {module}: {reason}")]
    PermissionDenied { module: String, reason: String },

    #[error("No NVIDIA PCI devices found, not loading {module}")]
    HardwareAbsent { module: String },

    #[error("Kernel module {module} is not loaded after running {loader:?}")]
    ModuleLoadFailed { module: String, loader: PathBuf },

    #[error("Failed to spawn {loader:?}: {source}")]
    SpawnFailed {
        loader: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Lookup errors
    #[error("Resource unavailable at {path:?}: {reason}")]
    ResourceUnavailable { path: PathBuf, reason: String },

    #[error("No character device major registered for {name}")]
    MajorNotFound { name: String },

    // Device node errors
    #[error("Cannot remove conflicting file at {path:?}: {source}")]
    StateConflict {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create {path:?}: {source}")]
    CreationFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to set ownership or mode of {path:?}: {source}")]
    PermissionFixFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot link {link:?} to {target:?}: {reason}")]
    SymlinkFailed { link: PathBuf, target: PathBuf, reason: String },

    // Input errors
    #[error("Invalid input: {reason}")]
    MalformedInput { reason: String },

    // PCI enumeration
    #[error(transparent)]
    PciScan(#[from] crate::pci::PciScanError),

    // Generic errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ModprobeError {
    /// Create a MalformedInput error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedInput { reason: reason.into() }
    }

    /// Failure class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PermissionDenied { .. } | Self::PermissionFixFailed { .. } => {
                ErrorKind::PermissionDenied
            }
            Self::HardwareAbsent { .. } => ErrorKind::HardwareAbsent,
            Self::ResourceUnavailable { .. } | Self::MajorNotFound { .. } | Self::PciScan(_) => {
                ErrorKind::ResourceUnavailable
            }
            Self::StateConflict { .. } => ErrorKind::StateConflict,
            Self::CreationFailed { .. }
            | Self::SymlinkFailed { .. }
            | Self::ModuleLoadFailed { .. }
            | Self::SpawnFailed { .. } => ErrorKind::CreationFailed,
            Self::MalformedInput { .. } => ErrorKind::MalformedInput,
            Self::IoError { .. } | Self::Internal(_) => ErrorKind::Unexpected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = ModprobeError::StateConflict {
            path: PathBuf::from("/dev/nvidia0"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert_eq!(err.kind(), ErrorKind::StateConflict);
        assert_eq!(ModprobeError::malformed("minor -1").kind(), ErrorKind::MalformedInput);
        assert_eq!(
            ModprobeError::HardwareAbsent { module: "nvidia".into() }.kind(),
            ErrorKind::HardwareAbsent
        );
    }

    #[test]
    fn test_display_includes_path() {
        let err = ModprobeError::CreationFailed {
            path: PathBuf::from("/dev/nvidiactl"),
            source: std::io::Error::from(std::io::ErrorKind::AlreadyExists),
        };
        assert!(err.to_string().contains("/dev/nvidiactl"));
    }
}
