//! Memory hotplug onlining policy.
//!
//! GPU memory exposed to the kernel as hotplugged blocks must be onlined as
//! movable so it can be offlined again when the driver unloads.

use crate::error::{ModprobeError, Result};
use crate::paths::HostPaths;
use std::fs;
use tracing::{debug, info};

/// Policy value written to `auto_online_blocks`.
pub const ONLINE_MOVABLE: &str = "online_movable";

/// Set the kernel's memory block auto-online policy to `online_movable`.
///
/// Nothing is written if the policy is already set.
pub fn enable_auto_online_movable(paths: &HostPaths) -> Result<()> {
    let path = &paths.auto_online_blocks;

    let current = fs::read_to_string(path).map_err(|e| ModprobeError::ResourceUnavailable {
        path: path.clone(),
        reason: e.to_string(),
    })?;

    if current.trim() == ONLINE_MOVABLE {
        debug!(path = %path.display(), "Memory auto-online policy already movable");
        return Ok(());
    }

    fs::write(path, ONLINE_MOVABLE)
        .map_err(|e| ModprobeError::IoError { path: path.clone(), source: e })?;

    info!(path = %path.display(), previous = %current.trim(), "Set memory auto-online policy");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sandbox(initial: Option<&str>) -> (TempDir, HostPaths) {
        let tmp = TempDir::new().unwrap();
        let paths = HostPaths::rooted_at(tmp.path());
        fs::create_dir_all(paths.auto_online_blocks.parent().unwrap()).unwrap();
        if let Some(value) = initial {
            fs::write(&paths.auto_online_blocks, value).unwrap();
        }
        (tmp, paths)
    }

    #[test]
    fn test_sets_policy() {
        let (_tmp, paths) = sandbox(Some("offline\n"));
        enable_auto_online_movable(&paths).unwrap();
        assert_eq!(fs::read_to_string(&paths.auto_online_blocks).unwrap(), "online_movable");
    }

    #[test]
    fn test_already_movable_untouched() {
        let (_tmp, paths) = sandbox(Some("online_movable\n"));
        enable_auto_online_movable(&paths).unwrap();
        // The trailing newline shows no write happened.
        assert_eq!(fs::read_to_string(&paths.auto_online_blocks).unwrap(), "online_movable\n");
    }

    #[test]
    fn test_missing_policy_file() {
        let (_tmp, paths) = sandbox(None);
        let err = enable_auto_online_movable(&paths).unwrap_err();
        assert!(matches!(err, ModprobeError::ResourceUnavailable { .. }));
    }
}
