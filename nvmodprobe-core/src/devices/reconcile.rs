//! Device node reconciliation.
//!
//! Compares a device file on disk against the driver's policy and performs
//! the smallest fix: create, replace, chmod/chown, or nothing. Every
//! successful pass ends with the `/dev/char/<major>:<minor>` alias, and the
//! alias result is the result of the pass.
//!
//! There is no locking between observing a node and acting on it. Callers
//! are expected to run rarely and not concurrently against the same paths.

use crate::devices::fs::{DeviceFs, NodeType, SystemFs};
use crate::devices::node::{DeviceNode, MajorSource};
use crate::devices::number::{DeviceEncoding, DeviceId};
use crate::devices::policy::{read_policy, DeviceFilePolicy, MODE_MASK};
use crate::error::{ModprobeError, Result};
use crate::kmod;
use crate::paths::HostPaths;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Mode for intermediate device directories such as `/dev/nvidia-caps`.
const DEVICE_DIR_MODE: u32 = 0o755;

/// Observed state of a device file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FileState {
    pub exists: bool,
    /// Character device with the expected device number.
    pub chr_dev_ok: bool,
    /// Mode, owner and group as the policy asks.
    pub permissions_ok: bool,
}

impl FileState {
    /// Nothing to fix.
    pub fn is_ready(&self) -> bool {
        self.exists && self.chr_dev_ok && self.permissions_ok
    }
}

/// Observation of one [`DeviceNode`], for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub path: PathBuf,
    /// `None` when the major number is not registered.
    pub device: Option<DeviceId>,
    pub policy: DeviceFilePolicy,
    pub state: FileState,
}

/// Reconciles device files against their permission policy.
#[derive(Debug, Clone)]
pub struct DeviceReconciler<F: DeviceFs = SystemFs> {
    paths: HostPaths,
    fs: F,
    encoding: DeviceEncoding,
}

impl DeviceReconciler<SystemFs> {
    /// Reconciler operating on the real filesystem.
    pub fn new(paths: HostPaths) -> Self {
        Self::with_fs(paths, SystemFs)
    }
}

impl<F: DeviceFs> DeviceReconciler<F> {
    pub fn with_fs(paths: HostPaths, fs: F) -> Self {
        Self { paths, fs, encoding: DeviceEncoding::default() }
    }

    pub fn paths(&self) -> &HostPaths {
        &self.paths
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    /// Resolve the device number of `node`.
    pub fn device_id(&self, node: &DeviceNode) -> Result<DeviceId> {
        let major = match node.major_source() {
            MajorSource::Fixed(major) => major,
            MajorSource::Registered(name) => kmod::char_major(&self.paths.proc_devices, name)
                .ok_or_else(|| ModprobeError::MajorNotFound { name: name.to_string() })?,
        };
        Ok(DeviceId::new(major, node.minor()))
    }

    /// Create or fix the device file for `node`.
    ///
    /// The parent directory is only created when the policy allows
    /// modification.
    pub fn ensure(&self, node: &DeviceNode) -> Result<()> {
        let id = self.device_id(node)?;
        let source = node.policy_source(&self.paths);

        if let Some(dir) = node.parent_dir(&self.paths) {
            if read_policy(Some(&source)).modify {
                self.ensure_dir(&dir)?;
            }
        }

        let path = node.path(&self.paths);
        self.reconcile(id, &path, Some(&source))
    }

    /// Observe the device file for `node` without changing anything.
    pub fn inspect(&self, node: &DeviceNode) -> NodeReport {
        let path = node.path(&self.paths);
        let policy = read_policy(Some(&node.policy_source(&self.paths)));

        let device = match self.device_id(node) {
            Ok(id) => Some(id),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Cannot resolve device number");
                None
            }
        };

        let state = match device {
            Some(id) => self.state_for(id, &path, &policy),
            None => FileState { exists: self.fs.stat(&path).is_ok(), ..FileState::default() },
        };

        NodeReport { path, device, policy, state }
    }

    /// Observe `path` against the policy read from `policy_source`.
    pub fn observe(&self, id: DeviceId, path: &Path, policy_source: Option<&Path>) -> FileState {
        let policy = read_policy(policy_source);
        self.state_for(id, path, &policy)
    }

    /// Bring `path` in line with `id` and the policy read from
    /// `policy_source`, then refresh the `/dev/char` alias.
    ///
    /// If the policy forbids modification only the alias is attempted. A
    /// node created by this call is removed again if its permissions cannot
    /// be applied; a pre-existing node is left as found.
    #[instrument(skip_all, fields(device = %id, path = %path.display()))]
    pub fn reconcile(&self, id: DeviceId, path: &Path, policy_source: Option<&Path>) -> Result<()> {
        let policy = read_policy(policy_source);

        if !policy.modify {
            debug!("Device file modification disabled by driver");
            return self.link_char_alias(id, path);
        }

        let state = self.state_for(id, path, &policy);
        if state.is_ready() {
            debug!("Device file already correct");
            return self.link_char_alias(id, path);
        }

        if state.exists && !state.chr_dev_ok {
            info!("Replacing device file with wrong type or device number");
            self.fs
                .remove(path)
                .map_err(|e| ModprobeError::StateConflict { path: path.to_path_buf(), source: e })?;
        }

        let created = !state.exists || !state.chr_dev_ok;
        if created {
            self.fs
                .mknod_char(path, policy.mode, self.encoding.pack(id))
                .map_err(|e| ModprobeError::CreationFailed {
                    path: path.to_path_buf(),
                    source: e,
                })?;
            info!(mode = %format!("{:o}", policy.mode), "Created device file");
        }

        // mknod is subject to the umask, so the mode is always set explicitly.
        if let Err(e) = self.apply_permissions(path, &policy) {
            if created {
                if let Err(remove_err) = self.fs.remove(path) {
                    warn!(error = %remove_err, "Failed to remove partially configured device file");
                }
            }
            return Err(ModprobeError::PermissionFixFailed { path: path.to_path_buf(), source: e });
        }

        self.link_char_alias(id, path)
    }

    fn apply_permissions(&self, path: &Path, policy: &DeviceFilePolicy) -> io::Result<()> {
        self.fs.chmod(path, policy.mode)?;
        self.fs.chown(path, policy.uid, policy.gid)
    }

    fn state_for(&self, id: DeviceId, path: &Path, policy: &DeviceFilePolicy) -> FileState {
        let Ok(st) = self.fs.stat(path) else {
            return FileState::default();
        };

        FileState {
            exists: true,
            chr_dev_ok: st.node_type == NodeType::CharDevice && self.encoding.matches(id, st.rdev),
            permissions_ok: (st.mode & MODE_MASK) == policy.mode
                && st.uid == policy.uid
                && st.gid == policy.gid,
        }
    }

    fn ensure_dir(&self, dir: &Path) -> Result<()> {
        match self.fs.create_dir(dir, DEVICE_DIR_MODE) {
            Ok(()) => {
                debug!(path = %dir.display(), "Created device directory");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(ModprobeError::CreationFailed { path: dir.to_path_buf(), source: e }),
        }
    }

    /// Point `/dev/char/<major>:<minor>` at `path` with a relative link.
    ///
    /// An existing alias is always replaced. If the new link cannot be made
    /// but whatever is there already resolves to the same inode, the alias
    /// counts as correct.
    fn link_char_alias(&self, id: DeviceId, path: &Path) -> Result<()> {
        let link = self.paths.dev_char_dir.join(id.to_string());
        let fail = |reason: String| ModprobeError::SymlinkFailed {
            link: link.clone(),
            target: path.to_path_buf(),
            reason,
        };

        let target = match self.fs.stat(path) {
            Ok(st) if st.node_type == NodeType::CharDevice => st,
            Ok(_) => return Err(fail("target is not a character device".to_string())),
            Err(e) => return Err(fail(e.to_string())),
        };

        let relative = path
            .strip_prefix(&self.paths.dev_dir)
            .map(|rest| Path::new("..").join(rest))
            .map_err(|_| {
                fail(format!("target is outside {}", self.paths.dev_dir.display()))
            })?;

        let _ = self.fs.unlink(&link);

        if let Err(e) = self.fs.symlink(&relative, &link) {
            return match self.fs.stat(&link) {
                Ok(existing) if existing.ino == target.ino => {
                    debug!(link = %link.display(), "Existing device alias already correct");
                    Ok(())
                }
                _ => Err(fail(e.to_string())),
            };
        }

        debug!(link = %link.display(), target = %relative.display(), "Linked device alias");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const DEVICES: &str = "\
Character devices:
  1 mem
195 nvidia
234 nvidia-caps
505 nvidia-uvm

Block devices:
  8 sd
";

    fn sandbox() -> (TempDir, DeviceReconciler) {
        let tmp = TempDir::new().unwrap();
        let paths = HostPaths::rooted_at(tmp.path());
        fs::create_dir_all(paths.proc_devices.parent().unwrap()).unwrap();
        fs::write(&paths.proc_devices, DEVICES).unwrap();
        fs::create_dir_all(&paths.dev_char_dir).unwrap();
        fs::create_dir_all(&paths.proc_driver).unwrap();
        (tmp, DeviceReconciler::new(paths))
    }

    #[test]
    fn test_device_id_resolution() {
        let (_tmp, reconciler) = sandbox();

        let gpu = DeviceNode::gpu(3, None).unwrap();
        assert_eq!(reconciler.device_id(&gpu).unwrap(), DeviceId::new(195, 3));

        let (uvm, tools) = DeviceNode::uvm_pair(0).unwrap();
        assert_eq!(reconciler.device_id(&uvm).unwrap(), DeviceId::new(505, 0));
        assert_eq!(reconciler.device_id(&tools).unwrap(), DeviceId::new(505, 1));

        let err = reconciler.device_id(&DeviceNode::NvLink).unwrap_err();
        assert!(matches!(
            err,
            ModprobeError::MajorNotFound { ref name } if name == "nvidia-nvlink"
        ));
    }

    #[test]
    fn test_observe_regular_file() {
        let (_tmp, reconciler) = sandbox();
        let path = reconciler.paths().dev_dir.join("nvidia0");
        fs::write(&path, b"").unwrap();

        let state = reconciler.observe(DeviceId::new(195, 0), &path, None);
        assert!(state.exists);
        assert!(!state.chr_dev_ok);
        assert!(!state.is_ready());

        let absent = reconciler.paths().dev_dir.join("nvidia1");
        assert_eq!(reconciler.observe(DeviceId::new(195, 1), &absent, None), FileState::default());
    }

    #[test]
    fn test_modify_disabled_touches_nothing() {
        let (_tmp, reconciler) = sandbox();
        let params = reconciler.paths().driver_params(None);
        fs::write(&params, "ModifyDeviceFiles: 0\n").unwrap();
        let path = reconciler.paths().dev_dir.join("nvidia0");

        // Only the alias is attempted, and it has no target.
        let err = reconciler.reconcile(DeviceId::new(195, 0), &path, Some(&params)).unwrap_err();
        assert!(matches!(err, ModprobeError::SymlinkFailed { .. }));
        assert!(!path.exists());
        assert!(fs::read_dir(&reconciler.paths().dev_char_dir).unwrap().next().is_none());
    }

    #[test]
    fn test_inspect_reports_unregistered_major() {
        let (_tmp, reconciler) = sandbox();
        let report = reconciler.inspect(&DeviceNode::NvLink);
        assert_eq!(report.device, None);
        assert!(!report.state.exists);
        assert_eq!(report.policy, DeviceFilePolicy::default());
        assert!(report.path.ends_with("dev/nvidia-nvlink"));
    }
}
