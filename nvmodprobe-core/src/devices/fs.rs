//! Filesystem seam for device-node operations.
//!
//! The reconciler only talks to the filesystem through [`DeviceFs`], which
//! keeps the decision logic testable without root.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{symlink, DirBuilderExt, FileTypeExt, MetadataExt, PermissionsExt};
use std::path::Path;

/// File type as far as the reconciler cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    CharDevice,
    Directory,
    Other,
}

/// Result of a `stat` (symlinks followed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStat {
    pub node_type: NodeType,
    pub rdev: u64,
    /// Permission bits only.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub ino: u64,
}

/// Filesystem operations used by the reconciler.
pub trait DeviceFs {
    /// Stat `path`, following symlinks.
    fn stat(&self, path: &Path) -> io::Result<NodeStat>;

    /// Create a character special file.
    fn mknod_char(&self, path: &Path, mode: u32, rdev: u64) -> io::Result<()>;

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()>;

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()>;

    /// Remove a file, or an empty directory.
    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Remove a non-directory entry without following symlinks.
    fn unlink(&self, path: &Path) -> io::Result<()>;

    /// Create a symbolic link at `link` whose content is `target`.
    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()>;

    /// Create one directory level with `mode`.
    fn create_dir(&self, path: &Path, mode: u32) -> io::Result<()>;
}

/// [`DeviceFs`] backed by the real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemFs;

impl DeviceFs for SystemFs {
    fn stat(&self, path: &Path) -> io::Result<NodeStat> {
        let meta = std::fs::metadata(path)?;
        let file_type = meta.file_type();

        let node_type = if file_type.is_char_device() {
            NodeType::CharDevice
        } else if file_type.is_dir() {
            NodeType::Directory
        } else {
            NodeType::Other
        };

        Ok(NodeStat {
            node_type,
            rdev: meta.rdev(),
            mode: meta.mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
            ino: meta.ino(),
        })
    }

    fn mknod_char(&self, path: &Path, mode: u32, rdev: u64) -> io::Result<()> {
        let c_path = CString::new(path.as_os_str().as_bytes())?;

        let ret = unsafe {
            libc::mknod(c_path.as_ptr(), libc::S_IFCHR | mode as libc::mode_t, rdev as libc::dev_t)
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        std::os::unix::fs::chown(path, Some(uid), Some(gid))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        if std::fs::symlink_metadata(path)?.is_dir() {
            std::fs::remove_dir(path)
        } else {
            std::fs::remove_file(path)
        }
    }

    fn unlink(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        symlink(target, link)
    }

    fn create_dir(&self, path: &Path, mode: u32) -> io::Result<()> {
        std::fs::DirBuilder::new().mode(mode).create(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_stat_regular_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("file");
        std::fs::write(&path, b"x").unwrap();
        SystemFs.chmod(&path, 0o640).unwrap();

        let st = SystemFs.stat(&path).unwrap();
        assert_eq!(st.node_type, NodeType::Other);
        assert_eq!(st.mode, 0o640);
        assert_eq!(st.uid, unsafe { libc::geteuid() });
    }

    #[test]
    fn test_symlink_stat_follows() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("target");
        let link = tmp.path().join("link");
        std::fs::write(&target, b"x").unwrap();
        SystemFs.symlink(Path::new("target"), &link).unwrap();

        assert_eq!(SystemFs.stat(&link).unwrap().ino, SystemFs.stat(&target).unwrap().ino);
        SystemFs.unlink(&link).unwrap();
        assert!(target.exists());
    }

    #[test]
    fn test_create_and_remove_dir() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("nvidia-caps");
        SystemFs.create_dir(&dir, 0o755).unwrap();
        assert_eq!(SystemFs.stat(&dir).unwrap().node_type, NodeType::Directory);
        assert_eq!(
            SystemFs.create_dir(&dir, 0o755).unwrap_err().kind(),
            io::ErrorKind::AlreadyExists
        );
        SystemFs.remove(&dir).unwrap();
        assert!(!dir.exists());
    }
}
