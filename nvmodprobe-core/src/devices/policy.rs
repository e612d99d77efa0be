//! Device-file permission policy.
//!
//! The driver exposes the desired owner, group and mode of its device files
//! as `Name: value` lines (`/proc/driver/nvidia/params` or a capability
//! file). The driver can change these at any time, so they are read fresh
//! on every reconciliation and never cached.

use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, trace};

/// Default device-file mode (rw for everyone).
pub const DEFAULT_MODE: u32 = 0o666;

/// Mode bits compared and applied.
pub const MODE_MASK: u32 = 0o777;

/// Policy keys.
pub mod keys {
    pub const UID: &str = "DeviceFileUID";
    pub const GID: &str = "DeviceFileGID";
    pub const MODE: &str = "DeviceFileMode";
    pub const MODIFY: &str = "ModifyDeviceFiles";
    /// Spelling used by capability files.
    pub const MODIFY_ALT: &str = "DeviceFileModify";
    /// Capability files only.
    pub const MINOR: &str = "DeviceFileMinor";
}

/// Desired device-file attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceFilePolicy {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    /// The driver allows this helper to create or fix the node.
    pub modify: bool,
}

impl Default for DeviceFilePolicy {
    fn default() -> Self {
        Self { uid: 0, gid: 0, mode: DEFAULT_MODE, modify: true }
    }
}

impl DeviceFilePolicy {
    /// Apply one `key: value` pair. Unknown keys are ignored.
    fn apply(&mut self, key: &str, value: u32) {
        match key {
            keys::UID => self.uid = value,
            keys::GID => self.gid = value,
            keys::MODE => self.mode = value,
            keys::MODIFY | keys::MODIFY_ALT => self.modify = value == 1,
            _ => {}
        }
    }
}

/// Read the policy from `source`.
///
/// Never fails: a missing or unreadable source yields the defaults, and a
/// read error part way through keeps what was parsed so far.
pub fn read_policy(source: Option<&Path>) -> DeviceFilePolicy {
    let mut policy = DeviceFilePolicy::default();

    let Some(path) = source else {
        return policy;
    };

    for (key, value) in read_fields(path) {
        policy.apply(&key, value);
    }

    debug!(
        source = %path.display(),
        uid = policy.uid,
        gid = policy.gid,
        mode = %format!("{:o}", policy.mode),
        modify = policy.modify,
        "Read device file policy"
    );

    policy
}

/// Minor number published by a capability file.
pub fn read_capability_minor(path: &Path) -> Option<u32> {
    read_fields(path).find(|(key, _)| key == keys::MINOR).map(|(_, value)| value)
}

/// Iterate the numeric `Name: value` pairs of a parameter file.
///
/// Lines without a colon or with a non-numeric value are skipped; iteration
/// stops at the first read error.
fn read_fields(path: &Path) -> impl Iterator<Item = (String, u32)> {
    let reader = match File::open(path) {
        Ok(f) => Some(BufReader::new(f)),
        Err(e) => {
            trace!(path = %path.display(), error = %e, "Parameter file unreadable");
            None
        }
    };

    reader
        .into_iter()
        .flat_map(|r| r.lines().map_while(|line| line.ok()))
        .filter_map(|line| parse_field(&line))
}

fn parse_field(line: &str) -> Option<(String, u32)> {
    let (key, value) = line.split_once(':')?;
    let value = value.trim().parse().ok()?;
    Some((key.to_string(), value))
}
