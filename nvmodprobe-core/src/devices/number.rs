//! Device number packing.
//!
//! The same [`DeviceEncoding`] must be used for the number passed to mknod
//! and for the comparison against `st_rdev`, otherwise an existing node would
//! never compare equal.

/// Largest minor number representable in the extended layout.
pub const MAX_MINOR: u32 = (1 << 20) - 1;

/// Largest major number representable in the extended layout.
pub const MAX_MAJOR: u32 = (1 << 12) - 1;

/// A (major, minor) pair identifying a character device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct DeviceId {
    pub major: u32,
    pub minor: u32,
}

impl DeviceId {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// `dev_t` bit layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceEncoding {
    /// 8-bit minor directly under the major: `major << 8 | minor`.
    Legacy,
    /// Linux userspace layout: minor bits 0-7, major bits 8-19, minor bits
    /// 8 and up at bit 20, high major bits at bit 44.
    #[default]
    Extended,
}

impl DeviceEncoding {
    /// Pack a device id into a `dev_t` value.
    pub fn pack(self, id: DeviceId) -> u64 {
        let major = u64::from(id.major);
        let minor = u64::from(id.minor);

        match self {
            Self::Legacy => (major << 8) | minor,
            Self::Extended => {
                (minor & 0xff)
                    | ((major & 0xfff) << 8)
                    | ((minor & !0xff) << 12)
                    | ((major & !0xfff) << 32)
            }
        }
    }

    /// Split a `dev_t` value back into a device id.
    pub fn unpack(self, dev: u64) -> DeviceId {
        match self {
            Self::Legacy => DeviceId::new((dev >> 8) as u32, (dev & 0xff) as u32),
            Self::Extended => {
                let major = ((dev >> 8) & 0xfff) | ((dev >> 32) & !0xfff);
                let minor = (dev & 0xff) | ((dev >> 12) & !0xff);
                DeviceId::new(major as u32, minor as u32)
            }
        }
    }

    /// Whether an observed `st_rdev` names `id`.
    pub fn matches(self, id: DeviceId, rdev: u64) -> bool {
        self.pack(id) == rdev
    }
}
