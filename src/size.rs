//! When no maximum size is configured, disk backends size themselves
//! from the free space on the cache's filesystem.
//!
//! The curve is piecewise: with very little space, use most of it;
//! then hold at the default size; then grow with a tenth of the free
//! space; hold again at two and a half times the default; grow with a
//! hundredth of the free space; and finally cap at the largest size.
//! Every piece starts where the previous one ends, so the result never
//! decreases as free space grows.
use std::path::Path;

use crate::error::Result;

const MIB: u64 = 1024 * 1024;

/// Default size of the in-memory backend.
pub(crate) const DEFAULT_MEMORY_SIZE: u64 = 10 * MIB;

/// Parameters of the automatic size curve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizePolicy {
    /// The size for moderately full disks.
    pub default_size: u64,
    /// Upper bound before scaling.
    pub largest_size: u64,
    /// Multiplies the unscaled result; the product is capped at a
    /// fifth of the available space.  1 means no scaling.
    pub scale: u64,
}

impl Default for SizePolicy {
    fn default() -> SizePolicy {
        SizePolicy::with_default_size(80 * MIB)
    }
}

impl SizePolicy {
    /// Returns a policy with the given default size, the largest size
    /// four times that, and no scaling.
    pub fn with_default_size(default_size: u64) -> SizePolicy {
        SizePolicy {
            default_size,
            largest_size: default_size.saturating_mul(4),
            scale: 1,
        }
    }

    fn unscaled(&self, available: u64) -> u64 {
        let default = self.default_size;
        let largest = self.largest_size;

        if available < default.saturating_mul(10) / 8 {
            available / 10 * 8 + (available % 10) * 8 / 10
        } else if available < default.saturating_mul(10) {
            default
        } else if available < default.saturating_mul(25) {
            available / 10
        } else if available < default.saturating_mul(250) {
            default.saturating_mul(5) / 2
        } else if available < largest.saturating_mul(100) {
            available / 100
        } else {
            largest
        }
    }

    /// Returns the cache size to use with `available` bytes free.
    pub fn preferred_cache_size(&self, available: u64) -> u64 {
        let size = self.unscaled(available);
        if self.scale <= 1 {
            return size;
        }

        size.saturating_mul(self.scale).min(available / 5)
    }
}

/// Returns the number of bytes available to unprivileged users on the
/// filesystem that holds `path`.
pub(crate) fn available_space(path: &Path) -> Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| crate::Error::InvalidArgument("cache path contains a NUL byte"))?;
    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    // Safety: `c_path` is NUL-terminated and `stats` is a valid out
    // parameter.
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stats) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    Ok((stats.f_bavail as u64).saturating_mul(stats.f_frsize as u64))
}
