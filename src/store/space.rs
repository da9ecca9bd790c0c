use std::fmt;
use std::path::Path;

/// Free-space queries used by the save strategies and the undo retention policy.
///
/// `None` means "unknown" and is treated as unlimited.
pub trait SpaceProbe: Send + Sync + fmt::Debug {
    /// Free bytes available to this process on the filesystem holding `dir`
    fn available_disk_space(&self, dir: &Path) -> Option<u64>;

    /// Free physical memory in bytes
    fn available_memory(&self) -> Option<u64>;
}

/// Asks the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl SpaceProbe for SystemProbe {
    fn available_disk_space(&self, dir: &Path) -> Option<u64> {
        statvfs_available(dir)
    }

    fn available_memory(&self) -> Option<u64> {
        sysconf_available_memory()
    }
}

/// Reports fixed numbers, for callers that enforce their own quotas
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedProbe {
    pub disk: Option<u64>,
    pub memory: Option<u64>,
}

impl SpaceProbe for FixedProbe {
    fn available_disk_space(&self, _dir: &Path) -> Option<u64> {
        self.disk
    }

    fn available_memory(&self) -> Option<u64> {
        self.memory
    }
}

#[cfg(unix)]
fn statvfs_available(dir: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;

    let dir = if dir.as_os_str().is_empty() { Path::new(".") } else { dir };
    let c_path = CString::new(dir.as_os_str().as_bytes()).ok()?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();

    // SAFETY: c_path is NUL-terminated and stat points to writable storage.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    // SAFETY: statvfs returned 0, so it filled the struct.
    let stat = unsafe { stat.assume_init() };

    #[allow(clippy::useless_conversion)]
    Some(u64::from(stat.f_bavail).saturating_mul(u64::from(stat.f_frsize)))
}

#[cfg(not(unix))]
fn statvfs_available(_dir: &Path) -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
fn sysconf_available_memory() -> Option<u64> {
    // SAFETY: sysconf only reads system configuration.
    let (pages, page_size) = unsafe {
        (
            libc::sysconf(libc::_SC_AVPHYS_PAGES),
            libc::sysconf(libc::_SC_PAGESIZE),
        )
    };
    if pages < 0 || page_size < 0 {
        return None;
    }
    Some((pages as u64).saturating_mul(page_size as u64))
}

#[cfg(not(target_os = "linux"))]
fn sysconf_available_memory() -> Option<u64> {
    None
}
