//! Advisory byte-range file locks and the per-process region-use list.
//!
//! All cross-process coordination goes through `fcntl` record locks on the
//! backing file: the control range `[0, dataOffset)` serializes index
//! mutation, and each in-use data region is locked shared by readers and
//! exclusive by writers and evictors. Locks are acquired control-first,
//! data-second; the kernel drops everything a process holds when it exits,
//! so a crash mid-transaction cannot strand a lock.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{PqError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LockMode {
    Shared,
    Exclusive,
}

/// Byte-range locker over the backing file. With locking disabled
/// (single-process use) every call degenerates to a no-op success.
pub(crate) struct FileLock {
    file: Arc<File>,
    enabled: bool,
}

impl FileLock {
    pub fn new(file: Arc<File>, enabled: bool) -> FileLock {
        FileLock { file, enabled }
    }

    /// Acquire a lock on `[offset, offset+extent)`. Blocking acquisition
    /// retries on signal interruption; non-blocking contention surfaces as
    /// [`PqError::Locked`].
    pub fn lock(&self, offset: u64, extent: u64, mode: LockMode, wait: bool) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let ty = match mode {
            LockMode::Shared => libc::F_RDLCK,
            LockMode::Exclusive => libc::F_WRLCK,
        };
        self.fcntl_lock(offset, extent, ty as libc::c_short, wait)
    }

    /// Release a previously acquired lock range.
    pub fn unlock(&self, offset: u64, extent: u64) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.fcntl_lock(offset, extent, libc::F_UNLCK as libc::c_short, true)
    }

    fn fcntl_lock(&self, offset: u64, extent: u64, ty: libc::c_short, wait: bool) -> Result<()> {
        // Zero-init: flock carries private padding fields on some libcs.
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = ty;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = offset as libc::off_t;
        fl.l_len = extent as libc::off_t;
        let cmd = if wait { libc::F_SETLKW } else { libc::F_SETLK };
        loop {
            let rc = unsafe { libc::fcntl(self.file.as_raw_fd(), cmd, &mut fl) };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) if wait => continue,
                Some(libc::EAGAIN) | Some(libc::EACCES) if !wait => {
                    return Err(PqError::Locked);
                }
                _ => return Err(PqError::System(err)),
            }
        }
    }
}

/// One entry per data-region lock this process currently holds.
pub(crate) struct RegionUse {
    pub offset: u64,
    pub extent: u64,
    pub mode: LockMode,
    /// Mapped (or buffered) address of the region's first byte.
    pub ptr: NonNull<u8>,
}

/// The process-local "regions in use" table. It mirrors every held data
/// region lock and is the authority for release.
#[derive(Default)]
pub(crate) struct UseList {
    entries: Vec<RegionUse>,
}

impl UseList {
    pub fn add(&mut self, entry: RegionUse) {
        debug_assert!(self.find(entry.offset).is_none());
        self.entries.push(entry);
    }

    pub fn find(&self, offset: u64) -> Option<&RegionUse> {
        self.entries.iter().find(|e| e.offset == offset)
    }

    pub fn take(&mut self, offset: u64) -> Option<RegionUse> {
        let at = self.entries.iter().position(|e| e.offset == offset)?;
        Some(self.entries.swap_remove(at))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn drain(&mut self) -> Vec<RegionUse> {
        std::mem::take(&mut self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_lock_roundtrip() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[0u8; 4096]).unwrap();
        let file = Arc::new(tmp.reopen().unwrap());
        let lk = FileLock::new(file, true);

        lk.lock(0, 1024, LockMode::Exclusive, true).unwrap();
        // Same process: overlapping requests merge rather than conflict.
        lk.lock(0, 1024, LockMode::Shared, false).unwrap();
        lk.unlock(0, 1024).unwrap();
    }

    #[test]
    fn test_disabled_is_noop() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let lk = FileLock::new(Arc::new(tmp.reopen().unwrap()), false);
        lk.lock(0, u64::MAX, LockMode::Exclusive, false).unwrap();
        lk.unlock(0, u64::MAX).unwrap();
    }

    #[test]
    fn test_use_list() {
        let mut ul = UseList::default();
        assert!(ul.is_empty());
        ul.add(RegionUse {
            offset: 0x1000,
            extent: 64,
            mode: LockMode::Shared,
            ptr: NonNull::dangling(),
        });
        assert!(ul.find(0x1000).is_some());
        assert!(ul.find(0x2000).is_none());
        let e = ul.take(0x1000).unwrap();
        assert_eq!(e.extent, 64);
        assert!(ul.is_empty());
    }
}
