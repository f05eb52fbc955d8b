//! Interprocess mutex over a named POSIX semaphore.
//!
//! One binary semaphore guards every mutation of the shared metadata:
//! the sharing bitmap, the shared counters, and `alive_procs`. rustix has
//! no named-semaphore wrapper, so this module calls `libc` directly.
//!
//! The lock is also taken inside the write-fault handler, so both `wait`
//! and `post` preserve `errno`: the faulting application code must
//! observe the value it had before the trap.

use crate::error::{Error, Result};
use std::ffi::CString;

/// Saves `errno` on construction and restores it on drop.
///
/// Async-signal-safe: only touches the thread-local errno slot.
pub struct ErrnoGuard(i32);

impl ErrnoGuard {
    /// Capture the current `errno`.
    pub fn save() -> Self {
        // SAFETY: __errno_location always returns a valid thread-local slot.
        Self(unsafe { *libc::__errno_location() })
    }
}

impl Drop for ErrnoGuard {
    fn drop(&mut self) {
        // SAFETY: as above.
        unsafe { *libc::__errno_location() = self.0 };
    }
}

/// A named counting semaphore used as a cross-process mutex.
pub struct IpcSem {
    sem: *mut libc::sem_t,
    name: CString,
}

impl IpcSem {
    /// Open the semaphore at `name`, creating it with value 1 if absent.
    ///
    /// The first process on the node creates it (`O_CREAT|O_EXCL`); later
    /// siblings attach to the existing one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Semaphore`] if the name is invalid or the kernel
    /// refuses the open.
    pub fn open(name: &str) -> Result<Self> {
        let cname = CString::new(name)
            .map_err(|_| Error::Semaphore(format!("invalid semaphore name {name:?}")))?;

        // SAFETY: cname is a valid NUL-terminated path.
        let mut sem = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                1 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EEXIST) {
                // SAFETY: as above; attach-only open.
                sem = unsafe { libc::sem_open(cname.as_ptr(), 0) };
            }
        }
        if sem == libc::SEM_FAILED {
            return Err(Error::Semaphore(format!(
                "sem_open({name}) failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        Ok(Self { sem, name: cname })
    }

    /// Block until the mutex is held, returning a guard that releases it
    /// on drop. `errno` is unchanged across the call.
    pub fn lock(&self) -> SemGuard<'_> {
        let _errno = ErrnoGuard::save();
        loop {
            // SAFETY: self.sem is a live semaphore for the life of self.
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                break;
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                // A wait that fails for any reason but a signal means the
                // shared metadata can no longer be kept consistent.
                crate::fault::raw_fatal(b"pagefold: sem_wait failed\n");
            }
        }
        SemGuard { sem: self }
    }

    fn unlock(&self) {
        let _errno = ErrnoGuard::save();
        // SAFETY: self.sem is a live semaphore; the guard proves we hold it.
        if unsafe { libc::sem_post(self.sem) } != 0 {
            crate::fault::raw_fatal(b"pagefold: sem_post failed\n");
        }
    }

    /// Close this process's handle. The kernel object survives until the
    /// last sibling unlinks it.
    pub fn close(&self) {
        // SAFETY: self.sem is a live semaphore handle.
        unsafe { libc::sem_close(self.sem) };
    }

    /// Remove the name from the system. Called by the last departing
    /// sibling only.
    pub fn unlink(&self) {
        // SAFETY: self.name is a valid NUL-terminated path.
        unsafe { libc::sem_unlink(self.name.as_ptr()) };
    }
}

// SAFETY: sem_t operations are process-shared by construction; the handle
// itself is just a pointer the kernel validates.
unsafe impl Send for IpcSem {}
unsafe impl Sync for IpcSem {}

/// Holds the interprocess mutex; releases on drop.
pub struct SemGuard<'a> {
    sem: &'a IpcSem,
}

impl Drop for SemGuard<'_> {
    fn drop(&mut self) {
        self.sem.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_name(tag: &str) -> String {
        format!("/pagefold-test-{}-{}", tag, std::process::id())
    }

    #[test]
    fn test_open_lock_unlock() {
        let name = test_name("basic");
        let sem = IpcSem::open(&name).unwrap();
        {
            let _guard = sem.lock();
        }
        // Re-lockable after release.
        {
            let _guard = sem.lock();
        }
        sem.close();
        sem.unlink();
    }

    #[test]
    fn test_reopen_attaches() {
        let name = test_name("reopen");
        let first = IpcSem::open(&name).unwrap();
        let second = IpcSem::open(&name).unwrap();

        // Both handles address the same kernel object: a value taken
        // through one is observed through the other.
        let guard = first.lock();
        drop(guard);
        let guard = second.lock();
        drop(guard);

        second.close();
        first.close();
        first.unlink();
    }

    #[test]
    fn test_errno_preserved_across_lock() {
        let name = test_name("errno");
        let sem = IpcSem::open(&name).unwrap();

        // SAFETY: writing the thread-local errno slot.
        unsafe { *libc::__errno_location() = libc::EBADF };
        {
            let _guard = sem.lock();
        }
        // SAFETY: reading the thread-local errno slot.
        let after = unsafe { *libc::__errno_location() };
        assert_eq!(after, libc::EBADF);

        sem.close();
        sem.unlink();
    }

    #[test]
    fn test_invalid_name_rejected() {
        assert!(IpcSem::open("bad\0name").is_err());
    }
}
