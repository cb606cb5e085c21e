//! fd-set discipline for the select multiplexer
//!
//! On this platform an fd set is a bit mask that must be paired with an
//! upper-bound descriptor for `select`. Wrapping both here keeps the rest of
//! the reactor free of the raw `FD_*` macros, and `copy()` gives the select
//! loop its per-iteration scratch sets cheaply.

use std::io;
use std::os::fd::RawFd;

/// Hard capacity of one fd set.
pub(crate) const FD_SET_CAPACITY: usize = libc::FD_SETSIZE as usize;

pub(crate) struct FdSet {
    raw: libc::fd_set,
}

impl FdSet {
    pub fn new() -> FdSet {
        let mut raw = std::mem::MaybeUninit::<libc::fd_set>::uninit();
        unsafe {
            libc::FD_ZERO(raw.as_mut_ptr());
            FdSet { raw: raw.assume_init() }
        }
    }

    pub fn insert(&mut self, fd: RawFd) {
        debug_assert!((fd as usize) < FD_SET_CAPACITY);
        unsafe { libc::FD_SET(fd, &raw mut self.raw) }
    }

    pub fn remove(&mut self, fd: RawFd) {
        unsafe { libc::FD_CLR(fd, &raw mut self.raw) }
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        // FD_ISSET takes a mutable set pointer on some libc versions; the
        // set is not modified.
        let set = (&raw const self.raw).cast_mut();
        unsafe { libc::FD_ISSET(fd, set) }
    }

    /// Scratch copy for one select call.
    pub fn copy(&self) -> FdSet {
        FdSet { raw: self.raw }
    }
}

/// Block in `select` until a descriptor in one of the scratch sets is ready
/// or the timeout expires. Returns the number of ready descriptors;
/// interruption by a signal is surfaced as `Interrupted`.
pub(crate) fn select(
    fd_range: RawFd,
    read: &mut FdSet,
    write: &mut FdSet,
    except: &mut FdSet,
    timeout_ms: u64,
) -> io::Result<usize> {
    let mut timeout = libc::timeval {
        tv_sec: (timeout_ms / 1000) as libc::time_t,
        tv_usec: ((timeout_ms % 1000) * 1000) as libc::suseconds_t,
    };
    let ready = unsafe {
        libc::select(
            fd_range,
            &raw mut read.raw,
            &raw mut write.raw,
            &raw mut except.raw,
            &raw mut timeout,
        )
    };
    if ready < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ready as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_operations() {
        let mut set = FdSet::new();
        assert!(!set.contains(5));
        set.insert(5);
        set.insert(9);
        assert!(set.contains(5));
        assert!(set.contains(9));

        let snapshot = set.copy();
        set.remove(5);
        assert!(!set.contains(5));
        assert!(snapshot.contains(5));
        assert!(snapshot.contains(9));
    }

    #[test]
    fn test_select_times_out() {
        let mut read = FdSet::new();
        let mut write = FdSet::new();
        let mut except = FdSet::new();
        let ready = select(0, &mut read, &mut write, &mut except, 10).unwrap();
        assert_eq!(ready, 0);
    }
}
