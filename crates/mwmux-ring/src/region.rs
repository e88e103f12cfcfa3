//! Page-aligned shared memory regions.
//!
//! On real deployments the region arrives from the hypervisor: the PVM
//! allocates and grants it, the INS maps the grants as one contiguous run.
//! Both paths end in `SharedRegion::from_raw`. Tests and the loopback rig
//! use `SharedRegion::anon`, an anonymous shared mapping.

use crate::error::{Result, RingError};
use mwmux_proto::config::PAGE_SIZE;

#[derive(Debug)]
pub struct SharedRegion {
    base: *mut u8,
    len: usize,
    /// Whether we created the mapping and must munmap on drop.
    owned: bool,
}

// Safety: the region is raw shared memory; all concurrent access goes
// through the ring's atomics and volatile slot copies. The struct itself
// only carries the pointer and length.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Map `pages` anonymous shared pages.
    pub fn anon(pages: usize) -> Result<Self> {
        let len = pages * PAGE_SIZE;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let errno = unsafe { *libc::__errno_location() };
            return Err(RingError::MapFailed(errno));
        }
        Ok(Self {
            base: ptr as *mut u8,
            len,
            owned: true,
        })
    }

    /// Wrap an externally mapped region (grant-mapped pages).
    ///
    /// # Safety
    ///
    /// `base` must point to a mapping of at least `len` bytes that stays
    /// valid for the lifetime of this struct; the caller keeps ownership
    /// of the mapping.
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Self {
        Self {
            base,
            len,
            owned: false,
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn pages(&self) -> usize {
        self.len / PAGE_SIZE
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if self.owned && !self.base.is_null() {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.len);
            }
            self.base = std::ptr::null_mut();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
