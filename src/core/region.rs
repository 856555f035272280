//! Owning handles over anonymous memory mappings.
//!
//! Every block of memory the runtime shares between processes (queues, the
//! control block, packet chunk pools) or reserves at a fixed address (the heap
//! window and its shadow) lives in a [`MappedRegion`]. Dropping the handle
//! unmaps it. Forked children never drop their copies: they leave through
//! `_exit`, so the parent remains the only process that unmaps.

use std::io;
use std::ptr::{self, NonNull};

use super::error::{RuntimeError, RuntimeResult};

/// Size of a tracked page.
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Round `addr` down to its page.
#[inline]
pub const fn page_of(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Round `len` up to a whole number of pages.
#[inline]
pub const fn page_align_up(len: usize) -> usize {
    (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Access rights for [`protect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    None,
    Read,
    ReadWrite,
}

impl Protection {
    pub(crate) fn bits(self) -> libc::c_int {
        match self {
            Protection::None => libc::PROT_NONE,
            Protection::Read => libc::PROT_READ,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

/// How a region is shared across `fork`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sharing {
    /// `MAP_SHARED`: every process sees the same bytes.
    Shared,
    /// `MAP_PRIVATE`: children get copy-on-write duplicates.
    Private,
}

/// An anonymous memory mapping, unmapped on drop.
#[derive(Debug)]
pub struct MappedRegion {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the handle is only an address range; synchronisation of the bytes
// inside is the job of whoever lays data out in it.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map `len` bytes of zeroed read/write memory.
    pub fn new(len: usize, sharing: Sharing) -> RuntimeResult<Self> {
        let len = page_align_up(len.max(1));
        let flags = match sharing {
            Sharing::Shared => libc::MAP_SHARED | libc::MAP_ANONYMOUS,
            Sharing::Private => libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        };

        // SAFETY: anonymous mapping with no address hint.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(RuntimeError::Mmap {
                len,
                source: io::Error::last_os_error(),
            });
        }

        Ok(Self {
            base: NonNull::new(ptr as *mut u8).ok_or(RuntimeError::Mmap {
                len,
                source: io::Error::other("null from mmap"),
            })?,
            len,
        })
    }

    /// Shorthand for a shared read/write region.
    pub fn shared(len: usize) -> RuntimeResult<Self> {
        Self::new(len, Sharing::Shared)
    }

    /// Reserve `len` bytes of inaccessible private address space at exactly `base`.
    ///
    /// The reservation is `MAP_NORESERVE`, so untouched pages cost nothing.
    /// Fails with [`RuntimeError::WindowUnavailable`] if anything is already mapped there.
    pub fn reserve_fixed(base: usize, len: usize) -> RuntimeResult<Self> {
        let len = page_align_up(len);

        // SAFETY: MAP_FIXED_NOREPLACE never clobbers an existing mapping.
        let ptr = unsafe {
            libc::mmap(
                base as *mut libc::c_void,
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE
                    | libc::MAP_ANONYMOUS
                    | libc::MAP_NORESERVE
                    | libc::MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(RuntimeError::WindowUnavailable { base, len });
        }
        if ptr as usize != base {
            // Kernels without MAP_FIXED_NOREPLACE treat the address as a hint.
            // SAFETY: we own the mapping we just got.
            unsafe { libc::munmap(ptr, len) };
            return Err(RuntimeError::WindowUnavailable { base, len });
        }

        Ok(Self {
            base: NonNull::new(ptr as *mut u8).ok_or(RuntimeError::WindowUnavailable { base, len })?,
            len,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.addr() && addr < self.addr() + self.len
    }

    /// Zero the whole region.
    pub fn zero(&mut self) {
        // SAFETY: the region is mapped read/write for `len` bytes.
        unsafe { ptr::write_bytes(self.base.as_ptr(), 0, self.len) };
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: we own the mapping.
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

/// Change the protection of `[addr, addr + len)`. Both must be page aligned.
pub fn protect(addr: usize, len: usize, prot: Protection) -> RuntimeResult<()> {
    debug_assert_eq!(addr % PAGE_SIZE, 0);
    // SAFETY: callers only pass ranges inside regions the runtime reserved.
    let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, len, prot.bits()) };
    if rc != 0 {
        return Err(RuntimeError::Protect {
            addr,
            len,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// The kernel's page size.
pub fn system_page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        PAGE_SIZE
    } else {
        size as usize
    }
}
